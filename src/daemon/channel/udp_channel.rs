//! A datagram transport over plain UDP.
//!
//! Destinations are `host:port` strings. This is enough to run two tunnel ends
//! directly against each other, or against a local datagram bridge of an
//! overlay network.
//!
//! Names are resolved when an address table is handed to the transport, not
//! per frame, and datagrams from a known peer are reported under the
//! destination it was configured with.

use std::{collections::HashMap, io, net::SocketAddr};

use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

use crate::daemon::switch::{AddressTable, Destination};

use super::DatagramTransport;

pub struct UdpChannel {
    socket: UdpSocket,
    /// Destination to the address frames are sent to.
    resolved: HashMap<Destination, SocketAddr>,
    /// Every known address of a destination, back to the destination.
    peers: HashMap<SocketAddr, Destination>,
}

impl UdpChannel {
    pub async fn bind(address: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(address).await?,
            resolved: HashMap::new(),
            peers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Resolves `destination` and remembers the result, preferring an
    /// address of the socket's own family.
    async fn resolve(&mut self, destination: &Destination) -> io::Result<SocketAddr> {
        if let Some(address) = self.resolved.get(destination) {
            return Ok(*address);
        }
        let candidates: Vec<SocketAddr> = match destination.as_str().parse() {
            Ok(address) => vec![address],
            Err(_) => lookup_host(destination.as_str()).await?.collect(),
        };
        let ipv4 = self.socket.local_addr()?.is_ipv4();
        let address = candidates
            .iter()
            .find(|candidate| candidate.is_ipv4() == ipv4)
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for destination {destination}"),
                )
            })?;
        for candidate in candidates {
            self.peers.insert(candidate, destination.clone());
        }
        self.resolved.insert(destination.clone(), address);
        debug!(%destination, %address, "destination resolved");
        Ok(address)
    }
}

impl DatagramTransport for UdpChannel {
    async fn send_to(&mut self, datagram: &[u8], destination: &Destination) -> io::Result<()> {
        let address = self.resolve(destination).await?;
        self.socket.send_to(datagram, address).await?;
        Ok(())
    }

    async fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<(usize, Destination)> {
        let (size, address) = self.socket.recv_from(buffer).await?;
        let source = match self.peers.get(&address) {
            Some(destination) => destination.clone(),
            None => Destination::from(address.to_string()),
        };
        Ok((size, source))
    }

    /// Re-resolves every destination of `table`. Names that fail to resolve
    /// are retried when a frame is sent to them.
    async fn prepare(&mut self, table: &AddressTable) {
        self.resolved.clear();
        self.peers.clear();
        let destinations: Vec<Destination> = table
            .routes()
            .map(|(_, destination)| destination.clone())
            .collect();
        for destination in destinations {
            if let Err(error) = self.resolve(&destination).await {
                warn!(%destination, %error, "failed to resolve destination");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    async fn loopback() -> UdpChannel {
        UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    fn table_with(destination: &Destination) -> AddressTable {
        [(Ipv4Addr::new(10, 0, 0, 2), destination.clone())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn datagrams_travel_between_channels() {
        let mut a = loopback().await;
        let mut b = loopback().await;
        let to_b = Destination::from(b.local_addr().unwrap().to_string());

        a.send_to(b"frame", &to_b).await.unwrap();

        let mut buffer = [0u8; 64];
        let (size, source) = b.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], b"frame");
        assert_eq!(source, Destination::from(a.local_addr().unwrap().to_string()));
    }

    #[tokio::test]
    async fn unresolvable_destination_is_an_error() {
        let mut a = loopback().await;
        assert!(a.send_to(b"frame", &"not an address".into()).await.is_err());
    }

    #[tokio::test]
    async fn named_peers_are_resolved_once_and_reported_by_name() {
        let mut a = loopback().await;
        let mut b = loopback().await;
        let a_name = Destination::from(format!("localhost:{}", a.local_addr().unwrap().port()));
        let b_name = Destination::from(format!("localhost:{}", b.local_addr().unwrap().port()));

        a.prepare(&table_with(&b_name)).await;
        b.prepare(&table_with(&a_name)).await;
        assert_eq!(a.resolved.get(&b_name), Some(&b.local_addr().unwrap()));

        a.send_to(b"frame", &b_name).await.unwrap();

        let mut buffer = [0u8; 64];
        let (size, source) = b.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], b"frame");
        assert_eq!(source, a_name);
    }

    #[tokio::test]
    async fn prepare_forgets_destinations_of_the_previous_table() {
        let mut a = loopback().await;
        let old = Destination::from("127.0.0.1:9");
        a.prepare(&table_with(&old)).await;
        assert!(a.resolved.contains_key(&old));

        a.prepare(&AddressTable::new()).await;
        assert!(a.resolved.is_empty());
        assert!(a.peers.is_empty());
    }
}

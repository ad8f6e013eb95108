//! In-process channels. They let links run against each other without a
//! device or a socket, which is what the tests do.

use std::{
    collections::HashMap,
    future, io,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc;

use crate::daemon::switch::Destination;

use super::{DatagramTransport, VirtualInterface};

/// A [VirtualInterface] fed and drained through channels.
pub struct MemoryInterface {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

/// The host side of a [MemoryInterface].
pub struct InterfacePeer {
    /// Packets sent here are read by the link.
    pub inject: mpsc::UnboundedSender<Vec<u8>>,

    /// Packets the link writes to the interface show up here.
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Creates an interface together with the host side feeding it.
pub fn memory_interface() -> (MemoryInterface, InterfacePeer) {
    let (inject, inbound) = mpsc::unbounded_channel();
    let (written_sender, written) = mpsc::unbounded_channel();
    (
        MemoryInterface {
            inbound,
            written: written_sender,
        },
        InterfacePeer { inject, written },
    )
}

impl VirtualInterface for MemoryInterface {
    async fn read_packet(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        // Once the host side is gone nothing will ever be readable again.
        let Some(packet) = self.inbound.recv().await else {
            return future::pending().await;
        };
        let size = packet.len().min(buffer.len());
        buffer[..size].copy_from_slice(&packet[..size]);
        Ok(size)
    }

    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.written
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface host is gone"))
    }
}

type Inbox = mpsc::UnboundedSender<(Destination, Vec<u8>)>;

/// A datagram network connecting [MemoryTransport] endpoints by destination.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<Destination, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint reachable at `destination`, replacing any earlier
    /// endpoint with the same destination.
    pub fn endpoint(&self, destination: impl Into<Destination>) -> MemoryTransport {
        let local = destination.into();
        let (sender, inbox) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local.clone(), sender);
        MemoryTransport {
            local,
            inbox,
            network: self.clone(),
        }
    }

    fn deliver(&self, from: &Destination, to: &Destination, datagram: &[u8]) -> io::Result<()> {
        let endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let inbox = endpoints.get(to).ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no endpoint {to}"))
        })?;
        inbox
            .send((from.clone(), datagram.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, format!("{to} is gone")))
    }
}

/// One endpoint of a [MemoryNetwork].
pub struct MemoryTransport {
    local: Destination,
    inbox: mpsc::UnboundedReceiver<(Destination, Vec<u8>)>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn destination(&self) -> &Destination {
        &self.local
    }

    /// Takes a datagram that has already arrived, if any.
    pub fn try_recv(&mut self) -> Option<(Destination, Vec<u8>)> {
        self.inbox.try_recv().ok()
    }
}

impl DatagramTransport for MemoryTransport {
    async fn send_to(&mut self, datagram: &[u8], destination: &Destination) -> io::Result<()> {
        self.network.deliver(&self.local, destination, datagram)
    }

    async fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<(usize, Destination)> {
        let Some((source, datagram)) = self.inbox.recv().await else {
            return future::pending().await;
        };
        let size = datagram.len().min(buffer.len());
        buffer[..size].copy_from_slice(&datagram[..size]);
        Ok((size, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoints_exchange_datagrams() {
        let network = MemoryNetwork::new();
        let mut alice = network.endpoint("alice");
        let mut bob = network.endpoint("bob");

        alice.send_to(b"hello", &"bob".into()).await.unwrap();

        let mut buffer = [0u8; 16];
        let (size, source) = bob.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], b"hello");
        assert_eq!(source, *alice.destination());
        assert!(bob.try_recv().is_none());
    }

    #[tokio::test]
    async fn sending_to_an_unknown_endpoint_fails() {
        let network = MemoryNetwork::new();
        let mut alice = network.endpoint("alice");
        let error = alice.send_to(b"hello", &"carol".into()).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test]
    async fn interface_passes_packets_both_ways() {
        let (mut interface, mut host) = memory_interface();
        host.inject.send(vec![1, 2, 3]).unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(interface.read_packet(&mut buffer).await.unwrap(), 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);

        interface.write_packet(&[9, 9]).await.unwrap();
        assert_eq!(host.written.recv().await, Some(vec![9, 9]));
    }
}

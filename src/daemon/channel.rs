//! The two I/O peers of a link: the virtual network interface on one side and
//! the datagram transport of the overlay network on the other.

pub mod memory_channel;
pub mod tun_channel;
pub mod udp_channel;

use std::{future::Future, io};

use super::switch::{AddressTable, Destination};

/// A virtual network interface that yields and accepts whole packets.
pub trait VirtualInterface {
    /// Reads one packet into `buffer`, returning its length.
    fn read_packet(&mut self, buffer: &mut [u8]) -> impl Future<Output = io::Result<usize>>;

    /// Writes one packet.
    fn write_packet(&mut self, packet: &[u8]) -> impl Future<Output = io::Result<()>>;
}

/// A datagram socket of the overlay network, addressed by [Destination].
///
/// Datagrams are delivered whole or not at all.
pub trait DatagramTransport {
    /// Sends one datagram to `destination`.
    fn send_to(
        &mut self,
        datagram: &[u8],
        destination: &Destination,
    ) -> impl Future<Output = io::Result<()>>;

    /// Receives one datagram into `buffer`, returning its length and sender.
    fn recv_from(
        &mut self,
        buffer: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Destination)>>;

    /// Called with every address table the link starts using, before frames
    /// are sent to its destinations.
    fn prepare(&mut self, table: &AddressTable) -> impl Future<Output = ()> {
        let _ = table;
        async {}
    }
}

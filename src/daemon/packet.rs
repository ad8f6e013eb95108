use std::{fmt::Debug, net::Ipv4Addr, sync::Arc};

use super::switch::Destination;

/// Kind of a link-level frame, as carried in the first two bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    KeepAlive = 1 << 0,
    Ip = 1 << 1,
    Control = 1 << 2,
    Ack = 1 << 3,
    Ether = 1 << 4,
}

impl FrameType {
    pub fn wire_value(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for FrameType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::KeepAlive),
            2 => Ok(Self::Ip),
            4 => Ok(Self::Control),
            8 => Ok(Self::Ack),
            16 => Ok(Self::Ether),
            other => Err(other),
        }
    }
}

/// A packet taken out of a received frame.
///
/// It keeps the type and sequence number of its frame and the destination the
/// frame came from, so packets from several frames can be put back in order.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub source: Destination,
    pub payload: Arc<[u8]>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("frame_type", &self.frame_type)
            .field("sequence", &self.sequence)
            .field("source", &self.source)
            .field("len", &self.payload.len())
            .finish()
    }
}

const IPV4_HEADER_LEN: usize = 20;
const IPV4_DESTINATION_OFFSET: usize = 16;
/// Bytes of Ethernet header in front of the packets of a TAP device.
pub const ETHERNET_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;

/// Reads the destination address of a raw IPv4 packet.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let field = &packet[IPV4_DESTINATION_OFFSET..IPV4_DESTINATION_OFFSET + 4];
    Some(Ipv4Addr::new(field[0], field[1], field[2], field[3]))
}

/// Reads the destination IPv4 address of an Ethernet frame carrying IPv4.
pub fn ethernet_ipv4_destination(frame: &[u8]) -> Option<Ipv4Addr> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    ipv4_destination(&frame[ETHERNET_HEADER_LEN..])
}

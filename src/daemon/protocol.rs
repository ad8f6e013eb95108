//! The link-level frame protocol.
//!
//! Every datagram sent between two tunnel ends is one frame:
//!
//! ```text
//! type: u16 | count: u16 | sequence: u64 | { len: u16 | payload } * count
//! ```
//!
//! All integers are big-endian. A frame never grows beyond the link MTU.
//! [Clumping] packs as many packets as fit into each frame, [Flat] sends one
//! packet per frame; both read frames the same way.

use std::{mem, sync::Arc};

use thiserror::Error;
use tracing::warn;

use super::{
    packet::{FrameType, Packet},
    switch::Destination,
};

/// Bytes taken by the frame header: type, packet count, sequence number.
pub const FRAME_OVERHEAD: usize = 12;

/// Bytes taken by the length prefix of every packet in a frame.
pub const PACKET_OVERHEAD: usize = 2;

/// Why a received frame could not be read.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the frame header")]
    TruncatedHeader { len: usize },
    #[error("unknown frame type {0:#06x}")]
    UnknownType(u16),
    #[error("packet {index} declares {declared} bytes but only {remaining} remain")]
    TruncatedPacket {
        index: usize,
        declared: usize,
        remaining: usize,
    },
}

/// One link-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub packets: Vec<Arc<[u8]>>,
}

impl Frame {
    pub fn new(frame_type: FrameType, sequence: u64, packets: Vec<Arc<[u8]>>) -> Self {
        Self {
            frame_type,
            sequence,
            packets,
        }
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD
            + self
                .packets
                .iter()
                .map(|packet| PACKET_OVERHEAD + packet.len())
                .sum::<usize>()
    }

    /// Serializes the frame.
    ///
    /// Packets must be shorter than 64 KiB and there must be fewer than 64 Ki
    /// of them; the protocols only build frames that respect this.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.frame_type.wire_value().to_be_bytes());
        bytes.extend_from_slice(&(self.packets.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        for packet in &self.packets {
            bytes.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            bytes.extend_from_slice(packet);
        }
        bytes
    }

    /// Parses a frame. Bytes after the last declared packet are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let mut rest = data;
        let (raw_type, count, sequence) = match (
            take_u16(&mut rest),
            take_u16(&mut rest),
            take_u64(&mut rest),
        ) {
            (Some(raw_type), Some(count), Some(sequence)) => (raw_type, count, sequence),
            _ => return Err(FrameError::TruncatedHeader { len: data.len() }),
        };
        let frame_type = FrameType::try_from(raw_type).map_err(FrameError::UnknownType)?;

        // The count comes off the wire; never reserve more than the rest could hold.
        let capacity = (count as usize).min(rest.len() / PACKET_OVERHEAD);
        let mut packets = Vec::with_capacity(capacity);
        for index in 0..count as usize {
            let declared = take_u16(&mut rest).ok_or(FrameError::TruncatedPacket {
                index,
                declared: PACKET_OVERHEAD,
                remaining: rest.len(),
            })? as usize;
            let remaining = rest.len();
            let payload = take(&mut rest, declared).ok_or(FrameError::TruncatedPacket {
                index,
                declared,
                remaining,
            })?;
            packets.push(Arc::from(payload));
        }
        Ok(Self::new(frame_type, sequence, packets))
    }

    /// Splits the frame into packets tagged with `source`.
    pub fn into_packets(self, source: &Destination) -> Vec<Packet> {
        let Self {
            frame_type,
            sequence,
            packets,
        } = self;
        packets
            .into_iter()
            .map(|payload| Packet {
                frame_type,
                sequence,
                source: source.clone(),
                payload,
            })
            .collect()
    }
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if data.len() < len {
        return None;
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Some(head)
}

fn take_u16(data: &mut &[u8]) -> Option<u16> {
    take(data, 2).map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_u64(data: &mut &[u8]) -> Option<u64> {
    let bytes = take(data, 8)?;
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(bytes);
    Some(u64::from_be_bytes(buffer))
}

/// A way of turning packets into frames and frames back into packets.
pub trait FrameProtocol {
    /// The largest frame this protocol produces.
    fn mtu(&self) -> usize;

    /// Packs `packets` into frames of `frame_type`, numbering each frame with
    /// `next_sequence`. Packets that cannot fit in a frame are dropped.
    fn encode(
        &self,
        packets: &[Arc<[u8]>],
        frame_type: FrameType,
        next_sequence: &mut dyn FnMut() -> u64,
    ) -> Vec<Frame>;

    /// Reads a received frame into packets tagged with `source`.
    fn decode(&self, data: &[u8], source: &Destination) -> Result<Vec<Packet>, FrameError> {
        Ok(Frame::parse(data)?.into_packets(source))
    }

    /// Whether a packet of `len` bytes fits in a frame on its own.
    fn fits(&self, len: usize) -> bool {
        len <= u16::MAX as usize && FRAME_OVERHEAD + PACKET_OVERHEAD + len <= self.mtu()
    }
}

fn warn_oversized(len: usize, mtu: usize) {
    warn!(len, mtu, "dropping packet too large for a frame");
}

/// Packs many packets into each frame.
#[derive(Debug, Clone, Copy)]
pub struct Clumping {
    mtu: usize,
}

impl Clumping {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }
}

impl FrameProtocol for Clumping {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn encode(
        &self,
        packets: &[Arc<[u8]>],
        frame_type: FrameType,
        next_sequence: &mut dyn FnMut() -> u64,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut current = Vec::new();
        let mut size = FRAME_OVERHEAD;
        for packet in packets {
            if !self.fits(packet.len()) {
                warn_oversized(packet.len(), self.mtu);
                continue;
            }
            let added = PACKET_OVERHEAD + packet.len();
            if size + added > self.mtu || current.len() == u16::MAX as usize {
                frames.push(Frame::new(frame_type, next_sequence(), mem::take(&mut current)));
                size = FRAME_OVERHEAD;
            }
            size += added;
            current.push(Arc::clone(packet));
        }
        if !current.is_empty() {
            frames.push(Frame::new(frame_type, next_sequence(), current));
        }
        frames
    }
}

/// Sends every packet in a frame of its own.
#[derive(Debug, Clone, Copy)]
pub struct Flat {
    mtu: usize,
}

impl Flat {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }
}

impl FrameProtocol for Flat {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn encode(
        &self,
        packets: &[Arc<[u8]>],
        frame_type: FrameType,
        next_sequence: &mut dyn FnMut() -> u64,
    ) -> Vec<Frame> {
        packets
            .iter()
            .filter(|packet| {
                let fits = self.fits(packet.len());
                if !fits {
                    warn_oversized(packet.len(), self.mtu);
                }
                fits
            })
            .map(|packet| Frame::new(frame_type, next_sequence(), vec![Arc::clone(packet)]))
            .collect()
    }
}

/// Which [FrameProtocol] a link uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    Clumping,
    #[default]
    Flat,
}

impl Strategy {
    pub fn protocol(self, mtu: usize) -> Box<dyn FrameProtocol> {
        match self {
            Self::Clumping => Box::new(Clumping::new(mtu)),
            Self::Flat => Box::new(Flat::new(mtu)),
        }
    }
}

//! # dgramtun: IP tunneling over a datagram overlay network
//!
//! **dgramtun** bridges a virtual network interface (TUN or TAP) to a
//! datagram-oriented overlay network. Every tunnel end owns a virtual IPv4
//! address; an address map tells it which overlay destination stands behind
//! each remote address.
//!
//! ## How It Works
//!
//! 1. **Switching**: packets read from the interface are grouped by their IPv4
//!    destination, which the [address table](daemon::switch::AddressTable)
//!    resolves to an overlay destination.
//! 2. **Framing**: each group is packed into MTU-sized frames, either several
//!    packets per frame ([clumping](daemon::protocol::Clumping)) or one
//!    ([flat](daemon::protocol::Flat)), and every frame gets a sequence number.
//! 3. **Pumping**: the [link](daemon::link::LinkPump) queues traffic from both
//!    sides and drains the queues on a fixed tick; frames that arrived in the
//!    same tick are put back in sequence order before their packets are written
//!    to the interface.
//!
//! ## Warning
//!
//! Reliability, congestion control and encryption are left to the overlay
//! network. A dropped datagram is a dropped packet.
//!
//! Also, it is highly experimental and you use it at your own risk.

pub mod config;
pub mod daemon;

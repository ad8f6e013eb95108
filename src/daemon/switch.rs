//! Module for the [AddressTable].
//!
//! It is responsible for mapping virtual IPv4 addresses to overlay
//! destinations (and back) and for numbering outgoing frames.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Display},
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// An opaque identifier of a remote overlay endpoint.
///
/// The tunnel never looks inside a destination; it only compares and hashes it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(Arc<str>);

impl Destination {
    pub fn new(destination: impl AsRef<str>) -> Self {
        Self(Arc::from(destination.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Destination {
    fn from(destination: &str) -> Self {
        Self::new(destination)
    }
}

impl From<String> for Destination {
    fn from(destination: String) -> Self {
        Self(Arc::from(destination))
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Destination").field(&self.as_str()).finish()
    }
}

/// Bidirectional map between virtual addresses and overlay destinations.
///
/// Every address maps to at most one destination and every destination to at
/// most one address. The table also hands out frame sequence numbers; the
/// counter is independent of the maps and may be shared with the table that
/// replaces this one on reload.
#[derive(Debug, Default)]
pub struct AddressTable {
    /// Address to destination.
    destinations: HashMap<Ipv4Addr, Destination>,

    /// Destination to address.
    addresses: HashMap<Destination, Ipv4Addr>,

    /// Last sequence number handed out.
    sequence: Arc<AtomicU64>,
}

impl AddressTable {
    /// Creates an empty table whose sequence starts at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address <-> destination`, replacing any previous mapping of
    /// either side.
    pub fn register(&mut self, address: Ipv4Addr, destination: Destination) {
        if let Some(previous) = self.destinations.insert(address, destination.clone()) {
            if previous != destination {
                self.addresses.remove(&previous);
            }
        }
        if let Some(previous) = self.addresses.insert(destination, address) {
            if previous != address {
                self.destinations.remove(&previous);
            }
        }
    }

    /// Returns the destination registered for `address`.
    pub fn destination_for(&self, address: &Ipv4Addr) -> Option<&Destination> {
        self.destinations.get(address)
    }

    /// Returns the address registered for `destination`.
    pub fn address_for(&self, destination: &Destination) -> Option<Ipv4Addr> {
        self.addresses.get(destination).copied()
    }

    /// Returns the next frame sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Makes this table continue the frame sequence of `previous`.
    pub fn continue_sequence_from(&mut self, previous: &AddressTable) {
        self.sequence = Arc::clone(&previous.sequence);
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = (&Ipv4Addr, &Destination)> {
        self.destinations.iter()
    }
}

impl FromIterator<(Ipv4Addr, Destination)> for AddressTable {
    fn from_iter<T: IntoIterator<Item = (Ipv4Addr, Destination)>>(iter: T) -> Self {
        let mut table = Self::new();
        for (address, destination) in iter {
            table.register(address, destination);
        }
        table
    }
}

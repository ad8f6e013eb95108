//! The dgramtun configuration file.
//!
//! A JSON document describing the virtual interface, the transport socket and
//! the address map:
//!
//! ```json
//! {
//!   "interface": { "ifname": "tun0", "address": "10.10.0.1",
//!                  "netmask": "255.255.0.0", "mtu": 4000, "tap": false },
//!   "clump": false,
//!   "pump": 500,
//!   "map": { "10.10.0.2": "203.0.113.7:7655" },
//!   "transport": { "bind": "0.0.0.0:7655" }
//! }
//! ```

use std::{
    collections::BTreeMap,
    fs, io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::daemon::{
    channel::tun_channel::TunSettings,
    link::LinkSettings,
    packet::ETHERNET_HEADER_LEN,
    protocol::{Strategy, FRAME_OVERHEAD, PACKET_OVERHEAD},
    switch::{AddressTable, Destination},
};

pub const DEFAULT_CONFIG_PATH: &str = "dgramtun.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to write config {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("mtu {0} leaves no room for packets or exceeds 65535")]
    InvalidMtu(usize),
    #[error("pump interval must be at least 1 ms")]
    InvalidPumpInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub ifname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    /// Largest datagram sent to the transport. The device itself gets what
    /// is left after framing, see [Config::interface_mtu].
    pub mtu: usize,
    #[serde(default)]
    pub tap: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            ifname: "dgram0".to_string(),
            address: None,
            netmask: Ipv4Addr::new(255, 255, 0, 0),
            mtu: 4000,
            tap: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local address of the datagram socket.
    pub bind: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7655)),
        }
    }
}

fn default_pump() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Pack several packets per frame instead of one.
    #[serde(default)]
    pub clump: bool,
    /// Pump interval in milliseconds.
    #[serde(default = "default_pump")]
    pub pump: u64,
    #[serde(default)]
    pub debug: bool,
    /// Virtual address to overlay destination.
    #[serde(default)]
    pub map: BTreeMap<Ipv4Addr, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig::default(),
            transport: TransportConfig::default(),
            clump: false,
            pump: default_pump(),
            debug: false,
            map: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads the config at `path`, writing a default one first if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parses and validates a config document.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source: source.into(),
        })?;
        fs::write(path, raw).map_err(write_error)
    }

    /// A default config with a random `10.10.x.y` local address registered
    /// under `local_destination`.
    pub fn generate(local_destination: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let address = Ipv4Addr::new(10, 10, rng.gen_range(1..=250), rng.gen_range(1..=250));
        let mut config = Self::default();
        config.interface.address = Some(address);
        config.map.insert(address, local_destination.into());
        config
    }

    /// MTU of the virtual interface: the largest packet that still fits in a
    /// frame of `interface.mtu` bytes on its own.
    pub fn interface_mtu(&self) -> usize {
        let mut overhead = FRAME_OVERHEAD + PACKET_OVERHEAD;
        if self.interface.tap {
            overhead += ETHERNET_HEADER_LEN;
        }
        self.interface.mtu.saturating_sub(overhead)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mtu = self.interface.mtu;
        if self.interface_mtu() == 0 || mtu > u16::MAX as usize {
            return Err(ConfigError::InvalidMtu(mtu));
        }
        if self.pump == 0 {
            return Err(ConfigError::InvalidPumpInterval);
        }
        Ok(())
    }

    pub fn address_table(&self) -> AddressTable {
        self.map
            .iter()
            .map(|(address, destination)| (*address, Destination::new(destination)))
            .collect()
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            mtu: self.interface.mtu,
            pump_interval: Duration::from_millis(self.pump),
            strategy: if self.clump {
                Strategy::Clumping
            } else {
                Strategy::Flat
            },
            tap: self.interface.tap,
        }
    }

    pub fn tun_settings(&self) -> TunSettings {
        TunSettings {
            name: self.interface.ifname.clone(),
            address: self.interface.address,
            netmask: self.interface.netmask,
            mtu: self.interface_mtu(),
            tap: self.interface.tap,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::daemon::{
        channel::memory_channel::{memory_interface, MemoryNetwork},
        link::LinkPump,
        packet::tests::ipv4_packet,
        protocol::Frame,
    };

    const SAMPLE: &str = r#"{
        "interface": { "ifname": "tun7", "address": "10.10.0.1",
                       "netmask": "255.255.0.0", "mtu": 1400, "tap": false },
        "clump": true,
        "pump": 250,
        "map": { "10.10.0.2": "peer.example:7655", "10.10.0.3": "198.51.100.4:7655" },
        "transport": { "bind": "127.0.0.1:7655" }
    }"#;

    #[test]
    fn parses_a_full_document() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.interface.ifname, "tun7");
        assert_eq!(config.interface.address, Some(Ipv4Addr::new(10, 10, 0, 1)));
        assert_eq!(config.transport.bind, SocketAddr::from(([127, 0, 0, 1], 7655)));

        let settings = config.link_settings();
        assert_eq!(settings.mtu, 1400);
        assert_eq!(settings.pump_interval, Duration::from_millis(250));
        assert_eq!(settings.strategy, Strategy::Clumping);
        assert!(!settings.tap);

        let table = config.address_table();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.destination_for(&Ipv4Addr::new(10, 10, 0, 2)),
            Some(&Destination::from("peer.example:7655"))
        );
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.link_settings().strategy, Strategy::Flat);
        assert_eq!(config.link_settings().pump_interval, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::parse(r#"{ "interface": { "ifname": "t", "netmask": "255.0.0.0", "mtu": 14 } }"#),
            Err(ConfigError::InvalidMtu(14))
        ));
        assert!(matches!(
            Config::parse(r#"{ "pump": 0 }"#),
            Err(ConfigError::InvalidPumpInterval)
        ));
        assert!(matches!(
            Config::parse(r#"{ "map": { "not-an-ip": "x" } }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn interface_mtu_leaves_room_for_framing() {
        let mut config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.tun_settings().mtu, 1400 - 12 - 2);

        config.interface.tap = true;
        assert_eq!(config.tun_settings().mtu, 1400 - 12 - 2 - 14);
        assert_eq!(config.link_settings().mtu, 1400);

        assert!(matches!(
            Config::parse(r#"{ "interface": { "ifname": "t", "netmask": "255.0.0.0", "mtu": 28, "tap": true } }"#),
            Err(ConfigError::InvalidMtu(28))
        ));
    }

    /// A full-size packet from the device must come out as one frame.
    async fn frames_for_full_size_packet(config: &Config) -> Vec<Frame> {
        let peer = Ipv4Addr::new(10, 10, 0, 2);
        let network = MemoryNetwork::new();
        let (interface, _host) = memory_interface();
        let (mut link, _handle) = LinkPump::new(
            interface,
            network.endpoint("local"),
            config.address_table(),
            config.link_settings(),
        );
        let mut remote = network.endpoint("peer.example:7655");

        let size = config.tun_settings().mtu;
        let mut packet = Vec::new();
        if config.interface.tap {
            packet.extend_from_slice(&[0u8; 12]);
            packet.extend_from_slice(&[0x08, 0x00]);
        }
        packet.extend(ipv4_packet(peer, size, 0xee));
        link.queue_outbound(Arc::from(packet));
        link.pump().await;

        std::iter::from_fn(|| remote.try_recv())
            .map(|(_, bytes)| {
                assert!(bytes.len() <= config.interface.mtu);
                Frame::parse(&bytes).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn packets_of_interface_mtu_fit_in_a_frame() {
        let mut config = Config::parse(SAMPLE).unwrap();
        for (clump, tap) in [(true, false), (false, false), (true, true), (false, true)] {
            config.clump = clump;
            config.interface.tap = tap;
            let frames = frames_for_full_size_packet(&config).await;
            assert_eq!(frames.len(), 1, "clump {clump}, tap {tap}");
            assert_eq!(frames[0].encoded_len(), config.interface.mtu);
        }
    }

    #[test]
    fn generated_config_maps_its_own_address() {
        let config = Config::generate("self.example:7655");
        let address = config.interface.address.unwrap();
        assert_eq!(address.octets()[..2], [10, 10]);
        assert_eq!(config.map.get(&address).map(String::as_str), Some("self.example:7655"));
    }

    #[test]
    fn load_writes_a_default_file_when_missing() {
        let dir = std::env::temp_dir().join(format!("dgramtun-config-{}", std::process::id()));
        let path = dir.join("dgramtun.json");
        let _ = fs::remove_file(&path);

        let created = Config::load(&path).unwrap();
        assert_eq!(created, Config::default());
        assert!(path.exists());

        let mut changed = created.clone();
        changed.clump = true;
        changed.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), changed);

        let _ = fs::remove_dir_all(&dir);
    }
}

//! A channel for the TUN (or TAP) device.

use std::{io, net::Ipv4Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::AsyncDevice;

use super::VirtualInterface;

/// Settings of the device to create.
#[derive(Debug, Clone)]
pub struct TunSettings {
    pub name: String,
    pub address: Option<Ipv4Addr>,
    pub netmask: Ipv4Addr,
    pub mtu: usize,
    /// Create a layer 2 (TAP) device instead of a layer 3 one.
    pub tap: bool,
}

/// A [VirtualInterface] backed by a TUN/TAP device.
pub struct TunChannel {
    device: AsyncDevice,
}

impl TunChannel {
    /// Creates the device and brings it up.
    pub fn open(settings: &TunSettings) -> tun::Result<Self> {
        let mut configuration = tun::configure();
        configuration
            .name(&settings.name)
            .netmask(settings.netmask)
            .mtu(settings.mtu as i32)
            .up();
        if let Some(address) = settings.address {
            configuration.address(address);
        }
        if settings.tap {
            configuration.layer(tun::Layer::L2);
        }
        #[cfg(target_os = "linux")]
        configuration.platform(|platform| {
            platform.packet_information(false);
        });
        Ok(Self {
            device: tun::create_as_async(&configuration)?,
        })
    }
}

impl VirtualInterface for TunChannel {
    async fn read_packet(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.device.read(buffer).await
    }

    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.device.write_all(packet).await
    }
}

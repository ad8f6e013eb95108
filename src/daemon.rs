//! The dgramtun daemon. It opens the virtual interface and the transport and
//! runs the link between them until interrupted.

pub mod channel;
pub mod error;
pub mod link;
pub mod packet;
pub mod protocol;
pub mod switch;

use std::path::{Path, PathBuf};

use tokio::{
    pin, select,
    signal::unix::{signal, SignalKind},
};
use tracing::{info, warn};

use crate::config::Config;

use self::{
    channel::{tun_channel::TunChannel, udp_channel::UdpChannel},
    error::DaemonError,
    link::{LinkHandle, LinkPump},
};

/// The dgramtun daemon configuration
pub struct DaemonConfig {
    /// Where the config was read from; re-read on SIGHUP.
    pub path: PathBuf,
    pub config: Config,
}

/// The dgramtun daemon
pub async fn run_daemon(daemon_config: DaemonConfig) -> Result<(), DaemonError> {
    let DaemonConfig { path, config } = daemon_config;

    let interface = TunChannel::open(&config.tun_settings())?;
    let transport = UdpChannel::bind(config.transport.bind).await?;
    info!(bind = %transport.local_addr()?, "transport bound");

    let table = config.address_table();
    for (address, destination) in table.routes() {
        info!(%address, %destination, "route registered");
    }
    let (link, handle) = LinkPump::new(interface, transport, table, config.link_settings());

    let mut hangup = signal(SignalKind::hangup())?;
    let link = link.run();
    pin!(link);
    loop {
        select! {
            result = &mut link => return result,
            Some(()) = hangup.recv() => reload_address_map(&path, &handle).await,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("stopping");
                if !handle.shutdown().await {
                    warn!("link has already stopped");
                }
            }
        }
    }
}

/// Re-reads the address map and hands it to the link. A broken file leaves the
/// current map in place.
async fn reload_address_map(path: &Path, handle: &LinkHandle) {
    match Config::load(path) {
        Ok(config) => {
            for (address, destination) in &config.map {
                info!(%address, %destination, "route registered");
            }
            if !handle.reload(config.address_table()).await {
                warn!("link has stopped, address map not reloaded");
            }
        }
        Err(error) => warn!(%error, path = %path.display(), "keeping the current address map"),
    }
}

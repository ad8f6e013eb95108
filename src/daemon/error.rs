use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Enum representing errors that can stop the dgramtun daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("tun device: {0}")]
    Tun(#[from] tun::Error),
    #[error("reading from the interface failed: {0}")]
    Interface(#[source] io::Error),
    #[error("the interface was closed")]
    InterfaceClosed,
    #[error("receiving from the transport failed: {0}")]
    Transport(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

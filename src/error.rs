//! Service-level error, composed from each module's own error type

use std::io;

use crate::config::ConfigError;
use crate::core::AdmissionError;
use crate::logging::LogError;
use crate::network::DispatchError;
use crate::worker::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("cannot bind {addr}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("cannot open log sink {path}")]
    Sink {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("admission control failed")]
    Admission(#[from] AdmissionError),
    #[error("log pipeline failed")]
    Log(#[from] LogError),
    #[error("cannot set up workers")]
    Spawn(#[from] SpawnError),
    #[error("dispatcher failed")]
    Dispatch(#[from] DispatchError),
}

//! Error types for target loading and proxy supervision

use std::path::PathBuf;

/// Errors raised while loading targets or supervising the proxy process
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The targets file could not be opened or read
    #[error("failed to read targets file {}: {source}", .path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The targets file was readable but held no usable entries
    #[error("targets file {} is empty", .path.display())]
    EmptyConfiguration { path: PathBuf },

    /// The proxy did not report readiness within the allotted checks
    #[error("proxy failed to start after {attempts} readiness checks")]
    ReadinessTimeout { attempts: u32 },

    /// The proxy exited while readiness was still being polled
    #[error("proxy exited before becoming ready")]
    ExitedBeforeReady,

    /// The proxy could not be confirmed stopped after kill
    #[error("proxy (pid {pid:?}) could not be killed, process leaked")]
    ProcessLeak { pid: Option<u32> },

    /// The proxy binary could not be launched
    #[error("failed to spawn proxy `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation required a started supervisor
    #[error("proxy has not been started")]
    NotStarted,

    /// `start` was called on a supervisor that already owns a process
    #[error("proxy was already started")]
    AlreadyStarted,
}

impl Error {
    /// Whether the failover loop must abort on this error.
    ///
    /// Readiness failures only condemn the current target; everything else
    /// means there is no safe way to keep rotating.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ReadinessTimeout { .. } | Error::ExitedBeforeReady)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to obtain a health verdict
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("health probe request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("health probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid health probe setup: {0}")]
    Setup(String),
}

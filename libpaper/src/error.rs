use std::{io::Error as IoError, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] IoError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("capture ended without an update request")]
    CaptureAborted,

    #[error("cancelled")]
    Cancelled,

    #[error("no network interface owns address {0}")]
    InterfaceNotFound(std::net::IpAddr),

    #[error("unsupported datalink channel type on {0}")]
    UnsupportedChannel(String),

    #[error("vendor request to {url} failed with HTTP {status}: {body}")]
    ReplayHttp {
        url: String,
        status: u16,
        body: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] ureq::Error),

    #[error("descriptor key `{path}`: {reason}")]
    DescriptorStructure { path: String, reason: String },

    #[error("no password hash signature found in {0:?}")]
    PatchSiteNotFound(PathBuf),

    #[error("hash site index {index} out of range ({count} sites found)")]
    PatchSiteSelection { index: usize, count: usize },

    #[error("replacement secret must not be empty")]
    EmptySecret,

    #[error("failed reading {path:?} for checksum: {source}")]
    ChecksumIo {
        path: PathBuf,
        #[source]
        source: IoError,
    },

    #[error("host table {path:?}: {reason}")]
    HostTable { path: PathBuf, reason: String },

    #[error("port {port} is already in use or access was denied")]
    PortBindConflict { port: u16 },

    #[error("local server error: {0}")]
    ServerRuntime(String),

    #[cfg(test)]
    #[error(transparent)]
    FromHexError(#[from] hex::FromHexError),
}

impl Error {
    pub(crate) fn descriptor(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DescriptorStructure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn host_table(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::HostTable {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

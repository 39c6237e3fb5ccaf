use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::types::Service;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unknown registry type: {0}")]
    UnknownKind(String),
    #[error("no registry connector installed for {0}")]
    NoConnector(RegistryKind),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    /// Failure reported by an out-of-tree backend client (etcd, zookeeper).
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Supported registry backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Etcd,
    Zookeeper,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::Zookeeper => "zookeeper",
        }
    }
}

impl FromStr for RegistryKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "zookeeper" | "zk" => Ok(Self::Zookeeper),
            _ => Err(DiscoveryError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters handed to a [`RegistryConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub addrs: Vec<String>,
    /// Session keepalive; entries expire when the server stops renewing.
    pub timeout: Duration,
    /// Namespace root all keys are created under.
    pub root: String,
}

/// A discovery registry the server publishes its services to.
#[async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &str;

    async fn register(&self, service: &Service) -> Result<(), DiscoveryError>;

    async fn deregister(&self, service: &Service) -> Result<(), DiscoveryError>;
}

/// Creates a [`Registry`] for one backend kind.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    fn kind(&self) -> RegistryKind;

    async fn connect(&self, options: &RegistryOptions) -> Result<Arc<dyn Registry>, DiscoveryError>;
}

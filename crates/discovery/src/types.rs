use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    Provider,
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider => f.write_str("provider"),
        }
    }
}

/// Key under which a service is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAttr {
    pub group: String,
    pub role: ServiceRole,
    pub protocol: String,
    pub service: String,
    pub version: String,
}

impl ServiceAttr {
    /// Template for everything a provider publishes; `service` and `version`
    /// are filled per registration by [`ServiceAttr::for_service`].
    pub fn provider(group: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            role: ServiceRole::Provider,
            protocol: protocol.into(),
            service: String::new(),
            version: String::new(),
        }
    }

    pub fn for_service(&self, service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            ..self.clone()
        }
    }

    /// Path-like key: `/<group>/<service>/<version>/<protocol>/<role>`.
    pub fn key(&self) -> String {
        format!(
            "/{}/{}/{}/{}/{}",
            self.group, self.service, self.version, self.protocol, self.role
        )
    }
}

/// One advertised endpoint of a server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl Node {
    /// Node for `host:port`, identified as `<id_prefix>-<host:port>`.
    pub fn new(id_prefix: &str, host: &str, port: u16) -> Self {
        Self {
            id: format!("{id_prefix}-{}", join_host_port(host, port)),
            address: host.to_string(),
            port,
        }
    }
}

/// A published service: its attributes plus every node serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub attr: ServiceAttr,
    pub nodes: Vec<Node>,
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

use std::time::Duration;

use {
    ferry_discovery::{RegistryKind, RegistryOptions},
    ferry_protocol::CodecType,
};

use crate::schema::ServerConfig;

/// Startup configuration faults. All of them are fatal and are raised before
/// any listener or registry connection exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("illegal codec type: {0:?}")]
    IllegalCodecType(String),
    #[error("port list is empty")]
    EmptyPortList,
    #[error("illegal port {0}")]
    IllegalPort(String),
    #[error("unknown registry type: {0:?}")]
    UnknownRegistryType(String),
}

impl ServerConfig {
    pub fn codec(&self) -> Result<CodecType, ConfigError> {
        CodecType::from_name(&self.codec_type)
            .ok_or_else(|| ConfigError::IllegalCodecType(self.codec_type.clone()))
    }

    /// Parsed listen ports, in configured order.
    pub fn listen_ports(&self) -> Result<Vec<u16>, ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::EmptyPortList);
        }
        self.ports
            .iter()
            .map(|p| {
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| ConfigError::IllegalPort(p.clone()))
            })
            .collect()
    }

    /// Split `registry.addr` on commas, dropping blanks.
    pub fn registry_addrs(&self) -> Vec<String> {
        self.registry
            .addr
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect()
    }

    /// The registry backend to connect to, or `None` when no addresses are
    /// configured.
    pub fn registry_kind(&self) -> Result<Option<RegistryKind>, ConfigError> {
        if self.registry_addrs().is_empty() {
            return Ok(None);
        }
        self.registry
            .kind
            .parse::<RegistryKind>()
            .map(Some)
            .map_err(|_| ConfigError::UnknownRegistryType(self.registry.kind.clone()))
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            addrs: self.registry_addrs(),
            timeout: self.registry.keepalive_timeout,
            root: self.registry.root.clone(),
        }
    }

    /// Run every startup check. Codec first, then ports, then registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.codec()?;
        self.listen_ports()?;
        self.registry_kind()?;
        Ok(())
    }

    /// Housekeeping period for sessions. Equal to the idle timeout so an
    /// idle session is noticed within two periods.
    pub fn cron_period(&self) -> Duration {
        self.session_timeout
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config(ports: &[&str]) -> ServerConfig {
        ServerConfig {
            ports: ports.iter().map(|p| p.to_string()).collect(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn ports_parse_in_order() {
        assert_eq!(
            config(&["20000", " 20001"]).listen_ports().unwrap(),
            vec![20000, 20001]
        );
    }

    #[test]
    fn empty_port_list_is_rejected() {
        assert_eq!(config(&[]).validate(), Err(ConfigError::EmptyPortList));
    }

    #[test]
    fn illegal_port_names_offending_value() {
        let err = config(&["20000", "http"]).listen_ports().unwrap_err();
        assert_eq!(err, ConfigError::IllegalPort("http".into()));
        assert_eq!(err.to_string(), "illegal port http");
        assert!(config(&["70000"]).listen_ports().is_err());
    }

    #[test]
    fn codec_is_checked_before_ports() {
        let cfg = ServerConfig {
            codec_type: "protobuf".into(),
            ..config(&[])
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::IllegalCodecType("protobuf".into()))
        );
    }

    #[test]
    fn registry_disabled_without_addresses() {
        let mut cfg = config(&["1"]);
        cfg.registry.kind = "nonsense".into();
        assert_eq!(cfg.registry_kind(), Ok(None));

        cfg.registry.addr = "10.0.0.1:2379, ,10.0.0.2:2379".into();
        assert_eq!(
            cfg.registry_kind(),
            Err(ConfigError::UnknownRegistryType("nonsense".into()))
        );

        cfg.registry.kind = "etcd".into();
        assert_eq!(cfg.registry_kind(), Ok(Some(RegistryKind::Etcd)));
        assert_eq!(cfg.registry_options().addrs, vec![
            "10.0.0.1:2379".to_string(),
            "10.0.0.2:2379".to_string()
        ]);
    }
}

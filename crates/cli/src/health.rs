//! Built-in health service registered by `ferry serve`.

use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};

use {
    ferry_protocol::PROTOCOL_VERSION,
    ferry_server::{RpcError, RpcEventListener, RpcService, ServiceBuilder},
};

pub struct Health {
    sessions: Arc<RpcEventListener>,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub protocol: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active: usize,
    pub limit: usize,
    pub uptime_secs: u64,
}

impl Health {
    fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.sessions.active(),
            limit: self.sessions.limit(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl RpcService for Health {
    fn service(&self) -> &str {
        "ferry.Health"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}

pub fn service(sessions: Arc<RpcEventListener>) -> ServiceBuilder<Health> {
    let health = Health {
        sessions,
        started: Instant::now(),
    };
    ServiceBuilder::new(health)
        .method("Ping", |_: &Health, (): ()| async {
            Ok::<_, RpcError>("pong".to_string())
        })
        .method("Version", |_: &Health, (): ()| async {
            Ok::<_, RpcError>(VersionInfo {
                server: env!("CARGO_PKG_VERSION").to_string(),
                protocol: PROTOCOL_VERSION,
            })
        })
        .method("Stats", |health: &Health, (): ()| {
            let stats = health.stats();
            async move { Ok::<_, RpcError>(stats) }
        })
}

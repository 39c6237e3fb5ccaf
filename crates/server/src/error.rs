use std::io;

use {
    ferry_config::ConfigError,
    ferry_discovery::DiscoveryError,
    ferry_protocol::{ErrorShape, error_codes},
    ferry_transport::TransportError,
};

use crate::server::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("cannot derive a service name from {type_name}")]
    EmptyServiceName { type_name: &'static str },
    #[error("service name {name:?} is not exported")]
    ServiceNotExported { name: String },
    #[error("service {name} is already registered")]
    DuplicateService { name: String },
    #[error("service {name} has no suitable methods{}", hint_suffix(.hint))]
    NoSuitableMethods { name: String, hint: Option<String> },
    #[error("service {service} registered but could not be published: {source}")]
    Publish {
        service: String,
        #[source]
        source: DiscoveryError,
    },
    #[error("service {service} not published, the registry was already withdrawn")]
    Withdrawn { service: String },
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("method {service}.{method} not found")]
    MethodNotFound { service: String, method: String },
}

impl From<LookupError> for ErrorShape {
    fn from(err: LookupError) -> Self {
        let code = match err {
            LookupError::ServiceNotFound(_) => error_codes::SERVICE_NOT_FOUND,
            LookupError::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
        };
        ErrorShape::new(code, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("cannot {action} a server that is {state}")]
    InvalidState {
        action: &'static str,
        state: LifecycleState,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("failed to start force-quit timer: {0}")]
    Timer(#[source] io::Error),
}

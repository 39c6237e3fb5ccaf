use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {async_trait::async_trait, dashmap::DashMap, tracing::debug};

use crate::{
    registry::{DiscoveryError, Registry, RegistryConnector, RegistryKind, RegistryOptions},
    types::{Node, Service, ServiceAttr},
};

/// In-process registry keyed by [`ServiceAttr::key`].
#[derive(Default)]
pub struct MemoryRegistry {
    entries: DashMap<String, Service>,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate an outage: every register/deregister fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn nodes(&self, attr: &ServiceAttr) -> Option<Vec<Node>> {
        self.entries.get(&attr.key()).map(|e| e.nodes.clone())
    }

    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.entries.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| a.attr.key().cmp(&b.attr.key()));
        services
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), DiscoveryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Unavailable("memory registry marked down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register(&self, service: &Service) -> Result<(), DiscoveryError> {
        self.check_available()?;
        let key = service.attr.key();
        debug!(key = %key, nodes = service.nodes.len(), "memory registry: register");
        self.entries.insert(key, service.clone());
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), DiscoveryError> {
        self.check_available()?;
        let key = service.attr.key();
        debug!(key = %key, "memory registry: deregister");
        self.entries.remove(&key);
        Ok(())
    }
}

/// Hands out one shared [`MemoryRegistry`] regardless of the addresses
/// configured, posing as the configured backend kind.
pub struct MemoryConnector {
    kind: RegistryKind,
    registry: Arc<MemoryRegistry>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(kind: RegistryKind, registry: Arc<MemoryRegistry>) -> Self {
        Self {
            kind,
            registry,
            connects: AtomicUsize::new(0),
        }
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryConnector for MemoryConnector {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    async fn connect(&self, options: &RegistryOptions) -> Result<Arc<dyn Registry>, DiscoveryError> {
        debug!(kind = %self.kind, addrs = ?options.addrs, root = %options.root, "memory registry: connect");
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.registry) as Arc<dyn Registry>)
    }
}

use std::{collections::HashMap, fmt, sync::Arc};

use {
    futures::future::join_all,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, info, warn},
};

use ferry_discovery::{Node, Registry, Service, ServiceAttr};

use crate::{
    catalog::{MethodCatalog, MethodDescriptor},
    error::{LookupError, RegisterError},
    service::{ReceiverKind, RpcService, ServiceBuilder, is_exported},
};

// ── Descriptor ───────────────────────────────────────────────────────────────

/// A registered receiver and its callable methods.
#[derive(Debug)]
pub struct ServiceDescriptor {
    name: String,
    type_name: &'static str,
    published_as: String,
    version: String,
    kind: ReceiverKind,
    methods: MethodCatalog,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The receiver's self-reported service name.
    pub fn published_as(&self) -> &str {
        &self.published_as
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn receiver_kind(&self) -> ReceiverKind {
        self.kind
    }

    pub fn methods(&self) -> &MethodCatalog {
        &self.methods
    }
}

// ── Registrar ────────────────────────────────────────────────────────────────

struct Publisher {
    registry: Arc<dyn Registry>,
    template: ServiceAttr,
    nodes: Vec<Node>,
}

/// What has been pushed to the registry. Locked for the whole of each
/// publish, so withdrawal only ever claims finished publishes.
#[derive(Default)]
struct Published {
    services: Vec<Service>,
    withdrawn: bool,
}

/// Owns the service map and keeps the discovery registry in step with it.
pub struct ServiceRegistrar {
    services: RwLock<HashMap<String, Arc<ServiceDescriptor>>>,
    publisher: Option<Publisher>,
    published: Mutex<Published>,
}

impl Default for ServiceRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistrar")
            .field(
                "registry",
                &self.publisher.as_ref().map(|p| p.registry.name()),
            )
            .finish_non_exhaustive()
    }
}

impl ServiceRegistrar {
    /// A registrar that never publishes.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            publisher: None,
            published: Mutex::new(Published::default()),
        }
    }

    /// A registrar that publishes each service as `template` (filled with the
    /// receiver's service name and version) served by `nodes`.
    pub fn with_registry(
        registry: Arc<dyn Registry>,
        template: ServiceAttr,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            publisher: Some(Publisher {
                registry,
                template,
                nodes,
            }),
            ..Self::new()
        }
    }

    /// Add a service and publish it. Returns the registered name. Once
    /// [`deregister_all`](Self::deregister_all) has run, the service is still
    /// added locally but publishing is refused with
    /// [`RegisterError::Withdrawn`].
    pub async fn register<S: RpcService>(
        &self,
        builder: ServiceBuilder<S>,
    ) -> Result<String, RegisterError> {
        let parts = builder.into_parts();
        let name = parts.name;
        if name.is_empty() {
            return Err(RegisterError::EmptyServiceName {
                type_name: parts.type_name,
            });
        }
        if !is_exported(&name) {
            return Err(RegisterError::ServiceNotExported { name });
        }

        let kind = parts.receiver.kind();
        let catalog = MethodCatalog::build(&name, &parts.receiver, parts.methods);

        let descriptor = {
            let mut services = self.services.write().await;
            if services.contains_key(&name) {
                return Err(RegisterError::DuplicateService { name });
            }
            let methods = catalog.map_err(|e| RegisterError::NoSuitableMethods {
                name: name.clone(),
                hint: e.hint,
            })?;
            let descriptor = Arc::new(ServiceDescriptor {
                name: name.clone(),
                type_name: parts.type_name,
                published_as: parts.published_as,
                version: parts.version,
                kind,
                methods,
            });
            services.insert(name.clone(), Arc::clone(&descriptor));
            descriptor
        };
        info!(
            service = %name,
            methods = descriptor.methods.len(),
            receiver = ?kind,
            "service registered"
        );

        let Some(publisher) = &self.publisher else {
            return Ok(name);
        };
        let service = Service {
            attr: publisher
                .template
                .for_service(descriptor.published_as(), descriptor.version()),
            nodes: publisher.nodes.clone(),
        };
        let mut published = self.published.lock().await;
        if published.withdrawn {
            warn!(service = %name, key = %service.attr.key(), "registry withdrawn, not publishing");
            return Err(RegisterError::Withdrawn { service: name });
        }
        if let Err(source) = publisher.registry.register(&service).await {
            warn!(service = %name, key = %service.attr.key(), error = %source, "publish failed");
            return Err(RegisterError::Publish {
                service: name,
                source,
            });
        }
        debug!(service = %name, key = %service.attr.key(), "service published");
        published.services.push(service);
        Ok(name)
    }

    pub async fn lookup(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(Arc<ServiceDescriptor>, Arc<MethodDescriptor>), LookupError> {
        let services = self.services.read().await;
        let descriptor = services
            .get(service)
            .ok_or_else(|| LookupError::ServiceNotFound(service.to_string()))?;
        let method = descriptor
            .methods
            .get(method)
            .ok_or_else(|| LookupError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;
        Ok((Arc::clone(descriptor), Arc::clone(method)))
    }

    /// Withdraw everything published so far and refuse later publishes. A
    /// publish already in flight finishes first and is withdrawn with the
    /// rest. Returns how many withdrawals failed; failures are logged and
    /// otherwise ignored.
    pub async fn deregister_all(&self) -> usize {
        let Some(publisher) = &self.publisher else {
            return 0;
        };
        let published = {
            let mut guard = self.published.lock().await;
            guard.withdrawn = true;
            std::mem::take(&mut guard.services)
        };
        let results = join_all(published.iter().map(|service| async move {
            let result = publisher.registry.deregister(service).await;
            if let Err(e) = &result {
                warn!(key = %service.attr.key(), error = %e, "deregister failed");
            }
            result
        }))
        .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            withdrawn = results.len() - failed,
            failed,
            registry = publisher.registry.name(),
            "services withdrawn"
        );
        failed
    }

    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Published services, in publish order.
    pub async fn published(&self) -> Vec<Service> {
        self.published.lock().await.services.clone()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::service::{CallContext, RpcError},
        async_trait::async_trait,
        ferry_discovery::{DiscoveryError, MemoryRegistry},
        ferry_protocol::CodecType,
        std::time::Duration,
    };

    /// Publishes after a delay, leaving a window where withdrawal can race it.
    struct SlowRegistry(Arc<MemoryRegistry>);

    #[async_trait]
    impl Registry for SlowRegistry {
        fn name(&self) -> &str {
            "slow"
        }

        async fn register(&self, service: &Service) -> Result<(), DiscoveryError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.register(service).await
        }

        async fn deregister(&self, service: &Service) -> Result<(), DiscoveryError> {
            self.0.deregister(service).await
        }
    }

    struct Arith;

    impl RpcService for Arith {
        fn service(&self) -> &str {
            "com.example.Arith"
        }

        fn version(&self) -> &str {
            "v1"
        }
    }

    #[derive(Default)]
    struct Counter(i64);

    impl RpcService for Counter {
        fn service(&self) -> &str {
            "com.example.Counter"
        }

        fn version(&self) -> &str {
            "v2"
        }
    }

    #[allow(non_camel_case_types)]
    struct lowercase;

    impl RpcService for lowercase {
        fn service(&self) -> &str {
            "lower"
        }

        fn version(&self) -> &str {
            "v0"
        }
    }

    fn arith() -> ServiceBuilder<Arith> {
        ServiceBuilder::new(Arith).method("Add", |_: &Arith, (a, b): (i64, i64)| async move {
            Ok::<_, RpcError>(a + b)
        })
    }

    fn publishing(registry: Arc<MemoryRegistry>) -> ServiceRegistrar {
        ServiceRegistrar::with_registry(
            registry,
            ServiceAttr::provider("dc1", "json"),
            vec![Node::new("node", "10.0.0.1", 20000)],
        )
    }

    #[tokio::test]
    async fn registered_method_is_found() {
        let registrar = ServiceRegistrar::new();
        assert_eq!(registrar.register(arith()).await.unwrap(), "Arith");

        let (service, method) = registrar.lookup("Arith", "Add").await.unwrap();
        assert_eq!(service.published_as(), "com.example.Arith");
        assert_eq!(service.receiver_kind(), ReceiverKind::Shared);
        let ctx = CallContext {
            session_id: 0,
            peer: None,
            seq: 3,
            service: "Arith".into(),
            method: "Add".into(),
        };
        let reply = method.invoke(ctx, CodecType::Json, b"[2,3]").await.unwrap();
        assert_eq!(reply, b"5");
    }

    #[tokio::test]
    async fn lookup_misses_are_distinguished() {
        let registrar = ServiceRegistrar::new();
        registrar.register(arith()).await.unwrap();
        assert_eq!(
            registrar.lookup("Nope", "Add").await.unwrap_err(),
            LookupError::ServiceNotFound("Nope".into())
        );
        assert_eq!(
            registrar.lookup("Arith", "Sub").await.unwrap_err(),
            LookupError::MethodNotFound {
                service: "Arith".into(),
                method: "Sub".into()
            }
        );
    }

    #[tokio::test]
    async fn names_are_validated_first() {
        let registrar = ServiceRegistrar::new();
        let err = registrar.register(arith().rename("")).await.unwrap_err();
        assert!(matches!(err, RegisterError::EmptyServiceName { .. }));

        let err = registrar
            .register(ServiceBuilder::new(lowercase).method("Ping", |_: &lowercase, (): ()| async {
                Ok::<_, RpcError>(())
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::ServiceNotExported { ref name } if name == "lowercase"));
        assert!(registrar.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_keeps_first_descriptor() {
        let registrar = ServiceRegistrar::new();
        registrar.register(arith()).await.unwrap();

        let second = ServiceBuilder::new(Arith).method("Mul", |_: &Arith, (a, b): (i64, i64)| async move {
            Ok::<_, RpcError>(a * b)
        });
        let err = registrar.register(second).await.unwrap_err();
        assert!(matches!(err, RegisterError::DuplicateService { ref name } if name == "Arith"));

        assert!(registrar.lookup("Arith", "Add").await.is_ok());
        assert!(registrar.lookup("Arith", "Mul").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_is_reported_before_missing_methods() {
        let registrar = ServiceRegistrar::new();
        registrar.register(arith()).await.unwrap();
        let err = registrar.register(ServiceBuilder::new(Arith)).await.unwrap_err();
        assert!(matches!(err, RegisterError::DuplicateService { .. }));
    }

    #[tokio::test]
    async fn shared_receiver_with_mut_methods_is_told_to_lock() {
        let registrar = ServiceRegistrar::new();
        let builder = || {
            ServiceBuilder::new(Counter::default()).method_mut("Incr", |c: &mut Counter, by: i64| {
                c.0 += by;
                Ok(c.0)
            })
        };
        let err = registrar.register(builder()).await.unwrap_err();
        let RegisterError::NoSuitableMethods { name, hint } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(name, "Counter");
        assert!(hint.unwrap().contains("ServiceBuilder::locked"));

        let locked = ServiceBuilder::locked(Counter::default()).method_mut(
            "Incr",
            |c: &mut Counter, by: i64| {
                c.0 += by;
                Ok(c.0)
            },
        );
        registrar.register(locked).await.unwrap();
        let (service, _) = registrar.lookup("Counter", "Incr").await.unwrap();
        assert_eq!(service.receiver_kind(), ReceiverKind::Locked);
    }

    #[tokio::test]
    async fn publishes_with_template_and_withdraws() {
        let registry = MemoryRegistry::new();
        let registrar = publishing(Arc::clone(&registry));
        registrar.register(arith()).await.unwrap();

        let attr = ServiceAttr::provider("dc1", "json").for_service("com.example.Arith", "v1");
        let nodes = registry.nodes(&attr).unwrap();
        assert_eq!(nodes[0].id, "node-10.0.0.1:20000");
        assert_eq!(registrar.published().await.len(), 1);

        assert_eq!(registrar.deregister_all().await, 0);
        assert!(registry.is_empty());
        assert!(registrar.published().await.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_local_entry() {
        let registry = MemoryRegistry::new();
        registry.set_unavailable(true);
        let registrar = publishing(Arc::clone(&registry));

        let err = registrar.register(arith()).await.unwrap_err();
        assert!(matches!(err, RegisterError::Publish { ref service, .. } if service == "Arith"));
        assert!(registrar.lookup("Arith", "Add").await.is_ok());
        assert!(registrar.published().await.is_empty());
    }

    #[tokio::test]
    async fn nothing_is_published_when_registration_fails() {
        let registry = MemoryRegistry::new();
        let registrar = publishing(Arc::clone(&registry));
        registrar.register(ServiceBuilder::new(Arith)).await.unwrap_err();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn withdraw_failures_are_counted() {
        let registry = MemoryRegistry::new();
        let registrar = publishing(Arc::clone(&registry));
        registrar.register(arith()).await.unwrap();
        registry.set_unavailable(true);
        assert_eq!(registrar.deregister_all().await, 1);
    }

    #[tokio::test]
    async fn withdrawal_waits_for_in_flight_publish() {
        let registry = MemoryRegistry::new();
        let registrar = Arc::new(ServiceRegistrar::with_registry(
            Arc::new(SlowRegistry(Arc::clone(&registry))),
            ServiceAttr::provider("dc1", "json"),
            vec![Node::new("node", "10.0.0.1", 20000)],
        ));

        let pending = tokio::spawn({
            let registrar = Arc::clone(&registrar);
            async move { registrar.register(arith()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registrar.deregister_all().await, 0);

        assert_eq!(pending.await.unwrap().unwrap(), "Arith");
        assert!(registry.is_empty());
        assert!(registrar.published().await.is_empty());
    }

    #[tokio::test]
    async fn publish_after_withdrawal_is_refused() {
        let registry = MemoryRegistry::new();
        let registrar = publishing(Arc::clone(&registry));
        registrar.deregister_all().await;

        let err = registrar.register(arith()).await.unwrap_err();
        assert!(matches!(err, RegisterError::Withdrawn { ref service } if service == "Arith"));
        assert!(registry.is_empty());
        assert!(registrar.lookup("Arith", "Add").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_and_lookup() {
        let registrar = Arc::new(ServiceRegistrar::new());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registrar = Arc::clone(&registrar);
            tasks.push(tokio::spawn(async move {
                let name = format!("Arith{}", i % 8);
                let result = registrar.register(arith().rename(name.clone())).await;
                for _ in 0..50 {
                    // A visible service always has its full method set.
                    if let Ok((svc, _)) = registrar.lookup(&name, "Add").await {
                        assert_eq!(svc.methods().len(), 1);
                    }
                    tokio::task::yield_now().await;
                }
                result.is_ok()
            }));
        }

        let mut successes = 0;
        for task in tasks {
            if task.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 8);
        assert_eq!(registrar.len().await, 8);
    }
}

use std::{fmt, net::SocketAddr, sync::Arc};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use {
    futures::future::join_all,
    tokio::sync::{Mutex, watch},
    tracing::{info, warn},
};

use {
    ferry_config::ServerConfig,
    ferry_discovery::{DiscoveryError, Node, RegistryConnector, ServiceAttr, join_host_port},
    ferry_protocol::{CodecType, PROTOCOL_VERSION},
    ferry_transport::{Listener, SessionHook, TcpTransport, Transport},
};

use crate::{
    dispatch::RpcPackageHandler,
    error::{RegisterError, ServerError},
    events::RpcEventListener,
    registrar::ServiceRegistrar,
    service::{RpcService, ServiceBuilder},
    session::SessionConfigurator,
    shutdown::{FORCED_EXIT_CODE, ForceQuitTimer, ProcessTerminator, Terminator},
};

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "unstarted",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Registry entries withdrawn and every listener closed in time.
    Graceful,
    /// The fail-fast timeout fired first and the terminator was invoked.
    Forced,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Forced => FORCED_EXIT_CODE,
        }
    }
}

/// Called on SIGHUP.
pub type ReloadHook = Arc<dyn Fn() + Send + Sync>;

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct ServerBuilder {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    connectors: Vec<Arc<dyn RegistryConnector>>,
    terminator: Arc<dyn Terminator>,
    reload: Option<ReloadHook>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            transport: Arc::new(TcpTransport),
            connectors: Vec::new(),
            terminator: Arc::new(ProcessTerminator),
            reload: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Make a registry backend available. The one matching the configured
    /// registry type is used.
    pub fn connector(mut self, connector: Arc<dyn RegistryConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn on_reload(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.reload = Some(Arc::new(hook));
        self
    }

    /// Validate the config, then connect the registry if one is configured.
    /// Nothing is connected or bound when validation fails.
    pub async fn build(self) -> Result<Server, ServerError> {
        let config = self.config;
        let codec = config.codec()?;
        let ports = config.listen_ports()?;
        let kind = config.registry_kind()?;

        let nodes: Vec<Node> = ports
            .iter()
            .map(|&port| Node::new(&config.registry.node_id, &config.host, port))
            .collect();

        let registrar = match kind {
            None => ServiceRegistrar::new(),
            Some(kind) => {
                let connector = self
                    .connectors
                    .iter()
                    .find(|c| c.kind() == kind)
                    .ok_or(DiscoveryError::NoConnector(kind))?;
                let registry = connector.connect(&config.registry_options()).await?;
                info!(
                    kind = %kind,
                    registry = registry.name(),
                    addrs = %config.registry.addr,
                    "discovery registry connected"
                );
                ServiceRegistrar::with_registry(
                    registry,
                    ServiceAttr::provider(config.registry.idc.clone(), codec.as_str()),
                    nodes.clone(),
                )
            },
        };

        let sessions = Arc::new(RpcEventListener::new(
            config.session_number,
            config.session_timeout,
        ));
        let (state, _) = watch::channel(LifecycleState::Unstarted);

        Ok(Server {
            config,
            codec,
            ports,
            nodes,
            registrar: Arc::new(registrar),
            sessions,
            transport: self.transport,
            terminator: self.terminator,
            reload: self.reload,
            listeners: Mutex::new(Vec::new()),
            state,
        })
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Owns the listeners, the registrar and the registry connection of one
/// server instance.
pub struct Server {
    config: ServerConfig,
    codec: CodecType,
    ports: Vec<u16>,
    nodes: Vec<Node>,
    registrar: Arc<ServiceRegistrar>,
    sessions: Arc<RpcEventListener>,
    transport: Arc<dyn Transport>,
    terminator: Arc<dyn Terminator>,
    reload: Option<ReloadHook>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    state: watch::Sender<LifecycleState>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Advertised endpoints, one per configured port.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn registrar(&self) -> &Arc<ServiceRegistrar> {
        &self.registrar
    }

    pub fn sessions(&self) -> &Arc<RpcEventListener> {
        &self.sessions
    }

    pub async fn register<S: RpcService>(
        &self,
        builder: ServiceBuilder<S>,
    ) -> Result<String, ServerError> {
        let state = self.state();
        if matches!(state, LifecycleState::Stopping | LifecycleState::Stopped) {
            return Err(ServerError::InvalidState {
                action: "register on",
                state,
            });
        }
        match self.registrar.register(builder).await {
            // Shutdown withdrew the registry while this publish waited.
            Err(RegisterError::Withdrawn { .. }) => Err(ServerError::InvalidState {
                action: "register on",
                state: self.state(),
            }),
            registered => Ok(registered?),
        }
    }

    /// Bind one listener per configured port.
    pub async fn init(&self) -> Result<(), ServerError> {
        self.transition("init", &[LifecycleState::Unstarted], LifecycleState::Initializing)?;

        let handler = Arc::new(RpcPackageHandler::new(&self.registrar, self.codec));
        let hook: Arc<dyn SessionHook> = Arc::new(SessionConfigurator::new(
            self.config.session.clone(),
            self.config.cron_period(),
            handler,
            Arc::clone(&self.sessions),
        ));

        let mut opened: Vec<Arc<dyn Listener>> = Vec::with_capacity(self.ports.len());
        for &port in &self.ports {
            let addr = join_host_port(&self.config.host, port);
            match self.transport.listen(&addr, Arc::clone(&hook)).await {
                Ok(listener) => {
                    info!(addr = %listener.local_addr(), "listener bound");
                    opened.push(listener);
                },
                Err(e) => {
                    warn!(addr = %addr, error = %e, "listen failed, closing opened listeners");
                    close_all(&opened).await;
                    self.state.send_replace(LifecycleState::Unstarted);
                    return Err(e.into());
                },
            }
        }

        *self.listeners.lock().await = opened;
        self.state.send_replace(LifecycleState::Running);
        Ok(())
    }

    /// Bound addresses, in port order.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .await
            .iter()
            .map(|l| l.local_addr())
            .collect()
    }

    /// Start, then serve until SIGINT, SIGTERM or SIGQUIT. SIGHUP runs the
    /// reload hook and keeps serving.
    pub async fn run(&self) -> Result<ShutdownOutcome, ServerError> {
        self.run_until(self.wait_for_signal()).await
    }

    /// Start, serve until `stop` resolves, then shut down.
    pub async fn run_until<F>(&self, stop: F) -> Result<ShutdownOutcome, ServerError>
    where
        F: Future<Output = Result<(), ServerError>>,
    {
        if let Err(e) = self.init().await {
            if self.state() == LifecycleState::Unstarted
                && let Err(stop_err) = self.stop().await
            {
                warn!(error = %stop_err, "cleanup after failed init did not complete");
            }
            return Err(e);
        }
        self.log_banner().await;

        let waited = stop.await;
        let outcome = self.shutdown().await?;
        waited?;
        Ok(outcome)
    }

    /// Withdraw and close under the fail-fast bound. If the bound passes
    /// first the terminator is invoked and the outcome is
    /// [`ShutdownOutcome::Forced`].
    pub async fn shutdown(&self) -> Result<ShutdownOutcome, ServerError> {
        let timeout = self.config.fail_fast_timeout;
        let mut timer = ForceQuitTimer::arm(timeout, Arc::clone(&self.terminator))
            .map_err(ServerError::Timer)?;
        self.transition(
            "shut down",
            &[LifecycleState::Unstarted, LifecycleState::Running],
            LifecycleState::Stopping,
        )?;
        info!(fail_fast_timeout = ?timeout, "shutting down");

        let outcome = tokio::select! {
            biased;
            _ = self.withdraw_and_close() => ShutdownOutcome::Graceful,
            _ = timer.fired() => ShutdownOutcome::Forced,
        };
        if outcome == ShutdownOutcome::Graceful {
            timer.disarm();
        }

        self.state.send_replace(LifecycleState::Stopped);
        info!(outcome = ?outcome, "server stopped");
        Ok(outcome)
    }

    /// Withdraw and close with no time bound.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.transition(
            "stop",
            &[LifecycleState::Unstarted, LifecycleState::Running],
            LifecycleState::Stopping,
        )?;
        self.withdraw_and_close().await;
        self.state.send_replace(LifecycleState::Stopped);
        info!("server stopped");
        Ok(())
    }

    async fn withdraw_and_close(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock().await);
        let (failed, ()) = tokio::join!(self.registrar.deregister_all(), close_all(&listeners));
        if failed > 0 {
            warn!(failed, "some services are still published");
        }
    }

    fn transition(
        &self,
        action: &'static str,
        from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), ServerError> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        match refused {
            None => Ok(()),
            Some(state) => Err(ServerError::InvalidState { action, state }),
        }
    }

    #[cfg(unix)]
    async fn wait_for_signal(&self) -> Result<(), ServerError> {
        let mut interrupt = signal(SignalKind::interrupt()).map_err(ServerError::Signal)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(ServerError::Signal)?;
        let mut quit = signal(SignalKind::quit()).map_err(ServerError::Signal)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(ServerError::Signal)?;

        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = quit.recv() => "SIGQUIT",
                _ = hangup.recv() => {
                    info!(signal = "SIGHUP", "reload requested");
                    if let Some(reload) = &self.reload {
                        reload();
                    }
                    continue;
                },
            };
            info!(signal = name, "shutdown requested");
            return Ok(());
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_signal(&self) -> Result<(), ServerError> {
        tokio::signal::ctrl_c().await.map_err(ServerError::Signal)?;
        info!(signal = "ctrl-c", "shutdown requested");
        Ok(())
    }

    async fn log_banner(&self) {
        let addrs = self
            .local_addrs()
            .await
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let services = self.registrar.service_names().await;
        let registry = match self.config.registry_kind() {
            Ok(Some(kind)) => format!("registry: {kind} at {}", self.config.registry.addr),
            _ => "registry: none".to_string(),
        };
        let lines = [
            format!(
                "{} rpc server v{}",
                self.config.app_name,
                env!("CARGO_PKG_VERSION")
            ),
            format!(
                "protocol v{PROTOCOL_VERSION}, codec {}, listening on {addrs}",
                self.codec
            ),
            format!(
                "{} services registered: {}",
                services.len(),
                services.join(", ")
            ),
            format!(
                "sessions: limit {}, idle timeout {:?}",
                self.config.session_number, self.config.session_timeout
            ),
            registry,
        ];
        let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
        info!("┌{}┐", "─".repeat(width));
        for line in &lines {
            info!("│  {:<w$}│", line, w = width - 2);
        }
        info!("└{}┘", "─".repeat(width));
    }
}

async fn close_all(listeners: &[Arc<dyn Listener>]) {
    join_all(listeners.iter().map(|listener| async move {
        let addr = listener.local_addr();
        match listener.close().await {
            Ok(()) => info!(addr = %addr, "listener closed"),
            Err(e) => warn!(addr = %addr, error = %e, "listener close failed"),
        }
    }))
    .await;
}

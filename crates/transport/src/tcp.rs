use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    futures::FutureExt,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
        net::{
            TcpListener, TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::mpsc,
        time::{Instant, Interval, MissedTickBehavior},
    },
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::{debug, error, warn},
};

use crate::{
    error::TransportError,
    frame::{compress, decompress, read_frame, write_frame},
    session::{
        CompressType, Conn, CronAction, EventListener, Listener, PackageHandler, Session,
        SessionHook, SessionId, SessionInfo, SessionSettings, Transport,
    },
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Plain TCP transport: one task per accepted connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(
        &self,
        addr: &str,
        hook: Arc<dyn SessionHook>,
    ) -> Result<Arc<dyn Listener>, TransportError> {
        let server = TcpServer::start(addr, hook).await?;
        Ok(server)
    }
}

// ── Listener ─────────────────────────────────────────────────────────────────

pub struct TcpServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TcpServer {
    /// Bind `addr` and start accepting. Every accepted connection is handed
    /// to `hook` before its session runs.
    pub async fn start(addr: &str, hook: Arc<dyn SessionHook>) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let server = Arc::new(Self {
            local_addr,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        server.tracker.spawn(accept_loop(
            listener,
            hook,
            server.cancel.clone(),
            server.tracker.clone(),
        ));
        debug!(addr = %local_addr, "tcp listener accepting");
        Ok(server)
    }
}

#[async_trait]
impl Listener for TcpServer {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(addr = %self.local_addr, "tcp listener closed");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    hook: Arc<dyn SessionHook>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            },
        };

        let mut session = TcpSession::new(stream, peer);
        // A hook that panics found a connection it cannot serve; the
        // transport is miswired and the process must not carry on.
        let configured =
            std::panic::catch_unwind(AssertUnwindSafe(|| hook.on_new_session(&mut session)))
                .unwrap_or_else(|_| {
                    error!(peer = %peer, "session hook panicked, aborting");
                    std::process::abort()
                });
        if let Err(e) = configured {
            warn!(peer = %peer, error = %e, "session rejected by hook");
            continue;
        }
        tracker.spawn(session.run(cancel.child_token()));
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct TcpSession {
    id: SessionId,
    stream: TcpStream,
    peer: SocketAddr,
    settings: SessionSettings,
    handler: Option<Arc<dyn PackageHandler>>,
    listener: Option<Arc<dyn EventListener>>,
}

impl TcpSession {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            peer,
            settings: SessionSettings::default(),
            handler: None,
            listener: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn has_pkg_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn has_event_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Drive the session until the peer leaves, an error occurs, the
    /// listener asks to close, or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            id,
            stream,
            peer,
            settings,
            handler,
            listener,
        } = self;
        let (Some(handler), Some(listener)) = (handler, listener) else {
            warn!(session = id, peer = %peer, "session has no package handler or event listener, closing");
            return;
        };

        let info = Arc::new(SessionInfo::new(
            id,
            settings.name.clone(),
            Some(peer),
            stream.local_addr().ok(),
        ));
        if let Err(e) = listener.on_open(&info) {
            debug!(session = %info.stat(), error = %e, "session refused on open");
            listener.on_error(&info, &e);
            return;
        }
        let close = CloseGuard {
            listener: Arc::clone(&listener),
            info: Arc::clone(&info),
        };

        let (read_half, write_half) = stream.into_split();
        let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(settings.rq_len.max(1));
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(settings.wq_len.max(1));
        let stop = cancel.child_token();

        let reader = tokio::spawn(read_loop(
            read_half,
            in_tx,
            settings.clone(),
            Arc::clone(&info),
            Arc::clone(&listener),
            stop.clone(),
        ));
        let mut writer = tokio::spawn(write_loop(
            write_half,
            out_rx,
            settings.clone(),
            Arc::clone(&info),
            Arc::clone(&listener),
        ));

        let mut cron = cron_interval(settings.cron_period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                frame = in_rx.recv() => {
                    let Some(frame) = frame else { break };
                    info.touch();
                    let handled = AssertUnwindSafe(handler.handle(&info, frame))
                        .catch_unwind()
                        .await;
                    let reply = match handled {
                        Ok(Some(reply)) => reply,
                        Ok(None) => continue,
                        Err(_) => {
                            error!(session = %info.stat(), "package handler panicked, closing session");
                            break;
                        },
                    };
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                },
                _ = next_tick(&mut cron) => {
                    if listener.on_cron(&info) == CronAction::Close {
                        debug!(session = %info.stat(), "closed by housekeeping");
                        break;
                    }
                },
            }
        }

        stop.cancel();
        drop(out_tx);
        if tokio::time::timeout(settings.wait_time, &mut writer).await.is_err() {
            debug!(session = %info.stat(), "pending replies dropped after wait time");
            writer.abort();
        }
        reader.abort();
        drop(close);
    }
}

/// Fires `on_close` when dropped, so an opened session is always closed
/// exactly once whichever way its task ends.
struct CloseGuard {
    listener: Arc<dyn EventListener>,
    info: Arc<SessionInfo>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.listener.on_close(&self.info);
    }
}

impl Session for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn stat(&self) -> String {
        format!(
            "session{{id:{}, name:{}, peer:{}}}",
            self.id, self.settings.name, self.peer
        )
    }

    fn conn(&self) -> Conn<'_> {
        Conn::Tcp(&self.stream)
    }

    fn set_compress_type(&mut self, compress: CompressType) {
        self.settings.compress = compress;
    }

    fn set_name(&mut self, name: &str) {
        self.settings.name = name.to_string();
    }

    fn set_max_msg_len(&mut self, len: usize) {
        self.settings.max_msg_len = len;
    }

    fn set_pkg_handler(&mut self, handler: Arc<dyn PackageHandler>) {
        self.handler = Some(handler);
    }

    fn set_event_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listener = Some(listener);
    }

    fn set_rq_len(&mut self, len: usize) {
        self.settings.rq_len = len.max(1);
    }

    fn set_wq_len(&mut self, len: usize) {
        self.settings.wq_len = len.max(1);
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.settings.read_timeout = timeout;
    }

    fn set_write_timeout(&mut self, timeout: Duration) {
        self.settings.write_timeout = timeout;
    }

    fn set_cron_period(&mut self, period: Duration) {
        self.settings.cron_period = period;
    }

    fn set_wait_time(&mut self, wait: Duration) {
        self.settings.wait_time = wait;
    }
}

// ── IO loops ─────────────────────────────────────────────────────────────────

async fn read_loop(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<Bytes>,
    settings: SessionSettings,
    info: Arc<SessionInfo>,
    listener: Arc<dyn EventListener>,
    stop: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        // An idle connection is fine; the deadline only applies once a frame
        // has started arriving.
        let ready = tokio::select! {
            _ = stop.cancelled() => return,
            ready = within(settings.read_timeout, reader.fill_buf()) => ready,
        };
        match ready.map(|r| r.map(|buf| !buf.is_empty())) {
            None => continue,
            Some(Ok(true)) => {},
            Some(Ok(false)) => {
                debug!(session = %info.stat(), "peer closed");
                return;
            },
            Some(Err(e)) => {
                listener.on_error(&info, &e.into());
                return;
            },
        }

        let frame = within(
            settings.read_timeout,
            read_frame(&mut reader, settings.max_msg_len),
        )
        .await
        .unwrap_or(Err(TransportError::ReadTimeout(settings.read_timeout)))
        .and_then(|frame| {
            frame
                .map(|payload| decompress(settings.compress, payload, settings.max_msg_len))
                .transpose()
        });
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(session = %info.stat(), error = %e, "read failed");
                listener.on_error(&info, &e);
                return;
            },
        };

        tokio::select! {
            _ = stop.cancelled() => return,
            sent = tx.send(payload) => {
                if sent.is_err() {
                    return;
                }
            },
        }
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    settings: SessionSettings,
    info: Arc<SessionInfo>,
    listener: Arc<dyn EventListener>,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(payload) = rx.recv().await {
        let result = match compress(settings.compress, payload) {
            Ok(packed) => within(settings.write_timeout, write_frame(&mut writer, &packed))
                .await
                .unwrap_or(Err(TransportError::WriteTimeout(settings.write_timeout))),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(session = %info.stat(), error = %e, "write failed");
            listener.on_error(&info, &e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Await `fut` under `limit`; a zero limit waits forever.
async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

fn cron_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(cron: &mut Option<Interval>) {
    match cron {
        Some(interval) => {
            interval.tick().await;
        },
        None => std::future::pending().await,
    }
}

use std::{io, sync::Arc, time::Duration};

use {
    socket2::{SockRef, TcpKeepalive},
    tokio::net::TcpStream,
    tracing::debug,
};

use {
    ferry_config::SessionConfig,
    ferry_transport::{CompressType, Conn, Session, SessionHook, TransportError},
};

use crate::{dispatch::RpcPackageHandler, events::RpcEventListener};

/// Tunes every accepted connection and attaches the dispatch entry point.
pub struct SessionConfigurator {
    config: SessionConfig,
    cron_period: Duration,
    handler: Arc<RpcPackageHandler>,
    listener: Arc<RpcEventListener>,
}

impl SessionConfigurator {
    pub fn new(
        config: SessionConfig,
        cron_period: Duration,
        handler: Arc<RpcPackageHandler>,
        listener: Arc<RpcEventListener>,
    ) -> Self {
        Self {
            config,
            cron_period,
            handler,
            listener,
        }
    }
}

impl SessionHook for SessionConfigurator {
    /// # Panics
    ///
    /// When the session is not backed by a TCP stream.
    fn on_new_session(&self, session: &mut dyn Session) -> Result<(), TransportError> {
        let cfg = &self.config;
        if cfg.compress_encoding {
            session.set_compress_type(CompressType::Zip);
        }

        match session.conn() {
            Conn::Tcp(stream) => tune_tcp(stream, cfg)?,
            Conn::Other(kind) => panic!(
                "session {} uses a {kind} connection, expected tcp",
                session.id()
            ),
        }

        session.set_name(&cfg.session_name);
        session.set_max_msg_len(cfg.max_msg_len);
        session.set_pkg_handler(self.handler.clone());
        session.set_event_listener(self.listener.clone());
        session.set_rq_len(cfg.read_queue_len);
        session.set_wq_len(cfg.write_queue_len);
        session.set_read_timeout(cfg.tcp_read_timeout);
        session.set_write_timeout(cfg.tcp_write_timeout);
        session.set_cron_period(self.cron_period);
        session.set_wait_time(cfg.wait_timeout);

        debug!(session = %session.stat(), "session configured");
        Ok(())
    }
}

fn tune_tcp(stream: &TcpStream, cfg: &SessionConfig) -> io::Result<()> {
    stream.set_nodelay(cfg.tcp_no_delay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(cfg.tcp_keep_alive)?;
    if cfg.tcp_keep_alive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(cfg.keep_alive_period))?;
    }
    if cfg.tcp_read_buffer > 0 {
        sock.set_recv_buffer_size(cfg.tcp_read_buffer)?;
    }
    if cfg.tcp_write_buffer > 0 {
        sock.set_send_buffer_size(cfg.tcp_write_buffer)?;
    }
    Ok(())
}

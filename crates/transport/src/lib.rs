//! Framed session transport.
//!
//! A [`Transport`] binds listeners; every accepted connection becomes a
//! [`Session`] that a [`SessionHook`] configures before it runs. Running
//! sessions read length-prefixed frames, hand each payload to their
//! [`PackageHandler`] in order, and report lifecycle events to their
//! [`EventListener`].

pub mod error;
pub mod frame;
pub mod session;
pub mod tcp;

pub use {
    error::TransportError,
    session::{
        CompressType, Conn, CronAction, EventListener, Listener, PackageHandler, Session,
        SessionHook, SessionId, SessionInfo, SessionSettings, Transport,
    },
    tcp::{TcpServer, TcpSession, TcpTransport},
};

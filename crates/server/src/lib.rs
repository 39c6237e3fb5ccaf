//! RPC server runtime.
//!
//! Services are declared with [`ServiceBuilder`] and registered on a
//! [`Server`], which binds one listener per configured port, dispatches
//! request frames to the registered methods, publishes every service to the
//! discovery registry and withdraws them again on shutdown.

pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod registrar;
pub mod server;
pub mod service;
pub mod session;
pub mod shutdown;

pub use {
    catalog::{Invoker, MethodCatalog, MethodDescriptor, NoEligibleMethods},
    dispatch::RpcPackageHandler,
    error::{LookupError, RegisterError, ServerError},
    events::{RpcEventListener, SessionEntry},
    registrar::{ServiceDescriptor, ServiceRegistrar},
    server::{LifecycleState, ReloadHook, Server, ServerBuilder, ShutdownOutcome},
    service::{
        CallContext, CallFuture, ReceiverKind, ReceiverRequirement, RpcError, RpcService,
        ServiceBuilder,
    },
    session::SessionConfigurator,
    shutdown::{FORCED_EXIT_CODE, ProcessTerminator, Terminator},
};

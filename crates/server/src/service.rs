//! Declaring services: the [`RpcService`] trait receivers implement and the
//! [`ServiceBuilder`] that lists their remotely callable methods.

use std::{
    any::type_name,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use {
    futures::{FutureExt, future::BoxFuture},
    serde::{Serialize, de::DeserializeOwned},
};

use {
    ferry_protocol::{CodecType, ErrorShape, error_codes},
    ferry_transport::SessionId,
};

// ── Types ────────────────────────────────────────────────────────────────────

/// A receiver object whose methods can be called remotely.
pub trait RpcService: Send + Sync + 'static {
    /// Service name published to the discovery registry.
    fn service(&self) -> &str;
    /// Version published alongside [`RpcService::service`].
    fn version(&self) -> &str;
}

/// Per-call metadata, available to methods registered with
/// [`ServiceBuilder::method_ctx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub session_id: SessionId,
    pub peer: Option<SocketAddr>,
    pub seq: u64,
    pub service: String,
    pub method: String,
}

/// Error returned by a method implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcError {
    /// An application error with the default [`error_codes::APPLICATION`] code.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(error_codes::APPLICATION, message)
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<RpcError> for ErrorShape {
    fn from(err: RpcError) -> Self {
        ErrorShape::new(err.code, err.message)
    }
}

/// How the receiver is held by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    /// Shared reference only; methods run concurrently.
    Shared,
    /// Behind a mutex; `&mut self` methods are available.
    Locked,
}

/// What a method needs from its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverRequirement {
    Shared,
    Exclusive,
}

impl ReceiverKind {
    pub fn satisfies(self, requirement: ReceiverRequirement) -> bool {
        match requirement {
            ReceiverRequirement::Shared => true,
            ReceiverRequirement::Exclusive => self == Self::Locked,
        }
    }
}

/// Reply future of one shared method call.
pub type CallFuture = BoxFuture<'static, Result<Vec<u8>, ErrorShape>>;

type SharedHandler<S> =
    Arc<dyn Fn(&S, CallContext, CodecType, &[u8]) -> Result<CallFuture, ErrorShape> + Send + Sync>;

type ExclusiveHandler<S> =
    Arc<dyn Fn(&mut S, CallContext, CodecType, &[u8]) -> Result<Vec<u8>, ErrorShape> + Send + Sync>;

pub(crate) enum Handler<S> {
    Shared(SharedHandler<S>),
    Exclusive(ExclusiveHandler<S>),
}

pub(crate) enum Receiver<S> {
    Shared(Arc<S>),
    Locked(Arc<Mutex<S>>),
}

impl<S> Receiver<S> {
    pub(crate) fn kind(&self) -> ReceiverKind {
        match self {
            Self::Shared(_) => ReceiverKind::Shared,
            Self::Locked(_) => ReceiverKind::Locked,
        }
    }
}

/// A method as declared on the builder, before eligibility is checked.
pub(crate) struct DeclaredMethod<S> {
    pub name: String,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    pub takes_context: bool,
    pub handler: Handler<S>,
}

impl<S> DeclaredMethod<S> {
    pub(crate) fn requirement(&self) -> ReceiverRequirement {
        match self.handler {
            Handler::Shared(_) => ReceiverRequirement::Shared,
            Handler::Exclusive(_) => ReceiverRequirement::Exclusive,
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Collects a receiver and the methods it exposes.
///
/// ```ignore
/// let arith = ServiceBuilder::new(Arith)
///     .method("Add", |_, args: Pair| async move { Ok(args.a + args.b) })
///     .method_ctx("Whoami", |_, ctx, (): ()| async move { Ok(ctx.peer) });
/// server.register(arith).await?;
/// ```
///
/// Only methods whose names start with an uppercase letter are callable;
/// others are skipped at registration.
pub struct ServiceBuilder<S> {
    name: String,
    type_name: &'static str,
    published_as: String,
    version: String,
    receiver: Receiver<S>,
    methods: Vec<DeclaredMethod<S>>,
}

pub(crate) struct ServiceParts<S> {
    pub name: String,
    pub type_name: &'static str,
    pub published_as: String,
    pub version: String,
    pub receiver: Receiver<S>,
    pub methods: Vec<DeclaredMethod<S>>,
}

impl<S: RpcService> ServiceBuilder<S> {
    /// Hold `service` behind a shared reference.
    pub fn new(service: S) -> Self {
        Self::shared(Arc::new(service))
    }

    pub fn shared(service: Arc<S>) -> Self {
        let published_as = service.service().to_string();
        let version = service.version().to_string();
        Self::with_receiver(Receiver::Shared(service), published_as, version)
    }

    /// Hold `service` behind a mutex so `&mut self` methods can be exposed
    /// through [`ServiceBuilder::method_mut`].
    pub fn locked(service: S) -> Self {
        let published_as = service.service().to_string();
        let version = service.version().to_string();
        Self::with_receiver(
            Receiver::Locked(Arc::new(Mutex::new(service))),
            published_as,
            version,
        )
    }

    fn with_receiver(receiver: Receiver<S>, published_as: String, version: String) -> Self {
        let type_name = type_name::<S>();
        Self {
            name: short_type_name(type_name).to_string(),
            type_name,
            published_as,
            version,
            receiver,
            methods: Vec::new(),
        }
    }

    /// Register under `name` instead of the receiver's type name.
    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_kind(&self) -> ReceiverKind {
        self.receiver.kind()
    }

    /// An async method taking `&self` and one argument.
    pub fn method<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(&S, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.push_shared(name, false, move |recv: &S, _ctx: CallContext, args: A| f(recv, args))
    }

    /// Like [`ServiceBuilder::method`], with the call's [`CallContext`].
    pub fn method_ctx<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(&S, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.push_shared(name, true, f)
    }

    /// A synchronous method taking `&mut self`. Only callable on a
    /// [`ServiceBuilder::locked`] receiver.
    pub fn method_mut<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(&mut S, A) -> Result<R, RpcError> + Send + Sync + 'static,
    {
        let handler = move |recv: &mut S,
                            _ctx: CallContext,
                            codec: CodecType,
                            body: &[u8]|
              -> Result<Vec<u8>, ErrorShape> {
            let args = decode_args::<A>(codec, body)?;
            let reply = f(recv, args)?;
            encode_reply(codec, &reply)
        };
        self.methods.push(DeclaredMethod {
            name: name.to_string(),
            arg_type: type_name::<A>(),
            reply_type: type_name::<R>(),
            takes_context: false,
            handler: Handler::Exclusive(Arc::new(handler)),
        });
        self
    }

    fn push_shared<A, R, F, Fut>(mut self, name: &str, takes_context: bool, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(&S, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = move |recv: &S,
                            ctx: CallContext,
                            codec: CodecType,
                            body: &[u8]|
              -> Result<CallFuture, ErrorShape> {
            let args = decode_args::<A>(codec, body)?;
            let call = f(recv, ctx, args);
            Ok(async move {
                let reply = call.await?;
                encode_reply(codec, &reply)
            }
            .boxed())
        };
        self.methods.push(DeclaredMethod {
            name: name.to_string(),
            arg_type: type_name::<A>(),
            reply_type: type_name::<R>(),
            takes_context,
            handler: Handler::Shared(Arc::new(handler)),
        });
        self
    }

    pub(crate) fn into_parts(self) -> ServiceParts<S> {
        ServiceParts {
            name: self.name,
            type_name: self.type_name,
            published_as: self.published_as,
            version: self.version,
            receiver: self.receiver,
            methods: self.methods,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// `my_crate::svc::Arith<u32>` → `Arith`.
pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Exported names start with an uppercase letter.
pub(crate) fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

fn decode_args<A: DeserializeOwned>(codec: CodecType, body: &[u8]) -> Result<A, ErrorShape> {
    codec.decode(body).map_err(|e| {
        ErrorShape::new(
            error_codes::INVALID_ARGUMENT,
            format!("cannot decode {}: {e}", type_name::<A>()),
        )
    })
}

fn encode_reply<R: Serialize>(codec: CodecType, reply: &R) -> Result<Vec<u8>, ErrorShape> {
    codec
        .encode(reply)
        .map_err(|e| ErrorShape::new(error_codes::INTERNAL, format!("cannot encode reply: {e}")))
}

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> ErrorShape {
    ErrorShape::new(
        error_codes::INTERNAL,
        "service state is poisoned by an earlier panic",
    )
}

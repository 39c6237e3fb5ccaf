//! Eligibility of declared methods and the descriptors built from them.

use std::{collections::BTreeMap, fmt, sync::Arc};

use {
    futures::{FutureExt, future},
    tracing::{debug, warn},
};

use ferry_protocol::{CodecType, ErrorShape, error_codes};

use crate::service::{
    CallContext, CallFuture, DeclaredMethod, Handler, ReceiverKind, ReceiverRequirement, Receiver,
    RpcService, is_exported, poisoned,
};

/// Type-erased call entry point bound to its receiver.
pub type Invoker = Arc<dyn Fn(CallContext, CodecType, &[u8]) -> CallFuture + Send + Sync>;

/// One remotely callable method. Built once at registration, immutable after.
pub struct MethodDescriptor {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    requirement: ReceiverRequirement,
    takes_context: bool,
    invoker: Invoker,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn requirement(&self) -> ReceiverRequirement {
        self.requirement
    }

    pub fn takes_context(&self) -> bool {
        self.takes_context
    }

    /// Decode `body`, run the method and encode its reply.
    pub async fn invoke(
        &self,
        ctx: CallContext,
        codec: CodecType,
        body: &[u8],
    ) -> Result<Vec<u8>, ErrorShape> {
        (self.invoker)(ctx, codec, body).await
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("requirement", &self.requirement)
            .field("takes_context", &self.takes_context)
            .finish_non_exhaustive()
    }
}

/// Why a receiver ended up with no callable methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoEligibleMethods {
    /// Set when a locked receiver would have exposed methods.
    pub hint: Option<String>,
}

/// The ordered set of methods a receiver exposes.
#[derive(Debug, Default)]
pub struct MethodCatalog {
    methods: BTreeMap<String, Arc<MethodDescriptor>>,
}

impl MethodCatalog {
    /// Keep the declared methods that are exported and whose receiver
    /// requirement `receiver` satisfies. Everything else is skipped.
    pub(crate) fn build<S: RpcService>(
        service: &str,
        receiver: &Receiver<S>,
        declared: Vec<DeclaredMethod<S>>,
    ) -> Result<Self, NoEligibleMethods> {
        let kind = receiver.kind();
        let locked_would_help = kind == ReceiverKind::Shared
            && declared
                .iter()
                .any(|m| is_eligible(ReceiverKind::Locked, m));

        let mut methods = BTreeMap::new();
        for method in declared {
            if !is_exported(&method.name) {
                debug!(service, method = %method.name, "skipping unexported method");
                continue;
            }
            if !kind.satisfies(method.requirement()) {
                debug!(service, method = %method.name, "skipping method that needs a locked receiver");
                continue;
            }
            if methods.contains_key(&method.name) {
                warn!(service, method = %method.name, "method declared twice, keeping the first");
                continue;
            }
            let descriptor = MethodDescriptor {
                requirement: method.requirement(),
                invoker: bind(receiver, method.handler),
                name: method.name,
                arg_type: method.arg_type,
                reply_type: method.reply_type,
                takes_context: method.takes_context,
            };
            methods.insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        if methods.is_empty() {
            let hint = locked_would_help.then(|| {
                format!("{service} has `&mut self` methods; register it with ServiceBuilder::locked")
            });
            return Err(NoEligibleMethods { hint });
        }
        Ok(Self { methods })
    }

    pub fn get(&self, method: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(method)
    }

    /// Method names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn is_eligible<S>(kind: ReceiverKind, method: &DeclaredMethod<S>) -> bool {
    is_exported(&method.name) && kind.satisfies(method.requirement())
}

fn bind<S: RpcService>(receiver: &Receiver<S>, handler: Handler<S>) -> Invoker {
    match (receiver, handler) {
        (Receiver::Shared(recv), Handler::Shared(h)) => {
            let recv = Arc::clone(recv);
            Arc::new(move |ctx: CallContext, codec: CodecType, body: &[u8]| {
                match h(recv.as_ref(), ctx, codec, body) {
                    Ok(call) => call,
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            })
        },
        (Receiver::Locked(recv), Handler::Shared(h)) => {
            let recv = Arc::clone(recv);
            Arc::new(move |ctx: CallContext, codec: CodecType, body: &[u8]| {
                // The guard is released before the returned future runs.
                let started = recv
                    .lock()
                    .map_err(poisoned)
                    .and_then(|guard| h(&*guard, ctx, codec, body));
                match started {
                    Ok(call) => call,
                    Err(e) => future::ready(Err(e)).boxed(),
                }
            })
        },
        (Receiver::Locked(recv), Handler::Exclusive(h)) => {
            let recv = Arc::clone(recv);
            Arc::new(move |ctx: CallContext, codec: CodecType, body: &[u8]| {
                let result = recv
                    .lock()
                    .map_err(poisoned)
                    .and_then(|mut guard| h(&mut *guard, ctx, codec, body));
                future::ready(result).boxed()
            })
        },
        // Filtered out by eligibility before binding.
        (Receiver::Shared(_), Handler::Exclusive(_)) => {
            Arc::new(|_: CallContext, _: CodecType, _: &[u8]| -> CallFuture {
                future::ready(Err(ErrorShape::new(
                    error_codes::INTERNAL,
                    "method needs a locked receiver",
                )))
                .boxed()
            })
        },
    }
}

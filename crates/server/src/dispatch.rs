use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    futures::FutureExt,
    tracing::{debug, error, warn},
};

use {
    ferry_protocol::{CodecType, ErrorShape, RequestFrame, ResponseFrame, error_codes},
    ferry_transport::{PackageHandler, SessionInfo},
};

use crate::{registrar::ServiceRegistrar, service::CallContext};

/// Decodes request frames, routes them through the registrar and encodes
/// the reply. Holds the registrar weakly so open sessions never keep a
/// stopped server alive.
pub struct RpcPackageHandler {
    registrar: Weak<ServiceRegistrar>,
    codec: CodecType,
}

impl RpcPackageHandler {
    pub fn new(registrar: &Arc<ServiceRegistrar>, codec: CodecType) -> Self {
        Self {
            registrar: Arc::downgrade(registrar),
            codec,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub async fn dispatch(&self, session: &SessionInfo, payload: &[u8]) -> ResponseFrame {
        let request: RequestFrame = match self.codec.decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(session = session.id(), error = %e, "malformed request frame");
                return ResponseFrame::err(
                    0,
                    ErrorShape::new(error_codes::INVALID_REQUEST, e.to_string()),
                );
            },
        };
        let seq = request.seq;

        let Some(registrar) = self.registrar.upgrade() else {
            return ResponseFrame::err(
                seq,
                ErrorShape::new(error_codes::UNAVAILABLE, "server is shutting down"),
            );
        };

        let method = match registrar.lookup(&request.service, &request.method).await {
            Ok((_, method)) => method,
            Err(e) => {
                warn!(
                    service = %request.service,
                    method = %request.method,
                    session = session.id(),
                    "unknown method"
                );
                return ResponseFrame::err(seq, e.into());
            },
        };
        drop(registrar);

        debug!(
            service = %request.service,
            method = %request.method,
            seq,
            session = session.id(),
            "dispatching method"
        );
        let ctx = CallContext {
            session_id: session.id(),
            peer: session.peer(),
            seq,
            service: request.service,
            method: request.method,
        };
        let (service, name) = (ctx.service.clone(), ctx.method.clone());
        let invoked = AssertUnwindSafe(method.invoke(ctx, self.codec, &request.body))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(service = %service, method = %name, seq, "method panicked");
                Err(ErrorShape::new(error_codes::INTERNAL, "method panicked"))
            });
        match invoked {
            Ok(body) => {
                debug!(service = %service, method = %name, seq, "method ok");
                ResponseFrame::ok(seq, body)
            },
            Err(err) => {
                warn!(service = %service, method = %name, seq, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(seq, err)
            },
        }
    }
}

#[async_trait]
impl PackageHandler for RpcPackageHandler {
    async fn handle(&self, session: &SessionInfo, payload: Bytes) -> Option<Bytes> {
        let response = self.dispatch(session, &payload).await;
        match self.codec.encode(&response) {
            Ok(encoded) => Some(Bytes::from(encoded)),
            Err(e) => {
                warn!(session = session.id(), seq = response.seq, error = %e, "cannot encode response");
                None
            },
        }
    }
}

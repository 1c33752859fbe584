use crate::msgs::WireMsg;
use crate::route_head::RouteHead;
use crate::router::Router;
use crate::socket::Socket;
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Everything a handler gets to see, passed explicitly rather than smuggled
/// through task-local state.
pub struct CallContext<'a> {
    pub router: &'a Router,
    pub socket: &'a Arc<Socket>,
    pub head: RouteHead,
}

/// A registered handler: decode the body, do the work, produce a serialized
/// response. A returned error becomes a `RespErr` reply and never closes
/// the socket.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn call(&self, ctx: &CallContext<'_>, body: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Startup-populated mapping msg id -> handler. Populated once before the
/// server starts, read-only afterwards, so lookups take no lock.
#[derive(Default)]
pub struct CallTable {
    handlers: FxHashMap<u32, Arc<dyn CallHandler>>,
}

impl CallTable {
    pub fn new() -> CallTable {
        CallTable::default()
    }

    pub fn register(&mut self, msg_id: u32, handler: Arc<dyn CallHandler>) -> anyhow::Result<()> {
        if msg_id == 0 {
            bail!("msg id 0 is reserved");
        }
        match self.handlers.entry(msg_id) {
            Entry::Occupied(_) => bail!("a handler is already registered for msg id {}", msg_id),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    /// Registers a typed handler under its request's msg id, wrapping it
    /// with body decode and response encode.
    pub fn register_typed<H: TypedHandler>(&mut self, handler: H) -> anyhow::Result<()> {
        self.register(H::Req::MSG_ID, Arc::new(TypedAdapter(handler)))
    }

    pub fn get(&self, msg_id: u32) -> Option<Arc<dyn CallHandler>> {
        self.handlers.get(&msg_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A handler over concrete request/response types. The request and response
/// share a msg id, so the adapter can both dispatch and validate replies.
#[async_trait]
pub trait TypedHandler: Send + Sync + 'static {
    type Req: WireMsg;
    type Resp: WireMsg;

    async fn handle(&self, ctx: &CallContext<'_>, req: Self::Req) -> anyhow::Result<Self::Resp>;
}

struct TypedAdapter<H>(H);

#[async_trait]
impl<H: TypedHandler> CallHandler for TypedAdapter<H> {
    async fn call(&self, ctx: &CallContext<'_>, body: &[u8]) -> anyhow::Result<Vec<u8>> {
        let req = H::Req::from_body(body)?;
        let resp = self.0.handle(ctx, req).await?;
        let mut buf = BytesMut::new();
        resp.ser(&mut buf);
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::{EchoRequest, EchoResponse};

    struct UppercaseEcho;

    #[async_trait]
    impl TypedHandler for UppercaseEcho {
        type Req = EchoRequest;
        type Resp = EchoResponse;

        async fn handle(&self, _ctx: &CallContext<'_>, req: EchoRequest) -> anyhow::Result<EchoResponse> {
            Ok(EchoResponse { msg: req.msg.to_uppercase() })
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut table = CallTable::new();
        table.register_typed(UppercaseEcho).unwrap();
        assert!(table.register_typed(UppercaseEcho).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_msg_id_zero_is_reserved() {
        let mut table = CallTable::new();
        struct Nop;
        #[async_trait]
        impl CallHandler for Nop {
            async fn call(&self, _ctx: &CallContext<'_>, _body: &[u8]) -> anyhow::Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }
        assert!(table.register(0, Arc::new(Nop)).is_err());
    }

    #[test]
    fn test_lookup() {
        let mut table = CallTable::new();
        table.register_typed(UppercaseEcho).unwrap();
        assert!(table.get(EchoRequest::MSG_ID).is_some());
        assert!(table.get(9999).is_none());
    }
}

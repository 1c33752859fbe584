use crate::calltable::{CallContext, CallTable, TypedHandler};
use crate::group::GroupManager;
use crate::msgs::{
    EchoRequest, EchoResponse, ErrMsg, GroupBroadcastRequest, GroupBroadcastResponse,
    ListGroupsRequest, ListGroupsResponse, WireMsg,
};
use crate::packet::{frame_type, Frame};
use crate::permit::Permit;
use crate::route_head::{MsgKind, RouteHead};
use crate::server::SocketDispatcher;
use crate::socket::Socket;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Published whenever a user session comes up or goes down. An evicted
/// session produces no Offline event - its replacement is already Online.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserStatChange {
    pub socket_id: String,
    pub uid: u32,
    pub online: bool,
}

/// The dispatch core: decides per route frame between a local handler call
/// and a forward to a peer socket, and maintains the uid and group
/// registries across session lifecycles.
///
/// The router holds sockets only through its registries; sockets never
/// reference the router back.
pub struct Router {
    self_uid: u32,
    users: RwLock<FxHashMap<u32, Arc<Socket>>>,
    groups: GroupManager,
    calls: CallTable,
    permit: Option<Arc<dyn Permit>>,
    events: Option<mpsc::Sender<UserStatChange>>,
}

impl Router {
    pub fn new(calls: CallTable) -> Router {
        Router {
            self_uid: 0,
            users: RwLock::new(FxHashMap::default()),
            groups: GroupManager::new(),
            calls,
            permit: None,
            events: None,
        }
    }

    pub fn with_permit(mut self, permit: Arc<dyn Permit>) -> Router {
        self.permit = Some(permit);
        self
    }

    /// Identity of this process itself. Frames targeting it are dispatched
    /// locally exactly like uid 0.
    pub fn with_self_uid(mut self, uid: u32) -> Router {
        self.self_uid = uid;
        self
    }

    pub fn with_event_queue(mut self, events: mpsc::Sender<UserStatChange>) -> Router {
        self.events = Some(events);
        self
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    pub async fn get_socket_by_uid(&self, uid: u32) -> Option<Arc<Socket>> {
        self.users.read().await.get(&uid).cloned()
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Registers the session under its uid, evicting and closing any prior
    /// session of the same user first (at most one session per uid), then
    /// joins the role's default groups and publishes Online.
    pub async fn on_user_online(&self, socket: &Arc<Socket>) {
        let user = socket.user();
        if user.is_anonymous() {
            debug!(id = %socket.id(), "anonymous session, not registered for routing");
            return;
        }

        let evicted = {
            let mut users = self.users.write().await;
            let prev = users.remove(&user.uid);
            if let Some(prev) = &prev {
                if !Arc::ptr_eq(prev, socket) {
                    prev.close();
                }
            }
            users.insert(user.uid, socket.clone());
            prev
        };
        if let Some(evicted) = evicted {
            info!(uid = user.uid, old = %evicted.id(), new = %socket.id(), "re-login evicted previous session");
        }

        for group in self.login_groups(&user.role) {
            self.groups.add_to(&group, user.uid, socket.clone()).await;
        }

        info!(uid = user.uid, id = %socket.id(), name = %user.name, "user online");
        self.publish(UserStatChange {
            socket_id: socket.id().to_string(),
            uid: user.uid,
            online: true,
        })
        .await;
    }

    /// Mirror of `on_user_online`. The registry entry is removed only if it
    /// still points at this socket - an evicted session must not tear down
    /// its replacement.
    pub async fn on_user_offline(&self, socket: &Arc<Socket>) {
        let user = socket.user();
        if user.is_anonymous() {
            return;
        }

        let removed = {
            let mut users = self.users.write().await;
            match users.get(&user.uid) {
                Some(current) if Arc::ptr_eq(current, socket) => {
                    users.remove(&user.uid);
                    true
                }
                _ => false,
            }
        };

        self.groups.remove_everywhere(user.uid, socket).await;

        if removed {
            info!(uid = user.uid, id = %socket.id(), "user offline");
            self.publish(UserStatChange {
                socket_id: socket.id().to_string(),
                uid: user.uid,
                online: false,
            })
            .await;
        } else {
            debug!(uid = user.uid, id = %socket.id(), "offline session was already replaced");
        }
    }

    async fn on_route_frame(&self, socket: &Arc<Socket>, frame: Frame) {
        let head = match RouteHead::from_frame(&frame) {
            Ok(head) => head,
            Err(e) => {
                debug!(id = %socket.id(), "dropping route frame with bad head: {}", e);
                socket.bump_err();
                return;
            }
        };

        if head.target_uid == 0 || head.target_uid == self.self_uid {
            self.on_call(socket, frame, head).await;
        } else {
            self.forward(socket, frame, head).await;
        }
    }

    /// Rewrites the source uid and enqueues the frame on the target's send
    /// queue; the frame stays byte-identical apart from that one field. An
    /// absent target is dropped silently.
    async fn forward(&self, socket: &Arc<Socket>, frame: Frame, head: RouteHead) {
        let source_uid = socket.user().uid;
        if source_uid == 0 {
            debug!(id = %socket.id(), "dropping forward from unauthenticated session");
            return;
        }

        let Some(target) = self.get_socket_by_uid(head.target_uid).await else {
            debug!(target = head.target_uid, "forward target not found");
            return;
        };

        if !self.forward_allowed(&socket.user().role, &target.user().role, head.msg_id) {
            debug!(
                id = %socket.id(),
                target = head.target_uid,
                msg_id = head.msg_id,
                "forward denied"
            );
            socket.bump_err();
            return;
        }

        let mut fwd_head = head;
        fwd_head.source_uid = source_uid;
        let mut fwd = frame;
        fwd.set_head(fwd_head.to_bytes());

        if let Err(e) = target.send(fwd).await {
            debug!(target = head.target_uid, "forward failed: {}", e);
        }
    }

    async fn on_call(&self, socket: &Arc<Socket>, frame: Frame, head: RouteHead) {
        let Some(handler) = self.calls.get(head.msg_id) else {
            debug!(msg_id = head.msg_id, "no handler for msg id");
            socket.bump_err();
            return;
        };

        if !self.call_allowed(&socket.user().role, head.msg_id) {
            debug!(id = %socket.id(), msg_id = head.msg_id, "call denied");
            socket.bump_err();
            return;
        }

        let ctx = CallContext { router: self, socket, head };
        match handler.call(&ctx, frame.body()).await {
            Ok(body) => {
                let kind = match head.msg_kind {
                    MsgKind::Request => MsgKind::Response,
                    other => other,
                };
                if let Err(e) = self.send_message(socket, head.ask_id, kind, head.msg_id, body).await {
                    debug!(id = %socket.id(), "reply failed: {}", e);
                }
            }
            Err(e) => {
                debug!(id = %socket.id(), msg_id = head.msg_id, "handler error: {}", e);
                socket.bump_err();
                let body = ErrMsg { code: -1, detail: e.to_string() }.to_body();
                let _ = self
                    .send_message(socket, head.ask_id, MsgKind::RespErr, head.msg_id, body)
                    .await;
            }
        }
    }

    /// Builds and enqueues a route frame addressed back at the session.
    pub async fn send_message(
        &self,
        socket: &Arc<Socket>,
        ask_id: u32,
        kind: MsgKind,
        msg_id: u32,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        let head = RouteHead {
            target_uid: socket.user().uid,
            source_uid: self.self_uid,
            ask_id,
            msg_id,
            msg_kind: kind,
        };
        let frame = Frame::new(frame_type::ROUTE)
            .with_head(head.to_bytes())
            .with_body(body);
        socket.send(frame).await?;
        Ok(())
    }

    /// Enqueues the frame on every member of the group except the sender
    /// and returns how many enqueues succeeded. An absent group has zero
    /// recipients.
    pub async fn broadcast_to_group(&self, group: &str, skip_uid: u32, frame: &Frame) -> u32 {
        let Some(group) = self.groups.get(group).await else {
            return 0;
        };
        let mut count = 0u32;
        for (uid, socket) in group.snapshot().await {
            if uid == skip_uid {
                continue;
            }
            if socket.send(frame.clone()).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    fn login_groups(&self, role: &str) -> Vec<String> {
        match &self.permit {
            Some(permit) => permit.role_groups(role),
            None => Vec::new(),
        }
    }

    fn call_allowed(&self, role: &str, msg_id: u32) -> bool {
        self.permit
            .as_ref()
            .map_or(true, |p| p.call_enable(role, msg_id))
    }

    fn forward_allowed(&self, source_role: &str, target_role: &str, msg_id: u32) -> bool {
        self.permit
            .as_ref()
            .map_or(true, |p| p.forward_enable(source_role, target_role, msg_id))
    }

    async fn publish(&self, event: UserStatChange) {
        if let Some(events) = &self.events {
            if events.send(event).await.is_err() {
                debug!("event queue closed, dropping user stat change");
            }
        }
    }
}

#[async_trait]
impl SocketDispatcher for Router {
    async fn on_message(&self, socket: &Arc<Socket>, frame: Frame) {
        if frame.frame_type() != frame_type::ROUTE {
            debug!(id = %socket.id(), "dropping frame of unhandled type {:#04x}", frame.frame_type());
            return;
        }
        self.on_route_frame(socket, frame).await;
    }

    async fn on_status(&self, socket: &Arc<Socket>, connected: bool) {
        if connected {
            self.on_user_online(socket).await;
        } else {
            self.on_user_offline(socket).await;
        }
    }
}

pub struct EchoHandler;

#[async_trait]
impl TypedHandler for EchoHandler {
    type Req = EchoRequest;
    type Resp = EchoResponse;

    async fn handle(&self, _ctx: &CallContext<'_>, req: EchoRequest) -> anyhow::Result<EchoResponse> {
        Ok(EchoResponse { msg: req.msg })
    }
}

/// Fans the carried payload out to the caller's group as an async route
/// frame and reports how many peers got it enqueued.
pub struct GroupBroadcastHandler;

#[async_trait]
impl TypedHandler for GroupBroadcastHandler {
    type Req = GroupBroadcastRequest;
    type Resp = GroupBroadcastResponse;

    async fn handle(
        &self,
        ctx: &CallContext<'_>,
        req: GroupBroadcastRequest,
    ) -> anyhow::Result<GroupBroadcastResponse> {
        let sender_uid = ctx.socket.user().uid;
        let head = RouteHead {
            target_uid: 0,
            source_uid: sender_uid,
            ask_id: 0,
            msg_id: req.msg_id,
            msg_kind: MsgKind::Async,
        };
        let frame = Frame::new(frame_type::ROUTE)
            .with_head(head.to_bytes())
            .with_body(req.data);

        let recv_count = ctx.router.broadcast_to_group(&req.group, sender_uid, &frame).await;
        Ok(GroupBroadcastResponse { recv_count })
    }
}

pub struct ListGroupsHandler;

#[async_trait]
impl TypedHandler for ListGroupsHandler {
    type Req = ListGroupsRequest;
    type Resp = ListGroupsResponse;

    async fn handle(
        &self,
        ctx: &CallContext<'_>,
        _req: ListGroupsRequest,
    ) -> anyhow::Result<ListGroupsResponse> {
        Ok(ListGroupsResponse { groups: ctx.router.groups().group_names().await })
    }
}

/// The handlers every stock deployment registers.
pub fn builtin_call_table() -> CallTable {
    let mut calls = CallTable::new();
    calls
        .register_typed(EchoHandler)
        .expect("echo handler registers into an empty table");
    calls
        .register_typed(GroupBroadcastHandler)
        .expect("group broadcast handler registers into an empty table");
    calls
        .register_typed(ListGroupsHandler)
        .expect("list groups handler registers into an empty table");
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenAuth, UserInfo};
    use crate::client::Client;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::error::CallError;
    use crate::permit::{LocalPermit, MockPermit};
    use crate::server::{Server, ServerOptions};
    use crate::test_util::CapturingClientDispatcher;
    use std::net::SocketAddr;
    use std::time::Duration;

    const CALL_DEADLINE: Duration = Duration::from_secs(2);

    fn two_user_auth() -> Arc<StaticTokenAuth> {
        Arc::new(
            StaticTokenAuth::new()
                .with_user("token-a", UserInfo::new(111, "alice", "user"))
                .with_user("token-b", UserInfo::new(222, "bob", "user")),
        )
    }

    struct Fixture {
        server: Arc<Server>,
        router: Arc<Router>,
        addr: SocketAddr,
        events: mpsc::Receiver<UserStatChange>,
    }

    async fn start_stack(calls: CallTable, permit: Option<Arc<dyn Permit>>) -> Fixture {
        let (event_tx, events) = mpsc::channel(32);
        let mut router = Router::new(calls).with_event_queue(event_tx);
        if let Some(permit) = permit {
            router = router.with_permit(permit);
        }
        let router = Arc::new(router);

        let server = Arc::new(
            Server::new(ServerOptions {
                config: ServerConfig::new("127.0.0.1:0".parse().unwrap()),
                dispatcher: router.clone(),
                auth: Some(two_user_auth()),
                accept_filter: None,
            })
            .await
            .unwrap(),
        );
        server.start().unwrap();
        let addr = server.address();
        Fixture { server, router, addr, events }
    }

    async fn connect_client(
        addr: SocketAddr,
        token: &str,
    ) -> (Arc<Client>, Arc<CapturingClientDispatcher>) {
        let dispatcher = Arc::new(CapturingClientDispatcher::new());
        let client = Client::new(
            ClientConfig::new(addr).with_token(token),
            Some(dispatcher.clone() as Arc<dyn crate::client::ClientDispatcher>),
        )
        .unwrap();
        client.connect().await.unwrap();
        (client, dispatcher)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_happy_path_echo() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client, _) = connect_client(fixture.addr, "token-a").await;

        let resp: EchoResponse = client
            .send_request(0, &EchoRequest { msg: "hi".into() }, CALL_DEADLINE)
            .await
            .unwrap();
        assert_eq!(resp.msg, "hi");

        client.close().await;
        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_peer_forward_rewrites_source_uid() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client_a, _) = connect_client(fixture.addr, "token-a").await;
        let (_client_b, dispatcher_b) = connect_client(fixture.addr, "token-b").await;
        settle().await;

        // no reply will come; the interesting part is what B receives
        let a = client_a.clone();
        tokio::spawn(async move {
            let _ = a
                .send_request::<EchoRequest, EchoResponse>(
                    222,
                    &EchoRequest { msg: "x".into() },
                    Duration::from_millis(200),
                )
                .await;
        });

        let frame = dispatcher_b.next_frame(Duration::from_secs(2)).await;
        let head = RouteHead::from_frame(&frame).unwrap();
        assert_eq!(head.target_uid, 222);
        assert_eq!(head.source_uid, 111);
        assert_ne!(head.ask_id, 0);
        assert_eq!(head.msg_kind, MsgKind::Request);
        assert_eq!(
            EchoRequest::from_body(frame.body()).unwrap(),
            EchoRequest { msg: "x".into() }
        );

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_relogin_evicts_previous_session() {
        let mut fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client_one, _) = connect_client(fixture.addr, "token-a").await;
        settle().await;
        let first_sid = client_one.socket_id().await.unwrap();

        let (client_two, _) = connect_client(fixture.addr, "token-a").await;
        settle().await;
        let second_sid = client_two.socket_id().await.unwrap();

        // the registry points at the later session, the earlier one is closed
        let registered = fixture.router.get_socket_by_uid(111).await.unwrap();
        assert_eq!(registered.id(), second_sid);
        assert_eq!(fixture.router.user_count().await, 1);
        assert!(!client_one.valid().await);
        assert!(client_two.valid().await);

        // online(first), online(second) - eviction publishes no offline
        let e1 = fixture.events.recv().await.unwrap();
        let e2 = fixture.events.recv().await.unwrap();
        assert_eq!((e1.uid, e1.online, e1.socket_id), (111, true, first_sid));
        assert_eq!((e2.uid, e2.online, e2.socket_id), (111, true, second_sid));

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_absent_target_drops_silently() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client, _) = connect_client(fixture.addr, "token-a").await;

        let err = client
            .send_request::<EchoRequest, EchoResponse>(
                9999,
                &EchoRequest { msg: "void".into() },
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CallError>(), Some(CallError::Timeout)));

        // the session survives the miss
        assert!(client.valid().await);
        let resp: EchoResponse = client
            .send_request(0, &EchoRequest { msg: "still here".into() }, CALL_DEADLINE)
            .await
            .unwrap();
        assert_eq!(resp.msg, "still here");

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_forward_denied_bumps_error_counter() {
        let mut permit = MockPermit::new();
        permit.expect_role_groups().return_const(Vec::<String>::new());
        permit.expect_call_enable().return_const(true);
        permit.expect_forward_enable().return_const(false);

        let fixture = start_stack(builtin_call_table(), Some(Arc::new(permit))).await;
        let (client_a, _) = connect_client(fixture.addr, "token-a").await;
        let (_client_b, dispatcher_b) = connect_client(fixture.addr, "token-b").await;
        settle().await;

        let err = client_a
            .send_request::<EchoRequest, EchoResponse>(
                222,
                &EchoRequest { msg: "x".into() },
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CallError>(), Some(CallError::Timeout)));
        assert!(dispatcher_b.is_empty().await);

        let socket_a = fixture.router.get_socket_by_uid(111).await.unwrap();
        assert_eq!(socket_a.err_count(), 1);

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_msg_id_drops_and_counts() {
        let fixture = start_stack(CallTable::new(), Some(Arc::new(LocalPermit))).await;
        let (client, _) = connect_client(fixture.addr, "token-a").await;
        settle().await;

        let err = client
            .send_request::<EchoRequest, EchoResponse>(
                0,
                &EchoRequest { msg: "x".into() },
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<CallError>(), Some(CallError::Timeout)));

        let socket = fixture.router.get_socket_by_uid(111).await.unwrap();
        assert_eq!(socket.err_count(), 1);
        assert!(socket.valid());

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_becomes_resp_err() {
        struct Failing;

        #[async_trait]
        impl TypedHandler for Failing {
            type Req = EchoRequest;
            type Resp = EchoResponse;

            async fn handle(
                &self,
                _ctx: &CallContext<'_>,
                _req: EchoRequest,
            ) -> anyhow::Result<EchoResponse> {
                anyhow::bail!("echo exploded")
            }
        }

        let mut calls = CallTable::new();
        calls.register_typed(Failing).unwrap();
        let fixture = start_stack(calls, Some(Arc::new(LocalPermit))).await;
        let (client, _) = connect_client(fixture.addr, "token-a").await;

        let err = client
            .send_request::<EchoRequest, EchoResponse>(
                0,
                &EchoRequest { msg: "x".into() },
                CALL_DEADLINE,
            )
            .await
            .unwrap_err();
        match err.downcast_ref::<CallError>() {
            Some(CallError::Remote { code, detail }) => {
                assert_eq!(*code, -1);
                assert!(detail.contains("echo exploded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // a handler error never closes the session
        assert!(client.valid().await);

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_group_broadcast_skips_sender() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client_a, _) = connect_client(fixture.addr, "token-a").await;
        let (_client_b, dispatcher_b) = connect_client(fixture.addr, "token-b").await;
        settle().await;

        // both users carry role "user" and were placed in the same group
        let resp: GroupBroadcastResponse = client_a
            .send_request(
                0,
                &GroupBroadcastRequest {
                    group: "user".into(),
                    msg_id: 777,
                    data: b"fanout".to_vec(),
                },
                CALL_DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(resp.recv_count, 1);

        let frame = dispatcher_b.next_frame(Duration::from_secs(2)).await;
        let head = RouteHead::from_frame(&frame).unwrap();
        assert_eq!(head.source_uid, 111);
        assert_eq!(head.msg_id, 777);
        assert_eq!(head.msg_kind, MsgKind::Async);
        assert_eq!(frame.body(), b"fanout");

        let missing: GroupBroadcastResponse = client_a
            .send_request(
                0,
                &GroupBroadcastRequest {
                    group: "nobody-here".into(),
                    msg_id: 777,
                    data: Vec::new(),
                },
                CALL_DEADLINE,
            )
            .await
            .unwrap();
        assert_eq!(missing.recv_count, 0);

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_list_groups() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;
        let (client, _) = connect_client(fixture.addr, "token-a").await;
        settle().await;

        let resp: ListGroupsResponse = client
            .send_request(0, &ListGroupsRequest {}, CALL_DEADLINE)
            .await
            .unwrap();
        assert_eq!(resp.groups, vec!["user".to_string()]);

        fixture.server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_token_disables_reconnect() {
        let fixture = start_stack(builtin_call_table(), Some(Arc::new(LocalPermit))).await;

        let client = Client::new(
            ClientConfig::new(fixture.addr)
                .with_token("not-a-token")
                .with_reconnect_delay(Duration::from_millis(50)),
            None,
        )
        .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::HandshakeError>(),
            Some(crate::error::HandshakeError::Rejected(reason)) if reason == "invalid token"
        ));
        assert!(!client.reconnect_enabled());
        assert!(!client.valid().await);

        fixture.server.stop().await;
    }
}

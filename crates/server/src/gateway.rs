use std::sync::Arc;

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use homeward_core::{
    event::{
        Ack, Connected, ErrorPayload, MarkMessagesRead, MessageSent, MessagesMarkedRead, Pong,
        PresenceStatus, PresenceUpdated, PropertyConversationJoined, PropertyRef,
        SendPropertyMessage, UserTyping,
    },
    EventFrame, EventName, Identity,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    badges::BadgeEngine,
    config::GatewayConfig,
    conversation::{ConversationResolver, ResolveError, Resolution},
    identity::{CredentialVerifier, IdentityResolver},
    lifecycle::{Connection, ConnectionState, InvalidTransition, PingTracker},
    membership::{JoinAttempt, RoomTracker},
    pipeline::{MessagePipeline, PipelineError, PipelineLimits},
    store::{GatewayStore, StoreError},
    transport::{GroupKey, Hub, Outbound},
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connection is not ready yet")]
    NotReady,
    #[error("malformed frame")]
    MalformedFrame,
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Rejected(String),
    #[error("not permitted to access this conversation")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Text sent back to the client; storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Store(_) => "internal error, please retry".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<PipelineError> for GatewayError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidPayload(message) => GatewayError::InvalidPayload(message),
            PipelineError::Unauthorized => GatewayError::Unauthorized,
            PipelineError::Store(err) => GatewayError::Store(err),
            other @ (PipelineError::AnonymousSender | PipelineError::NotFound(_)) => {
                GatewayError::Rejected(other.to_string())
            }
        }
    }
}

impl From<ResolveError> for GatewayError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unauthorized => GatewayError::Unauthorized,
            ResolveError::Store(err) => GatewayError::Store(err),
        }
    }
}

/// The single terminal response to an inbound frame.
#[derive(Debug, Clone)]
pub struct Reply {
    pub event: EventName,
    pub data: Value,
}

impl Reply {
    fn new<T: Serialize>(event: EventName, payload: &T) -> Result<Self, GatewayError> {
        let data = serde_json::to_value(payload)
            .map_err(|err| GatewayError::Store(StoreError::Storage(err.into())))?;
        Ok(Self { event, data })
    }
}

/// Outcome of dispatching one inbound frame.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Event label for metrics; `unknown` when the name is not routable.
    pub event: &'static str,
    pub ok: bool,
    pub frame: EventFrame,
}

type HandlerFn = for<'a> fn(&'a Gateway, &'a Connection, Value) -> BoxFuture<'a, Result<Reply, GatewayError>>;

struct Route {
    event: EventName,
    error_event: EventName,
    requires_ready: bool,
    handler: HandlerFn,
}

const ROUTES: &[Route] = &[
    Route {
        event: EventName::Ping,
        error_event: EventName::Error,
        requires_ready: false,
        handler: |gw, conn, data| gw.ping(conn, data).boxed(),
    },
    Route {
        event: EventName::JoinPropertyConversation,
        error_event: EventName::Error,
        requires_ready: true,
        handler: |gw, conn, data| gw.join_property(conn, data).boxed(),
    },
    Route {
        event: EventName::LeavePropertyConversation,
        error_event: EventName::Error,
        requires_ready: true,
        handler: |gw, conn, data| gw.leave_property(conn, data).boxed(),
    },
    Route {
        event: EventName::SendPropertyMessage,
        error_event: EventName::MessageError,
        requires_ready: true,
        handler: |gw, conn, data| gw.send_message(conn, data).boxed(),
    },
    Route {
        event: EventName::MarkMessagesRead,
        error_event: EventName::Error,
        requires_ready: true,
        handler: |gw, conn, data| gw.mark_read(conn, data).boxed(),
    },
    Route {
        event: EventName::TypingStart,
        error_event: EventName::Error,
        requires_ready: true,
        handler: |gw, conn, data| gw.typing(conn, data, true).boxed(),
    },
    Route {
        event: EventName::TypingStop,
        error_event: EventName::Error,
        requires_ready: true,
        handler: |gw, conn, data| gw.typing(conn, data, false).boxed(),
    },
];

/// Background sweep tasks; aborted on shutdown.
pub struct Sweepers {
    handles: Vec<JoinHandle<()>>,
}

impl Sweepers {
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Realtime gateway state shared by every socket of one process.
pub struct Gateway {
    config: GatewayConfig,
    identities: IdentityResolver,
    rooms: RoomTracker,
    pings: PingTracker,
    conversations: ConversationResolver,
    pipeline: MessagePipeline,
    hub: Hub,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn GatewayStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let hub = Hub::new(config.outbound_buffer);
        let conversations =
            ConversationResolver::new(store.clone(), config.permit_unverified_access);
        let badges = BadgeEngine::new(store.clone(), hub.clone());
        let pipeline = MessagePipeline::new(
            store.clone(),
            conversations.clone(),
            badges,
            hub.clone(),
            PipelineLimits {
                max_message_length: config.max_message_length,
                history_limit: config.history_limit,
            },
        );
        Self {
            identities: IdentityResolver::new(verifier, store),
            rooms: RoomTracker::new(),
            pings: PingTracker::new(),
            conversations,
            pipeline,
            hub,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityResolver {
        &self.identities
    }

    pub fn rooms(&self) -> &RoomTracker {
        &self.rooms
    }

    pub fn pings(&self) -> &PingTracker {
        &self.pings
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Register an authenticated connection with the hub and its personal groups.
    ///
    /// Returns the `connected` frame, which must be written before anything
    /// read from the returned queue.
    pub async fn connect(
        &self,
        connection: &Connection,
    ) -> Result<(EventFrame, tokio::sync::mpsc::Receiver<Outbound>), GatewayError> {
        let connected = EventFrame::new(
            EventName::Connected,
            &Connected {
                connection_id: connection.id,
                user_id: connection.user_id().to_string(),
                user_type: connection.role,
                identity: connection.identity.kind().to_string(),
            },
        )
        .map_err(|err| GatewayError::Store(StoreError::Storage(err.into())))?;

        let rx = self.hub.register(connection.id).await;
        for group in connection.personal_groups() {
            self.hub.join_group(connection.id, &group).await;
        }
        tracing::info!(
            connection_id = %connection.id,
            user_id = %connection.user_id(),
            role = %connection.role,
            identity = connection.identity.kind(),
            "connection authenticated"
        );
        Ok((connected, rx))
    }

    /// Open the connection to inbound traffic and announce it online.
    pub async fn mark_ready(&self, connection: &mut Connection) -> Result<(), InvalidTransition> {
        connection.advance(ConnectionState::Ready)?;
        self.announce(connection, &connection.personal_groups(), PresenceStatus::Online)
            .await;
        tracing::debug!(connection_id = %connection.id, "connection ready");
        Ok(())
    }

    /// Tear down everything held for a connection and tell its rooms it left.
    pub async fn disconnect(&self, connection: &mut Connection) {
        if connection.state() == ConnectionState::Closed {
            return;
        }
        let was_ready = connection.is_ready();
        let _ = connection.advance(ConnectionState::Closed);
        if was_ready {
            self.announce(connection, &connection.personal_groups(), PresenceStatus::Offline)
                .await;
        }

        let left = self.rooms.remove_user(&connection.user_key()).await;
        self.pings.remove(connection.id).await;
        self.hub.unregister(connection.id).await;
        for property_id in &left {
            self.presence(connection, *property_id, PresenceStatus::Offline)
                .await;
        }
        tracing::info!(
            connection_id = %connection.id,
            user_id = %connection.user_id(),
            rooms = left.len(),
            "connection closed"
        );
    }

    /// Route one inbound text frame and produce exactly one response frame.
    pub async fn dispatch(&self, connection: &Connection, text: &str) -> Dispatched {
        let frame = match EventFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(connection_id = %connection.id, error = %err, "malformed frame");
                return failure("unknown", EventName::Error, None, &GatewayError::MalformedFrame);
            }
        };

        let Some(route) = frame
            .name()
            .and_then(|name| ROUTES.iter().find(|route| route.event == name))
        else {
            let err = GatewayError::UnknownEvent(frame.event.clone());
            return failure("unknown", EventName::Error, Some(&frame), &err);
        };

        let label = route.event.as_str();
        if route.requires_ready && !connection.is_ready() {
            tracing::warn!(
                connection_id = %connection.id,
                event = label,
                state = connection.state().as_str(),
                "rejecting frame received before ready"
            );
            return failure(label, route.error_event, Some(&frame), &GatewayError::NotReady);
        }

        match (route.handler)(self, connection, frame.data.clone()).await {
            Ok(reply) => Dispatched {
                event: label,
                ok: true,
                frame: EventFrame {
                    event: reply.event.as_str().to_string(),
                    data: reply.data,
                },
            },
            Err(err) => {
                match &err {
                    GatewayError::Store(inner) => tracing::error!(
                        connection_id = %connection.id,
                        event = label,
                        error = %inner,
                        "handler failed"
                    ),
                    other => tracing::debug!(
                        connection_id = %connection.id,
                        event = label,
                        error = %other,
                        "handler rejected frame"
                    ),
                }
                failure(label, route.error_event, Some(&frame), &err)
            }
        }
    }

    async fn ping(&self, connection: &Connection, _data: Value) -> Result<Reply, GatewayError> {
        self.pings.record(connection.id, Instant::now()).await;
        Reply::new(
            EventName::Pong,
            &Pong {
                timestamp: Utc::now().timestamp_millis(),
            },
        )
    }

    async fn join_property(
        &self,
        connection: &Connection,
        data: Value,
    ) -> Result<Reply, GatewayError> {
        let PropertyRef { property_id } = parse(data)?;
        if matches!(connection.identity, Identity::Anonymous { .. })
            && !self.config.permit_unverified_access
        {
            return Err(GatewayError::Unauthorized);
        }

        let user = connection.user_key();
        let room = GroupKey::property(property_id);
        match self.rooms.try_join(property_id, &user).await {
            JoinAttempt::AlreadyJoined { conversation_id } => {
                self.hub.join_group(connection.id, &room).await;
                Reply::new(
                    EventName::PropertyConversationJoined,
                    &PropertyConversationJoined {
                        property_id,
                        conversation_id,
                        conversation: None,
                        messages: Vec::new(),
                        status: homeward_core::event::JoinStatus::AlreadyJoined,
                    },
                )
            }
            JoinAttempt::Joined => {
                let resolved = self
                    .conversations
                    .get_or_create(property_id, &connection.identity, connection.role)
                    .await;
                let conversation = match resolved {
                    Ok(Resolution::Found(conversation)) => conversation,
                    Ok(Resolution::NotFound(reason)) => {
                        self.rooms.leave(property_id, &user).await;
                        tracing::info!(
                            %property_id,
                            reason = reason.describe(),
                            "join found no conversation"
                        );
                        return Reply::new(
                            EventName::PropertyConversationJoined,
                            &PropertyConversationJoined {
                                property_id,
                                conversation_id: None,
                                conversation: None,
                                messages: Vec::new(),
                                status: reason.join_status(),
                            },
                        );
                    }
                    Err(err) => {
                        self.rooms.leave(property_id, &user).await;
                        return Err(err.into());
                    }
                };

                let messages = match self.pipeline.history(&conversation).await {
                    Ok(messages) => messages,
                    Err(err) => {
                        self.rooms.leave(property_id, &user).await;
                        return Err(err.into());
                    }
                };
                self.rooms
                    .set_conversation(property_id, &user, conversation.id)
                    .await;
                self.hub.join_group(connection.id, &room).await;
                self.presence(connection, property_id, PresenceStatus::Online)
                    .await;

                Reply::new(
                    EventName::PropertyConversationJoined,
                    &PropertyConversationJoined {
                        property_id,
                        conversation_id: Some(conversation.id),
                        conversation: Some(conversation),
                        messages,
                        status: homeward_core::event::JoinStatus::Joined,
                    },
                )
            }
        }
    }

    async fn leave_property(
        &self,
        connection: &Connection,
        data: Value,
    ) -> Result<Reply, GatewayError> {
        let reference: PropertyRef = parse(data)?;
        let was_member = self
            .rooms
            .leave(reference.property_id, &connection.user_key())
            .await;
        self.hub
            .leave_group(connection.id, &GroupKey::property(reference.property_id))
            .await;
        if was_member {
            self.presence(connection, reference.property_id, PresenceStatus::Offline)
                .await;
        }
        Reply::new(EventName::PropertyConversationLeft, &reference)
    }

    async fn send_message(
        &self,
        connection: &Connection,
        data: Value,
    ) -> Result<Reply, GatewayError> {
        let request: SendPropertyMessage = parse(data)?;
        let temp_id = request.temp_id.clone();
        let sent = self.pipeline.send(connection, request).await?;
        Reply::new(
            EventName::MessageSent,
            &MessageSent {
                property_id: sent.conversation.property_id,
                message: sent.message,
                temp_id,
            },
        )
    }

    async fn mark_read(&self, connection: &Connection, data: Value) -> Result<Reply, GatewayError> {
        let request: MarkMessagesRead = parse(data)?;
        let marked = self.pipeline.mark_read(connection, request).await?;
        Reply::new(
            EventName::MessagesMarkedRead,
            &MessagesMarkedRead {
                conversation_id: Some(marked.conversation.id),
                property_id: Some(marked.conversation.property_id),
                count: marked.message_ids.len() as u64,
            },
        )
    }

    async fn typing(
        &self,
        connection: &Connection,
        data: Value,
        is_typing: bool,
    ) -> Result<Reply, GatewayError> {
        let PropertyRef { property_id } = parse(data)?;
        let event = if is_typing {
            EventName::TypingStart
        } else {
            EventName::TypingStop
        };
        if let Ok(frame) = EventFrame::new(
            EventName::UserTyping,
            &UserTyping {
                property_id,
                user_id: connection.user_id().to_string(),
                user_type: connection.role,
                is_typing,
            },
        ) {
            self.hub
                .emit_to_group_except(&GroupKey::property(property_id), connection.id, Arc::new(frame))
                .await;
        }
        Reply::new(
            EventName::Ack,
            &Ack {
                event: event.as_str().to_string(),
            },
        )
    }

    async fn presence(&self, connection: &Connection, property_id: Uuid, status: PresenceStatus) {
        self.announce(connection, &[GroupKey::property(property_id)], status)
            .await;
    }

    /// Broadcast a presence change to `groups`, skipping the connection itself.
    async fn announce(&self, connection: &Connection, groups: &[GroupKey], status: PresenceStatus) {
        let payload = PresenceUpdated {
            user_id: connection.user_id().to_string(),
            user_type: connection.role,
            status,
        };
        let frame = match EventFrame::new(EventName::PresenceUpdated, &payload) {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode presence update");
                return;
            }
        };
        self.hub
            .emit_to_groups_except(groups, connection.id, frame)
            .await;
    }

    /// Evict memberships past their TTL; returns how many were dropped.
    pub async fn sweep_memberships(&self, now: Instant) -> usize {
        let evicted = self
            .rooms
            .evict_stale(now, self.config.membership_ttl())
            .await;
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "evicted stale room memberships");
        }
        evicted.len()
    }

    pub async fn sweep_pings(&self, now: Instant) -> usize {
        let evicted = self
            .pings
            .evict_older_than(now, self.config.ping_ttl())
            .await;
        if evicted > 0 {
            tracing::debug!(evicted, "discarded abandoned ping records");
        }
        evicted
    }

    pub fn spawn_sweepers(self: &Arc<Self>) -> Sweepers {
        let membership = {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(gateway.config.membership_sweep_interval());
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    gateway.sweep_memberships(Instant::now()).await;
                }
            })
        };
        let pings = {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(gateway.config.ping_sweep_interval());
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    gateway.sweep_pings(Instant::now()).await;
                }
            })
        };
        Sweepers {
            handles: vec![membership, pings],
        }
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|err| GatewayError::InvalidPayload(err.to_string()))
}

fn failure(
    label: &'static str,
    error_event: EventName,
    request: Option<&EventFrame>,
    err: &GatewayError,
) -> Dispatched {
    let temp_id = request
        .and_then(|frame| frame.data.get("tempId"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let payload = ErrorPayload {
        message: err.client_message(),
        event: request.map(|frame| frame.event.clone()),
        temp_id,
    };
    let data = serde_json::to_value(&payload).unwrap_or(Value::Null);
    Dispatched {
        event: label,
        ok: false,
        frame: EventFrame {
            event: error_event.as_str().to_string(),
            data,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::{Handshake, ResolvedIdentity},
        session::tests::SessionTestHarness,
        store::InMemoryStore,
    };
    use homeward_core::{Role, VerifiedSource};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        gateway: Arc<Gateway>,
        sessions: SessionTestHarness,
        agent: Uuid,
        client: Uuid,
        timeline: Uuid,
        property: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_with(GatewayConfig::default()).await
    }

    async fn fixture_with(config: GatewayConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let agent = store.insert_agent(true).await;
        let client = store.insert_client(Some(agent)).await;
        let timeline = store.insert_timeline(Some(agent), Some(client)).await;
        let property = store.insert_property(Some(timeline)).await;
        let sessions = SessionTestHarness::new();
        let gateway = Arc::new(Gateway::new(
            config,
            store.clone(),
            Arc::new(sessions.verifier.clone()),
        ));
        Fixture {
            store,
            gateway,
            sessions,
            agent,
            client,
            timeline,
            property,
        }
    }

    async fn open(
        gateway: &Gateway,
        handshake: Handshake,
    ) -> (Connection, tokio::sync::mpsc::Receiver<Outbound>) {
        let resolved = gateway.identities().resolve(&handshake).await.unwrap();
        let mut connection =
            Connection::authenticate(Uuid::new_v4(), resolved, handshake.timeline_id.clone());
        let (connected, rx) = gateway.connect(&connection).await.unwrap();
        assert_eq!(connected.event, "connected");
        connection.advance(ConnectionState::Ready).unwrap();
        (connection, rx)
    }

    async fn open_as(
        gateway: &Gateway,
        identity: Identity,
        role: Role,
    ) -> (Connection, tokio::sync::mpsc::Receiver<Outbound>) {
        let mut connection =
            Connection::authenticate(Uuid::new_v4(), ResolvedIdentity { identity, role }, None);
        let (_connected, rx) = gateway.connect(&connection).await.unwrap();
        connection.advance(ConnectionState::Ready).unwrap();
        (connection, rx)
    }

    fn frame(event: &str, data: Value) -> String {
        json!({ "event": event, "data": data }).to_string()
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn find<'a>(frames: &'a [Outbound], event: &str) -> &'a EventFrame {
        frames
            .iter()
            .find(|f| f.event == event)
            .unwrap_or_else(|| panic!("no {event} frame in {frames:?}"))
    }

    #[tokio::test]
    async fn every_inbound_frame_gets_exactly_one_response() {
        let fx = fixture().await;
        let resolved = ResolvedIdentity {
            identity: Identity::anonymous(7, Uuid::new_v4()),
            role: Role::Client,
        };
        let mut early = Connection::authenticate(Uuid::new_v4(), resolved, None);

        let cases = [
            ("not json".to_string(), "error"),
            (frame("teleport", json!({})), "error"),
            (frame("ping", Value::Null), "pong"),
            (
                frame("send-property-message", json!({ "content": "x", "tempId": "t-9" })),
                "message-error",
            ),
            (frame("join-property-conversation", json!({})), "error"),
        ];
        for (text, expected) in &cases {
            let dispatched = fx.gateway.dispatch(&early, text).await;
            assert_eq!(&dispatched.frame.event, expected, "for {text}");
        }

        let rejected = fx
            .gateway
            .dispatch(
                &early,
                &frame("send-property-message", json!({ "content": "x", "tempId": "t-9" })),
            )
            .await;
        assert!(!rejected.ok);
        assert_eq!(rejected.frame.data["message"], "connection is not ready yet");
        assert_eq!(rejected.frame.data["tempId"], "t-9");

        early.advance(ConnectionState::Ready).unwrap();
        let invalid = fx
            .gateway
            .dispatch(&early, &frame("join-property-conversation", json!({})))
            .await;
        assert_eq!(invalid.frame.event, "error");
        assert!(invalid.frame.data["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn duplicate_join_skips_conversation_lookup() {
        let fx = fixture().await;
        let (conn, _rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some(fx.timeline.to_string()),
            },
        )
        .await;
        let join = frame("join-property-conversation", json!({ "propertyId": fx.property }));

        let first = fx.gateway.dispatch(&conn, &join).await;
        assert_eq!(first.frame.data["status"], "joined");
        let conversation_id = first.frame.data["conversationId"].clone();

        // A failing lookup would surface as an error if the second join reached it.
        fx.store.fail_operation("find_conversation_by_property");
        let second = fx.gateway.dispatch(&conn, &join).await;
        assert_eq!(second.frame.event, "property-conversation-joined");
        assert_eq!(second.frame.data["status"], "already_joined");
        assert_eq!(second.frame.data["conversationId"], conversation_id);
        assert_eq!(fx.gateway.rooms().len().await, 1);
    }

    #[tokio::test]
    async fn unknown_property_joins_with_empty_history() {
        let fx = fixture().await;
        let (conn, _rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Agent),
                token: Some(fx.sessions.agent_token(fx.agent)),
                timeline_id: None,
            },
        )
        .await;

        let reply = fx
            .gateway
            .dispatch(
                &conn,
                &frame(
                    "join-property-conversation",
                    json!({ "propertyId": Uuid::new_v4() }),
                ),
            )
            .await;
        assert!(reply.ok);
        assert_eq!(reply.frame.data["status"], "property_not_found");
        assert_eq!(reply.frame.data["messages"], json!([]));
        assert_eq!(fx.gateway.rooms().len().await, 0);
    }

    #[tokio::test]
    async fn client_to_agent_round_trip_settles_badges() {
        let fx = fixture().await;
        let (client, mut client_rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some(fx.timeline.to_string()),
            },
        )
        .await;
        assert_eq!(
            client.identity,
            Identity::verified(fx.client.to_string(), VerifiedSource::TimelineLink)
        );
        let (agent, mut agent_rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Agent),
                token: Some(fx.sessions.agent_token(fx.agent)),
                timeline_id: None,
            },
        )
        .await;
        let join = frame("join-property-conversation", json!({ "propertyId": fx.property }));

        let joined = fx.gateway.dispatch(&client, &join).await;
        assert_eq!(joined.frame.data["status"], "joined");
        assert_eq!(joined.frame.data["conversation"]["agentId"], fx.agent.to_string());
        assert_eq!(joined.frame.data["conversation"]["clientId"], fx.client.to_string());
        fx.gateway.dispatch(&agent, &join).await;
        drain(&mut client_rx);
        drain(&mut agent_rx);

        let sent = fx
            .gateway
            .dispatch(
                &client,
                &frame(
                    "send-property-message",
                    json!({ "propertyId": fx.property, "content": "Hello", "tempId": "c-1" }),
                ),
            )
            .await;
        assert_eq!(sent.frame.event, "message-sent");
        assert_eq!(sent.frame.data["tempId"], "c-1");

        let agent_frames = drain(&mut agent_rx);
        assert_eq!(find(&agent_frames, "new-message").data["content"], "Hello");
        assert_eq!(
            find(&agent_frames, "unreadCountsUpdated").data["agentUnreadCount"],
            1
        );
        assert_eq!(
            find(&agent_frames, "hierarchicalUnreadCountsUpdated").data["totalUnread"],
            1
        );
        let client_frames = drain(&mut client_rx);
        let property = fx.property.to_string();
        assert_eq!(
            find(&client_frames, "clientUnreadCountsUpdated").data["unreadCounts"]
                [property.as_str()],
            0
        );

        let marked = fx
            .gateway
            .dispatch(
                &agent,
                &frame("mark-messages-read", json!({ "propertyId": fx.property })),
            )
            .await;
        assert_eq!(marked.frame.event, "messages-marked-read");
        assert_eq!(marked.frame.data["count"], 1);

        let agent_frames = drain(&mut agent_rx);
        assert_eq!(
            find(&agent_frames, "hierarchicalUnreadCountsUpdated").data["totalUnread"],
            0
        );
        let client_frames = drain(&mut client_rx);
        assert_eq!(find(&client_frames, "message-read").data["messageIds"][0], sent.frame.data["message"]["id"]);
        assert_eq!(
            find(&client_frames, "clientUnreadCountsUpdated").data["unreadCounts"]
                [property.as_str()],
            0
        );
    }

    #[tokio::test]
    async fn join_and_leave_do_not_touch_badges() {
        let fx = fixture().await;
        let (watcher, mut watcher_rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Agent),
                token: Some(fx.sessions.agent_token(fx.agent)),
                timeline_id: None,
            },
        )
        .await;
        let join = frame("join-property-conversation", json!({ "propertyId": fx.property }));
        fx.gateway.dispatch(&watcher, &join).await;

        let (client, _rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some(fx.timeline.to_string()),
            },
        )
        .await;
        fx.gateway.dispatch(&client, &join).await;
        fx.gateway
            .dispatch(
                &client,
                &frame("leave-property-conversation", json!({ "propertyId": fx.property })),
            )
            .await;

        let frames = drain(&mut watcher_rx);
        let events: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(events, vec!["presence-updated", "presence-updated"]);
        assert_eq!(frames[0].data["status"], "online");
        assert_eq!(frames[1].data["status"], "offline");
    }

    #[tokio::test]
    async fn disconnect_clears_rooms_pings_and_groups() {
        let fx = fixture().await;
        let (mut conn, _rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some("unlinked-share".into()),
            },
        )
        .await;
        fx.gateway.dispatch(&conn, &frame("ping", Value::Null)).await;
        fx.gateway
            .rooms()
            .try_join(fx.property, &conn.user_key())
            .await;
        assert_eq!(fx.gateway.pings().len().await, 1);

        fx.gateway.disconnect(&mut conn).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(fx.gateway.rooms().len().await, 0);
        assert_eq!(fx.gateway.pings().len().await, 0);
        assert_eq!(
            fx.gateway
                .hub()
                .group_size(&GroupKey::timeline("unlinked-share"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn anonymous_connections_can_watch_but_not_speak() {
        let fx = fixture().await;
        let (anon, _rx) = open(&fx.gateway, Handshake::default()).await;

        let joined = fx
            .gateway
            .dispatch(
                &anon,
                &frame("join-property-conversation", json!({ "propertyId": fx.property })),
            )
            .await;
        assert_eq!(joined.frame.data["status"], "joined");

        let sent = fx
            .gateway
            .dispatch(
                &anon,
                &frame(
                    "send-property-message",
                    json!({ "propertyId": fx.property, "content": "psst" }),
                ),
            )
            .await;
        assert_eq!(sent.frame.event, "message-error");
        assert!(!sent.ok);
    }

    #[tokio::test]
    async fn strict_mode_turns_away_unverified_identities() {
        let fx = fixture_with(GatewayConfig {
            permit_unverified_access: false,
            ..GatewayConfig::default()
        })
        .await;
        let join = frame("join-property-conversation", json!({ "propertyId": fx.property }));
        let (synthetic, _rx) = open_as(
            &fx.gateway,
            Identity::synthetic_client(fx.timeline.to_string()),
            Role::Client,
        )
        .await;

        let joined = fx.gateway.dispatch(&synthetic, &join).await;
        assert!(!joined.ok);
        assert_eq!(joined.frame.event, "error");
        assert_eq!(
            joined.frame.data["message"],
            "not permitted to access this conversation"
        );
        assert_eq!(fx.gateway.rooms().len().await, 0);

        let sent = fx
            .gateway
            .dispatch(
                &synthetic,
                &frame(
                    "send-property-message",
                    json!({ "propertyId": fx.property, "content": "Hello", "tempId": "s-1" }),
                ),
            )
            .await;
        assert_eq!(sent.frame.event, "message-error");
        assert_eq!(sent.frame.data["tempId"], "s-1");

        let marked = fx
            .gateway
            .dispatch(
                &synthetic,
                &frame("mark-messages-read", json!({ "propertyId": fx.property })),
            )
            .await;
        assert!(!marked.ok);
        assert!(fx
            .store
            .find_conversation_by_property(fx.property)
            .await
            .unwrap()
            .is_none());

        let (anon, _anon_rx) = open(&fx.gateway, Handshake::default()).await;
        let anon_join = fx.gateway.dispatch(&anon, &join).await;
        assert_eq!(anon_join.frame.event, "error");
        assert_eq!(fx.gateway.rooms().len().await, 0);

        let (owner, _owner_rx) = open(
            &fx.gateway,
            Handshake {
                role: Some(Role::Client),
                token: None,
                timeline_id: Some(fx.timeline.to_string()),
            },
        )
        .await;
        assert_eq!(fx.gateway.dispatch(&owner, &join).await.frame.data["status"], "joined");
    }

    #[tokio::test]
    async fn simultaneous_anonymous_viewers_keep_separate_memberships() {
        let fx = fixture().await;
        let (first, _first_rx) = open(&fx.gateway, Handshake::default()).await;
        let (mut second, _second_rx) = open(&fx.gateway, Handshake::default()).await;
        assert_ne!(first.user_key(), second.user_key());

        let join = frame("join-property-conversation", json!({ "propertyId": fx.property }));
        assert_eq!(fx.gateway.dispatch(&first, &join).await.frame.data["status"], "joined");
        assert_eq!(fx.gateway.dispatch(&second, &join).await.frame.data["status"], "joined");
        assert_eq!(fx.gateway.rooms().len().await, 2);

        fx.gateway.disconnect(&mut second).await;
        assert!(fx
            .gateway
            .rooms()
            .membership(fx.property, &first.user_key())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn membership_sweep_evicts_only_expired_entries() {
        let fx = fixture().await;
        let ttl = fx.gateway.config().membership_ttl();
        let start = Instant::now();
        let stale = homeward_core::UserKey::new("gone", Role::Client);
        let fresh = homeward_core::UserKey::new("here", Role::Client);
        fx.gateway.rooms().try_join_at(fx.property, &stale, start).await;
        fx.gateway
            .rooms()
            .try_join_at(fx.property, &fresh, start + ttl)
            .await;

        let evicted = fx
            .gateway
            .sweep_memberships(start + ttl + std::time::Duration::from_secs(1))
            .await;
        assert_eq!(evicted, 1);
        assert!(fx.gateway.rooms().membership(fx.property, &stale).await.is_none());
        assert!(fx.gateway.rooms().membership(fx.property, &fresh).await.is_some());
    }

    #[tokio::test]
    async fn ready_and_close_announce_presence_to_other_tabs() {
        let fx = fixture().await;
        let handshake = Handshake {
            role: Some(Role::Client),
            token: None,
            timeline_id: Some(fx.timeline.to_string()),
        };
        let (_first, mut first_rx) = open(&fx.gateway, handshake.clone()).await;

        let resolved = fx.gateway.identities().resolve(&handshake).await.unwrap();
        let mut second = Connection::authenticate(Uuid::new_v4(), resolved, handshake.timeline_id);
        let (_connected, _second_rx) = fx.gateway.connect(&second).await.unwrap();
        fx.gateway.mark_ready(&mut second).await.unwrap();
        assert!(second.is_ready());

        // Shares both the personal and the timeline group; delivered once.
        let frames = drain(&mut first_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["status"], "online");

        fx.gateway.disconnect(&mut second).await;
        let frames = drain(&mut first_rx);
        assert_eq!(find(&frames, "presence-updated").data["status"], "offline");
        assert!(fx.gateway.mark_ready(&mut second).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn membership_sweeper_runs_without_disconnects() {
        let fx = fixture().await;
        let user = homeward_core::UserKey::new("ghost", Role::Client);
        fx.gateway.rooms().try_join(fx.property, &user).await;

        let sweepers = fx.gateway.spawn_sweepers();
        tokio::time::sleep(
            fx.gateway.config().membership_ttl() + fx.gateway.config().membership_sweep_interval() * 2,
        )
        .await;
        assert_eq!(fx.gateway.rooms().len().await, 0);
        sweepers.abort();
    }
}

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use homeward_core::{event::ErrorPayload, EventFrame, EventName, Role};
use serde::Deserialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep_until, timeout, Instant},
};
use tracing::Instrument;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    gateway::Gateway,
    identity::Handshake,
    lifecycle::Connection,
    telemetry,
};

/// Query string accepted on the upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketParams {
    pub role: Option<String>,
    pub token: Option<String>,
    pub timeline_id: Option<String>,
}

impl SocketParams {
    /// A `Bearer` authorization header wins over the `token` parameter.
    pub fn into_handshake(self, headers: &HeaderMap) -> Handshake {
        let role = self.role.as_deref().and_then(|raw| match raw.parse::<Role>() {
            Ok(role) => Some(role),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring unrecognised handshake role");
                None
            }
        });
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Handshake {
            role,
            token: bearer.or(self.token),
            timeline_id: self.timeline_id,
        }
    }
}

/// Accepts gateway upgrades and runs one read/write loop per socket.
pub struct SocketService {
    gateway: Arc<Gateway>,
    semaphore: Arc<Semaphore>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl SocketService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let permits = gateway.config().max_connections;
        Self {
            gateway,
            semaphore: Arc::new(Semaphore::new(permits)),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn open(self: Arc<Self>, handshake: Handshake, ws: WebSocketUpgrade) -> Response {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => ws.on_upgrade(move |socket| self.run(handshake, socket, permit)),
            Err(_) => {
                tracing::warn!("rejecting socket upgrade; connection limit reached");
                (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response()
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        handshake: Handshake,
        mut socket: WebSocket,
        _permit: OwnedSemaphorePermit,
    ) {
        let connection_id = Uuid::new_v4();
        let resolved = match self.gateway.identities().resolve(&handshake).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(%connection_id, error = %err, "identity resolution failed");
                self.refuse(&mut socket).await;
                return;
            }
        };

        let connection = Connection::authenticate(connection_id, resolved, handshake.timeline_id);
        let span = telemetry::connection_span(&connection);
        self.serve(connection, socket).instrument(span).await;
    }

    async fn serve(&self, mut connection: Connection, mut socket: WebSocket) {
        let send_timeout = self.gateway.config().send_timeout();
        let (connected, mut outbound) = match self.gateway.connect(&connection).await {
            Ok(registered) => registered,
            Err(err) => {
                tracing::error!(error = %err, "failed to register connection");
                return;
            }
        };
        self.connection_opened();

        if let Err(err) = send_frame(&mut socket, &connected, send_timeout).await {
            tracing::warn!(error = %err, "failed to confirm connection");
            self.close(&mut connection).await;
            return;
        }

        let ready = sleep_until(Instant::now() + self.gateway.config().ready_delay());
        tokio::pin!(ready);

        loop {
            tokio::select! {
                () = &mut ready, if !connection.is_ready() => {
                    if let Err(err) = self.gateway.mark_ready(&mut connection).await {
                        tracing::warn!(error = %err, "connection could not become ready");
                        break;
                    }
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(err) = send_frame(&mut socket, &frame, send_timeout).await {
                        tracing::warn!(error = %err, event = %frame.event, "dropping connection after failed send");
                        break;
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            let dispatched = self.gateway.dispatch(&connection, text.as_str()).await;
                            self.record_event(dispatched.event, dispatched.ok);
                            if let Err(err) = send_frame(&mut socket, &dispatched.frame, send_timeout).await {
                                tracing::warn!(error = %err, "failed to send reply");
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            tracing::debug!("ignoring binary frame");
                        }
                        Some(Ok(WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "socket read failed");
                            break;
                        }
                    }
                }
            }
        }

        self.close(&mut connection).await;
    }

    async fn close(&self, connection: &mut Connection) {
        self.gateway.disconnect(connection).await;
        self.connection_closed();
    }

    async fn refuse(&self, socket: &mut WebSocket) {
        let payload = ErrorPayload {
            message: "authentication unavailable, please reconnect".to_string(),
            event: None,
            temp_id: None,
        };
        if let Ok(frame) = EventFrame::new(EventName::Error, &payload) {
            let _ = send_frame(socket, &frame, self.gateway.config().send_timeout()).await;
        }
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "authentication failed".into(),
            })))
            .await;
    }

    fn record_event(&self, event: &str, ok: bool) {
        tracing::debug!(event, ok, "handled inbound frame");
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_gateway_event(event, ok);
        }
    }

    fn connection_opened(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.connection_opened();
        }
    }

    fn connection_closed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed();
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &EventFrame, limit: Duration) -> Result<()> {
    let text = frame.encode().context("failed to encode frame")?;
    timeout(limit, socket.send(WsMessage::Text(text.into())))
        .await
        .map_err(|_| anyhow!("websocket send timed out"))?
        .context("websocket send failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_overrides_query_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        let params = SocketParams {
            role: Some("Agent".into()),
            token: Some("query-token".into()),
            timeline_id: None,
        };

        let handshake = params.into_handshake(&headers);
        assert_eq!(handshake.role, Some(Role::Agent));
        assert_eq!(handshake.token.as_deref(), Some("header-token"));
    }

    #[test]
    fn query_token_used_without_header() {
        let params = SocketParams {
            role: Some("client".into()),
            token: Some("query-token".into()),
            timeline_id: Some("tl-1".into()),
        };

        let handshake = params.into_handshake(&HeaderMap::new());
        assert_eq!(handshake.role, Some(Role::Client));
        assert_eq!(handshake.token.as_deref(), Some("query-token"));
        assert_eq!(handshake.timeline_id.as_deref(), Some("tl-1"));
    }

    #[test]
    fn unknown_role_and_blank_bearer_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        let params = SocketParams {
            role: Some("landlord".into()),
            ..SocketParams::default()
        };

        let handshake = params.into_handshake(&headers);
        assert_eq!(handshake.role, None);
        assert_eq!(handshake.token, None);
    }
}

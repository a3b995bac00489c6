use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use poem::http::StatusCode;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::web::websocket::{Message as Frame, WebSocket, WebSocketStream};
use poem::web::{Data, Json};
use poem::{EndpointExt, IntoResponse, Route, Server, get, handler};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{self, Message, Msg, ProtocolError, Verb};
use crate::orchestrator::{ConfigSink, ConnectorConfig, Event, OrchestratorHandle};
use crate::types::JwsEntry;

const PUSH_CAPACITY: usize = 64;

/// What the control server needs from the orchestrator.
#[async_trait]
pub trait ControlBackend: Send + Sync {
    /// Current configuration with the revision it was last pushed under.
    async fn configuration(&self) -> Result<(u64, ConnectorConfig)>;
    async fn peer_jws(&self) -> Result<BTreeMap<String, JwsEntry>>;
    /// Hands keys reported by a connector to the orchestrator.
    fn upload_peer_jws(&self, entries: Vec<JwsEntry>) -> Result<()>;
    /// Diagnostic snapshot served on `GET /state`.
    async fn state(&self) -> Result<Value>;
}

#[async_trait]
impl ControlBackend for OrchestratorHandle {
    async fn configuration(&self) -> Result<(u64, ConnectorConfig)> {
        let context = self.get_context().await?;
        Ok((context.config_revision, context.connector_config))
    }

    async fn peer_jws(&self) -> Result<BTreeMap<String, JwsEntry>> {
        Ok(self.get_context().await?.peer_jws.unwrap_or_default())
    }

    fn upload_peer_jws(&self, entries: Vec<JwsEntry>) -> Result<()> {
        self.send_event(Event::UploadPeerJws { entries })
    }

    async fn state(&self) -> Result<Value> {
        let context = self.get_context().await?;
        let phases = self.region_phases().await?;
        Ok(json!({ "context": context, "phases": phases }))
    }
}

#[derive(Debug, Clone)]
pub enum Push {
    Configuration {
        revision: u64,
        config: ConnectorConfig,
    },
    PeerJws(BTreeMap<String, JwsEntry>),
}

/// Fans orchestrator pushes out to every open connection.
#[derive(Clone)]
pub struct ControlChannel {
    tx: broadcast::Sender<Push>,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUSH_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Push> {
        self.tx.subscribe()
    }
}

impl ConfigSink for ControlChannel {
    fn push_configuration(&self, revision: u64, config: &ConnectorConfig) {
        let push = Push::Configuration {
            revision,
            config: config.clone(),
        };
        if self.tx.send(push).is_err() {
            debug!("No connector connected, configuration push skipped");
        }
    }

    fn push_peer_jws(&self, keys: &BTreeMap<String, JwsEntry>) {
        if self.tx.send(Push::PeerJws(keys.clone())).is_err() {
            debug!("No connector connected, peer JWS push skipped");
        }
    }
}

#[derive(Clone)]
struct ControlState {
    backend: Arc<dyn ControlBackend>,
    channel: ControlChannel,
}

/// Configuration a connection last received, the base of the next `PATCH`.
struct Sent {
    revision: u64,
    value: Value,
}

/// Per-connection protocol state.
#[derive(Default)]
struct Connection {
    last_sent: Option<Sent>,
}

impl Connection {
    /// Full `NOTIFY` the first time, then a JSON Patch against the previous push; `None`
    /// when nothing changed for this connection or the push predates what it already has.
    fn configuration_update(
        &mut self,
        revision: u64,
        config: &ConnectorConfig,
    ) -> Result<Option<Message>> {
        let known = self.last_sent.as_ref().map(|sent| sent.revision);
        if known.is_some_and(|known| revision <= known) {
            debug!("Dropping configuration revision {revision}, connection has {known:?}");
            return Ok(None);
        }
        let value = serde_json::to_value(config).context("Failed to encode configuration")?;
        let update = match &self.last_sent {
            None => Some(Message::new(Verb::Notify, Msg::Configuration, value.clone())),
            Some(previous) => {
                let patch = json_patch::diff(&previous.value, &value);
                if patch.0.is_empty() {
                    None
                } else {
                    let data = serde_json::to_value(&patch).context("Failed to encode patch")?;
                    Some(Message::new(Verb::Patch, Msg::Configuration, data))
                }
            }
        };
        self.last_sent = Some(Sent { revision, value });
        Ok(update)
    }

    async fn handle(&mut self, text: &str, backend: &dyn ControlBackend) -> Result<Option<Message>> {
        let request = match message::parse(text) {
            Ok(request) => request,
            Err(rejection) => {
                debug!("Rejecting control frame: {}", rejection.error);
                return Ok(Some(Message::rejected(rejection)));
            }
        };

        let reply = match (request.msg, request.verb) {
            (Msg::Configuration, Verb::Read) => {
                let (revision, config) = backend.configuration().await?;
                let value =
                    serde_json::to_value(&config).context("Failed to encode configuration")?;
                self.last_sent = Some(Sent {
                    revision,
                    value: value.clone(),
                });
                Some(Message::reply(Msg::Configuration, value, request.id))
            }
            (Msg::PeerJws, Verb::Read) => {
                let keys = backend.peer_jws().await?;
                let value = serde_json::to_value(&keys).context("Failed to encode peer keys")?;
                Some(Message::reply(Msg::PeerJws, value, request.id))
            }
            (Msg::PeerJws, Verb::Notify) => {
                match serde_json::from_value::<Vec<JwsEntry>>(request.data) {
                    Ok(entries) => {
                        info!("Connector reported {} peer JWS key(s)", entries.len());
                        backend.upload_peer_jws(entries)?;
                        None
                    }
                    Err(_) => Some(Message::error(ProtocolError::JsonParseError, None)),
                }
            }
            (Msg::Error, Verb::Notify) => {
                warn!("Connector reported an error: {}", request.data);
                None
            }
            _ => Some(Message::error(
                ProtocolError::UnsupportedVerb,
                Some(request.id),
            )),
        };
        Ok(reply)
    }
}

async fn send(
    sink: &mut (impl futures_util::Sink<Frame, Error = std::io::Error> + Unpin),
    message: &Message,
) -> Result<()> {
    let text = message.to_text().context("Failed to encode control frame")?;
    sink.send(Frame::Text(text))
        .await
        .context("Failed to send control frame")
}

async fn serve_connection(socket: WebSocketStream, state: ControlState) -> Result<()> {
    let (mut sink, mut stream) = socket.split();
    let mut pushes = state.channel.subscribe();
    let mut connection = Connection::default();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Frame::Text(text))) => {
                    if let Some(reply) = connection.handle(&text, state.backend.as_ref()).await? {
                        send(&mut sink, &reply).await?;
                    }
                }
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("Control connection failed"),
            },
            push = pushes.recv() => match push {
                Ok(Push::Configuration { revision, config }) => {
                    if let Some(update) = connection.configuration_update(revision, &config)? {
                        send(&mut sink, &update).await?;
                    }
                }
                Ok(Push::PeerJws(keys)) => {
                    let data = serde_json::to_value(&keys).context("Failed to encode peer keys")?;
                    send(&mut sink, &Message::new(Verb::Notify, Msg::PeerJws, data)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Control connection skipped {skipped} push(es)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[handler]
fn control(ws: WebSocket, Data(state): Data<&ControlState>) -> impl IntoResponse {
    let state = state.clone();
    ws.on_upgrade(move |socket| async move {
        info!("Connector connected");
        match serve_connection(socket, state).await {
            Ok(()) => info!("Connector disconnected"),
            Err(err) => warn!("Connector connection closed: {err:#}"),
        }
    })
}

#[handler]
async fn state_snapshot(Data(state): Data<&ControlState>) -> poem::Result<Json<Value>> {
    state.backend.state().await.map(Json).map_err(|err| {
        poem::Error::from_string(format!("{err:#}"), StatusCode::SERVICE_UNAVAILABLE)
    })
}

/// Binds the control listener and serves it in the background.
///
/// Returns the bound address together with the server task, which ends with an error if
/// the listener fails.
///
/// # Errors
/// Returns an error if the address cannot be bound.
pub async fn start_control_server(
    addr: &str,
    backend: Arc<dyn ControlBackend>,
    channel: ControlChannel,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let acceptor = TcpListener::bind(addr.to_string())
        .into_acceptor()
        .await
        .with_context(|| format!("Failed to bind control listener on {addr}"))?;
    let local_addr = acceptor
        .local_addr()
        .into_iter()
        .find_map(|addr| addr.as_socket_addr().copied())
        .context("Control listener has no socket address")?;

    let app = Route::new()
        .at("/", get(control))
        .at("/state", get(state_snapshot))
        .data(ControlState { backend, channel });

    info!("Control channel listening on {local_addr}");
    let server = tokio::spawn(async move {
        Server::new_with_acceptor(acceptor)
            .run(app)
            .await
            .context("Control server failed")
    });
    Ok((local_addr, server))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        revision: u64,
        config: ConnectorConfig,
    }

    #[async_trait]
    impl ControlBackend for Fixed {
        async fn configuration(&self) -> Result<(u64, ConnectorConfig)> {
            Ok((self.revision, self.config.clone()))
        }

        async fn peer_jws(&self) -> Result<BTreeMap<String, JwsEntry>> {
            Ok(BTreeMap::new())
        }

        fn upload_peer_jws(&self, _entries: Vec<JwsEntry>) -> Result<()> {
            Ok(())
        }

        async fn state(&self) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_first_push_is_full_then_patches() {
        let mut connection = Connection::default();
        let mut config = ConnectorConfig::outbound_ca("R1".to_string());

        let first = connection.configuration_update(1, &config).unwrap().unwrap();
        config.merge(ConnectorConfig::outbound_ca("R2".to_string()));
        let second = connection.configuration_update(2, &config).unwrap().unwrap();

        assert_eq!(first.verb, Verb::Notify);
        assert_eq!(first.data["outbound"]["tls"]["creds"]["ca"], "R1");
        assert_eq!(second.verb, Verb::Patch);
        assert_eq!(
            second.data,
            json!([{ "op": "replace", "path": "/outbound/tls/creds/ca", "value": "R2" }])
        );
    }

    #[test]
    fn test_unchanged_push_is_not_sent() {
        let mut connection = Connection::default();
        let config = ConnectorConfig::outbound_ca("R1".to_string());
        connection.configuration_update(1, &config).unwrap();
        assert!(connection.configuration_update(2, &config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_reply_echoes_id_and_sets_patch_base() {
        let backend = Fixed {
            revision: 1,
            config: ConnectorConfig::outbound_ca("R1".to_string()),
        };
        let mut connection = Connection::default();

        let reply = connection
            .handle(r#"{"verb":"READ","msg":"CONFIGURATION","id":"r-1"}"#, &backend)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.id, "r-1");
        assert_eq!(reply.verb, Verb::Notify);
        assert!(
            connection
                .configuration_update(2, &backend.config)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_push_queued_before_read_does_not_roll_back() {
        let mut r2 = ConnectorConfig::outbound_ca("R1".to_string());
        r2.merge(ConnectorConfig::outbound_ca("R2".to_string()));
        let backend = Fixed {
            revision: 2,
            config: r2.clone(),
        };
        let mut connection = Connection::default();
        connection
            .handle(r#"{"verb":"READ","msg":"CONFIGURATION","id":"r-2"}"#, &backend)
            .await
            .unwrap();

        let stale = ConnectorConfig::outbound_ca("R1".to_string());
        assert!(connection.configuration_update(1, &stale).unwrap().is_none());
        assert!(connection.configuration_update(2, &r2).unwrap().is_none());

        let mut r3 = r2;
        r3.merge(ConnectorConfig::outbound_ca("R3".to_string()));
        let next = connection.configuration_update(3, &r3).unwrap().unwrap();
        assert_eq!(next.verb, Verb::Patch);
        assert_eq!(
            next.data,
            json!([{ "op": "replace", "path": "/outbound/tls/creds/ca", "value": "R3" }])
        );
    }

    #[tokio::test]
    async fn test_patch_from_connector_is_unsupported() {
        let backend = Fixed {
            revision: 0,
            config: ConnectorConfig::default(),
        };
        let mut connection = Connection::default();
        let reply = connection
            .handle(
                r#"{"verb":"PATCH","msg":"CONFIGURATION","data":[],"id":"p-1"}"#,
                &backend,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.msg, Msg::Error);
        assert_eq!(reply.data, json!("UNSUPPORTED_VERB"));
        assert_eq!(reply.id, "p-1");
    }

    #[tokio::test]
    async fn test_malformed_peer_jws_payload_is_a_parse_error() {
        let backend = Fixed {
            revision: 0,
            config: ConnectorConfig::default(),
        };
        let mut connection = Connection::default();
        let reply = connection
            .handle(
                r#"{"verb":"NOTIFY","msg":"PEER_JWS","data":"nope","id":"n-1"}"#,
                &backend,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, json!("JSON_PARSE_ERROR"));
        assert_ne!(reply.id, "n-1");
    }
}

//! Relay protocol plumbing: NIP-01 messages and a WebSocket relay pool.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
};

/// Message received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event { sub: String, event: Event },
    Eose(String),
    Ok {
        id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Closed { sub: String, message: String },
}

impl RelayMessage {
    /// Parse a relay text frame. Unknown or malformed frames yield `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first()?.as_str()? {
            "EVENT" if arr.len() >= 3 => Some(RelayMessage::Event {
                sub: str_at(1)?,
                event: serde_json::from_value(arr[2].clone()).ok()?,
            }),
            "EOSE" => Some(RelayMessage::Eose(str_at(1)?)),
            "OK" => Some(RelayMessage::Ok {
                id: str_at(1)?,
                accepted: arr.get(2).and_then(|v| v.as_bool())?,
                message: str_at(3).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice(str_at(1)?)),
            "CLOSED" => Some(RelayMessage::Closed {
                sub: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// `["EVENT", <event>]`
pub fn event_message(ev: &Event) -> String {
    json!(["EVENT", ev]).to_string()
}

/// `["REQ", <sub>, <filter>...]`
pub fn req_message(sub: &str, filters: &[Filter]) -> String {
    let mut arr = vec![Value::String("REQ".into()), Value::String(sub.into())];
    arr.extend(filters.iter().map(|f| Value::Object(f.to_json())));
    Value::Array(arr).to_string()
}

/// `["CLOSE", <sub>]`
pub fn close_message(sub: &str) -> String {
    json!(["CLOSE", sub]).to_string()
}

fn subscription_id() -> String {
    format!("relaysync-{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Per-relay outcome of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Relays the event was written to.
    pub sent: Vec<String>,
    /// Relays that could not be reached, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn any_sent(&self) -> bool {
        !self.sent.is_empty()
    }
}

/// Connection pool shared by every publish and query of a session.
#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Write `event` to each relay. Does not wait for `OK` acknowledgements.
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<PublishReport>;

    /// One-shot query: collect stored events until every relay sent `EOSE`.
    async fn list(&self, filters: &[Filter], relays: &[String]) -> Result<Vec<Event>>;
}

/// WebSocket relay pool, optionally routed through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct WsRelayPool {
    tor_socks: Option<String>,
    timeout: Duration,
}

impl Default for WsRelayPool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WsRelayPool {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self {
            tor_socks,
            timeout: Duration::from_secs(10),
        }
    }

    /// Bound on connecting and on waiting for `EOSE`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self, relay: &str) -> Result<WsStream> {
        timeout(self.timeout, connect_ws(relay, self.tor_socks.as_deref()))
            .await
            .map_err(|_| Error::Network(format!("connect to {relay} timed out")))?
    }

    async fn send_event(&self, relay: &str, ev: &Event) -> Result<()> {
        let mut ws = self.connect(relay).await?;
        ws.send(Message::Text(event_message(ev))).await?;
        let _ = ws.close(None).await;
        Ok(())
    }

    async fn list_one(&self, relay: &str, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut ws = self.connect(relay).await?;
        let sub = subscription_id();
        ws.send(Message::Text(req_message(&sub, filters))).await?;
        let deadline = Instant::now() + self.timeout;
        let mut events = vec![];
        loop {
            let msg = match timeout_at(deadline, ws.next()).await {
                Ok(Some(msg)) => msg?,
                Ok(None) => break,
                Err(_) => {
                    warn!(relay, "no EOSE before timeout, keeping partial results");
                    break;
                }
            };
            match msg {
                Message::Text(txt) => match RelayMessage::parse(&txt) {
                    Some(RelayMessage::Event { sub: s, event }) if s == sub => events.push(event),
                    Some(RelayMessage::Eose(s)) if s == sub => break,
                    Some(RelayMessage::Closed { sub: s, message }) if s == sub => {
                        warn!(relay, %message, "subscription closed by relay");
                        break;
                    }
                    Some(RelayMessage::Notice(notice)) => debug!(relay, %notice, "relay notice"),
                    _ => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.send(Message::Text(close_message(&sub))).await;
        let _ = ws.close(None).await;
        Ok(events)
    }

    /// Open a live subscription on one relay. Messages for the subscription are
    /// forwarded until the receiver is dropped or the relay disconnects.
    pub async fn subscribe(
        &self,
        relay: &str,
        filters: &[Filter],
    ) -> Result<mpsc::Receiver<RelayMessage>> {
        let mut ws = self.connect(relay).await?;
        let sub = subscription_id();
        ws.send(Message::Text(req_message(&sub, filters))).await?;
        let (tx, rx) = mpsc::channel(256);
        let relay = relay.to_string();
        tokio::spawn(async move {
            loop {
                // Stop once the receiver is gone, even on a silent relay.
                let msg = tokio::select! {
                    _ = tx.closed() => {
                        debug!(%relay, %sub, "subscriber dropped, closing subscription");
                        break;
                    }
                    msg = ws.next() => msg,
                };
                let txt = match msg {
                    None => break,
                    Some(Ok(Message::Text(txt))) => txt,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%relay, error = %e, "subscription stream failed");
                        break;
                    }
                };
                let Some(parsed) = RelayMessage::parse(&txt) else {
                    continue;
                };
                let ours = match &parsed {
                    RelayMessage::Event { sub: s, .. }
                    | RelayMessage::Eose(s)
                    | RelayMessage::Closed { sub: s, .. } => s == &sub,
                    RelayMessage::Ok { .. } | RelayMessage::Notice(_) => true,
                };
                if ours && tx.send(parsed).await.is_err() {
                    break;
                }
            }
            let _ = ws.send(Message::Text(close_message(&sub))).await;
            let _ = ws.close(None).await;
        });
        Ok(rx)
    }
}

#[async_trait]
impl RelayPool for WsRelayPool {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<PublishReport> {
        let results = join_all(relays.iter().map(|r| self.send_event(r, event))).await;
        let mut report = PublishReport::default();
        for (relay, res) in relays.iter().zip(results) {
            match res {
                Ok(()) => report.sent.push(relay.clone()),
                Err(e) => {
                    warn!(%relay, id = %event.id, error = %e, "publish failed");
                    report.failed.push((relay.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn list(&self, filters: &[Filter], relays: &[String]) -> Result<Vec<Event>> {
        let results = join_all(relays.iter().map(|r| self.list_one(r, filters))).await;
        let mut seen = HashSet::new();
        let mut events = vec![];
        let mut last_err = None;
        let mut any_ok = relays.is_empty();
        for (relay, res) in relays.iter().zip(results) {
            match res {
                Ok(batch) => {
                    any_ok = true;
                    events.extend(batch.into_iter().filter(|ev| seen.insert(ev.id.clone())));
                }
                Err(e) => {
                    warn!(%relay, error = %e, "list failed");
                    last_err = Some(e);
                }
            }
        }
        match (any_ok, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(events),
        }
    }
}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay).map_err(|e| Error::Network(format!("{relay}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Network(format!("{relay}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Network(format!("{relay}: missing port")))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Network(format!("socks proxy {proxy}: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Network(format!("{relay}: {e}")))?,
        )
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

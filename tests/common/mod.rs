#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relaysync::{Event, Filter};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Minimal in-process relay: stores every `EVENT`, answers `REQ` from its store.
pub struct MockRelay {
    pub url: String,
    pub events: Arc<Mutex<Vec<Event>>>,
    /// `CLOSE` frames received from clients.
    pub closes: Arc<AtomicUsize>,
}

impl MockRelay {
    pub async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    /// A relay that never sends `EOSE` after the stored events.
    pub async fn spawn_without_eose() -> Self {
        Self::spawn_with(false).await
    }

    async fn spawn_with(eose: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let (shared, shared_closes) = (events.clone(), closes.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, shared.clone(), shared_closes.clone(), eose));
            }
        });
        Self {
            url: format!("ws://{addr}"),
            events,
            closes,
        }
    }

    pub fn seed(&self, ev: Event) {
        self.events.lock().push(ev);
    }

    pub fn stored(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Poll until the relay holds `n` events or a second has passed.
    pub async fn wait_for(&self, n: usize) -> Vec<Event> {
        for _ in 0..100 {
            if self.events.lock().len() >= n {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.stored()
    }

    /// Poll until a client has sent `CLOSE` or a second has passed.
    pub async fn wait_for_close(&self) -> usize {
        for _ in 0..100 {
            if self.closes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.closes.load(Ordering::SeqCst)
    }
}

async fn handle(
    stream: TcpStream,
    events: Arc<Mutex<Vec<Event>>>,
    closes: Arc<AtomicUsize>,
    eose: bool,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let txt = match msg {
            Message::Text(txt) => txt,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Some(Ok(ev)) = arr.get(1).map(|v| serde_json::from_value::<Event>(v.clone()))
                else {
                    continue;
                };
                let ok = json!(["OK", ev.id, true, ""]).to_string();
                events.lock().push(ev);
                let _ = ws.send(Message::Text(ok)).await;
            }
            Some("REQ") => {
                let sub = arr.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
                let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_json).collect();
                let matching: Vec<Event> = events
                    .lock()
                    .iter()
                    .filter(|ev| filters.iter().any(|f| f.matches(ev)))
                    .cloned()
                    .collect();
                for ev in matching {
                    let frame = json!(["EVENT", sub, ev]).to_string();
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if eose {
                    let _ = ws.send(Message::Text(json!(["EOSE", sub]).to_string())).await;
                }
            }
            Some("CLOSE") => {
                closes.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

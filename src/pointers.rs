//! Latest-id pointers for replaceable records.
//!
//! Pointers map a logical record (`pubkey`, `kind`, `d`) to the id of the
//! newest relay-confirmed event seen for it. They are a cache: losing them
//! only costs a relay round trip, and [`PointerCache::rebuild`] restores them
//! from a reconciled [`EventStore`].

use std::sync::Arc;

use crate::{
    error::Result,
    event::{Event, KindClass},
    kv::KvStore,
    store::EventStore,
};

#[derive(Clone)]
pub struct PointerCache {
    kv: Arc<dyn KvStore>,
}

/// Storage key for a record's pointer. `d` is hex encoded so any slot name is a safe path.
pub fn pointer_key(pubkey: &str, kind: u32, d: Option<&str>) -> String {
    format!(
        "latest/{}.{}.{}",
        pubkey,
        kind,
        hex::encode(d.unwrap_or_default())
    )
}

impl PointerCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Point the event's record at it. Regular and ephemeral kinds are skipped.
    pub async fn record(&self, ev: &Event) -> Result<()> {
        let d = match ev.kind_class() {
            KindClass::Replaceable => None,
            KindClass::ParameterizedReplaceable => Some(ev.d_tag().unwrap_or_default()),
            KindClass::Regular | KindClass::Ephemeral => return Ok(()),
        };
        self.kv
            .set(&pointer_key(&ev.pubkey, ev.kind, d), &ev.id)
            .await
    }

    pub async fn get(&self, pubkey: &str, kind: u32, d: Option<&str>) -> Result<Option<String>> {
        self.kv.get(&pointer_key(pubkey, kind, d)).await
    }

    pub async fn forget(&self, pubkey: &str, kind: u32, d: Option<&str>) -> Result<()> {
        self.kv.delete(&pointer_key(pubkey, kind, d)).await
    }

    /// Rewrite the pointer of every winner held by `store`. Returns the count written.
    pub async fn rebuild(&self, store: &EventStore) -> Result<usize> {
        let winners: Vec<Event> = store.winners().cloned().collect();
        for ev in &winners {
            self.record(ev).await?;
        }
        Ok(winners.len())
    }
}

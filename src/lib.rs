//! Client-side sync core for Nostr relays.
//!
//! Reconciles relay events into a deterministic local view, publishes signed
//! (optionally mined and delegated) events, and replays edits made while
//! offline with conflict detection.

pub mod config;
pub mod delegation;
pub mod error;
pub mod event;
pub mod filter;
pub mod kv;
pub mod offline;
pub mod pointers;
pub mod pow;
pub mod publish;
pub mod relay;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use event::{Event, KindClass, Tag, TagKind, UnsignedEvent};
pub use filter::Filter;
pub use offline::{OfflineEdit, OfflineQueue};
pub use publish::Publisher;
pub use relay::{RelayPool, WsRelayPool};
pub use session::{LocalSigner, Session, Signer};
pub use store::EventStore;

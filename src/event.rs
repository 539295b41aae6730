//! Nostr event model: wire shape, content-derived ids, signatures and
//! per-kind replacement semantics.

use std::cmp::Ordering;

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    delegation::{verify_delegated, UnknownClausePolicy},
    error::{Error, Result},
};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. They are kept verbatim on the wire so unknown
/// tags survive a round trip; business logic reads them through [`Tag::parse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Shorthand for a `["d", value]` slot identifier.
    pub fn identifier(value: impl Into<String>) -> Self {
        Tag(vec!["d".into(), value.into()])
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Decode the raw string array into a typed variant.
    pub fn parse(&self) -> TagKind {
        match self.0.as_slice() {
            [n, v, ..] if n == "d" => TagKind::Identifier(v.clone()),
            [n] if n == "d" => TagKind::Identifier(String::new()),
            [n, id, rest @ ..] if n == "e" => TagKind::Event {
                id: id.clone(),
                relay: rest.first().filter(|r| !r.is_empty()).cloned(),
            },
            [n, pk, rest @ ..] if n == "p" => TagKind::Pubkey {
                pubkey: pk.clone(),
                relay: rest.first().filter(|r| !r.is_empty()).cloned(),
            },
            [n, v, ..] if n == "t" => TagKind::Topic(v.clone()),
            [n, nonce, rest @ ..] if n == "nonce" => match nonce.parse() {
                Ok(nonce) => TagKind::Nonce {
                    nonce,
                    target: rest.first().and_then(|t| t.parse().ok()),
                },
                Err(_) => TagKind::Other,
            },
            [n, delegator, conditions, sig, ..] if n == "delegation" => TagKind::Delegation {
                delegator: delegator.clone(),
                conditions: conditions.clone(),
                sig: sig.clone(),
            },
            _ => TagKind::Other,
        }
    }
}

/// Typed view over the tags the sync core understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagKind {
    /// `d` slot identifier of parameterized-replaceable events.
    Identifier(String),
    /// `e` reference to another event.
    Event { id: String, relay: Option<String> },
    /// `p` reference to another author.
    Pubkey { pubkey: String, relay: Option<String> },
    /// `t` hashtag.
    Topic(String),
    /// Proof-of-work nonce with optional committed target difficulty.
    Nonce { nonce: u64, target: Option<u8> },
    /// Delegated signing capability.
    Delegation {
        delegator: String,
        conditions: String,
        sig: String,
    },
    Other,
}

/// Reconciliation policy class of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Every event is kept.
    Regular,
    /// Latest event per author and kind wins.
    Replaceable,
    /// Never stored.
    Ephemeral,
    /// Latest event per author, kind and `d` tag wins.
    ParameterizedReplaceable,
}

impl KindClass {
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 | 10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::ParameterizedReplaceable,
            _ => KindClass::Regular,
        }
    }
}

/// Logical slot a replaceable event competes for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub kind: u32,
    pub pubkey: String,
    /// `Some` only for parameterized-replaceable kinds; empty when the `d` tag is absent.
    pub d: Option<String>,
}

/// Event contents before an id and signature are attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Author public key (hex). Filled from the signer when left empty.
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            pubkey: String::new(),
            created_at: 0,
            kind,
            tags: vec![],
            content: content.into(),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// First tag decoding to a delegation capability, if any.
    pub fn delegation(&self) -> Option<TagKind> {
        find_delegation(&self.tags)
    }

    /// Sign with a local key, overwriting `pubkey` with the key's x-only public key.
    pub fn sign_with(mut self, keypair: &Keypair) -> Result<Event> {
        let secp = Secp256k1::new();
        self.pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        let hash = event_hash(&self)?;
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Core Nostr event exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Author-asserted Unix timestamp; untrusted, used only for ordering.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    pub fn kind_class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Value of the first `d` tag.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| match t.0.as_slice() {
            [n, v, ..] if n == "d" => Some(v.as_str()),
            [n] if n == "d" => Some(""),
            _ => None,
        })
    }

    /// Replacement slot for replaceable kinds, `None` for regular and ephemeral ones.
    pub fn scope_key(&self) -> Option<ScopeKey> {
        match self.kind_class() {
            KindClass::Replaceable => Some(ScopeKey {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                d: None,
            }),
            KindClass::ParameterizedReplaceable => Some(ScopeKey {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                d: Some(self.d_tag().unwrap_or_default().to_string()),
            }),
            KindClass::Regular | KindClass::Ephemeral => None,
        }
    }

    /// Total order used to pick a replaceable winner: newer `created_at`, then greater id.
    pub fn replacement_order(&self, other: &Event) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether `self` wins over `other` in the same scope.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.replacement_order(other) == Ordering::Greater
    }

    pub fn delegation(&self) -> Option<TagKind> {
        find_delegation(&self.tags)
    }

    /// Strip id and signature.
    pub fn template(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Recompute the id and check the signature.
    pub fn verify(&self) -> bool {
        verify_event(self).is_ok()
    }
}

fn find_delegation(tags: &[Tag]) -> Option<TagKind> {
    tags.iter()
        .map(Tag::parse)
        .find(|t| matches!(t, TagKind::Delegation { .. }))
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &UnsignedEvent) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Hex event id for a template.
pub fn compute_id(ev: &UnsignedEvent) -> Result<String> {
    Ok(hex::encode(event_hash(ev)?))
}

/// Check that `id` is the hash of the event's contents. Returns the raw hash.
pub fn verify_id(ev: &Event) -> Result<[u8; 32]> {
    let hash = event_hash(&ev.template())?;
    if hex::encode(hash) != ev.id {
        return Err(Error::MalformedEvent("id mismatch".into()));
    }
    Ok(hash)
}

/// Verify an event's ID and Schnorr signature against its `pubkey`, and its
/// delegation tag if it carries one (unknown clauses ignored).
pub fn verify_event(ev: &Event) -> Result<()> {
    verify_event_with(ev, UnknownClausePolicy::Ignore)
}

/// [`verify_event`] with an explicit policy for unknown delegation clauses.
pub fn verify_event_with(ev: &Event, policy: UnknownClausePolicy) -> Result<()> {
    let hash = verify_id(ev)?;
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)
        .map_err(|e| Error::MalformedEvent(format!("bad signature encoding: {e}")))?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)
        .map_err(|e| Error::MalformedEvent(format!("bad pubkey: {e}")))?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| Error::MalformedEvent("signature mismatch".into()))?;
    verify_delegated(ev, policy)
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

//! NIP-26 delegated event signing.
//!
//! A delegator grants a delegate key the right to publish on its behalf by
//! signing `nostr:delegation:<delegate pubkey>:<conditions>`. The resulting
//! token travels as `["delegation", delegator, conditions, sig]` on every
//! event the delegate signs.

use std::{fmt, str::FromStr};

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    event::{Event, Tag, TagKind},
};

/// How clauses other than `kind=`, `created_at>` and `created_at<` are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownClausePolicy {
    /// Skip them; the remaining clauses decide.
    #[default]
    Ignore,
    /// Any unknown clause fails the check.
    Reject,
}

impl FromStr for UnknownClausePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "ignore" => Ok(Self::Ignore),
            "reject" => Ok(Self::Reject),
            other => Err(Error::Authorization(format!(
                "unknown delegation clause policy: {other}"
            ))),
        }
    }
}

/// One `&`-separated predicate of a condition string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Kind(u32),
    CreatedAfter(u64),
    CreatedBefore(u64),
    /// A supported predicate whose value does not parse. Never satisfied.
    Malformed(String),
    Unknown(String),
}

impl Clause {
    fn parse(raw: &str) -> Self {
        if let Some(v) = raw.strip_prefix("kind=") {
            v.parse()
                .map_or_else(|_| Clause::Malformed(raw.into()), Clause::Kind)
        } else if let Some(v) = raw.strip_prefix("created_at>") {
            v.parse()
                .map_or_else(|_| Clause::Malformed(raw.into()), Clause::CreatedAfter)
        } else if let Some(v) = raw.strip_prefix("created_at<") {
            v.parse()
                .map_or_else(|_| Clause::Malformed(raw.into()), Clause::CreatedBefore)
        } else {
            Clause::Unknown(raw.into())
        }
    }

    fn holds(&self, kind: u32, created_at: u64, policy: UnknownClausePolicy) -> bool {
        match self {
            Clause::Kind(k) => *k == kind,
            Clause::CreatedAfter(t) => created_at > *t,
            Clause::CreatedBefore(t) => created_at < *t,
            Clause::Malformed(_) => false,
            Clause::Unknown(_) => policy == UnknownClausePolicy::Ignore,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Kind(k) => write!(f, "kind={k}"),
            Clause::CreatedAfter(t) => write!(f, "created_at>{t}"),
            Clause::CreatedBefore(t) => write!(f, "created_at<{t}"),
            Clause::Malformed(raw) | Clause::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Parsed condition string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conditions(pub Vec<Clause>);

impl Conditions {
    pub fn parse(s: &str) -> Self {
        Conditions(
            s.split('&')
                .filter(|c| !c.is_empty())
                .map(Clause::parse)
                .collect(),
        )
    }

    /// Conjunctive evaluation of every clause.
    pub fn allows(&self, kind: u32, created_at: u64, policy: UnknownClausePolicy) -> bool {
        self.0.iter().all(|c| c.holds(kind, created_at, policy))
    }
}

impl fmt::Display for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{clause}")?;
        }
        Ok(())
    }
}

/// Evaluate a raw condition string, ignoring unknown clauses.
pub fn check_conditions(conditions: &str, kind: u32, created_at: u64) -> bool {
    check_conditions_with(conditions, kind, created_at, UnknownClausePolicy::Ignore)
}

pub fn check_conditions_with(
    conditions: &str,
    kind: u32,
    created_at: u64,
    policy: UnknownClausePolicy,
) -> bool {
    Conditions::parse(conditions).allows(kind, created_at, policy)
}

/// Decoded delegation tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub delegator: String,
    pub conditions: String,
    pub sig: String,
}

impl Delegation {
    pub fn from_tag(tag: &Tag) -> Option<Self> {
        Self::from_kind(tag.parse())
    }

    pub fn from_kind(kind: TagKind) -> Option<Self> {
        match kind {
            TagKind::Delegation {
                delegator,
                conditions,
                sig,
            } => Some(Self {
                delegator,
                conditions,
                sig,
            }),
            _ => None,
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::new([
            "delegation",
            self.delegator.as_str(),
            self.conditions.as_str(),
            self.sig.as_str(),
        ])
    }

    /// Check the delegator's signature over the token for `delegate_pubkey`.
    pub fn verify_signature(&self, delegate_pubkey: &str) -> bool {
        verify_token(self, delegate_pubkey).is_ok()
    }

    /// Full check used before publishing or accepting a delegated event.
    pub fn authorize(
        &self,
        delegate_pubkey: &str,
        kind: u32,
        created_at: u64,
        policy: UnknownClausePolicy,
    ) -> Result<()> {
        if !self.verify_signature(delegate_pubkey) {
            return Err(Error::Authorization(format!(
                "delegation from {} does not cover {delegate_pubkey}",
                self.delegator
            )));
        }
        if !check_conditions_with(&self.conditions, kind, created_at, policy) {
            return Err(Error::Authorization(format!(
                "delegation conditions `{}` reject kind {kind} at {created_at}",
                self.conditions
            )));
        }
        Ok(())
    }
}

fn token_hash(delegate_pubkey: &str, conditions: &str) -> [u8; 32] {
    let token = format!("nostr:delegation:{delegate_pubkey}:{conditions}");
    Sha256::digest(token.as_bytes()).into()
}

fn verify_token(delegation: &Delegation, delegate_pubkey: &str) -> Result<()> {
    let hash = token_hash(delegate_pubkey, &delegation.conditions);
    let sig = Signature::from_slice(&hex::decode(&delegation.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&delegation.delegator)?)?;
    let msg = Message::from_digest_slice(&hash)?;
    Secp256k1::verification_only().verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Sign a delegation token and return the four-element tag.
pub fn create_token(delegator: &Keypair, delegate_pubkey: &str, conditions: &str) -> Result<Tag> {
    let secp = Secp256k1::new();
    let hash = token_hash(delegate_pubkey, conditions);
    let msg = Message::from_digest_slice(&hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, delegator);
    Ok(Delegation {
        delegator: hex::encode(delegator.x_only_public_key().0.serialize()),
        conditions: conditions.to_string(),
        sig: hex::encode(sig.as_ref()),
    }
    .to_tag())
}

/// Verify a delegation tag against the delegate's public key.
pub fn verify_signature(tag: &Tag, delegate_pubkey: &str) -> bool {
    Delegation::from_tag(tag).is_some_and(|d| d.verify_signature(delegate_pubkey))
}

/// Check the delegation carried by a signed event, if any, under `policy`.
/// The event's own signature is checked by [`crate::event::verify_event`].
pub fn verify_delegated(ev: &Event, policy: UnknownClausePolicy) -> Result<()> {
    match ev.delegation().and_then(Delegation::from_kind) {
        Some(d) => d.authorize(&ev.pubkey, ev.kind, ev.created_at, policy),
        None => Ok(()),
    }
}

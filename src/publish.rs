//! Publish pipeline: authorize, stamp, mine, sign, broadcast.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    delegation::{Delegation, UnknownClausePolicy},
    error::{Error, Result},
    event::{unix_now, Event, UnsignedEvent},
    pow::{self, PowLimits},
    relay::RelayPool,
    session::Session,
};

/// Source of the current Unix time in seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Turns templates into signed events and sends them to relays.
#[derive(Clone)]
pub struct Publisher {
    session: Arc<Session>,
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
    pow_limits: PowLimits,
    policy: UnknownClausePolicy,
    clock: Clock,
}

impl Publisher {
    /// `relays` is the default broadcast set used when a call names none.
    pub fn new(session: Arc<Session>, pool: Arc<dyn RelayPool>, relays: Vec<String>) -> Self {
        Self {
            session,
            pool,
            relays,
            pow_limits: PowLimits::default(),
            policy: UnknownClausePolicy::default(),
            clock: Arc::new(unix_now),
        }
    }

    pub fn with_pow_limits(mut self, limits: PowLimits) -> Self {
        self.pow_limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: UnknownClausePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pool(&self) -> &Arc<dyn RelayPool> {
        &self.pool
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Run every step up to and including signing, without broadcasting.
    pub async fn sign(&self, mut template: UnsignedEvent, pow_difficulty: Option<u8>) -> Result<Event> {
        let signer = self.session.signer()?;
        let pubkey = signer.public_key();
        let now = (self.clock)();

        if let Some(delegation) = template.delegation().and_then(Delegation::from_kind) {
            delegation.authorize(&pubkey, template.kind, now, self.policy)?;
        }

        template.pubkey = pubkey;
        template.created_at = now;

        if let Some(difficulty) = pow_difficulty.filter(|d| *d > 0) {
            let limits = self.pow_limits;
            template =
                tokio::task::spawn_blocking(move || pow::mine(template, difficulty, limits))
                    .await??;
        }

        signer.sign_event(template).await
    }

    /// Sign `template` and broadcast it to `relays`, or the default set when `None`.
    ///
    /// Succeeds once at least one relay took the write; acknowledgements are
    /// not awaited. Nothing is retried here: on [`Error::Network`] the caller
    /// either gives up or queues the mutation for offline replay.
    pub async fn publish(
        &self,
        template: UnsignedEvent,
        relays: Option<&[String]>,
        pow_difficulty: Option<u8>,
    ) -> Result<Event> {
        let event = self.sign(template, pow_difficulty).await?;
        let targets = relays.unwrap_or(&self.relays);
        if targets.is_empty() {
            return Err(Error::Network("no relays configured".into()));
        }
        let report = self.pool.publish(&event, targets).await?;
        if !report.any_sent() {
            warn!(id = %event.id, failed = report.failed.len(), "no relay accepted event");
            return Err(Error::Network(format!(
                "event {} reached none of {} relays",
                event.id,
                targets.len()
            )));
        }
        info!(id = %event.id, kind = event.kind, relays = report.sent.len(), "published");
        Ok(event)
    }
}

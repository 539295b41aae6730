//! Signing identity and its login/logout lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use secp256k1::{Keypair, Secp256k1};
use tracing::info;

use crate::{
    error::{Error, Result},
    event::{Event, UnsignedEvent},
};

/// Anything able to produce signed events for one public key: a local key or
/// a remote signer handle.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key.
    fn public_key(&self) -> String;

    async fn sign_event(&self, template: UnsignedEvent) -> Result<Event>;
}

/// Signer holding secp256k1 key material in memory.
pub struct LocalSigner {
    keypair: Keypair,
}

impl LocalSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let secp = Secp256k1::new();
        let bytes = hex::decode(secret.trim())?;
        Ok(Self::new(Keypair::from_seckey_slice(&secp, &bytes)?))
    }

    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        Self::new(Keypair::new(&secp, &mut rand::thread_rng()))
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    async fn sign_event(&self, template: UnsignedEvent) -> Result<Event> {
        if !template.pubkey.is_empty() && template.pubkey != self.public_key() {
            return Err(Error::Authorization(format!(
                "template authored by {} cannot be signed by {}",
                template.pubkey,
                self.public_key()
            )));
        }
        template.sign_with(&self.keypair)
    }
}

/// Process-wide session holding at most one active signer.
///
/// Construct one per process (or per test) and share it via `Arc`.
#[derive(Default)]
pub struct Session {
    signer: RwLock<Option<Arc<dyn Signer>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer(signer: Arc<dyn Signer>) -> Self {
        let session = Self::new();
        session.login(signer);
        session
    }

    pub fn login(&self, signer: Arc<dyn Signer>) {
        info!(pubkey = %signer.public_key(), "login");
        *self.signer.write() = Some(signer);
    }

    pub fn logout(&self) {
        if self.signer.write().take().is_some() {
            info!("logout");
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.signer.read().is_some()
    }

    pub fn public_key(&self) -> Option<String> {
        self.signer.read().as_ref().map(|s| s.public_key())
    }

    /// Active signer, or [`Error::Authorization`] when logged out.
    pub fn signer(&self) -> Result<Arc<dyn Signer>> {
        self.signer
            .read()
            .clone()
            .ok_or_else(|| Error::Authorization("no signing key available".into()))
    }
}

//! Bounded NIP-13 proof-of-work mining.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    error::{Error, Result},
    event::{event_hash, Tag, UnsignedEvent},
};

/// Ceilings that keep mining from running unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowLimits {
    pub max_duration: Duration,
    pub max_iterations: u64,
}

impl Default for PowLimits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(5),
            max_iterations: 10_000_000,
        }
    }
}

/// Count leading zero bits of a byte string.
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut count = 0;
    for b in bytes {
        if *b == 0 {
            count += 8;
        } else {
            count += b.leading_zeros();
            break;
        }
    }
    count
}

/// Difficulty of a hex event id. Invalid hex counts as zero.
pub fn difficulty(id: &str) -> u32 {
    hex::decode(id).map(|b| leading_zero_bits(&b)).unwrap_or(0)
}

/// Search for a nonce giving the template's id at least `target` leading zero bits.
///
/// The first `nonce` tag is reused, or one is appended. Nonces are tried from
/// 0 upwards; the committed target is stored as the tag's third element.
/// Nonce 0 is always tried, so difficulty 0 succeeds even with zero ceilings.
/// Returns [`Error::ProofOfWorkTimeout`] once either ceiling in `limits` is hit.
pub fn mine(mut template: UnsignedEvent, target: u8, limits: PowLimits) -> Result<UnsignedEvent> {
    let slot = match template.tags.iter().position(|t| t.name() == Some("nonce")) {
        Some(i) => i,
        None => {
            template.tags.push(Tag::new(["nonce", "0", "0"]));
            template.tags.len() - 1
        }
    };
    let started = Instant::now();
    let mut nonce: u64 = 0;
    loop {
        template.tags[slot] = Tag(vec!["nonce".into(), nonce.to_string(), target.to_string()]);
        let hash = event_hash(&template)?;
        if leading_zero_bits(&hash) >= u32::from(target) {
            debug!(target, nonce, elapsed = ?started.elapsed(), "proof of work found");
            return Ok(template);
        }
        nonce += 1;
        if nonce >= limits.max_iterations || started.elapsed() >= limits.max_duration {
            return Err(Error::ProofOfWorkTimeout {
                difficulty: target,
                iterations: nonce,
                elapsed: started.elapsed(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{compute_id, TagKind};

    fn template() -> UnsignedEvent {
        UnsignedEvent {
            pubkey: "00".repeat(32),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "mine me".into(),
        }
    }

    #[test]
    fn counts_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0xff]), 0);
        assert_eq!(leading_zero_bits(&[0x00, 0x0f]), 12);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
        assert_eq!(difficulty("000000000e9d97a1ab09fc381030b346cdd7a142ad57e6df0b46dc9bef6c7e2d"), 36);
        assert_eq!(difficulty("zz"), 0);
    }

    #[test]
    fn zero_difficulty_uses_nonce_zero() {
        let mined = mine(template(), 0, PowLimits::default()).unwrap();
        assert_eq!(
            mined.tags.last().unwrap().parse(),
            TagKind::Nonce {
                nonce: 0,
                target: Some(0)
            }
        );
    }

    #[test]
    fn unreachable_difficulty_times_out_on_iteration_ceiling() {
        let limits = PowLimits {
            max_duration: Duration::from_secs(60),
            max_iterations: 1,
        };
        let err = mine(template(), 255, limits).unwrap_err();
        assert!(matches!(
            err,
            Error::ProofOfWorkTimeout {
                difficulty: 255,
                iterations: 1,
                ..
            }
        ));
    }

    #[test]
    fn wall_clock_ceiling_stops_mining() {
        let limits = PowLimits {
            max_duration: Duration::ZERO,
            max_iterations: u64::MAX,
        };
        assert!(matches!(
            mine(template(), 255, limits),
            Err(Error::ProofOfWorkTimeout { .. })
        ));
    }

    #[test]
    fn zero_difficulty_ignores_zero_ceilings() {
        let limits = PowLimits {
            max_duration: Duration::ZERO,
            max_iterations: 0,
        };
        let mined = mine(template(), 0, limits).unwrap();
        assert!(matches!(
            mined.tags.last().unwrap().parse(),
            TagKind::Nonce { nonce: 0, .. }
        ));
    }

    #[test]
    fn mined_id_meets_target_and_reuses_nonce_tag() {
        let t = template().with_tag(Tag::new(["nonce", "999", "1"]));
        let mined = mine(t, 8, PowLimits::default()).unwrap();
        let nonces = mined
            .tags
            .iter()
            .filter(|t| t.name() == Some("nonce"))
            .count();
        assert_eq!(nonces, 1);
        assert!(difficulty(&compute_id(&mined).unwrap()) >= 8);
        assert!(matches!(
            mined.tags[0].parse(),
            TagKind::Nonce {
                target: Some(8),
                ..
            }
        ));
    }
}

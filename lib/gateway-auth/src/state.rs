//! Login-flow correlation state
//!
//! A fresh random token is minted for each redirect to the provider. The token
//! travels to the provider as the `state` parameter and back to the gateway in a
//! short-lived cookie; on callback both must match exactly. Nothing is stored
//! server-side except the set of tokens already consumed, which keeps a replayed
//! callback from succeeding even when the attacker also replays the cookie.
//! That set never drops a token still inside its lifetime: once it is full of
//! live tokens, further callbacks are refused until the oldest ones expire.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use gateway_core::{GatewayError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use std::num::NonZeroUsize;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Lifetime of a correlation token and its cookies
pub const STATE_TTL: Duration = Duration::from_secs(300);

const TOKEN_BYTES: usize = 32;
const DEFAULT_REPLAY_CAPACITY: usize = 50_000;

/// Unguessable URL-safe token from the OS-seeded thread RNG
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// State bound to one outbound login redirect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationState {
    pub token: String,
    pub original_url: String,
    /// Unix seconds
    pub issued_at: i64,
}

impl CorrelationState {
    pub fn mint(original_url: impl Into<String>) -> Self {
        Self {
            token: random_token(),
            original_url: original_url.into(),
            issued_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Value stored in the state cookie: `<token>.<issued_at>`
    pub fn cookie_value(&self) -> String {
        format!("{}.{}", self.token, self.issued_at)
    }

    /// Split a state cookie value into token and issue time
    pub fn parse_cookie(value: &str) -> Option<(&str, i64)> {
        let (token, issued_at) = value.rsplit_once('.')?;
        if token.is_empty() {
            return None;
        }
        Some((token, issued_at.parse().ok()?))
    }
}

/// Single-use verification of returning correlation tokens
pub struct StateVerifier {
    consumed: Mutex<LruCache<String, i64>>,
    ttl: Duration,
}

impl Default for StateVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl StateVerifier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            consumed: Mutex::new(LruCache::new(capacity)),
            ttl: STATE_TTL,
        }
    }

    /// Check the `state` query value against the state cookie and consume it
    ///
    /// Fails closed on anything short of an exact, fresh, first-time match.
    pub fn verify(&self, presented: Option<&str>, cookie: Option<&str>) -> Result<()> {
        let presented = presented
            .filter(|s| !s.is_empty())
            .ok_or_else(|| mismatch("missing state parameter"))?;
        let cookie = cookie.ok_or_else(|| mismatch("missing state cookie"))?;
        let (token, issued_at) =
            CorrelationState::parse_cookie(cookie).ok_or_else(|| mismatch("malformed state cookie"))?;

        if !bool::from(token.as_bytes().ct_eq(presented.as_bytes())) {
            return Err(mismatch("state does not match cookie"));
        }

        let now = chrono::Utc::now().timestamp();
        let age = now - issued_at;
        if age < 0 || age > self.ttl.as_secs() as i64 {
            return Err(mismatch("state expired"));
        }

        let mut consumed = self.consumed.lock();
        evict_expired(&mut consumed, now, self.ttl);
        if consumed.contains(token) {
            debug!("Rejected replayed correlation state");
            return Err(mismatch("state already used"));
        }
        if consumed.len() == consumed.cap().get() {
            warn!(capacity = consumed.cap().get(), "Replay cache full of live states, refusing login callback");
            return Err(mismatch("too many logins in flight"));
        }
        consumed.put(token.to_string(), issued_at);
        Ok(())
    }
}

fn mismatch(reason: &str) -> GatewayError {
    GatewayError::CsrfMismatch(reason.to_string())
}

/// Drop the oldest consumed tokens whose state could no longer verify anyway
fn evict_expired(cache: &mut LruCache<String, i64>, now: i64, ttl: Duration) {
    while let Some((_, issued_at)) = cache.peek_lru() {
        if now - *issued_at <= ttl.as_secs() as i64 {
            break;
        }
        cache.pop_lru();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_url_safe() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_cookie_value_round_trip() {
        let state = CorrelationState::mint("/app");
        let value = state.cookie_value();
        let (token, issued_at) = CorrelationState::parse_cookie(&value).unwrap();
        assert_eq!(token, state.token);
        assert_eq!(issued_at, state.issued_at);
        assert!(CorrelationState::parse_cookie("no-dot").is_none());
        assert!(CorrelationState::parse_cookie(".123").is_none());
        assert!(CorrelationState::parse_cookie("abc.notanumber").is_none());
    }

    #[test]
    fn test_state_accepted_exactly_once() {
        let verifier = StateVerifier::default();
        let state = CorrelationState::mint("/");
        let cookie = state.cookie_value();

        verifier.verify(Some(&state.token), Some(&cookie)).unwrap();
        let replay = verifier.verify(Some(&state.token), Some(&cookie));
        assert!(matches!(replay, Err(GatewayError::CsrfMismatch(_))));
    }

    #[test]
    fn test_mismatch_and_missing_values_fail() {
        let verifier = StateVerifier::default();
        let state = CorrelationState::mint("/");
        let cookie = state.cookie_value();

        assert!(verifier.verify(Some("other"), Some(&cookie)).is_err());
        assert!(verifier.verify(None, Some(&cookie)).is_err());
        assert!(verifier.verify(Some(&state.token), None).is_err());
        assert!(verifier.verify(Some(""), Some(&cookie)).is_err());
        // A failed attempt does not burn the token
        assert!(verifier.verify(Some(&state.token), Some(&cookie)).is_ok());
    }

    #[test]
    fn test_expired_state_fails() {
        let verifier = StateVerifier::default();
        let stale = CorrelationState {
            token: random_token(),
            original_url: "/".to_string(),
            issued_at: chrono::Utc::now().timestamp() - 301,
        };
        assert!(verifier
            .verify(Some(&stale.token), Some(&stale.cookie_value()))
            .is_err());
    }

    #[test]
    fn test_full_replay_cache_never_forgets_live_tokens() {
        let verifier = StateVerifier::new(2);
        let first = CorrelationState::mint("/");
        let second = CorrelationState::mint("/");
        let third = CorrelationState::mint("/");

        verifier.verify(Some(&first.token), Some(&first.cookie_value())).unwrap();
        verifier.verify(Some(&second.token), Some(&second.cookie_value())).unwrap();

        let refused = verifier.verify(Some(&third.token), Some(&third.cookie_value()));
        assert!(matches!(refused, Err(GatewayError::CsrfMismatch(_))));
        // The earliest consumed token is still remembered
        assert!(verifier.verify(Some(&first.token), Some(&first.cookie_value())).is_err());
    }

    #[test]
    fn test_replay_cache_drops_expired_entries() {
        let mut cache = LruCache::new(NonZeroUsize::new(4).unwrap());
        let now = chrono::Utc::now().timestamp();
        cache.put("old".to_string(), now - 1000);
        cache.put("fresh".to_string(), now);
        evict_expired(&mut cache, now, STATE_TTL);
        assert!(!cache.contains("old"));
        assert!(cache.contains("fresh"));
    }
}

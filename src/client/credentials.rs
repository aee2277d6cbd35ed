//! Ordered API credentials with rotation.
//!
//! Rotation is a logical fallback: exactly one credential is active, and it
//! stays active across items until a 401 or 429 moves it on. Secrets are only
//! reachable through `Credential::expose`; everything that is logged or
//! recorded uses the label (`key#1`, `key#2`, ...).

use crate::models::{Result, TollgateError};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

const REDACTED: &str = "[redacted]";

/// One API key.
#[derive(Clone)]
pub struct Credential {
    label: String,
    secret: String,
}

impl Credential {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The raw secret, for building the Authorization header only.
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &REDACTED)
            .finish()
    }
}

/// Per-credential bookkeeping.
#[derive(Debug)]
struct CredentialSlot {
    credential: Credential,
    revoked: bool,
    consecutive_429s: u32,
    requests: u64,
    rate_limited: u64,
}

/// Usage summary for one credential.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub label: String,
    pub revoked: bool,
    pub requests: u64,
    pub rate_limited: u64,
}

/// Ordered credential list with a single active entry.
#[derive(Debug)]
pub struct CredentialPool {
    slots: Vec<CredentialSlot>,
    active: usize,
}

impl CredentialPool {
    /// Build a pool from secrets in priority order.
    ///
    /// An empty list is a fatal setup error.
    pub fn new(provider: &str, secrets: Vec<String>) -> Result<Self> {
        if secrets.is_empty() {
            return Err(TollgateError::NoCredentials {
                provider: provider.to_string(),
            });
        }

        let slots = secrets
            .into_iter()
            .enumerate()
            .map(|(i, secret)| CredentialSlot {
                credential: Credential::new(format!("key#{}", i + 1), secret),
                revoked: false,
                consecutive_429s: 0,
                requests: 0,
                rate_limited: 0,
            })
            .collect::<Vec<_>>();

        info!(provider = provider, credentials = slots.len(), "Credentials loaded");
        Ok(Self { slots, active: 0 })
    }

    /// Active credential, unless every credential has been revoked.
    pub fn active(&self) -> Option<(usize, &Credential)> {
        let slot = self.slots.get(self.active)?;
        if slot.revoked {
            return None;
        }
        Some((self.active, &slot.credential))
    }

    /// Move to the next usable credential not in `tried`.
    ///
    /// Scans forward from the active slot, wrapping around. Returns the new
    /// active index, or `None` if no candidate exists (active is unchanged).
    pub fn rotate(&mut self, tried: &HashSet<usize>) -> Option<usize> {
        let n = self.slots.len();
        let next = (1..=n)
            .map(|step| (self.active + step) % n)
            .find(|&i| !self.slots[i].revoked && !tried.contains(&i))?;

        let from = self.slots[self.active].credential.label.clone();
        self.active = next;
        info!(from = %from, to = %self.slots[next].credential.label, "Rotated credential");
        Some(next)
    }

    /// Permanently disable a credential for this run (401).
    ///
    /// If it was active, the next usable credential becomes active.
    pub fn revoke(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.revoked = true;
            warn!(credential = %slot.credential.label, "Credential rejected, disabling for this run");
        }
        if index == self.active {
            let n = self.slots.len();
            if let Some(next) = (1..=n)
                .map(|step| (index + step) % n)
                .find(|&i| !self.slots[i].revoked)
            {
                self.active = next;
            }
        }
    }

    pub fn record_request(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.requests += 1;
        }
    }

    pub fn record_429(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.consecutive_429s += 1;
            slot.rate_limited += 1;
            warn!(
                credential = %slot.credential.label,
                consecutive_429s = slot.consecutive_429s,
                "Rate limited (429)"
            );
        }
    }

    pub fn record_success(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.consecutive_429s = 0;
        }
    }

    /// Number of credentials not revoked.
    pub fn usable(&self) -> usize {
        self.slots.iter().filter(|s| !s.revoked).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replace every secret occurring in `text` with a placeholder.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for slot in &self.slots {
            let secret = slot.credential.expose();
            if !secret.is_empty() && out.contains(secret) {
                out = out.replace(secret, REDACTED);
            }
        }
        out
    }

    pub fn summaries(&self) -> Vec<CredentialSummary> {
        self.slots
            .iter()
            .map(|s| CredentialSummary {
                label: s.credential.label.clone(),
                revoked: s.revoked,
                requests: s.requests,
                rate_limited: s.rate_limited,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::new("test", (0..n).map(|i| format!("sk-secret-{i}")).collect()).unwrap()
    }

    #[test]
    fn test_empty_pool_is_fatal() {
        let err = CredentialPool::new("openrouter", vec![]).unwrap_err();
        assert!(err.is_fatal_setup());
    }

    #[test]
    fn test_rotate_skips_tried_and_revoked() {
        let mut pool = pool(3);
        let mut tried = HashSet::from([0]);
        pool.revoke(1);
        assert_eq!(pool.active().unwrap().0, 0);

        assert_eq!(pool.rotate(&tried), Some(2));
        tried.insert(2);
        assert_eq!(pool.rotate(&tried), None);
        assert_eq!(pool.active().unwrap().0, 2);
    }

    #[test]
    fn test_revoking_active_moves_on() {
        let mut pool = pool(2);
        pool.revoke(0);
        assert_eq!(pool.active().unwrap().1.label(), "key#2");
        pool.revoke(1);
        assert!(pool.active().is_none());
        assert_eq!(pool.usable(), 0);
    }

    #[test]
    fn test_secrets_never_in_debug_or_scrubbed_text() {
        let pool = pool(2);
        let (_, credential) = pool.active().unwrap();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("sk-secret-0"));
        assert!(debug.contains("key#1"));

        let scrubbed = pool.scrub("invalid key sk-secret-1 supplied");
        assert_eq!(scrubbed, "invalid key [redacted] supplied");
    }
}

//! The three expiring maps a Forwarder owns, all behind a single mutex
//! (§5): `app_message_history` gates device responses, `rate_limited_messages`
//! throttles outbound app codes, `processed_messages` is the payload-hash
//! loop cache this workspace relies on since its MQTT transport is v3.1.1
//! (no user properties — see §4.3).

use crate::forwarder::rate_limiter::RATE_LIMIT_WINDOW;
use bridge_protocol::Side;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// §4.4 step 5: a device response is only forwarded if an app message for
/// the same device crossed within this window.
pub const CORRELATION_WINDOW: Duration = Duration::from_millis(1_000);

/// §9's v3 fallback: drop an echo of our own publish seen again within 1s.
pub const LOOP_CACHE_WINDOW: Duration = Duration::from_millis(1_000);

#[derive(Default)]
pub struct CorrelationState {
    pub app_message_history: HashMap<String, Instant>,
    pub rate_limited_messages: HashMap<(String, u32), Instant>,
    /// Keyed by `deviceKey`; value is the payload hash we last *published*,
    /// the side we published it to, and when. `is_own_echo` only treats a
    /// match as a loop when the incoming message arrives on that same
    /// target side — a repeat on the originating side is a legitimate
    /// resend, not our own publish bouncing back, and falls through to
    /// correlation/rate-limit handling instead.
    pub processed_messages: HashMap<String, (String, Side, Instant)>,
}

impl CorrelationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.6 map hygiene: drop entries older than 2x their window. Best
    /// effort — correctness never depends on this running.
    pub fn sweep(&mut self, now: Instant) {
        self.app_message_history
            .retain(|_, t| now.duration_since(*t) <= CORRELATION_WINDOW * 2);
        self.rate_limited_messages
            .retain(|_, t| now.duration_since(*t) <= RATE_LIMIT_WINDOW * 2);
        self.processed_messages
            .retain(|_, (_, _, t)| now.duration_since(*t) <= LOOP_CACHE_WINDOW * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_drops_only_stale_entries() {
        let mut state = CorrelationState::new();
        let t0 = Instant::now();
        state.app_message_history.insert("k1".to_owned(), t0);
        state
            .app_message_history
            .insert("k2".to_owned(), t0 + Duration::from_millis(500));

        state.sweep(t0 + CORRELATION_WINDOW * 2 + Duration::from_millis(600));

        assert!(!state.app_message_history.contains_key("k1"));
        assert!(state.app_message_history.contains_key("k2"));
    }
}

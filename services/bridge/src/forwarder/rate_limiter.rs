//! §4.5 rate limiter: app-originated messages toward the cloud broker are
//! throttled per `(deviceKey, code)` to one emission every 59_900 ms.

use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(59_900);

const LIMITED_CODES: [u32; 8] = [1, 13, 15, 16, 21, 26, 28, 30];

static CODE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn code_pattern() -> &'static Regex {
    CODE_PATTERN.get_or_init(|| Regex::new(r"cd=0*(\d+)").expect("static pattern is valid"))
}

/// Extracts the rate-limit code from a payload, if present and the payload
/// decodes as text. Returns `None` on anything that should fail open: no
/// match, non-UTF8 payload, or a code outside the gated set.
pub fn rate_limit_code(payload: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(payload).ok()?;
    let caps = code_pattern().captures(text)?;
    let code: u32 = caps[1].parse().ok()?;
    LIMITED_CODES.contains(&code).then_some(code)
}

/// Returns `true` if a message for `(device_key, code)` may be forwarded
/// right now, updating `last_allowed` to `now` when it is.
pub fn allow_and_record(
    rate_limited_messages: &mut std::collections::HashMap<(String, u32), Instant>,
    device_key: &str,
    code: u32,
    now: Instant,
) -> bool {
    let key = (device_key.to_owned(), code);
    match rate_limited_messages.get(&key) {
        Some(last) if now.duration_since(*last) < RATE_LIMIT_WINDOW => false,
        _ => {
            rate_limited_messages.insert(key, now);
            true
        }
    }
}

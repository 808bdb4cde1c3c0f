//! The Forwarder engine (§4.3-4.6): owns the two MQTT sessions for one cloud
//! broker plus the correlation/rate-limit/loop-cache state shared between
//! them, and the pure per-message dispatch logic that drives both.

pub mod dispatch;
pub mod matcher;
pub mod rate_limiter;
pub mod session;
pub mod state;

pub use dispatch::{DispatchOutcome, DropReason, MessageHandler};
pub use matcher::{build_matchers, match_device, DeviceMatcher};
pub use session::{Forwarder, SessionError, SideSession};
pub use state::CorrelationState;

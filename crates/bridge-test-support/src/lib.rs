//! Test doubles for the forwarder's MQTT-facing seams: a mockable monotonic
//! clock and a recording publisher, so correlation-window, rate-limiter and
//! loop-break logic can be unit tested without a real broker or real time.

mod clock;
mod publisher;

pub use clock::{FakeClock, MonotonicClock, SystemClock};
pub use publisher::{MqttPublisher, PublishError, PublishedMessage, RecordingPublisher};

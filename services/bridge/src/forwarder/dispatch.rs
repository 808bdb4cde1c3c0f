//! §4.4 message handling: the pure per-message decision path, generic over
//! the clock and publisher so it can run against a fake broker in tests
//! (`bridge-test-support`) and a real `rumqttc` session in production.

use crate::forwarder::matcher::{match_device, DeviceMatcher};
use crate::forwarder::rate_limiter::{allow_and_record, rate_limit_code};
use crate::forwarder::state::{CorrelationState, CORRELATION_WINDOW, LOOP_CACHE_WINDOW};
use bridge_protocol::{id, prefix, BrokerDefinition, Role, Side};
use bridge_test_support::{MonotonicClock, MqttPublisher};
use md5::{Digest, Md5};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    LoopMarker,
    NoDeviceMatch,
    DirectionPolicy,
    NoCorrelationWindow,
    RateLimited,
    PublishFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published { topic: String },
    Dropped(DropReason),
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Local => Side::Cloud,
        Side::Cloud => Side::Local,
    }
}

/// §4.4 step 3's direction policy table: `true` means the message may cross.
fn direction_allowed(source: Side, role: Role, inv: bool) -> bool {
    !matches!(
        (source, role, inv),
        (Side::Cloud, Role::Device, false)
            | (Side::Cloud, Role::App, true)
            | (Side::Local, Role::Device, true)
            | (Side::Local, Role::App, false)
    )
}

pub struct MessageHandler<'a> {
    pub matchers: &'a [DeviceMatcher],
    pub broker: &'a BrokerDefinition,
    pub forwarder_inverse_forwarding: bool,
    pub relay_tag: &'a str,
}

impl<'a> MessageHandler<'a> {
    /// Runs one incoming message through loop rejection, device matching,
    /// direction policy, correlation/rate-limit gating and (if accepted)
    /// the publish call.
    ///
    /// `incoming_relay_tag` models the `relayInstanceId` user-property
    /// check from §4.4 step 1; the production session always passes `None`
    /// since this workspace's MQTT transport is v3.1.1 and carries no user
    /// properties (loop prevention there is entirely `processed_messages`,
    /// below). Tests exercise both paths.
    pub async fn handle<C, P>(
        &self,
        state: &Mutex<CorrelationState>,
        clock: &C,
        publisher: &P,
        source: Side,
        topic: &str,
        payload: &[u8],
        incoming_relay_tag: Option<&str>,
    ) -> DispatchOutcome
    where
        C: MonotonicClock,
        P: MqttPublisher,
    {
        if incoming_relay_tag.is_some() {
            return DispatchOutcome::Dropped(DropReason::LoopMarker);
        }

        let Some((device, role)) = match_device(self.matchers, source, topic) else {
            return DispatchOutcome::Dropped(DropReason::NoDeviceMatch);
        };

        let inv = device.effective_direction(self.forwarder_inverse_forwarding);
        if !direction_allowed(source, role, inv) {
            return DispatchOutcome::Dropped(DropReason::DirectionPolicy);
        }

        let device_key = device.device_key();
        let now = clock.now();
        let payload_hash = hex::encode(Md5::digest(payload));

        if self.is_own_echo(state, &device_key, &payload_hash, source, now) {
            return DispatchOutcome::Dropped(DropReason::LoopMarker);
        }

        let target = opposite(source);

        match role {
            Role::App => {
                state
                    .lock()
                    .expect("correlation state mutex poisoned")
                    .app_message_history
                    .insert(device_key.clone(), now);

                if target == Side::Cloud {
                    if let Some(code) = rate_limit_code(payload) {
                        let mut guard = state.lock().expect("correlation state mutex poisoned");
                        if !allow_and_record(&mut guard.rate_limited_messages, &device_key, code, now)
                        {
                            return DispatchOutcome::Dropped(DropReason::RateLimited);
                        }
                    }
                }
            }
            Role::Device => {
                let mut guard = state.lock().expect("correlation state mutex poisoned");
                match guard.app_message_history.get(&device_key).copied() {
                    Some(recorded_at) if now.duration_since(recorded_at) <= CORRELATION_WINDOW => {
                        guard.app_message_history.remove(&device_key);
                    }
                    _ => return DispatchOutcome::Dropped(DropReason::NoCorrelationWindow),
                }
            }
        }

        let target_topic = format!(
            "{}{}/{}/{}/ctrl",
            prefix(device, target, self.broker),
            device.device_type,
            role.as_topic_token(),
            id(device, target)
        );

        state
            .lock()
            .expect("correlation state mutex poisoned")
            .processed_messages
            .insert(device_key, (payload_hash, target, now));

        match publisher
            .publish(target, target_topic.clone(), payload.to_vec(), self.relay_tag.to_owned())
            .await
        {
            Ok(()) => DispatchOutcome::Published { topic: target_topic },
            Err(err) => DispatchOutcome::Dropped(DropReason::PublishFailed(err.to_string())),
        }
    }

    /// A loop echo is our own recent publish bouncing back: the cached entry
    /// must have been sent *to* `source`, not merely share a device key. A
    /// payload re-sent from the side it originated on never matches here
    /// (nothing was ever published to that side for it) and falls through
    /// to correlation/rate-limit handling instead — see §4.5.
    fn is_own_echo<C: MonotonicClock>(
        &self,
        state: &Mutex<CorrelationState>,
        device_key: &str,
        payload_hash: &str,
        source: Side,
        now: std::time::Instant,
    ) -> bool {
        let guard = state.lock().expect("correlation state mutex poisoned");
        matches!(
            guard.processed_messages.get(device_key),
            Some((hash, published_to, seen_at))
                if hash == payload_hash
                    && *published_to == source
                    && now.duration_since(*seen_at) <= LOOP_CACHE_WINDOW
        )
    }
}

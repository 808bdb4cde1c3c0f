//! Production MQTT wiring: two `rumqttc` sessions per Forwarder (local,
//! cloud), each driven by its own event-loop-polling task, mirroring
//! `half_bridge` in the `tedge_mqtt_bridge` grounding file. Transport is
//! `rumqttc`'s stable MQTT v3.1.1 client; see `forwarder::dispatch` for why
//! loop-prevention doesn't rely on user properties here.

use crate::forwarder::dispatch::{DispatchOutcome, MessageHandler};
use crate::forwarder::matcher::build_matchers;
use crate::forwarder::state::CorrelationState;
use bridge_protocol::{id, prefix, BrokerDefinition, Device, Role, Side};
use bridge_test_support::{MqttPublisher, PublishError, SystemClock};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport, TlsConfiguration};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum SessionError {
    InvalidUrl(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidUrl(s) => write!(f, "invalid broker URL: {s}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Publishes onto whichever of the two sessions matches the target side.
struct RumqttcPublisher {
    local: AsyncClient,
    cloud: AsyncClient,
}

#[async_trait::async_trait]
impl MqttPublisher for RumqttcPublisher {
    async fn publish(
        &self,
        side: Side,
        topic: String,
        payload: Vec<u8>,
        relay_instance_id: String,
    ) -> Result<(), PublishError> {
        // Not carried on the wire: v3.1.1 has no user properties. Logged so
        // the instance tag is still visible for debugging forwarded traffic.
        debug!(relay_instance_id, topic, "publishing");
        let client = match side {
            Side::Local => &self.local,
            Side::Cloud => &self.cloud,
        };
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError(e.to_string()))
    }
}

fn build_mqtt_options(
    url: &str,
    client_id: String,
    credentials: Option<(&str, &str)>,
    tls: Option<(Option<&str>, Option<&str>, Option<&str>)>,
) -> Result<MqttOptions, SessionError> {
    let mut options = MqttOptions::parse_url(format!("{url}?client_id={client_id}"))
        .map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    options.set_keep_alive(KEEP_ALIVE);

    if let Some((username, password)) = credentials {
        options.set_credentials(username, password);
    }

    if let Some((ca, cert, key)) = tls {
        if let Some(ca_pem) = ca {
            let client_auth = match (cert, key) {
                (Some(cert_pem), Some(key_pem)) => {
                    Some((cert_pem.as_bytes().to_vec(), key_pem.as_bytes().to_vec()))
                }
                _ => None,
            };
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca_pem.as_bytes().to_vec(),
                alpn: None,
                client_auth,
            }));
        }
    }

    Ok(options)
}

/// One side's live session: the `AsyncClient` handle plus the task driving
/// its event loop.
pub struct SideSession {
    pub client: AsyncClient,
    pub connected: Arc<std::sync::atomic::AtomicBool>,
    task: JoinHandle<()>,
}

impl SideSession {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Builds subscriptions for every device on `side` and issues them once
/// (§4.3: the library is responsible for resuming subscriptions on
/// reconnect).
async fn subscribe_all(
    client: &AsyncClient,
    devices: &[Device],
    broker: &BrokerDefinition,
    side: Side,
    forwarder_inverse_forwarding: bool,
) {
    for d in devices {
        let inv = d.effective_direction(forwarder_inverse_forwarding);
        let role = match (side, inv) {
            (Side::Cloud, false) => Role::App,
            (Side::Cloud, true) => Role::Device,
            (Side::Local, false) => Role::Device,
            (Side::Local, true) => Role::App,
        };
        let topic = format!(
            "{}{}/{}/{}/ctrl",
            prefix(d, side, broker),
            d.device_type,
            role.as_topic_token(),
            id(d, side)
        );
        if let Err(err) = client.subscribe(&topic, QoS::AtMostOnce).await {
            warn!(error = %err, topic, "subscribe failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_side_loop(
    mut eventloop: EventLoop,
    side: Side,
    devices: Vec<Device>,
    broker: BrokerDefinition,
    forwarder_inverse_forwarding: bool,
    relay_tag: String,
    state: Arc<Mutex<CorrelationState>>,
    publisher: Arc<RumqttcPublisher>,
    connected: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    use std::sync::atomic::Ordering;

    tokio::spawn(async move {
        let matchers = build_matchers(&devices, &broker);
        let clock = SystemClock;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::Relaxed);
                    info!(side = ?side, "mqtt connected");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let handler = MessageHandler {
                        matchers: &matchers,
                        broker: &broker,
                        forwarder_inverse_forwarding,
                        relay_tag: &relay_tag,
                    };
                    let topic = publish.topic.clone();
                    let outcome = handler
                        .handle(&state, &clock, publisher.as_ref(), side, &topic, &publish.payload, None)
                        .await;
                    match outcome {
                        DispatchOutcome::Published { topic } => {
                            info!(side = ?side, topic, "forwarded");
                        }
                        DispatchOutcome::Dropped(reason) => {
                            debug!(side = ?side, topic, reason = ?reason, "dropped");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!(side = ?side, error = %err, "mqtt connection error");
                }
            }
        }
    })
}

pub struct Forwarder {
    pub local: SideSession,
    pub cloud: SideSession,
    pub state: Arc<Mutex<CorrelationState>>,
    sweep_task: JoinHandle<()>,
}

impl Forwarder {
    pub fn relay_tag() -> String {
        use rand::Rng;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// Opens both sessions, issues subscriptions, and starts the dispatch
    /// and sweep tasks. `local_broker_url` is the user-provided local broker
    /// (TCP or TLS per scheme, no client certificate); `broker` is this
    /// Forwarder's cloud broker definition.
    pub fn spawn(
        devices: Vec<Device>,
        broker: BrokerDefinition,
        forwarder_inverse_forwarding: bool,
        local_broker_url: &str,
    ) -> Result<Self, SessionError> {
        let relay_tag = Self::relay_tag();

        let local_client_id = format!("config_{}", hex::encode(rand_bytes(12)));
        let local_options = build_mqtt_options(local_broker_url, local_client_id, None, None)?;
        let (local_client, local_eventloop) = AsyncClient::new(local_options, EVENT_CHANNEL_CAPACITY);

        let cloud_client_id = format!(
            "{}{}",
            broker.client_id_prefix(),
            hex::encode(rand_bytes(12))
        );
        let cloud_options = build_mqtt_options(
            &broker.url,
            cloud_client_id,
            None,
            Some((broker.ca.as_deref(), broker.cert.as_deref(), broker.key.as_deref())),
        )?;
        let (cloud_client, cloud_eventloop) = AsyncClient::new(cloud_options, EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(Mutex::new(CorrelationState::new()));
        let publisher = Arc::new(RumqttcPublisher {
            local: local_client.clone(),
            cloud: cloud_client.clone(),
        });
        let local_connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cloud_connected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let local_task = {
            let devices = devices.clone();
            let broker = broker.clone();
            let relay_tag = relay_tag.clone();
            let state = state.clone();
            let publisher = publisher.clone();
            let connected = local_connected.clone();
            spawn_side_loop(
                local_eventloop,
                Side::Local,
                devices,
                broker,
                forwarder_inverse_forwarding,
                relay_tag,
                state,
                publisher,
                connected,
            )
        };

        let cloud_task = {
            let devices = devices.clone();
            let broker = broker.clone();
            let relay_tag = relay_tag.clone();
            let state = state.clone();
            let publisher = publisher.clone();
            let connected = cloud_connected.clone();
            spawn_side_loop(
                cloud_eventloop,
                Side::Cloud,
                devices,
                broker,
                forwarder_inverse_forwarding,
                relay_tag,
                state,
                publisher,
                connected,
            )
        };

        {
            let local_client = local_client.clone();
            let devices = devices.clone();
            let broker = broker.clone();
            tokio::spawn(async move {
                subscribe_all(&local_client, &devices, &broker, Side::Local, forwarder_inverse_forwarding).await;
            });
        }
        {
            let cloud_client = cloud_client.clone();
            let devices = devices.clone();
            let broker = broker.clone();
            tokio::spawn(async move {
                subscribe_all(&cloud_client, &devices, &broker, Side::Cloud, forwarder_inverse_forwarding).await;
            });
        }

        let sweep_task = {
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    state.lock().expect("correlation state mutex poisoned").sweep(std::time::Instant::now());
                }
            })
        };

        Ok(Forwarder {
            local: SideSession {
                client: local_client,
                connected: local_connected,
                task: local_task,
            },
            cloud: SideSession {
                client: cloud_client,
                connected: cloud_connected,
                task: cloud_task,
            },
            state,
            sweep_task,
        })
    }

    /// Ends both sessions and the sweep task. No drain (§5).
    pub fn shutdown(&self) {
        self.local.abort();
        self.cloud.abort();
        self.sweep_task.abort();
    }
}

fn rand_bytes(n: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

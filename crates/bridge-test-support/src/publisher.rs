//! A recording `MqttPublisher` so forwarder dispatch tests can assert on
//! what would have been published without a real MQTT broker.

use bridge_protocol::Side;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct PublishError(pub String);

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publish failed: {}", self.0)
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub side: Side,
    pub topic: String,
    pub payload: Vec<u8>,
    pub relay_instance_id: String,
}

#[async_trait::async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(
        &self,
        side: Side,
        topic: String,
        payload: Vec<u8>,
        relay_instance_id: String,
    ) -> Result<(), PublishError>;
}

/// Records every publish call in order; never fails.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .expect("recording publisher mutex poisoned")
            .clone()
    }
}

#[async_trait::async_trait]
impl MqttPublisher for RecordingPublisher {
    async fn publish(
        &self,
        side: Side,
        topic: String,
        payload: Vec<u8>,
        relay_instance_id: String,
    ) -> Result<(), PublishError> {
        self.published
            .lock()
            .expect("recording publisher mutex poisoned")
            .push(PublishedMessage {
                side,
                topic,
                payload,
                relay_instance_id,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_keeps_publishes_in_order() {
        let publisher = RecordingPublisher::new();
        publisher
            .publish(Side::Cloud, "t1".to_owned(), b"a".to_vec(), "tag1".to_owned())
            .await
            .unwrap();
        publisher
            .publish(Side::Local, "t2".to_owned(), b"b".to_vec(), "tag1".to_owned())
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "t1");
        assert_eq!(published[1].topic, "t2");
        assert_eq!(published[1].side, Side::Local);
    }
}

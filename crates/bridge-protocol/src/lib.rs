// bridge-protocol: shared device/broker types and the topic grammar the
// forwarder and identity resolver both need to agree on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which broker connection a topic or subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Cloud,
}

/// The pub/sub role token carried in a topic (`device` or `App`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Device,
    App,
}

impl Role {
    pub fn as_topic_token(self) -> &'static str {
        match self {
            Role::Device => "device",
            Role::App => "App",
        }
    }

    pub fn from_topic_token(token: &str) -> Option<Role> {
        match token {
            "device" => Some(Role::Device),
            "App" => Some(Role::App),
            _ => None,
        }
    }
}

/// A resolved device bound to exactly one Forwarder.
///
/// `broker_id`, `remote_id` and `use_remote_topic_id` are filled in by the
/// identity resolver; everything else comes straight from config or the
/// vendor API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub mac: String,
    pub device_type: String,
    #[serde(default)]
    pub version: Option<f64>,
    #[serde(default)]
    pub inverse_forwarding: Option<bool>,
    #[serde(default)]
    pub broker_id: String,
    #[serde(default)]
    pub remote_id: String,
    #[serde(default)]
    pub use_remote_topic_id: bool,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Device {
    /// The prefix of `device_type` before the final `-` (e.g. `HMG` from
    /// `HMG-50`). Types with no `-` are their own family.
    pub fn family(&self) -> &str {
        match self.device_type.rfind('-') {
            Some(idx) => &self.device_type[..idx],
            None => &self.device_type,
        }
    }

    /// `type:device_id:mac` — the stable composite map key used throughout
    /// the forwarder's expiring maps.
    pub fn device_key(&self) -> String {
        format!("{}:{}:{}", self.device_type, self.device_id, self.mac)
    }

    /// First comma-separated token of `salt`, the material actually used by
    /// the CQ derivation. `None` if there is no salt or it's empty.
    pub fn salt_token(&self) -> Option<&str> {
        self.salt
            .as_deref()
            .and_then(|s| s.split(',').next())
            .filter(|s| !s.is_empty())
    }

    /// `d.inverse_forwarding ?? forwarder.inverse_forwarding ?? false`
    pub fn effective_direction(&self, forwarder_inverse_forwarding: bool) -> bool {
        self.inverse_forwarding
            .unwrap_or(forwarder_inverse_forwarding)
    }
}

/// The per-cloud-broker configuration (`BrokerDefinition` in the data model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDefinition {
    pub url: String,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub client_id_prefix: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub local_topic_prefix: Option<String>,
    #[serde(default)]
    pub topic_encryption_key: Option<String>,
    #[serde(default)]
    pub min_versions: HashMap<String, f64>,
    #[serde(default)]
    pub use_remote_topic_id_versions: HashMap<String, Vec<f64>>,
    /// Whether this Forwarder's devices default to inverse forwarding when a
    /// device doesn't override it.
    #[serde(default)]
    pub inverse_forwarding: bool,
}

fn default_topic_prefix() -> String {
    "hame_energy/".to_owned()
}

impl BrokerDefinition {
    pub fn client_id_prefix(&self) -> &str {
        self.client_id_prefix.as_deref().unwrap_or("hm_")
    }

    /// Prefix in use on the local side for a device that is not mirroring
    /// the cloud's topic form.
    pub fn local_topic_prefix(&self) -> &str {
        self.local_topic_prefix
            .as_deref()
            .unwrap_or(&self.topic_prefix)
    }
}

/// `prefix(d, S)` from the topic-structure table.
pub fn prefix<'a>(device: &Device, side: Side, broker: &'a BrokerDefinition) -> &'a str {
    match side {
        Side::Cloud => &broker.topic_prefix,
        Side::Local if device.use_remote_topic_id => &broker.topic_prefix,
        Side::Local => broker.local_topic_prefix(),
    }
}

/// `id(d, S)` from the topic-structure table.
pub fn id<'a>(device: &'a Device, side: Side) -> &'a str {
    match side {
        Side::Cloud => &device.remote_id,
        Side::Local if device.use_remote_topic_id => &device.remote_id,
        Side::Local => &device.mac,
    }
}

/// The single topic a device subscribes to on `side`, given the effective
/// direction `inv`.
pub fn subscribe_topic(device: &Device, side: Side, broker: &BrokerDefinition, inv: bool) -> String {
    let role = match (side, inv) {
        (Side::Cloud, false) => Role::App,
        (Side::Cloud, true) => Role::Device,
        (Side::Local, false) => Role::Device,
        (Side::Local, true) => Role::App,
    };
    format!(
        "{}{}/{}/{}/ctrl",
        prefix(device, side, broker),
        device.device_type,
        role.as_topic_token(),
        id(device, side)
    )
}

/// Escapes `prefix` and builds the regex described in §4.3/§4.4:
/// `^<prefix>([^/]+)/(device|App)/(.*)/ctrl$`, with capture groups
/// (family-or-type, role, identifier).
pub fn topic_match_pattern(topic_prefix: &str) -> String {
    format!(
        "^{}([^/]+)/(device|App)/(.*)/ctrl$",
        regex::escape(topic_prefix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(use_remote_topic_id: bool) -> Device {
        Device {
            device_id: "D1234567890123456789012".to_owned(),
            mac: "aabbccddeeff".to_owned(),
            device_type: "HMA-1".to_owned(),
            version: Some(240.0),
            inverse_forwarding: None,
            broker_id: "main".to_owned(),
            remote_id: "R000000000000000000000000".to_owned(),
            use_remote_topic_id,
            salt: Some("abc123def456789a,extra".to_owned()),
            name: None,
        }
    }

    fn broker() -> BrokerDefinition {
        BrokerDefinition {
            url: "mqtts://cloud.example/".to_owned(),
            ca: None,
            cert: None,
            key: None,
            client_id_prefix: None,
            topic_prefix: "hame_energy/".to_owned(),
            local_topic_prefix: None,
            topic_encryption_key: None,
            min_versions: HashMap::new(),
            use_remote_topic_id_versions: HashMap::new(),
            inverse_forwarding: false,
        }
    }

    #[test]
    fn family_strips_trailing_generation_suffix() {
        let d = device(false);
        assert_eq!(d.family(), "HMA");
    }

    #[test]
    fn family_of_jpls_8h_is_jpls() {
        let mut d = device(false);
        d.device_type = "JPLS-8H".to_owned();
        assert_eq!(d.family(), "JPLS");
    }

    #[test]
    fn salt_token_takes_first_comma_segment() {
        let d = device(false);
        assert_eq!(d.salt_token(), Some("abc123def456789a"));
    }

    #[test]
    fn device_key_is_stable_composite() {
        let d = device(false);
        assert_eq!(d.device_key(), "HMA-1:D1234567890123456789012:aabbccddeeff");
    }

    #[test]
    fn subscribe_topic_non_inverse_matches_scenario_3() {
        let d = device(false);
        let b = broker();
        assert_eq!(
            subscribe_topic(&d, Side::Cloud, &b, false),
            "hame_energy/HMA-1/App/R000000000000000000000000/ctrl"
        );
        assert_eq!(
            subscribe_topic(&d, Side::Local, &b, false),
            "hame_energy/HMA-1/device/aabbccddeeff/ctrl"
        );
    }

    #[test]
    fn subscribe_topic_inverse_swaps_roles() {
        let d = device(false);
        let b = broker();
        assert_eq!(
            subscribe_topic(&d, Side::Cloud, &b, true),
            "hame_energy/HMA-1/device/R000000000000000000000000/ctrl"
        );
        assert_eq!(
            subscribe_topic(&d, Side::Local, &b, true),
            "hame_energy/HMA-1/App/aabbccddeeff/ctrl"
        );
    }

    #[test]
    fn local_topic_uses_remote_id_when_mirroring() {
        let d = device(true);
        let b = broker();
        assert_eq!(
            subscribe_topic(&d, Side::Local, &b, false),
            "hame_energy/HMA-1/device/R000000000000000000000000/ctrl"
        );
    }

    #[test]
    fn topic_match_pattern_escapes_prefix() {
        let pattern = topic_match_pattern("hame_energy/");
        let re = regex::Regex::new(&pattern).unwrap();
        let caps = re
            .captures("hame_energy/HMA-1/App/R000000000000000000000000/ctrl")
            .expect("should match");
        assert_eq!(&caps[1], "HMA-1");
        assert_eq!(&caps[2], "App");
        assert_eq!(&caps[3], "R000000000000000000000000");
    }

    #[test]
    fn effective_direction_falls_back_to_forwarder_default() {
        let d = device(false);
        assert!(!d.effective_direction(false));
        assert!(d.effective_direction(true));
        let mut d2 = device(false);
        d2.inverse_forwarding = Some(true);
        assert!(d2.effective_direction(false));
    }
}

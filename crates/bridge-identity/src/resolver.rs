//! Top-level Identity Resolver: combines broker auto-selection and the
//! three-tier remote-id derivation into the one decision bootstrap needs per
//! device.

use crate::broker_select::resolve_broker_id;
use crate::cq::cq;
use crate::firmware_gate::salted_derivation_eligible;
use crate::keyed_mac::keyed_mac_remote_id;
use bridge_protocol::BrokerDefinition;
use std::collections::HashMap;

#[derive(Debug)]
pub enum IdentityError {
    /// No explicit, auto-selected, or default broker id could be resolved.
    NoBrokerResolved { device_id: String },
    /// The resolved broker id isn't present in the catalog.
    UnknownBroker { broker_id: String },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::NoBrokerResolved { device_id } => {
                write!(f, "no broker could be resolved for device {device_id}")
            }
            IdentityError::UnknownBroker { broker_id } => {
                write!(f, "broker catalog has no entry for '{broker_id}'")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

pub struct ResolvedIdentity {
    pub broker_id: String,
    pub remote_id: String,
    pub use_remote_topic_id: bool,
}

/// Everything the resolver needs about one device that isn't already bundled
/// into `bridge_protocol::Device` (that struct is the *output* shape; this is
/// the raw input).
pub struct DeviceIdentityInput<'a> {
    pub device_id: &'a str,
    pub mac: &'a str,
    pub device_type: &'a str,
    pub family: &'a str,
    pub version: Option<f64>,
    pub salt: Option<&'a str>,
    pub explicit_broker_id: Option<&'a str>,
    pub explicit_remote_id: Option<&'a str>,
    pub explicit_use_remote_topic_id: Option<bool>,
}

pub fn resolve_identity(
    input: &DeviceIdentityInput<'_>,
    catalog: &HashMap<String, BrokerDefinition>,
    default_broker_id: Option<&str>,
) -> Result<ResolvedIdentity, IdentityError> {
    let broker_id = resolve_broker_id(
        input.explicit_broker_id,
        catalog,
        input.family,
        input.version,
        default_broker_id,
    )
    .ok_or_else(|| IdentityError::NoBrokerResolved {
        device_id: input.device_id.to_owned(),
    })?
    .to_owned();

    let broker = catalog
        .get(&broker_id)
        .ok_or_else(|| IdentityError::UnknownBroker {
            broker_id: broker_id.clone(),
        })?;

    let remote_id = derive_remote_id(input, broker);
    let use_remote_topic_id = input.explicit_use_remote_topic_id.unwrap_or_else(|| {
        input.version.is_some_and(|version| {
            broker
                .use_remote_topic_id_versions
                .get(input.family)
                .is_some_and(|versions| versions.contains(&version))
        })
    });

    Ok(ResolvedIdentity {
        broker_id,
        remote_id,
        use_remote_topic_id,
    })
}

/// §4.1 remote-id derivation, in priority order: explicit config override,
/// salted CQ form, keyed-MAC form, device-id fallback.
fn derive_remote_id(input: &DeviceIdentityInput<'_>, broker: &BrokerDefinition) -> String {
    if let Some(explicit) = input.explicit_remote_id.filter(|s| !s.is_empty()) {
        return explicit.to_owned();
    }

    if let (Some(salt), Some(version)) = (input.salt, input.version) {
        if salted_derivation_eligible(input.device_type, input.family, version) {
            let derived = cq(salt, input.mac, input.device_type);
            if !derived.is_empty() {
                return derived;
            }
        }
    }

    if let Some(key_hex) = &broker.topic_encryption_key {
        match keyed_mac_remote_id(key_hex, input.mac) {
            Ok(remote_id) => return remote_id,
            Err(err) => {
                tracing::warn!(error = %err, "keyed-MAC remote id derivation failed, falling back to device id");
            }
        }
    }

    input.device_id.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_key(key: Option<&str>) -> BrokerDefinition {
        BrokerDefinition {
            url: "mqtts://example/".to_owned(),
            ca: None,
            cert: None,
            key: None,
            client_id_prefix: None,
            topic_prefix: "hame_energy/".to_owned(),
            local_topic_prefix: None,
            topic_encryption_key: key.map(str::to_owned),
            min_versions: HashMap::new(),
            use_remote_topic_id_versions: HashMap::new(),
            inverse_forwarding: false,
        }
    }

    fn catalog_with(id: &str, broker: BrokerDefinition) -> HashMap<String, BrokerDefinition> {
        let mut m = HashMap::new();
        m.insert(id.to_owned(), broker);
        m
    }

    #[test]
    fn falls_back_to_device_id_with_no_salt_and_no_key() {
        let catalog = catalog_with("main", broker_with_key(None));
        let input = DeviceIdentityInput {
            device_id: "D1",
            mac: "aabbccddeeff",
            device_type: "HMG-50",
            family: "HMG",
            version: Some(10.0),
            salt: None,
            explicit_broker_id: Some("main"),
            explicit_remote_id: None,
            explicit_use_remote_topic_id: None,
        };
        let resolved = resolve_identity(&input, &catalog, None).unwrap();
        assert_eq!(resolved.remote_id, "D1");
        assert_eq!(resolved.broker_id, "main");
    }

    #[test]
    fn uses_keyed_mac_when_salt_ineligible_but_key_present() {
        let catalog = catalog_with(
            "main",
            broker_with_key(Some("000102030405060708090a0b0c0d0e0f")),
        );
        let input = DeviceIdentityInput {
            device_id: "D1",
            mac: "aabbccddeeff",
            device_type: "HMG-50",
            family: "HMG",
            version: Some(10.0), // below the HMG salted-derivation gate (154.0)
            salt: Some("abc123def456789a"),
            explicit_broker_id: Some("main"),
            explicit_remote_id: None,
            explicit_use_remote_topic_id: None,
        };
        let resolved = resolve_identity(&input, &catalog, None).unwrap();
        assert_eq!(resolved.remote_id.len(), 32);
        assert_ne!(resolved.remote_id, "D1");
    }

    #[test]
    fn uses_salted_form_when_eligible() {
        let catalog = catalog_with("main", broker_with_key(None));
        let input = DeviceIdentityInput {
            device_id: "D1",
            mac: "aabbccddeeff",
            device_type: "HMG-50",
            family: "HMG",
            version: Some(200.0), // above the HMG gate
            salt: Some("abc123def456789a"),
            explicit_broker_id: Some("main"),
            explicit_remote_id: None,
            explicit_use_remote_topic_id: None,
        };
        let resolved = resolve_identity(&input, &catalog, None).unwrap();
        assert!(!resolved.remote_id.is_empty());
        assert!(resolved.remote_id.chars().count() <= 24);
    }

    #[test]
    fn explicit_remote_id_wins_over_derivation() {
        let catalog = catalog_with("main", broker_with_key(None));
        let input = DeviceIdentityInput {
            device_id: "D1",
            mac: "aabbccddeeff",
            device_type: "HMG-50",
            family: "HMG",
            version: Some(200.0),
            salt: Some("abc123def456789a"),
            explicit_broker_id: Some("main"),
            explicit_remote_id: Some("RCUSTOM"),
            explicit_use_remote_topic_id: None,
        };
        let resolved = resolve_identity(&input, &catalog, None).unwrap();
        assert_eq!(resolved.remote_id, "RCUSTOM");
    }

    #[test]
    fn no_resolvable_broker_is_an_error() {
        let catalog: HashMap<String, BrokerDefinition> = HashMap::new();
        let input = DeviceIdentityInput {
            device_id: "D1",
            mac: "aabbccddeeff",
            device_type: "HMG-50",
            family: "HMG",
            version: Some(200.0),
            salt: None,
            explicit_broker_id: None,
            explicit_remote_id: None,
            explicit_use_remote_topic_id: None,
        };
        let err = resolve_identity(&input, &catalog, None).unwrap_err();
        assert!(matches!(err, IdentityError::NoBrokerResolved { .. }));
    }
}

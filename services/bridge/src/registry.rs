//! Device Registry: merges the vendor API device list with config-supplied
//! device entries, resolves identity for each, and freezes the result into
//! the immutable device set the Forwarders are built from.
//!
//! Merge policy (config devices are overrides, keyed by `device_id`; a
//! config entry with no matching API device stands on its own — this lets
//! the bridge run against a static device list with no vendor account):
//! - if a config device's `device_id` matches an API device, its override
//!   fields (`broker_id`, `remote_id`, `use_remote_topic_id`,
//!   `inverse_forwarding`) win over the API-derived defaults
//! - a config device whose `device_id` has no API match becomes a device in
//!   its own right, using the mac/type/version straight from config

use crate::config::DeviceOverride;
use bridge_identity::{resolve_identity, DeviceIdentityInput, IdentityError};
use bridge_protocol::{BrokerDefinition, Device};
use bridge_vendor_api::VendorDevice;
use std::collections::HashMap;

/// One per-device failure recorded during registry construction; the
/// process only aborts if the resulting device list is empty.
#[derive(Debug, Clone)]
pub struct RegistryError {
    pub device_id: String,
    pub reason: String,
}

pub struct RegistryBuildResult {
    pub devices: Vec<Device>,
    pub errors: Vec<RegistryError>,
}

struct MergedInput {
    device_id: String,
    mac: String,
    device_type: String,
    version: Option<f64>,
    salt: Option<String>,
    inverse_forwarding: Option<bool>,
    broker_id: Option<String>,
    remote_id: Option<String>,
    use_remote_topic_id: Option<bool>,
}

pub fn build_registry(
    vendor_devices: &[VendorDevice],
    overrides: &[DeviceOverride],
    catalog: &HashMap<String, BrokerDefinition>,
    default_broker_id: Option<&str>,
    forwarder_inverse_forwarding: bool,
    inverse_forwarding_device_ids: &[String],
) -> RegistryBuildResult {
    let override_by_id: HashMap<&str, &DeviceOverride> = overrides
        .iter()
        .map(|o| (o.device_id.as_str(), o))
        .collect();

    let mut merged = Vec::new();
    for vd in vendor_devices {
        let ov = override_by_id.get(vd.devid.as_str()).copied();
        merged.push(merge_vendor_device(vd, ov));
    }

    let known_ids: std::collections::HashSet<&str> =
        vendor_devices.iter().map(|d| d.devid.as_str()).collect();
    for ov in overrides {
        if !known_ids.contains(ov.device_id.as_str()) {
            merged.push(merge_override_only(ov));
        }
    }

    let mut devices = Vec::with_capacity(merged.len());
    let mut errors = Vec::new();

    for input in merged {
        match resolve_one(
            &input,
            catalog,
            default_broker_id,
            forwarder_inverse_forwarding,
            inverse_forwarding_device_ids,
        ) {
            Ok(device) => devices.push(device),
            Err(reason) => errors.push(RegistryError {
                device_id: input.device_id,
                reason,
            }),
        }
    }

    RegistryBuildResult { devices, errors }
}

fn merge_vendor_device(vd: &VendorDevice, ov: Option<&DeviceOverride>) -> MergedInput {
    MergedInput {
        device_id: vd.devid.trim().to_owned(),
        mac: ov.map(|o| o.mac.clone()).unwrap_or_else(|| vd.mac.clone()),
        device_type: ov
            .map(|o| o.device_type.clone())
            .unwrap_or_else(|| vd.device_type.clone()),
        version: ov.and_then(|o| o.version).or(vd.version),
        salt: vd.salt.clone(),
        inverse_forwarding: ov.and_then(|o| o.inverse_forwarding),
        broker_id: ov.and_then(|o| o.broker_id.clone()),
        remote_id: ov.and_then(|o| o.remote_id.clone()),
        use_remote_topic_id: ov.and_then(|o| o.use_remote_topic_id),
    }
}

fn merge_override_only(ov: &DeviceOverride) -> MergedInput {
    MergedInput {
        device_id: ov.device_id.trim().to_owned(),
        mac: ov.mac.clone(),
        device_type: ov.device_type.clone(),
        version: ov.version,
        salt: None,
        inverse_forwarding: ov.inverse_forwarding,
        broker_id: ov.broker_id.clone(),
        remote_id: ov.remote_id.clone(),
        use_remote_topic_id: ov.use_remote_topic_id,
    }
}

/// 12 lowercase hex characters after stripping `:` separators; `None` if the
/// result isn't valid hex of the right length.
fn normalize_mac(raw: &str) -> Option<String> {
    let stripped: String = raw.chars().filter(|c| *c != ':').collect();
    let lower = stripped.to_lowercase();
    if lower.len() == 12 && lower.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(lower)
    } else {
        None
    }
}

fn family_of(device_type: &str) -> &str {
    match device_type.rfind('-') {
        Some(idx) => &device_type[..idx],
        None => device_type,
    }
}

fn resolve_one(
    input: &MergedInput,
    catalog: &HashMap<String, BrokerDefinition>,
    default_broker_id: Option<&str>,
    forwarder_inverse_forwarding: bool,
    inverse_forwarding_device_ids: &[String],
) -> Result<Device, String> {
    let mac = normalize_mac(&input.mac)
        .ok_or_else(|| format!("mac '{}' does not normalize to 12 hex characters", input.mac))?;

    let salt_token = input
        .salt
        .as_deref()
        .and_then(|s| s.split(',').next())
        .filter(|s| !s.is_empty());

    let family = family_of(&input.device_type);
    let id_input = DeviceIdentityInput {
        device_id: &input.device_id,
        mac: &mac,
        device_type: &input.device_type,
        family,
        version: input.version,
        salt: salt_token,
        explicit_broker_id: input.broker_id.as_deref(),
        explicit_remote_id: input.remote_id.as_deref(),
        explicit_use_remote_topic_id: input.use_remote_topic_id,
    };

    let resolved = resolve_identity(&id_input, catalog, default_broker_id).map_err(|e| match e {
        IdentityError::NoBrokerResolved { device_id } => {
            format!("no broker resolved for device {device_id}")
        }
        IdentityError::UnknownBroker { broker_id } => {
            format!("resolved broker '{broker_id}' not present in catalog")
        }
    })?;

    let inverse_forwarding = input.inverse_forwarding.or_else(|| {
        inverse_forwarding_device_ids
            .iter()
            .any(|id| id == &input.device_id)
            .then_some(true)
    });

    let _ = forwarder_inverse_forwarding; // resolved at dispatch time via Device::effective_direction

    Ok(Device {
        device_id: input.device_id.clone(),
        mac,
        device_type: input.device_type.clone(),
        version: input.version,
        inverse_forwarding,
        broker_id: resolved.broker_id,
        remote_id: resolved.remote_id,
        use_remote_topic_id: resolved.use_remote_topic_id,
        salt: input.salt.clone(),
        name: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> HashMap<String, BrokerDefinition> {
        let mut m = HashMap::new();
        m.insert(
            "main".to_owned(),
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
            },
        );
        m
    }

    fn vendor_device(devid: &str, mac: &str) -> VendorDevice {
        serde_json::from_value(serde_json::json!({
            "devid": devid,
            "mac": mac,
            "type": "HMA-1",
            "version": 240.0,
        }))
        .unwrap()
    }

    #[test]
    fn builds_devices_straight_from_vendor_api() {
        let vendor = vec![vendor_device("D1", "aa:bb:cc:dd:ee:ff")];
        let result = build_registry(&vendor, &[], &catalog(), Some("main"), false, &[]);
        assert!(result.errors.is_empty());
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].mac, "aabbccddeeff");
        assert_eq!(result.devices[0].broker_id, "main");
    }

    #[test]
    fn invalid_mac_is_collected_as_an_error_not_fatal() {
        let vendor = vec![vendor_device("D1", "not-a-mac")];
        let result = build_registry(&vendor, &[], &catalog(), Some("main"), false, &[]);
        assert!(result.devices.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].device_id, "D1");
    }

    #[test]
    fn config_override_applies_on_top_of_vendor_device() {
        let vendor = vec![vendor_device("D1", "aabbccddeeff")];
        let overrides = vec![DeviceOverride {
            device_id: "D1".to_owned(),
            mac: "aabbccddeeff".to_owned(),
            device_type: "HMA-1".to_owned(),
            version: None,
            inverse_forwarding: Some(true),
            broker_id: None,
            remote_id: Some("RCUSTOM".to_owned()),
            use_remote_topic_id: None,
        }];
        let result = build_registry(&vendor, &overrides, &catalog(), Some("main"), false, &[]);
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].remote_id, "RCUSTOM");
        assert_eq!(result.devices[0].inverse_forwarding, Some(true));
    }

    #[test]
    fn config_only_device_with_no_vendor_match_is_included() {
        let overrides = vec![DeviceOverride {
            device_id: "STATIC1".to_owned(),
            mac: "aabbccddeeff".to_owned(),
            device_type: "HMG-50".to_owned(),
            version: Some(200.0),
            inverse_forwarding: None,
            broker_id: Some("main".to_owned()),
            remote_id: None,
            use_remote_topic_id: None,
        }];
        let result = build_registry(&[], &overrides, &catalog(), None, false, &[]);
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices[0].device_id, "STATIC1");
    }

    #[test]
    fn inverse_forwarding_device_ids_list_sets_device_override() {
        let vendor = vec![vendor_device("D1", "aabbccddeeff")];
        let result = build_registry(
            &vendor,
            &[],
            &catalog(),
            Some("main"),
            false,
            &["D1".to_owned()],
        );
        assert_eq!(result.devices[0].inverse_forwarding, Some(true));
    }
}

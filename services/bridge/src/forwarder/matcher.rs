//! Per-device topic matchers, precompiled once per Forwarder at construction
//! time (not per message) since the device set is frozen after startup.

use bridge_protocol::{id, prefix, topic_match_pattern, BrokerDefinition, Device, Role, Side};
use regex::Regex;

pub struct DeviceMatcher {
    pub device: Device,
    cloud_regex: Regex,
    local_regex: Regex,
}

pub fn build_matchers(devices: &[Device], broker: &BrokerDefinition) -> Vec<DeviceMatcher> {
    devices
        .iter()
        .map(|d| {
            let cloud_prefix = prefix(d, Side::Cloud, broker);
            let local_prefix = prefix(d, Side::Local, broker);
            DeviceMatcher {
                device: d.clone(),
                cloud_regex: Regex::new(&topic_match_pattern(cloud_prefix))
                    .expect("escaped prefix always yields a valid pattern"),
                local_regex: Regex::new(&topic_match_pattern(local_prefix))
                    .expect("escaped prefix always yields a valid pattern"),
            }
        })
        .collect()
}

/// §4.4 step 2: enumerate devices, accept only a match whose captured type
/// and identifier agree with the device's own expected values on `source`.
pub fn match_device<'a>(
    matchers: &'a [DeviceMatcher],
    source: Side,
    topic: &str,
) -> Option<(&'a Device, Role)> {
    for m in matchers {
        let re = match source {
            Side::Cloud => &m.cloud_regex,
            Side::Local => &m.local_regex,
        };
        let Some(caps) = re.captures(topic) else {
            continue;
        };
        if &caps[1] != m.device.device_type {
            continue;
        }
        if &caps[3] != id(&m.device, source) {
            continue;
        }
        if let Some(role) = Role::from_topic_token(&caps[2]) {
            return Some((&m.device, role));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    fn device() -> Device {
        Device {
            device_id: "D1234567890123456789012".to_owned(),
            mac: "aabbccddeeff".to_owned(),
            device_type: "HMA-1".to_owned(),
            version: Some(240.0),
            inverse_forwarding: Some(false),
            broker_id: "main".to_owned(),
            remote_id: "R000000000000000000000000".to_owned(),
            use_remote_topic_id: false,
            salt: None,
            name: None,
        }
    }

    #[test]
    fn matches_cloud_app_topic_for_non_inverse_device() {
        let b = broker();
        let d = device();
        let matchers = build_matchers(std::slice::from_ref(&d), &b);
        let (matched, role) = match_device(
            &matchers,
            Side::Cloud,
            "hame_energy/HMA-1/App/R000000000000000000000000/ctrl",
        )
        .expect("should match");
        assert_eq!(matched.device_id, d.device_id);
        assert_eq!(role, Role::App);
    }

    #[test]
    fn does_not_match_unrelated_device_id() {
        let b = broker();
        let d = device();
        let matchers = build_matchers(std::slice::from_ref(&d), &b);
        assert!(match_device(
            &matchers,
            Side::Cloud,
            "hame_energy/HMA-1/App/SOMEOTHERID0000000000000/ctrl"
        )
        .is_none());
    }

    #[test]
    fn local_side_matches_mac_based_topic() {
        let b = broker();
        let d = device();
        let matchers = build_matchers(std::slice::from_ref(&d), &b);
        let (matched, role) =
            match_device(&matchers, Side::Local, "hame_energy/HMA-1/device/aabbccddeeff/ctrl")
                .expect("should match");
        assert_eq!(matched.device_id, d.device_id);
        assert_eq!(role, Role::Device);
    }
}

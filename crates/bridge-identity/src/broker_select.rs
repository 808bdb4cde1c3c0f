//! Broker auto-selection by firmware version.

use bridge_protocol::BrokerDefinition;
use std::collections::HashMap;

/// Picks the broker whose `min_versions[family]` is the greatest value not
/// exceeding `version`. Ties (equal thresholds on different brokers) break
/// on the lexicographically smallest broker id — an explicit choice for the
/// open question in the design notes, not specified by the original.
pub fn auto_select_broker<'a>(
    catalog: &'a HashMap<String, BrokerDefinition>,
    family: &str,
    version: f64,
) -> Option<&'a str> {
    let mut best: Option<(f64, &str)> = None;
    for (id, def) in catalog {
        let Some(&min_version) = def.min_versions.get(family) else {
            continue;
        };
        if min_version > version {
            continue;
        }
        best = match best {
            None => Some((min_version, id.as_str())),
            Some((best_version, best_id)) => {
                if min_version > best_version
                    || (min_version == best_version && id.as_str() < best_id)
                {
                    Some((min_version, id.as_str()))
                } else {
                    Some((best_version, best_id))
                }
            }
        };
    }
    best.map(|(_, id)| id)
}

/// Resolves the broker id for a device: explicit `device.broker_id` wins,
/// then auto-selection, then the configured default.
pub fn resolve_broker_id<'a>(
    explicit_broker_id: Option<&'a str>,
    catalog: &'a HashMap<String, BrokerDefinition>,
    family: &str,
    version: Option<f64>,
    default_broker_id: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(id) = explicit_broker_id.filter(|s| !s.is_empty()) {
        return Some(id);
    }
    if let Some(version) = version {
        if let Some(id) = auto_select_broker(catalog, family, version) {
            return Some(id);
        }
    }
    default_broker_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(min_versions: &[(&str, f64)]) -> BrokerDefinition {
        BrokerDefinition {
            url: "mqtts://example/".to_owned(),
            ca: None,
            cert: None,
            key: None,
            client_id_prefix: None,
            topic_prefix: "hame_energy/".to_owned(),
            local_topic_prefix: None,
            topic_encryption_key: None,
            min_versions: min_versions
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            use_remote_topic_id_versions: HashMap::new(),
            inverse_forwarding: false,
        }
    }

    #[test]
    fn picks_greatest_threshold_not_exceeding_version() {
        let mut catalog = HashMap::new();
        catalog.insert("old".to_owned(), broker(&[("HMG", 100.0)]));
        catalog.insert("new".to_owned(), broker(&[("HMG", 150.0)]));
        assert_eq!(auto_select_broker(&catalog, "HMG", 154.0), Some("new"));
        assert_eq!(auto_select_broker(&catalog, "HMG", 120.0), Some("old"));
    }

    #[test]
    fn no_match_when_version_below_every_threshold() {
        let mut catalog = HashMap::new();
        catalog.insert("only".to_owned(), broker(&[("HMG", 150.0)]));
        assert_eq!(auto_select_broker(&catalog, "HMG", 10.0), None);
    }

    #[test]
    fn ties_break_on_lexicographically_smallest_id() {
        let mut catalog = HashMap::new();
        catalog.insert("bravo".to_owned(), broker(&[("HMG", 150.0)]));
        catalog.insert("alpha".to_owned(), broker(&[("HMG", 150.0)]));
        assert_eq!(auto_select_broker(&catalog, "HMG", 200.0), Some("alpha"));
    }

    #[test]
    fn explicit_broker_id_overrides_auto_selection() {
        let catalog = HashMap::new();
        assert_eq!(
            resolve_broker_id(Some("pinned"), &catalog, "HMG", Some(200.0), Some("default")),
            Some("pinned")
        );
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let catalog = HashMap::new();
        assert_eq!(
            resolve_broker_id(None, &catalog, "HMG", Some(200.0), Some("default")),
            Some("default")
        );
    }
}

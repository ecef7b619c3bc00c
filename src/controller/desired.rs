//! Desired labels and taints derived from a node's trigger annotations

use std::collections::BTreeMap;

use super::cache::NodeSnapshot;
use super::config::ControllerConfig;
use super::taint::{parse_taints, Taint, TaintParseError};

/// Labels the node should carry: the baseline labels, plus every zone label
/// set to the zone annotation's value when that annotation is present.
pub fn desired_labels(node: &NodeSnapshot, config: &ControllerConfig) -> BTreeMap<String, String> {
    let mut labels = config.baseline_labels.clone();
    if let Some(zone) = node.annotation(&config.zone_annotation) {
        for label in &config.zone_labels {
            labels.insert(label.clone(), zone.to_string());
        }
    }
    labels
}

/// Taints the node should carry according to its taint annotation.
///
/// A bare word with no `:`, `=` or `,` (for example `clickhouse`) is read as
/// `<default key>=<word>:<default effect>`. Anything else must follow the
/// full taint grammar.
pub fn desired_taints(
    node: &NodeSnapshot,
    config: &ControllerConfig,
) -> Result<Vec<Taint>, TaintParseError> {
    let Some(value) = node.annotation(&config.taint_annotation) else {
        return Ok(Vec::new());
    };

    let value = value.trim();
    if !value.is_empty() && !value.contains([':', '=', ',']) {
        return Ok(vec![Taint::new(
            config.default_taint_key.clone(),
            value,
            config.default_taint_effect,
        )]);
    }

    parse_taints(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::config::{LEGACY_ZONE_LABEL, TAINT_ANNOTATION, ZONE_ANNOTATION, ZONE_LABEL};
    use crate::controller::taint::TaintEffect;

    fn snapshot(annotations: &[(&str, &str)]) -> NodeSnapshot {
        NodeSnapshot {
            name: "worker-1".to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_zone_annotation_sets_both_zone_labels() {
        let config = ControllerConfig {
            baseline_labels: BTreeMap::new(),
            ..Default::default()
        };
        let labels = desired_labels(&snapshot(&[(ZONE_ANNOTATION, "us-east-1")]), &config);

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[ZONE_LABEL], "us-east-1");
        assert_eq!(labels[LEGACY_ZONE_LABEL], "us-east-1");
    }

    #[test]
    fn test_baseline_labels_always_present() {
        let config = ControllerConfig::default();
        let labels = desired_labels(&snapshot(&[]), &config);
        assert_eq!(labels, config.baseline_labels);
    }

    #[test]
    fn test_empty_zone_annotation_is_ignored() {
        let config = ControllerConfig::default();
        let labels = desired_labels(&snapshot(&[(ZONE_ANNOTATION, "")]), &config);
        assert!(!labels.contains_key(ZONE_LABEL));
    }

    #[test]
    fn test_no_taint_annotation_means_no_taints() {
        let config = ControllerConfig::default();
        assert!(desired_taints(&snapshot(&[]), &config).unwrap().is_empty());
        assert!(desired_taints(&snapshot(&[(TAINT_ANNOTATION, "")]), &config)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bare_taint_value_uses_default_key() {
        let config = ControllerConfig::default();
        let taints = desired_taints(&snapshot(&[(TAINT_ANNOTATION, "clickhouse")]), &config).unwrap();
        assert_eq!(
            taints,
            vec![Taint::new("dedicated", "clickhouse", TaintEffect::NoSchedule)]
        );
    }

    #[test]
    fn test_full_taint_grammar() {
        let config = ControllerConfig::default();
        let taints = desired_taints(
            &snapshot(&[(TAINT_ANNOTATION, "key1=value1:NoSchedule,key2:PreferNoSchedule")]),
            &config,
        )
        .unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[0].key, "key1");
        assert_eq!(taints[1].effect, TaintEffect::PreferNoSchedule);
    }

    #[test]
    fn test_malformed_taint_annotation_errors() {
        let config = ControllerConfig::default();
        assert!(desired_taints(&snapshot(&[(TAINT_ANNOTATION, "key1:BadEffect")]), &config).is_err());
        assert!(desired_taints(&snapshot(&[(TAINT_ANNOTATION, "key1=value1")]), &config).is_err());
    }
}

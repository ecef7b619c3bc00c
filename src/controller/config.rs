//! Controller configuration

use std::collections::BTreeMap;

use crate::error::{Error, Result};

use super::taint::TaintEffect;

/// Annotation holding the zone to apply to a node
pub const ZONE_ANNOTATION: &str = "altinity.cloud/auto-zone";
/// Annotation holding the taints to apply to a node
pub const TAINT_ANNOTATION: &str = "altinity.cloud/auto-taint";
/// Well-known zone label
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
/// Deprecated zone label, still read by older schedulers and storage drivers
pub const LEGACY_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";
/// Label applied to every node the controller has seen
pub const BASELINE_LABEL: (&str, &str) = ("altinity.cloud/node-label-controller", "managed");

/// Field manager recorded on every patch
pub const FIELD_MANAGER: &str = "node-label-controller";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub zone_annotation: String,
    pub taint_annotation: String,
    /// Labels that all receive the zone annotation's value
    pub zone_labels: Vec<String>,
    /// Labels applied to every node regardless of annotations
    pub baseline_labels: BTreeMap<String, String>,
    /// Key used when the taint annotation is a bare value such as `clickhouse`
    pub default_taint_key: String,
    pub default_taint_effect: TaintEffect,
    pub workers: usize,
    /// Send patches as server-side dry runs
    pub dry_run: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            zone_annotation: ZONE_ANNOTATION.to_string(),
            taint_annotation: TAINT_ANNOTATION.to_string(),
            zone_labels: vec![ZONE_LABEL.to_string(), LEGACY_ZONE_LABEL.to_string()],
            baseline_labels: BTreeMap::from([(
                BASELINE_LABEL.0.to_string(),
                BASELINE_LABEL.1.to_string(),
            )]),
            default_taint_key: "dedicated".to_string(),
            default_taint_effect: TaintEffect::NoSchedule,
            workers: 2,
            dry_run: false,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.zone_annotation.trim().is_empty() || self.taint_annotation.trim().is_empty() {
            return Err(Error::ConfigError(
                "trigger annotation keys must not be empty".to_string(),
            ));
        }
        if self.zone_labels.iter().all(|label| label.trim().is_empty()) {
            return Err(Error::ConfigError(
                "at least one zone label key is required".to_string(),
            ));
        }
        if self.default_taint_key.trim().is_empty() {
            return Err(Error::ConfigError(
                "default taint key must not be empty".to_string(),
            ));
        }
        if let Some(key) = self.baseline_labels.keys().find(|key| key.trim().is_empty()) {
            return Err(Error::ConfigError(format!(
                "baseline label key must not be empty (got {key:?})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.zone_labels, vec![ZONE_LABEL, LEGACY_ZONE_LABEL]);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_missing_zone_labels_rejected() {
        let config = ControllerConfig {
            zone_labels: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_annotation_rejected() {
        let config = ControllerConfig {
            taint_annotation: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_baseline_is_allowed() {
        let config = ControllerConfig {
            baseline_labels: BTreeMap::new(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}

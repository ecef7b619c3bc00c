//! Minimal-diff patch builders for node labels and taints
//!
//! Both builders are additive only: they never remove or rewrite a label or
//! taint that is absent from the desired state, so state owned by other
//! actors on the node is left alone. An empty patch means the node has
//! already converged and no API call should be made.

use std::collections::{BTreeMap, HashSet};

use super::taint::{Taint, TaintEffect};

/// Labels to set through a merge patch on `metadata.labels`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelMergePatch {
    pub labels: BTreeMap<String, String>,
}

impl LabelMergePatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Structural operations against the `spec.taints` array
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TaintPatchOps {
    /// Node already carries every desired taint
    #[default]
    None,
    /// Node has no taints; create the whole array in one operation
    Replace(Vec<Taint>),
    /// Append each taint to the existing array
    Append(Vec<Taint>),
}

impl TaintPatchOps {
    pub fn is_empty(&self) -> bool {
        self.taints().is_empty()
    }

    /// Taints this patch adds to the node
    pub fn taints(&self) -> &[Taint] {
        match self {
            TaintPatchOps::None => &[],
            TaintPatchOps::Replace(taints) | TaintPatchOps::Append(taints) => taints,
        }
    }

    /// Force per-taint append operations, never a whole-array write
    pub fn into_append(self) -> Self {
        match self {
            TaintPatchOps::Replace(taints) => TaintPatchOps::Append(taints),
            other => other,
        }
    }
}

/// Desired labels whose key is missing from `current` or whose value differs.
pub fn diff_labels(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> LabelMergePatch {
    let labels = desired
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    LabelMergePatch { labels }
}

/// Desired taints whose `(key, effect)` is not already on the node.
///
/// Existing taints are matched on key and effect only, so a taint with a
/// different value is left untouched. Duplicates within `desired` collapse
/// to a single addition at the first position, carrying the last value.
pub fn diff_taints(current: &[Taint], desired: &[Taint]) -> TaintPatchOps {
    let existing: HashSet<(&str, TaintEffect)> = current.iter().map(Taint::identity).collect();

    let mut additions: Vec<Taint> = Vec::new();
    for taint in desired {
        if existing.contains(&taint.identity()) {
            continue;
        }
        match additions
            .iter_mut()
            .find(|added| added.identity() == taint.identity())
        {
            Some(added) => added.value = taint.value.clone(),
            None => additions.push(taint.clone()),
        }
    }

    if additions.is_empty() {
        TaintPatchOps::None
    } else if current.is_empty() {
        TaintPatchOps::Replace(additions)
    } else {
        TaintPatchOps::Append(additions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_labels_adds_missing() {
        let current = labels(&[("kubernetes.io/os", "linux")]);
        let desired = labels(&[("topology.kubernetes.io/zone", "us-east-1")]);

        let patch = diff_labels(&current, &desired);
        assert_eq!(patch.labels, desired);
    }

    #[test]
    fn test_diff_labels_updates_divergent_values() {
        let current = labels(&[("zone", "us-west-2"), ("legacy-zone", "us-east-1")]);
        let desired = labels(&[("zone", "us-east-1"), ("legacy-zone", "us-east-1")]);

        let patch = diff_labels(&current, &desired);
        assert_eq!(patch.labels, labels(&[("zone", "us-east-1")]));
    }

    #[test]
    fn test_diff_labels_converged_is_empty() {
        let current = labels(&[("zone", "us-east-1"), ("other", "x")]);
        let desired = labels(&[("zone", "us-east-1")]);

        assert!(diff_labels(&current, &desired).is_empty());
    }

    #[test]
    fn test_diff_labels_never_removes() {
        let current = labels(&[("owned-by-someone-else", "yes")]);
        let patch = diff_labels(&current, &BTreeMap::new());
        assert!(patch.is_empty());
    }

    #[test]
    fn test_diff_taints_replaces_when_node_has_none() {
        let desired = vec![Taint::new("dedicated", "clickhouse", TaintEffect::NoSchedule)];

        assert_eq!(
            diff_taints(&[], &desired),
            TaintPatchOps::Replace(desired.clone())
        );
    }

    #[test]
    fn test_diff_taints_appends_when_node_has_taints() {
        let current = vec![Taint::new(
            "node.kubernetes.io/unreachable",
            "",
            TaintEffect::NoExecute,
        )];
        let desired = vec![Taint::new("dedicated", "clickhouse", TaintEffect::NoSchedule)];

        assert_eq!(
            diff_taints(&current, &desired),
            TaintPatchOps::Append(desired.clone())
        );
    }

    #[test]
    fn test_diff_taints_matches_on_key_and_effect_only() {
        let current = vec![Taint::new("dedicated", "kafka", TaintEffect::NoSchedule)];
        let desired = vec![
            Taint::new("dedicated", "clickhouse", TaintEffect::NoSchedule),
            Taint::new("dedicated", "clickhouse", TaintEffect::NoExecute),
        ];

        assert_eq!(
            diff_taints(&current, &desired),
            TaintPatchOps::Append(vec![Taint::new(
                "dedicated",
                "clickhouse",
                TaintEffect::NoExecute
            )])
        );
    }

    #[test]
    fn test_diff_taints_converged_is_empty() {
        let current = vec![Taint::new("dedicated", "clickhouse", TaintEffect::NoSchedule)];
        let patch = diff_taints(&current, &current.clone());
        assert!(patch.is_empty());
        assert_eq!(patch, TaintPatchOps::None);
    }

    #[test]
    fn test_diff_taints_collapses_duplicate_desired() {
        let desired = vec![
            Taint::new("a", "1", TaintEffect::NoSchedule),
            Taint::new("b", "", TaintEffect::NoSchedule),
            Taint::new("a", "2", TaintEffect::NoSchedule),
        ];

        assert_eq!(
            diff_taints(&[], &desired).taints(),
            &[
                Taint::new("a", "2", TaintEffect::NoSchedule),
                Taint::new("b", "", TaintEffect::NoSchedule),
            ]
        );
    }

    #[test]
    fn test_into_append() {
        let taints = vec![Taint::new("a", "", TaintEffect::NoSchedule)];
        assert_eq!(
            TaintPatchOps::Replace(taints.clone()).into_append(),
            TaintPatchOps::Append(taints)
        );
        assert_eq!(TaintPatchOps::None.into_append(), TaintPatchOps::None);
    }
}

//! Taint model and the taint annotation parser
//!
//! The taint annotation holds a comma separated list of entries in the form
//! `KEY[=VALUE]:EFFECT`, for example:
//!
//! ```text
//! dedicated=clickhouse:NoSchedule, spot:PreferNoSchedule
//! ```
//!
//! Whitespace around every token is ignored and blank entries are skipped.
//! A single malformed entry fails the whole annotation.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Taint as KubeTaint;
use thiserror::Error;

/// Scheduling effect of a taint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaintEffect {
    type Err = ();

    /// Case-sensitive match against the three Kubernetes effects
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            _ => Err(()),
        }
    }
}

/// A node taint as the controller sees it
///
/// Two taints with the same key and effect are the same taint for diffing,
/// whatever their values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    /// Empty when the taint carries no value
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }

    /// Diff identity of the taint
    pub fn identity(&self) -> (&str, TaintEffect) {
        (self.key.as_str(), self.effect)
    }

    /// Convert a taint read from the API server.
    ///
    /// Returns `None` for effects this controller does not model.
    pub fn from_kube(taint: &KubeTaint) -> Option<Self> {
        let effect = taint.effect.parse().ok()?;
        Some(Self {
            key: taint.key.clone(),
            value: taint.value.clone().unwrap_or_default(),
            effect,
        })
    }

    /// Convert into the API representation; an empty value is omitted.
    pub fn to_kube(&self) -> KubeTaint {
        KubeTaint {
            key: self.key.clone(),
            value: if self.value.is_empty() {
                None
            } else {
                Some(self.value.clone())
            },
            effect: self.effect.as_str().to_string(),
            time_added: None,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.key, self.effect)
        } else {
            write!(f, "{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaintParseError {
    /// Entry has no `:` separating the effect
    #[error("invalid taint format: {entry} (expected key=value:effect or key:effect)")]
    MissingEffect { entry: String },

    /// Effect is not one of NoSchedule, PreferNoSchedule, NoExecute
    #[error(
        "invalid taint effect: {effect} in {entry} (must be NoSchedule, PreferNoSchedule, or NoExecute)"
    )]
    InvalidEffect { entry: String, effect: String },

    /// Key is blank after trimming
    #[error("empty key in taint: {entry}")]
    EmptyKey { entry: String },
}

/// Parse a taint annotation value into taints, preserving input order.
///
/// An empty string yields no taints. Any malformed entry fails the whole
/// parse and no taints are returned.
pub fn parse_taints(spec: &str) -> Result<Vec<Taint>, TaintParseError> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Result<Taint, TaintParseError> {
    let (key_value, effect) =
        entry
            .split_once(':')
            .ok_or_else(|| TaintParseError::MissingEffect {
                entry: entry.to_string(),
            })?;

    let effect = effect.trim();
    let effect = effect
        .parse::<TaintEffect>()
        .map_err(|_| TaintParseError::InvalidEffect {
            entry: entry.to_string(),
            effect: effect.to_string(),
        })?;

    // Everything after the first '=' is the value, so values may contain '='
    let (key, value) = match key_value.split_once('=') {
        Some((key, value)) => (key.trim(), value.trim()),
        None => (key_value.trim(), ""),
    };

    if key.is_empty() {
        return Err(TaintParseError::EmptyKey {
            entry: entry.to_string(),
        });
    }

    Ok(Taint::new(key, value, effect))
}

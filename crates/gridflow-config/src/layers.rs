//! Layered configuration documents
//!
//! A configuration file is a YAML sequence of per-cloud documents. A default
//! and an enforced document may be layered around every one of them:
//!
//! ```text
//! default  <  user document  <  enforced
//! ```
//!
//! Mappings merge key by key at every depth; any other value, sequences
//! included, is replaced by the later layer.

use crate::error::{ConfigError, Result};
use serde_yaml::Value;
use std::path::Path;

/// Deep-merges `overlay` into `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, Value::Null) if !base.is_null() => {}
        (base, overlay) => *base = overlay,
    }
}

/// Reads a YAML file.
pub fn read_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// The per-cloud documents of a user configuration. A single mapping is
/// accepted as a one-cloud configuration.
pub fn documents(user: Value) -> Result<Vec<Value>> {
    match user {
        Value::Sequence(documents) if !documents.is_empty() => Ok(documents),
        Value::Sequence(_) | Value::Null => Err(ConfigError::Invalid(
            "the configuration contains no cloud".to_string(),
        )),
        mapping @ Value::Mapping(_) => Ok(vec![mapping]),
        _ => Err(ConfigError::Invalid(
            "the configuration must be a list of cloud configurations".to_string(),
        )),
    }
}

/// Applies the default and enforced layers to every document.
pub fn layer(documents: Vec<Value>, default: Option<&Value>, enforced: Option<&Value>) -> Vec<Value> {
    documents
        .into_iter()
        .map(|document| {
            let mut merged = default.cloned().unwrap_or(Value::Mapping(Default::default()));
            deep_merge(&mut merged, document);
            if let Some(enforced) = enforced {
                deep_merge(&mut merged, enforced.clone());
            }
            merged
        })
        .collect()
}

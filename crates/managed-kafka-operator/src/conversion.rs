//! Merge functions for topic config keys
//!
//! Several applications may set the same config key on a shared topic. Each
//! supported key maps to a converter that folds every supplied value into
//! one. Converters must not depend on the order of their input, since the
//! order applications are listed in is not stable.

use crate::error::{OperatorError, Result};
use std::collections::{BTreeSet, HashMap};

/// Folds every application's value for one key into a single value
pub type Converter = fn(&[String]) -> std::result::Result<String, String>;

/// Table of config key to converter
#[derive(Clone)]
pub struct ConversionRegistry {
    converters: HashMap<String, Converter>,
}

impl ConversionRegistry {
    /// Registry with no converters
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Add or replace the converter for `key`
    pub fn register(&mut self, key: impl Into<String>, converter: Converter) -> &mut Self {
        self.converters.insert(key.into(), converter);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.converters.contains_key(key)
    }

    /// Merge `values` for `key`.
    ///
    /// Fails when the key has no converter or the converter rejects a value.
    pub fn convert(&self, key: &str, values: &[String]) -> Result<String> {
        let converter = self
            .converters
            .get(key)
            .ok_or_else(|| OperatorError::MissingConverter {
                key: key.to_string(),
            })?;

        converter(values).map_err(|message| OperatorError::InvalidTopicValue {
            key: key.to_string(),
            message,
        })
    }
}

impl Default for ConversionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register("retention.ms", int_max)
            .register("retention.bytes", int_max)
            .register("min.compaction.lag.ms", int_max)
            .register("delete.retention.ms", int_max)
            .register("max.message.bytes", int_max)
            .register("max.compaction.lag.ms", int_min)
            .register("segment.ms", int_min)
            .register("min.cleanable.dirty.ratio", float_min)
            .register("cleanup.policy", list_merge);
        registry
    }
}

impl std::fmt::Debug for ConversionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.converters.keys().collect();
        keys.sort();
        f.debug_struct("ConversionRegistry")
            .field("keys", &keys)
            .finish()
    }
}

fn parse_ints(values: &[String]) -> std::result::Result<Vec<i64>, String> {
    values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| format!("'{}' is not an integer", v))
        })
        .collect()
}

fn parse_floats(values: &[String]) -> std::result::Result<Vec<f64>, String> {
    values
        .iter()
        .map(|v| match v.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(f),
            _ => Err(format!("'{}' is not a number", v)),
        })
        .collect()
}

/// Largest integer
pub fn int_max(values: &[String]) -> std::result::Result<String, String> {
    parse_ints(values)?
        .into_iter()
        .max()
        .map(|v| v.to_string())
        .ok_or_else(|| "no values to merge".to_string())
}

/// Smallest integer
pub fn int_min(values: &[String]) -> std::result::Result<String, String> {
    parse_ints(values)?
        .into_iter()
        .min()
        .map(|v| v.to_string())
        .ok_or_else(|| "no values to merge".to_string())
}

/// Smallest float, printed back in its shortest form
pub fn float_min(values: &[String]) -> std::result::Result<String, String> {
    parse_floats(values)?
        .into_iter()
        .reduce(f64::min)
        .map(|v| v.to_string())
        .ok_or_else(|| "no values to merge".to_string())
}

/// Union of comma separated lists, sorted
pub fn list_merge(values: &[String]) -> std::result::Result<String, String> {
    let merged: BTreeSet<&str> = values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect();

    if merged.is_empty() {
        return Err("no values to merge".to_string());
    }

    Ok(merged.into_iter().collect::<Vec<_>>().join(","))
}

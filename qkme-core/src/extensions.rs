//! Extension parameter processing
//!
//! ETSI GS QKD 014 lets a master attach `extension_mandatory` and
//! `extension_optional` objects to a key request. Each supported extension is
//! a variant of [`ExtensionKind`]; the registry maps wire names to variants.

use crate::{ExtensionParameter, KmeError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound accepted for `max_age`
pub const MAX_AGE_LIMIT_SECS: u64 = 7 * 24 * 3600;

/// Extensions this KME knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    /// Caps the lifetime of delivered keys, in seconds
    MaxAge,
    /// Key relay route; only direct point-to-point links are served
    RouteType,
    /// Key transport; only QKD-derived material is served
    TransferMethod,
}

impl ExtensionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExtensionKind::MaxAge => "max_age",
            ExtensionKind::RouteType => "route_type",
            ExtensionKind::TransferMethod => "transfer_method",
        }
    }

    fn apply(&self, value: &Value, applied: &mut AppliedExtensions) -> Result<()> {
        match self {
            ExtensionKind::MaxAge => {
                let secs = value
                    .as_u64()
                    .filter(|secs| (1..=MAX_AGE_LIMIT_SECS).contains(secs))
                    .ok_or_else(|| {
                        KmeError::invalid(
                            self.name(),
                            format!("must be an integer between 1 and {}", MAX_AGE_LIMIT_SECS),
                        )
                    })?;
                applied.max_age = Some(Duration::from_secs(secs));
            }
            ExtensionKind::RouteType => expect_str(self.name(), value, "direct")?,
            ExtensionKind::TransferMethod => expect_str(self.name(), value, "qkd")?,
        }
        Ok(())
    }
}

fn expect_str(name: &str, value: &Value, supported: &str) -> Result<()> {
    match value.as_str() {
        Some(v) if v.eq_ignore_ascii_case(supported) => Ok(()),
        _ => Err(KmeError::invalid(name, format!("only '{}' is supported", supported))),
    }
}

/// Name to handler mapping
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    kinds: HashMap<String, ExtensionKind>,
}

impl ExtensionRegistry {
    /// Registry with no supported extensions
    pub fn empty() -> Self {
        ExtensionRegistry {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ExtensionKind) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    pub fn get(&self, name: &str) -> Option<ExtensionKind> {
        self.kinds.get(name).copied()
    }

    /// Names of supported extensions, sorted
    pub fn supported(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(ExtensionKind::MaxAge);
        registry.register(ExtensionKind::RouteType);
        registry.register(ExtensionKind::TransferMethod);
        registry
    }
}

/// Outcome of extension processing for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedExtensions {
    pub parameters: Vec<ExtensionParameter>,
    pub max_age: Option<Duration>,
}

impl AppliedExtensions {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Echo of the applied extensions for `key_container_extension`
    pub fn to_container_extension(&self) -> Option<Value> {
        if self.parameters.is_empty() {
            return None;
        }

        let map: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        Some(Value::Object(map))
    }
}

/// Flatten the wire form `[{"name": value}, ...]` into parameters
pub fn collect_parameters(objects: &[Map<String, Value>], mandatory: bool) -> Vec<ExtensionParameter> {
    objects
        .iter()
        .flat_map(|object| object.iter())
        .map(|(name, value)| ExtensionParameter {
            name: name.clone(),
            value: value.clone(),
            mandatory,
        })
        .collect()
}

/// Validate and apply request extensions.
///
/// An unknown or malformed mandatory extension fails the whole request.
/// Unknown or malformed optional extensions are dropped.
pub fn process(
    mandatory: &[ExtensionParameter],
    optional: &[ExtensionParameter],
    registry: &ExtensionRegistry,
) -> Result<AppliedExtensions> {
    let mut applied = AppliedExtensions::default();

    for parameter in mandatory {
        let kind = registry.get(&parameter.name).ok_or_else(|| KmeError::Validation {
            message: "not all mandatory extensions are supported".to_string(),
            details: vec![crate::ErrorDetail::new(
                "extension_mandatory",
                format!("'{}' is not supported", parameter.name),
            )],
        })?;
        kind.apply(&parameter.value, &mut applied)?;
        applied.parameters.push(parameter.clone());
    }

    for parameter in optional {
        if applied.parameters.iter().any(|p| p.name == parameter.name) {
            continue;
        }

        match registry.get(&parameter.name) {
            Some(kind) => match kind.apply(&parameter.value, &mut applied) {
                Ok(()) => applied.parameters.push(parameter.clone()),
                Err(e) => tracing::debug!("Dropping optional extension {}: {}", parameter.name, e),
            },
            None => tracing::debug!("Dropping unsupported optional extension {}", parameter.name),
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value, mandatory: bool) -> Vec<ExtensionParameter> {
        let objects: Vec<Map<String, Value>> = serde_json::from_value(value).unwrap();
        collect_parameters(&objects, mandatory)
    }

    #[test]
    fn test_unknown_mandatory_extension_is_rejected() {
        let registry = ExtensionRegistry::default();
        let mandatory = params(json!([{"abc_route_type": "direct"}]), true);

        let err = process(&mandatory, &[], &registry).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.details()[0].parameter, "extension_mandatory");
    }

    #[test]
    fn test_optional_extensions_are_filtered() {
        let registry = ExtensionRegistry::default();
        let optional = params(
            json!([{"route_type": "direct"}, {"abc_qos": "gold"}, {"max_age": "soon"}]),
            false,
        );

        let applied = process(&[], &optional, &registry).unwrap();
        assert_eq!(applied.parameters.len(), 1);
        assert_eq!(applied.parameters[0].name, "route_type");
        assert_eq!(applied.max_age, None);
        assert_eq!(
            applied.to_container_extension(),
            Some(json!({"route_type": "direct"}))
        );
    }

    #[test]
    fn test_mandatory_max_age_is_applied() {
        let registry = ExtensionRegistry::default();
        let mandatory = params(json!([{"max_age": 30, "transfer_method": "qkd"}]), true);

        let applied = process(&mandatory, &[], &registry).unwrap();
        assert_eq!(applied.max_age, Some(Duration::from_secs(30)));
        assert_eq!(applied.parameters.len(), 2);
    }

    #[test]
    fn test_malformed_mandatory_value_is_rejected() {
        let registry = ExtensionRegistry::default();
        let mandatory = params(json!([{"route_type": "indirect"}]), true);
        assert!(process(&mandatory, &[], &registry).is_err());

        let mandatory = params(json!([{"max_age": 0}]), true);
        assert!(process(&mandatory, &[], &registry).is_err());
    }

    #[test]
    fn test_empty_registry_drops_everything_optional() {
        let registry = ExtensionRegistry::empty();
        let optional = params(json!([{"max_age": 10}]), false);
        let applied = process(&[], &optional, &registry).unwrap();
        assert!(applied.is_empty());
        assert!(registry.supported().is_empty());
    }
}

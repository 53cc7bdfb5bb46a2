//! Run configuration and the field-resolution seam
//!
//! Raw config values are turned into typed values by an external resolution
//! engine, reached through [`FieldResolver`]. The resolved config is then
//! checked structurally against the schema carried in the job snapshot.

use crate::error::{ConfigViolation, Error, Result};
use crate::snapshot::{ConfigFieldSnap, ConfigTypeSnap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Run config for a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig(Value);

impl Default for RunConfig {
    fn default() -> Self {
        Self::empty()
    }
}

impl RunConfig {
    pub fn empty() -> Self {
        RunConfig(Value::Object(Map::new()))
    }

    pub fn from_value(value: Value) -> Self {
        RunConfig(value)
    }

    /// Resolve every top-level section of `raw` through `resolver`
    pub fn resolve(job_name: &str, raw: &Value, resolver: &dyn FieldResolver) -> Result<Self> {
        let sections = match raw {
            Value::Null => return Ok(Self::empty()),
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidConfig {
                    job_name: job_name.to_string(),
                    violations: vec![ConfigViolation::new(
                        "",
                        format!("expected an object, got {}", type_name(other)),
                    )],
                })
            }
        };

        let root = ResolutionContext::root();
        let mut resolved = Map::new();
        let mut violations = Vec::new();
        for (key, value) in sections {
            let ctx = root.at_path(key);
            match resolver.resolve(&ctx, value) {
                Ok(v) => {
                    resolved.insert(key.clone(), v);
                }
                Err(e) => violations.push(ConfigViolation::new(e.path.clone(), e.message)),
            }
        }

        if !violations.is_empty() {
            return Err(Error::InvalidConfig {
                job_name: job_name.to_string(),
                violations,
            });
        }
        Ok(RunConfig(Value::Object(resolved)))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

/// Where in the config tree a value is being resolved
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolutionContext {
    path: Vec<String>,
}

impl ResolutionContext {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn at_path<S: Into<String>>(&self, segment: S) -> Self {
        let mut path = self.path.clone();
        path.push(segment.into());
        Self { path }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    pub fn error<M: Into<String>>(&self, message: M) -> ResolutionError {
        ResolutionError {
            path: self.dotted_path(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to resolve {path}: {message}")]
pub struct ResolutionError {
    pub path: String,
    pub message: String,
}

/// Turns a raw config value into a typed one
pub trait FieldResolver: Send + Sync {
    fn resolve(
        &self,
        ctx: &ResolutionContext,
        raw: &Value,
    ) -> std::result::Result<Value, ResolutionError>;
}

/// Returns raw values unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

impl FieldResolver for PassthroughResolver {
    fn resolve(
        &self,
        _ctx: &ResolutionContext,
        raw: &Value,
    ) -> std::result::Result<Value, ResolutionError> {
        Ok(raw.clone())
    }
}

/// Check `config` against `schema`, collecting every violation
pub fn validate_run_config(schema: &ConfigFieldSnap, config: &Value) -> Vec<ConfigViolation> {
    let mut violations = Vec::new();
    validate_type(&schema.config_type, config, "", &mut violations);
    violations
}

fn validate_type(ty: &ConfigTypeSnap, value: &Value, path: &str, out: &mut Vec<ConfigViolation>) {
    match ty {
        ConfigTypeSnap::Any => {}
        ConfigTypeSnap::Bool => expect(value.is_boolean(), "a bool", value, path, out),
        ConfigTypeSnap::Int => expect(value.is_i64() || value.is_u64(), "an int", value, path, out),
        ConfigTypeSnap::Float => expect(value.is_number(), "a float", value, path, out),
        ConfigTypeSnap::String => expect(value.is_string(), "a string", value, path, out),
        ConfigTypeSnap::Noneable { of } => {
            if !value.is_null() {
                validate_type(of, value, path, out);
            }
        }
        ConfigTypeSnap::Array { of } => match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_type(of, item, &join(path, &format!("[{}]", i)), out);
                }
            }
            other => out.push(mismatch("an array", other, path)),
        },
        ConfigTypeSnap::Enum { values } => match value.as_str() {
            Some(s) if values.iter().any(|v| v == s) => {}
            _ => out.push(ConfigViolation::new(
                path,
                format!("expected one of [{}], got {}", values.join(", "), value),
            )),
        },
        ConfigTypeSnap::Shape { fields, permissive } => {
            let empty = Map::new();
            let map = match value {
                Value::Object(map) => map,
                // An absent shape is fine as long as nothing inside is required.
                Value::Null => &empty,
                other => {
                    out.push(mismatch("an object", other, path));
                    return;
                }
            };
            for (name, field) in fields {
                let child_path = join(path, name);
                match map.get(name) {
                    Some(child) => validate_type(&field.config_type, child, &child_path, out),
                    None if field.is_required && field.default_value.is_none() => {
                        out.push(ConfigViolation::new(child_path, "missing required field"))
                    }
                    None => {}
                }
            }
            if !permissive {
                for key in map.keys() {
                    if !fields.contains_key(key) {
                        out.push(ConfigViolation::new(join(path, key), "unexpected field"));
                    }
                }
            }
        }
        ConfigTypeSnap::Selector { fields } => match value {
            Value::Object(map) if map.len() == 1 => {
                for (key, child) in map {
                    match fields.get(key) {
                        Some(field) => validate_type(&field.config_type, child, &join(path, key), out),
                        None => out.push(ConfigViolation::new(join(path, key), "unexpected field")),
                    }
                }
            }
            Value::Object(map) => out.push(ConfigViolation::new(
                path,
                format!("selector expects exactly one field, got {}", map.len()),
            )),
            other => out.push(mismatch("an object", other, path)),
        },
    }
}

fn expect(ok: bool, expected: &str, value: &Value, path: &str, out: &mut Vec<ConfigViolation>) {
    if !ok {
        out.push(mismatch(expected, value, path));
    }
}

fn mismatch(expected: &str, value: &Value, path: &str) -> ConfigViolation {
    ConfigViolation::new(path, format!("expected {}, got {}", expected, type_name(value)))
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else if segment.starts_with('[') {
        format!("{}{}", path, segment)
    } else {
        format!("{}.{}", path, segment)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{job_snapshot, OpBuilder};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema_with_required_op_config() -> ConfigFieldSnap {
        let mut fields = BTreeMap::new();
        fields.insert("path".to_string(), ConfigFieldSnap::required(ConfigTypeSnap::String));
        fields.insert(
            "limit".to_string(),
            ConfigFieldSnap::optional(ConfigTypeSnap::Int),
        );
        let op = OpBuilder::new("extract")
            .config(ConfigFieldSnap::required(ConfigTypeSnap::Shape {
                fields,
                permissive: false,
            }))
            .build();
        job_snapshot("etl_job", vec![op]).run_config_schema
    }

    #[test]
    fn test_valid_config() {
        let schema = schema_with_required_op_config();
        let config = json!({"ops": {"extract": {"config": {"path": "/data", "limit": 10}}}});
        assert!(validate_run_config(&schema, &config).is_empty());
    }

    #[test]
    fn test_missing_required() {
        let schema = schema_with_required_op_config();
        let violations = validate_run_config(&schema, &json!({}));
        assert_eq!(violations, vec![ConfigViolation::new("ops", "missing required field")]);

        let violations =
            validate_run_config(&schema, &json!({"ops": {"extract": {"config": {}}}}));
        assert_eq!(
            violations,
            vec![ConfigViolation::new("ops.extract.config.path", "missing required field")]
        );
    }

    #[test]
    fn test_type_mismatch_and_unexpected_field() {
        let schema = schema_with_required_op_config();
        let config = json!({
            "ops": {"extract": {"config": {"path": 3, "limit": "ten"}}},
            "loggers": {}
        });
        let violations = validate_run_config(&schema, &config);
        let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"ops.extract.config.path"));
        assert!(paths.contains(&"ops.extract.config.limit"));
        assert!(paths.contains(&"loggers"));
    }

    #[test]
    fn test_permissive_shape_accepts_extra_keys() {
        let schema = job_snapshot("etl_job", vec![]).run_config_schema;
        let config = json!({"resources": {"warehouse": {"config": {"dsn": "x"}}}});
        assert!(validate_run_config(&schema, &config).is_empty());
    }

    #[test]
    fn test_selector_and_enum() {
        let mut fields = BTreeMap::new();
        fields.insert("in_process".to_string(), ConfigFieldSnap::optional(ConfigTypeSnap::Any));
        fields.insert("multiprocess".to_string(), ConfigFieldSnap::optional(ConfigTypeSnap::Any));
        let selector = ConfigFieldSnap::optional(ConfigTypeSnap::Selector { fields });

        assert!(validate_run_config(&selector, &json!({"in_process": {}})).is_empty());
        assert_eq!(
            validate_run_config(&selector, &json!({"in_process": {}, "multiprocess": {}})).len(),
            1
        );

        let level = ConfigFieldSnap::required(ConfigTypeSnap::Enum {
            values: vec!["DEBUG".to_string(), "INFO".to_string()],
        });
        assert!(validate_run_config(&level, &json!("INFO")).is_empty());
        assert_eq!(validate_run_config(&level, &json!("LOUD")).len(), 1);
    }

    #[test]
    fn test_array_paths() {
        let field = ConfigFieldSnap::required(ConfigTypeSnap::Array {
            of: Box::new(ConfigTypeSnap::Int),
        });
        let violations = validate_run_config(&field, &json!([1, "two", 3]));
        assert_eq!(violations, vec![ConfigViolation::new("[1]", "expected an int, got string")]);
    }

    struct EnvResolver;

    impl FieldResolver for EnvResolver {
        fn resolve(
            &self,
            ctx: &ResolutionContext,
            raw: &Value,
        ) -> std::result::Result<Value, ResolutionError> {
            if raw == &json!("{{ env.MISSING }}") {
                return Err(ctx.error("environment variable MISSING is not set"));
            }
            Ok(raw.clone())
        }
    }

    #[test]
    fn test_resolve_through_collaborator() {
        let raw = json!({"ops": {"extract": {}}});
        let config = RunConfig::resolve("etl_job", &raw, &PassthroughResolver).unwrap();
        assert_eq!(config.as_value(), &raw);

        let raw = json!({"resources": "{{ env.MISSING }}"});
        let err = RunConfig::resolve("etl_job", &raw, &EnvResolver).unwrap_err();
        match err {
            Error::InvalidConfig { violations, .. } => {
                assert_eq!(violations[0].path, "resources");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_rejects_non_object() {
        let err = RunConfig::resolve("etl_job", &json!([1]), &PassthroughResolver).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            RunConfig::resolve("etl_job", &Value::Null, &PassthroughResolver).unwrap(),
            RunConfig::empty()
        );
    }
}

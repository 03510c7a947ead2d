//! Schema-driven validation over a generic record view (name → typed value).

use crate::errors::ValidationError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;

/// One field's typed value in a record under validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    String(String),
    Number(f64),
    Bool(bool),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Null,
}

impl RecordValue {
    fn kind_name(&self) -> &'static str {
        match self {
            RecordValue::String(_) => "string",
            RecordValue::Number(_) => "number",
            RecordValue::Bool(_) => "bool",
            RecordValue::Timestamp(_) => "timestamp",
            RecordValue::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
}

/// Closed set of recognized named formats — not a pluggable registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedFormat {
    Rfc3339,
    Email,
    Uuid,
    /// Uppercase base currency plus an allowed quote suffix, e.g. `BTCUSD`.
    Symbol,
    /// Member of a small venue allow-list.
    Venue,
}

#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    pub kind: Option<FieldKind>,
    pub required: bool,
    pub pattern: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed_values: Option<Vec<String>>,
    pub format: Option<NamedFormat>,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: HashMap<String, FieldSchema>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

const ALLOWED_VENUES: &[&str] = &["binance", "coinbase", "kraken", "okx", "bybit"];
const ALLOWED_QUOTE_SUFFIXES: &[&str] = &["USD", "USDT", "USDC", "BTC", "ETH"];

/// Registry of named schemas plus a compiled-regex cache keyed by pattern
/// source, so repeated `Validate` calls don't recompile identical patterns.
pub struct SchemaValidator {
    schemas: RwLock<HashMap<String, Schema>>,
    regex_cache: RwLock<HashMap<String, Regex>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self { schemas: RwLock::new(HashMap::new()), regex_cache: RwLock::new(HashMap::new()) }
    }

    pub fn register_schema(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.write().unwrap_or_else(|p| p.into_inner()).insert(name.into(), schema);
    }

    pub fn validate(
        &self,
        schema_name: &str,
        record: &HashMap<String, RecordValue>,
    ) -> Result<ValidationResult, ValidationError> {
        let schemas = self.schemas.read().unwrap_or_else(|p| p.into_inner());
        let schema = schemas.get(schema_name).ok_or_else(|| ValidationError {
            field: String::new(),
            rule: "schema".into(),
            message: format!("no schema registered under {schema_name}"),
        })?;

        let mut errors = Vec::new();
        for (field_name, field_schema) in &schema.fields {
            let value = record.get(field_name);
            self.check_field(field_name, field_schema, value, &mut errors);
        }

        Ok(ValidationResult { valid: errors.is_empty(), errors })
    }

    fn check_field(
        &self,
        field_name: &str,
        schema: &FieldSchema,
        value: Option<&RecordValue>,
        errors: &mut Vec<ValidationError>,
    ) {
        let value = match value {
            Some(RecordValue::Null) | None => {
                if schema.required {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "required".into(),
                        message: "field is required".into(),
                    });
                }
                return;
            }
            Some(v) => v,
        };

        if let Some(kind) = schema.kind {
            let matches = matches!(
                (kind, value),
                (FieldKind::String, RecordValue::String(_))
                    | (FieldKind::Number, RecordValue::Number(_))
                    | (FieldKind::Bool, RecordValue::Bool(_))
            );
            if !matches {
                errors.push(ValidationError {
                    field: field_name.into(),
                    rule: "type".into(),
                    message: format!("expected {kind:?}, got {}", value.kind_name()),
                });
                return;
            }
        }

        if let RecordValue::String(s) = value {
            if let Some(min_len) = schema.min_length {
                if s.len() < min_len {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "min_length".into(),
                        message: format!("length {} below minimum {min_len}", s.len()),
                    });
                }
            }
            if let Some(max_len) = schema.max_length {
                if s.len() > max_len {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "max_length".into(),
                        message: format!("length {} above maximum {max_len}", s.len()),
                    });
                }
            }
            if let Some(pattern) = &schema.pattern {
                match self.compiled_pattern(pattern) {
                    Ok(regex) if !regex.is_match(s) => errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "pattern".into(),
                        message: format!("value does not match pattern {pattern}"),
                    }),
                    Ok(_) => {}
                    Err(err) => errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "pattern".into(),
                        message: format!("invalid pattern {pattern}: {err}"),
                    }),
                }
            }
            if let Some(allowed) = &schema.allowed_values {
                if !allowed.iter().any(|a| a == s) {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "enum".into(),
                        message: format!("{s} not in allowed values"),
                    });
                }
            }
            if let Some(format) = schema.format {
                if let Err(message) = validate_named_format(format, s) {
                    errors.push(ValidationError { field: field_name.into(), rule: "format".into(), message });
                }
            }
        }

        if let RecordValue::Number(n) = value {
            if let Some(min) = schema.min {
                if *n < min {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "min".into(),
                        message: format!("{n} below minimum {min}"),
                    });
                }
            }
            if let Some(max) = schema.max {
                if *n > max {
                    errors.push(ValidationError {
                        field: field_name.into(),
                        rule: "max".into(),
                        message: format!("{n} above maximum {max}"),
                    });
                }
            }
        }
    }

    fn compiled_pattern(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(regex) = self.regex_cache.read().unwrap_or_else(|p| p.into_inner()).get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern)?;
        self.regex_cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_named_format(format: NamedFormat, value: &str) -> Result<(), String> {
    match format {
        NamedFormat::Rfc3339 => chrono::DateTime::parse_from_rfc3339(value)
            .map(|_| ())
            .map_err(|_| format!("{value} is not valid RFC3339")),
        NamedFormat::Email => {
            if value.matches('@').count() == 1 && !value.starts_with('@') && !value.ends_with('@') {
                Ok(())
            } else {
                Err(format!("{value} is not a valid email"))
            }
        }
        NamedFormat::Uuid => {
            uuid::Uuid::parse_str(value).map(|_| ()).map_err(|_| format!("{value} is not a valid uuid"))
        }
        NamedFormat::Symbol => {
            if let Some(suffix) = ALLOWED_QUOTE_SUFFIXES.iter().find(|s| value.ends_with(**s)) {
                let base = &value[..value.len() - suffix.len()];
                if !base.is_empty() && base.chars().all(|c| c.is_ascii_uppercase()) {
                    return Ok(());
                }
            }
            Err(format!("{value} is not a recognized symbol"))
        }
        NamedFormat::Venue => {
            if ALLOWED_VENUES.contains(&value) {
                Ok(())
            } else {
                Err(format!("{value} is not an allow-listed venue"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, RecordValue)]) -> HashMap<String, RecordValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn required_field_missing_fails() {
        let validator = SchemaValidator::new();
        let mut schema = Schema::default();
        schema.fields.insert("venue".into(), FieldSchema { required: true, ..Default::default() });
        validator.register_schema("envelope", schema);

        let result = validator.validate("envelope", &record(&[])).unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors[0].rule, "required");
    }

    #[test]
    fn valid_record_revalidates_clean() {
        let validator = SchemaValidator::new();
        let mut schema = Schema::default();
        schema.fields.insert(
            "symbol".into(),
            FieldSchema { kind: Some(FieldKind::String), format: Some(NamedFormat::Symbol), ..Default::default() },
        );
        validator.register_schema("envelope", schema);

        let rec = record(&[("symbol", RecordValue::String("BTCUSD".into()))]);
        let first = validator.validate("envelope", &rec).unwrap();
        let second = validator.validate("envelope", &rec).unwrap();
        assert!(first.valid);
        assert!(second.valid);
        assert!(first.errors.is_empty() && second.errors.is_empty());
    }

    #[test]
    fn venue_format_checks_allow_list() {
        let validator = SchemaValidator::new();
        let mut schema = Schema::default();
        schema.fields.insert(
            "venue".into(),
            FieldSchema { kind: Some(FieldKind::String), format: Some(NamedFormat::Venue), ..Default::default() },
        );
        validator.register_schema("envelope", schema);

        let ok = validator.validate("envelope", &record(&[("venue", RecordValue::String("binance".into()))])).unwrap();
        assert!(ok.valid);

        let bad = validator.validate("envelope", &record(&[("venue", RecordValue::String("nasdaq".into()))])).unwrap();
        assert!(!bad.valid);
    }

    #[test]
    fn pattern_cache_is_reused_across_calls() {
        let validator = SchemaValidator::new();
        let mut schema = Schema::default();
        schema.fields.insert(
            "id".into(),
            FieldSchema { kind: Some(FieldKind::String), pattern: Some("^[a-z]+$".into()), ..Default::default() },
        );
        validator.register_schema("thing", schema);

        for _ in 0..5 {
            let result = validator
                .validate("thing", &record(&[("id", RecordValue::String("abc".into()))]))
                .unwrap();
            assert!(result.valid);
        }
        assert_eq!(validator.regex_cache.read().unwrap().len(), 1);
    }

    #[test]
    fn range_checks_enforce_min_and_max() {
        let validator = SchemaValidator::new();
        let mut schema = Schema::default();
        schema.fields.insert(
            "confidence".into(),
            FieldSchema { kind: Some(FieldKind::Number), min: Some(0.0), max: Some(1.0), ..Default::default() },
        );
        validator.register_schema("envelope", schema);

        let too_high = validator
            .validate("envelope", &record(&[("confidence", RecordValue::Number(1.5))]))
            .unwrap();
        assert!(!too_high.valid);
    }
}

//! Envelope validation: schema conformance and staleness checking, run
//! before a record enters storage or scoring.

pub mod schema;
pub mod staleness;

pub use schema::{FieldKind, FieldSchema, NamedFormat, RecordValue, Schema, SchemaValidator, ValidationResult};
pub use staleness::{StalenessChecker, StalenessConfig, StalenessResult};

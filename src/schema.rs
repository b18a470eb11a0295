//! JSON Schema validation for executor input and output.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{ExecutorError, Result, SchemaSide};

/// A compiled schema together with the document it came from.
struct Compiled {
    document: Value,
    schema: JSONSchema,
}

impl Compiled {
    fn new(side: SchemaSide, raw: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(raw).map_err(|e| ExecutorError::Schema {
            side,
            message: format!("not valid JSON: {e}"),
        })?;

        let schema = JSONSchema::options()
            .compile(&document)
            .map_err(|e| ExecutorError::Schema {
                side,
                message: e.to_string(),
            })?;

        Ok(Self { document, schema })
    }

    fn validate(&self, side: SchemaSide, value: &Value) -> Result<()> {
        let Err(mut errors) = self.schema.validate(value) else {
            return Ok(());
        };

        // Report the first violation with its location; count the rest.
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let path = first.instance_path.to_string();
        let location = if path.is_empty() { "/" } else { path.as_str() };
        let mut message = format!("{first} at {location}");

        let remaining = errors.count();
        if remaining > 0 {
            message.push_str(&format!(" (and {remaining} more)"));
        }

        Err(ExecutorError::Validation { side, message })
    }
}

/// Validates values against an executor's input and output schemas.
///
/// Either side may be absent, in which case that side accepts anything.
/// At least one side must be present; callers skip validation entirely
/// when an executor declares no schemas.
pub struct SchemaValidator {
    input: Option<Compiled>,
    output: Option<Compiled>,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("input", &self.input_schema())
            .field("output", &self.output_schema())
            .finish()
    }
}

impl SchemaValidator {
    pub fn new(schema_in: Option<&str>, schema_out: Option<&str>) -> Result<Self> {
        let schema_in = schema_in.filter(|s| !s.trim().is_empty());
        let schema_out = schema_out.filter(|s| !s.trim().is_empty());

        if schema_in.is_none() && schema_out.is_none() {
            return Err(ExecutorError::Config(
                "schema validator requires at least one schema".to_string(),
            ));
        }

        Ok(Self {
            input: schema_in
                .map(|raw| Compiled::new(SchemaSide::Input, raw))
                .transpose()?,
            output: schema_out
                .map(|raw| Compiled::new(SchemaSide::Output, raw))
                .transpose()?,
        })
    }

    pub fn validate_input(&self, value: &Value) -> Result<()> {
        self.input
            .as_ref()
            .map_or(Ok(()), |c| c.validate(SchemaSide::Input, value))
    }

    pub fn validate_output(&self, value: &Value) -> Result<()> {
        self.output
            .as_ref()
            .map_or(Ok(()), |c| c.validate(SchemaSide::Output, value))
    }

    /// The parsed input schema document, if any.
    pub fn input_schema(&self) -> Option<&Value> {
        self.input.as_ref().map(|c| &c.document)
    }

    /// The parsed output schema document, if any.
    pub fn output_schema(&self) -> Option<&Value> {
        self.output.as_ref().map(|c| &c.document)
    }
}

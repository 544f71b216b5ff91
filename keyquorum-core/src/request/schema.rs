//! Shape checks for untyped request records.
//!
//! Records are checked against a kind's schema before any typed value is
//! built, so a missing or mistyped field is reported by name instead of
//! surfacing as a generic deserialization failure.

use serde_json::Value;

use crate::backend::Fields;

/// Expected JSON shape of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Any string, including empty.
    String,
    /// A string with at least one non-whitespace character.
    NonEmptyString,
    /// A string or `null`.
    OptionalString,
    /// An integer ≥ 1.
    PositiveInteger,
    /// `true` or `false`.
    Bool,
    /// An array of strings.
    StringList,
}

impl FieldType {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::NonEmptyString => "a non-empty string",
            Self::OptionalString => "a string or null",
            Self::PositiveInteger => "a positive integer",
            Self::Bool => "a boolean",
            Self::StringList => "a list of strings",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::NonEmptyString => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            Self::OptionalString => value.is_string() || value.is_null(),
            Self::PositiveInteger => value.as_u64().is_some_and(|n| n >= 1),
            Self::Bool => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }
}

/// One entry of a schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Field name.
    pub name: &'static str,
    /// Expected shape.
    pub ty: FieldType,
    /// Whether the field must be present.
    pub required: bool,
}

impl FieldSpec {
    /// A field that must be present.
    #[must_use]
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    /// A field that may be absent.
    #[must_use]
    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Checks `fields` against `schema`.
///
/// Fields not named in the schema are refused.
///
/// # Errors
///
/// Returns a message naming the first offending field.
pub fn check(fields: &Fields, schema: &[FieldSpec]) -> Result<(), String> {
    for spec in schema {
        match fields.get(spec.name) {
            None if spec.required => return Err(format!("missing field {}", spec.name)),
            None => {}
            Some(value) if !spec.ty.accepts(value) => {
                return Err(format!("field {} must be {}", spec.name, spec.ty.describe()));
            }
            Some(_) => {}
        }
    }
    if let Some(unknown) = fields
        .keys()
        .find(|key| !schema.iter().any(|spec| spec.name == key.as_str()))
    {
        return Err(format!("unexpected field {unknown}"));
    }
    Ok(())
}

//! Tier 1: structural validation. Purely local: parses the raw model
//! output against the profile's declared schema and checks field
//! presence, types, enum membership, length bounds, and regex shape
//! constraints. No model time is spent on output that fails here.

use serde_json::Value;

use crate::models::qa::{FailureCategory, TierVerdict};
use crate::profiles::schema::{FieldKind, FieldSpec, OutputSchema};

/// Pull a JSON document out of raw model text. Models occasionally wrap
/// output in prose or code fences; the outermost object is accepted.
pub fn extract_json(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(value);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

pub fn validate_structure(raw: &str, schema: &OutputSchema) -> TierVerdict {
    let Some(value) = extract_json(raw) else {
        return TierVerdict::fail(
            vec![FailureCategory::MalformedOutput],
            vec!["output is not a JSON document".to_string()],
        );
    };
    let Some(object) = value.as_object() else {
        return TierVerdict::fail(
            vec![FailureCategory::MalformedOutput],
            vec!["output is not a JSON object".to_string()],
        );
    };

    let mut categories = Vec::new();
    let mut notes = Vec::new();
    for spec in &schema.fields {
        match object.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    categories.push(FailureCategory::MissingField);
                    notes.push(format!("missing required field '{}'", spec.name));
                }
            }
            Some(field) => check_field(spec, field, &mut categories, &mut notes),
        }
    }

    if categories.is_empty() {
        TierVerdict::pass(1.0)
    } else {
        categories.dedup();
        TierVerdict::fail(categories, notes)
    }
}

fn check_field(
    spec: &FieldSpec,
    value: &Value,
    categories: &mut Vec<FailureCategory>,
    notes: &mut Vec<String>,
) {
    let type_ok = match spec.kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
    };
    if !type_ok {
        categories.push(FailureCategory::TypeMismatch);
        notes.push(format!("field '{}' is not a {}", spec.name, spec.kind));
        return;
    }

    if let Some(s) = value.as_str() {
        if !spec.enum_values.is_empty() && !spec.enum_values.iter().any(|v| v == s) {
            categories.push(FailureCategory::EnumViolation);
            notes.push(format!("field '{}' value '{s}' not in enum", spec.name));
        }
        let chars = s.chars().count();
        if spec.min_length.is_some_and(|min| chars < min)
            || spec.max_length.is_some_and(|max| chars > max)
        {
            categories.push(FailureCategory::LengthViolation);
            notes.push(format!("field '{}' length {chars} out of bounds", spec.name));
        }
        if let Some(pattern) = &spec.pattern {
            if !pattern.is_match(s) {
                categories.push(FailureCategory::PatternViolation);
                notes.push(format!("field '{}' does not match shape", spec.name));
            }
        }
    }

    if let Some(items) = value.as_array() {
        if spec.min_items.is_some_and(|min| items.len() < min)
            || spec.max_items.is_some_and(|max| items.len() > max)
        {
            categories.push(FailureCategory::LengthViolation);
            notes.push(format!(
                "field '{}' has {} items, out of bounds",
                spec.name,
                items.len()
            ));
        }
    }
}

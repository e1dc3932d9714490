//! Form schema documents.
//!
//! A schema is a JSON document declaring a form's title, its ordered fields and the
//! upload control. Optional structure is defaulted so partial schemas still render;
//! structural invariants (field names present and unique, options for choice
//! fields) are checked with `validator` and reported as `SchemaMalformed`.

pub mod catalog;

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

use crate::core::error::{IntakeError, IntakeResult};

pub use catalog::{
    sanitize_token, schema_id, SchemaCatalog, SchemaEntry, SchemaSource, LOCATOR_PREFIX,
};

/// Closed set of field types a schema may declare.
///
/// Unknown type strings (`email`, `date`, `number`, ...) are kept as
/// [`FieldKind::Other`] and render as a plain single-value input of that type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldKind {
    #[default]
    Text,
    Textarea,
    Select,
    Checkbox,
    Other(String),
}

impl FieldKind {
    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Textarea => "textarea",
            FieldKind::Select => "select",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Other(kind) => kind,
        }
    }

    /// Select and checkbox fields are meaningless without options.
    pub fn requires_options(&self) -> bool {
        matches!(self, FieldKind::Select | FieldKind::Checkbox)
    }
}

impl From<String> for FieldKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "" | "text" => FieldKind::Text,
            "textarea" => FieldKind::Textarea,
            "select" => FieldKind::Select,
            "checkbox" => FieldKind::Checkbox,
            _ => FieldKind::Other(kind),
        }
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "FieldSpec::validate_options"))]
pub struct FieldSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

impl FieldSpec {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    fn validate_options(&self) -> Result<(), ValidationError> {
        if self.kind.requires_options() && self.options.is_empty() {
            let mut err = ValidationError::new("options_required");
            err.add_param("field".into(), &self.name);
            return Err(err);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Controls {
    #[serde(rename = "allowUpload", default)]
    pub allow_upload: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "FormSchema::validate_unique_names"))]
pub struct FormSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[validate(nested)]
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Vec<FieldSpec>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub controls: Controls,
}

impl FormSchema {
    /// Parse and validate a schema document.
    pub fn from_slice(data: &[u8]) -> IntakeResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| IntakeError::SchemaMalformed(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> IntakeResult<Self> {
        if !value.is_object() {
            return Err(IntakeError::SchemaMalformed(
                "schema document must be a JSON object".to_string(),
            ));
        }

        let schema: FormSchema = serde_json::from_value(value)
            .map_err(|e| IntakeError::SchemaMalformed(e.to_string()))?;
        schema
            .validate()
            .map_err(|e| IntakeError::SchemaMalformed(e.to_string()))?;
        Ok(schema)
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Form")
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn validate_unique_names(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                let mut err = ValidationError::new("duplicate_field_name");
                err.add_param("field".into(), &field.name);
                return Err(err);
            }
        }
        Ok(())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_schema() {
        let schema = FormSchema::from_slice(
            br#"{
                "title": "New Request",
                "description": "Tell us what you need",
                "fields": [
                    {"name": "projectName", "type": "text", "label": "Project", "required": true},
                    {"name": "details", "type": "textarea", "placeholder": "More..."},
                    {"name": "requestType", "type": "select", "options": ["Commercial", "Clinical"]},
                    {"name": "markets", "type": "checkbox", "options": ["US", "EU"]},
                    {"name": "deadline", "type": "date"}
                ],
                "controls": {"allowUpload": true}
            }"#,
        )
        .unwrap();

        assert_eq!(schema.display_title(), "New Request");
        assert_eq!(schema.fields.len(), 5);
        assert_eq!(schema.fields[0].kind, FieldKind::Text);
        assert!(schema.fields[0].required);
        assert_eq!(schema.fields[1].kind, FieldKind::Textarea);
        assert_eq!(schema.fields[2].kind, FieldKind::Select);
        assert_eq!(schema.fields[3].kind, FieldKind::Checkbox);
        assert_eq!(schema.fields[4].kind, FieldKind::Other("date".to_string()));
        assert!(schema.controls.allow_upload);
    }

    #[test]
    fn test_missing_structure_is_defaulted() {
        let schema = FormSchema::from_slice(br#"{"fields": null}"#).unwrap();
        assert!(schema.fields.is_empty());
        assert!(!schema.controls.allow_upload);
        assert_eq!(schema.display_title(), "Form");

        let schema = FormSchema::from_slice(br#"{"fields": [{"name": "a"}]}"#).unwrap();
        assert_eq!(schema.fields[0].kind, FieldKind::Text);
        assert_eq!(schema.fields[0].display_label(), "a");
    }

    #[test]
    fn test_malformed_documents() {
        for doc in [
            &br#"[1, 2]"#[..],
            br#"not json"#,
            br#"{"fields": [{"type": "text"}]}"#,
            br#"{"fields": [{"name": ""}]}"#,
            br#"{"fields": [{"name": "a"}, {"name": "a"}]}"#,
            br#"{"fields": [{"name": "a", "type": "checkbox"}]}"#,
            br#"{"fields": [{"name": "a", "type": "select", "options": []}]}"#,
        ] {
            match FormSchema::from_slice(doc) {
                Err(IntakeError::SchemaMalformed(_)) => {}
                other => panic!("expected malformed for {:?}, got {other:?}", String::from_utf8_lossy(doc)),
            }
        }
    }

    #[test]
    fn test_kind_serializes_back_to_type_string() {
        let field = FieldSpec {
            name: "email".to_string(),
            kind: FieldKind::Other("email".to_string()),
            label: None,
            required: false,
            options: vec![],
            placeholder: None,
        };
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "email");
    }
}

//! Form rendering and collection.
//!
//! [`render`] materializes a [`FormSchema`] into a [`FieldSet`] of bound controls,
//! optionally pre-populated from an earlier submission. [`FieldSet::collect`] turns
//! the controls back into a [`SubmissionPayload`].
//!
//! Each [`FieldKind`] maps onto exactly one [`Control`] shape; checkbox fields
//! expand into one control per option, all sharing the field name.

pub mod payload;

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::{
    core::error::{IntakeError, IntakeResult},
    schema::{FieldKind, FieldSpec, FormSchema},
};

pub use payload::{FieldValue, SubmissionPayload};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "control",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Control {
    /// Single-line input; `input_type` is the schema type string (`text`, `email`, ...)
    Input {
        name: String,
        input_type: String,
        value: String,
        placeholder: Option<String>,
        required: bool,
    },
    TextArea {
        name: String,
        value: String,
        placeholder: Option<String>,
        required: bool,
    },
    Select {
        name: String,
        options: Vec<String>,
        selected: Option<String>,
        required: bool,
    },
    Checkbox {
        name: String,
        option: String,
        checked: bool,
    },
}

impl Control {
    pub fn name(&self) -> &str {
        match self {
            Control::Input { name, .. }
            | Control::TextArea { name, .. }
            | Control::Select { name, .. }
            | Control::Checkbox { name, .. } => name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub required: bool,
    pub controls: Vec<Control>,
}

/// Controls bound to one schema.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSet {
    #[serde(skip)]
    schema: Arc<FormSchema>,
    pub title: String,
    pub description: Option<String>,
    pub allow_upload: bool,
    pub fields: Vec<RenderedField>,
}

/// Render a schema into a field set, pre-populating from `prefill` when given.
pub fn render(schema: Arc<FormSchema>, prefill: Option<&SubmissionPayload>) -> FieldSet {
    let fields = schema
        .fields
        .iter()
        .map(|spec| render_field(spec, prefill.and_then(|p| p.get(&spec.name))))
        .collect();

    FieldSet {
        title: schema.display_title().to_string(),
        description: schema.description.clone(),
        allow_upload: schema.controls.allow_upload,
        fields,
        schema,
    }
}

fn render_field(spec: &FieldSpec, prefill: Option<&FieldValue>) -> RenderedField {
    let scalar = || prefill.map(FieldValue::display_text).unwrap_or_default();

    let controls = match &spec.kind {
        FieldKind::Textarea => vec![Control::TextArea {
            name: spec.name.clone(),
            value: scalar(),
            placeholder: spec.placeholder.clone(),
            required: spec.required,
        }],
        FieldKind::Select => {
            let value = scalar();
            let selected = spec.options.iter().find(|o| **o == value).cloned();
            if selected.is_none() && !value.is_empty() {
                debug!(
                    "Prefill value {value:?} is not an option of {}, left unselected",
                    spec.name
                );
            }
            vec![Control::Select {
                name: spec.name.clone(),
                options: spec.options.clone(),
                selected,
                required: spec.required,
            }]
        }
        FieldKind::Checkbox => {
            let chosen = prefill.map(FieldValue::choice_set).unwrap_or_default();
            spec.options
                .iter()
                .map(|option| Control::Checkbox {
                    name: spec.name.clone(),
                    option: option.clone(),
                    checked: chosen.contains(option),
                })
                .collect()
        }
        FieldKind::Text | FieldKind::Other(_) => vec![Control::Input {
            name: spec.name.clone(),
            input_type: spec.kind.as_str().to_string(),
            value: scalar(),
            placeholder: spec.placeholder.clone(),
            required: spec.required,
        }],
    };

    RenderedField {
        name: spec.name.clone(),
        label: spec.display_label().to_string(),
        kind: spec.kind.clone(),
        required: spec.required,
        controls,
    }
}

impl FieldSet {
    pub fn field(&self, name: &str) -> Option<&RenderedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut RenderedField> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Assign the value of a single-value control.
    ///
    /// Select controls only accept one of their options; an empty value clears them.
    pub fn set_value(&mut self, name: &str, new_value: &str) -> IntakeResult<()> {
        let control = self
            .field_mut(name)
            .and_then(|f| f.controls.first_mut())
            .ok_or_else(|| IntakeError::NotFound(format!("control {name}")))?;

        match control {
            Control::Input { value, .. } | Control::TextArea { value, .. } => {
                *value = new_value.to_string();
                Ok(())
            }
            Control::Select {
                options, selected, ..
            } => {
                if new_value.is_empty() {
                    *selected = None;
                    Ok(())
                } else if options.iter().any(|o| o == new_value) {
                    *selected = Some(new_value.to_string());
                    Ok(())
                } else {
                    Err(IntakeError::Validation(format!(
                        "{new_value:?} is not an option of {name}"
                    )))
                }
            }
            Control::Checkbox { .. } => Err(IntakeError::Validation(format!(
                "{name} is a checkbox field, toggle its options instead"
            ))),
        }
    }

    /// Toggle one checkbox option.
    pub fn set_checked(&mut self, name: &str, option: &str, on: bool) -> IntakeResult<()> {
        let field = self
            .field_mut(name)
            .ok_or_else(|| IntakeError::NotFound(format!("control {name}")))?;

        for control in field.controls.iter_mut() {
            if let Control::Checkbox {
                option: o, checked, ..
            } = control
            {
                if o == option {
                    *checked = on;
                    return Ok(());
                }
            }
        }
        Err(IntakeError::NotFound(format!("option {option:?} of {name}")))
    }

    /// Drop the controls of a field. Returns whether the field was present.
    pub fn remove_field(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|f| f.name != name);
        before != self.fields.len()
    }

    /// Current value of one field, read the same way [`FieldSet::collect`] does.
    pub fn value(&self, name: &str) -> Option<FieldValue> {
        self.field(name).map(collect_field)
    }

    /// Collect the current control values into a payload.
    ///
    /// Walks the schema, so a field whose controls are gone is skipped rather than
    /// failing the whole submission.
    pub fn collect(&self) -> SubmissionPayload {
        let mut payload = SubmissionPayload::new();
        for spec in &self.schema.fields {
            match self.field(&spec.name) {
                Some(field) => payload.insert(spec.name.clone(), collect_field(field)),
                None => debug!("No control for field {}, skipped", spec.name),
            }
        }
        payload
    }

    /// Required fields that are still empty.
    pub fn missing_required(&self) -> Vec<String> {
        self.schema
            .fields
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| self.value(&spec.name).is_some_and(|v| v.is_empty()))
            .map(|spec| spec.name.clone())
            .collect()
    }
}

fn collect_field(field: &RenderedField) -> FieldValue {
    if field.kind == FieldKind::Checkbox {
        return FieldValue::Choices(
            field
                .controls
                .iter()
                .filter_map(|c| match c {
                    Control::Checkbox {
                        option,
                        checked: true,
                        ..
                    } => Some(option.clone()),
                    _ => None,
                })
                .collect(),
        );
    }

    match field.controls.first() {
        Some(Control::Input { value, .. }) | Some(Control::TextArea { value, .. }) => {
            FieldValue::Text(value.clone())
        }
        Some(Control::Select { selected, .. }) => {
            FieldValue::Text(selected.clone().unwrap_or_default())
        }
        Some(Control::Checkbox { .. }) | None => FieldValue::Text(String::new()),
    }
}

/// A file picked for upload but not sent yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePreview {
    pub name: String,
    pub size_kb: u64,
}

/// Project selected files into display rows, sizes rounded up to whole KB.
pub fn render_file_preview<'a, I>(files: I) -> Vec<FilePreview>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    files
        .into_iter()
        .map(|(name, size)| FilePreview {
            name: name.to_string(),
            size_kb: size.div_ceil(1024),
        })
        .collect()
}

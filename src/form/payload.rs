use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Value of one field in a submission.
///
/// Checkbox fields carry a set of option strings; everything else is a single string.
/// Set equality ignores order.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Choices(Vec<String>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn choices<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldValue::Choices(values.into_iter().map(Into::into).collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Choices(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Choices(c) => c.is_empty(),
        }
    }

    /// Interpret the value as a set of selected options.
    ///
    /// Older records stored checkbox sets as a JSON-encoded string, so a text value
    /// that parses as a JSON array is decoded; any other text is a one-member set.
    pub fn choice_set(&self) -> Vec<String> {
        match self {
            FieldValue::Choices(c) => c.clone(),
            FieldValue::Text(s) if s.trim().is_empty() => Vec::new(),
            FieldValue::Text(s) => {
                if s.trim_start().starts_with('[') {
                    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(s) {
                        return items.into_iter().map(value_to_string).collect();
                    }
                }
                vec![s.clone()]
            }
        }
    }

    /// Single-string rendering, used for scalar controls and documents.
    pub fn display_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Choices(c) => c.join(", "),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Choices(a), FieldValue::Choices(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort();
                a.dedup();
                b.sort();
                b.dedup();
                a == b
            }
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

// Stored bodies may hold numbers, booleans or nulls written by older clients.
impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(FieldValue::from)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(items) => {
                FieldValue::Choices(items.into_iter().map(value_to_string).collect())
            }
            other => FieldValue::Text(value_to_string(other)),
        }
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Field name to value mapping produced by collecting a form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionPayload(BTreeMap<String, FieldValue>);

impl SubmissionPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    /// Text of a field, if present and not a set.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of this payload; keys in `other` win.
    pub fn merge(&mut self, other: SubmissionPayload) {
        self.0.extend(other.0);
    }

    /// Build a payload from raw form values in arrival order.
    ///
    /// A name seen more than once becomes a set of its values.
    pub fn from_form_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut payload = SubmissionPayload::new();
        for (name, value) in values {
            let merged = match payload.0.remove(&name) {
                None => FieldValue::Text(value),
                Some(FieldValue::Text(first)) => FieldValue::Choices(vec![first, value]),
                Some(FieldValue::Choices(mut set)) => {
                    set.push(value);
                    FieldValue::Choices(set)
                }
            };
            payload.0.insert(name, merged);
        }
        payload
    }
}

impl FromIterator<(String, FieldValue)> for SubmissionPayload {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

use bytes::Bytes;
use futures::stream;

use crate::{
    core::error::{IntakeError, IntakeResult},
    store::Upload,
};

/// Decoded `multipart/form-data` body.
#[derive(Debug, Default)]
pub struct FormData {
    /// Text parts in arrival order; a name may repeat
    pub fields: Vec<(String, String)>,
    /// File parts under any field name
    pub files: Vec<Upload>,
}

impl FormData {
    /// Remove every text part named `name` and return the last non-empty value.
    pub fn take_field(&mut self, name: &str) -> Option<String> {
        let mut found = None;
        self.fields.retain(|(k, v)| {
            if k == name {
                if !v.trim().is_empty() {
                    found = Some(v.trim().to_string());
                }
                false
            } else {
                true
            }
        });
        found
    }
}

pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

/// Decode a fully read multipart body.
///
/// A part carrying a filename is a file, even when the filename is empty and the part
/// has no content (browsers send that for an untouched file input); those empty
/// placeholders are dropped.
pub async fn parse_multipart(content_type: &str, body: Bytes) -> IntakeResult<FormData> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| IntakeError::Validation(format!("invalid multipart content type: {e}")))?;
    let body = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(body, boundary);

    let mut form = FormData::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IntakeError::Validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);

        match file_name {
            Some(file_name) => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| IntakeError::Validation(format!("reading file part: {e}")))?;
                if file_name.is_empty() && data.is_empty() {
                    continue;
                }
                log::debug!("Received file {file_name:?} ({} bytes) as {name}", data.len());
                form.files.push(Upload::new(file_name, data));
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| IntakeError::Validation(format!("reading field {name}: {e}")))?;
                form.fields.push((name, value));
            }
        }
    }
    Ok(form)
}

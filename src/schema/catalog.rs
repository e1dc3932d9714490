use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::FormSchema;
use crate::core::error::{IntakeError, IntakeResult};

/// URL prefix under which schema documents are addressed.
pub const LOCATOR_PREFIX: &str = "/formSchemas/";

const SCHEMA_EXTENSION: &str = "json";

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static DISALLOWED_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: String,
    pub locator: String,
}

/// Where forms come from.
///
/// The workflow controller only talks to this trait, so tests and embedders can
/// swap the directory-backed [`SchemaCatalog`] for anything else.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// All known schemas. Never fails: an unreadable source lists as empty.
    async fn list_schemas(&self) -> Vec<SchemaEntry>;

    async fn load_schema(&self, locator: &str) -> IntakeResult<FormSchema>;

    fn resolve_subform_locator(&self, request_type: &str, service_needed: &str) -> String;

    /// Load the subform for a selector pair.
    ///
    /// `Ok(None)` when no subform exists for the combination, or when either
    /// selector sanitizes to nothing.
    async fn load_subform(
        &self,
        request_type: &str,
        service_needed: &str,
    ) -> IntakeResult<Option<FormSchema>> {
        if sanitize_token(request_type).is_empty() || sanitize_token(service_needed).is_empty() {
            return Ok(None);
        }

        let locator = self.resolve_subform_locator(request_type, service_needed);
        match self.load_schema(&locator).await {
            Ok(schema) => Ok(Some(schema)),
            Err(IntakeError::SchemaNotFound(_)) => {
                debug!("No subform at {locator}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Schema catalog backed by a directory of `*.json` documents.
///
/// Top-level files are the catalog; subforms live in a subdirectory and are only
/// reachable through [`SchemaSource::load_subform`] or their explicit locator.
pub struct SchemaCatalog {
    schema_dir: PathBuf,
    subform_dir: String,
}

impl SchemaCatalog {
    pub fn new(schema_dir: impl Into<PathBuf>, subform_dir: impl Into<String>) -> Self {
        Self {
            schema_dir: schema_dir.into(),
            subform_dir: subform_dir.into().trim_matches('/').to_string(),
        }
    }

    /// Map a locator onto a file inside the schema directory.
    ///
    /// Anything that is not a plain relative `.json` path below the prefix does not
    /// resolve.
    fn locate(&self, locator: &str) -> IntakeResult<PathBuf> {
        let not_found = || IntakeError::SchemaNotFound(locator.to_string());

        let relative = locator.strip_prefix(LOCATOR_PREFIX).ok_or_else(not_found)?;
        let relative = Path::new(relative);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain || relative.extension().and_then(|e| e.to_str()) != Some(SCHEMA_EXTENSION) {
            return Err(not_found());
        }

        Ok(self.schema_dir.join(relative))
    }
}

#[async_trait]
impl SchemaSource for SchemaCatalog {
    async fn list_schemas(&self) -> Vec<SchemaEntry> {
        let mut dir = match fs::read_dir(&self.schema_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(
                    "Unable to read schema dir {}: {e}",
                    self.schema_dir.display()
                );
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Schema dir listing interrupted: {e}");
                    break;
                }
            };

            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file || path.extension().and_then(|e| e.to_str()) != Some(SCHEMA_EXTENSION) {
                continue;
            }

            let (Some(stem), Some(file_name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };

            entries.push(SchemaEntry {
                id: stem.to_string(),
                locator: format!("{LOCATOR_PREFIX}{file_name}"),
            });
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    async fn load_schema(&self, locator: &str) -> IntakeResult<FormSchema> {
        let path = self.locate(locator)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IntakeError::SchemaNotFound(locator.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Schema {locator} read from {}", path.display());

        FormSchema::from_slice(&data).map_err(|e| match e {
            IntakeError::SchemaMalformed(msg) => {
                IntakeError::SchemaMalformed(format!("{locator}: {msg}"))
            }
            other => other,
        })
    }

    fn resolve_subform_locator(&self, request_type: &str, service_needed: &str) -> String {
        format!(
            "{LOCATOR_PREFIX}{}/{}_{}.{SCHEMA_EXTENSION}",
            self.subform_dir,
            sanitize_token(request_type),
            sanitize_token(service_needed)
        )
    }
}

/// Normalize a selector value into a file-name token.
///
/// Trims, collapses whitespace runs to `_`, then drops anything outside
/// `[A-Za-z0-9_-]`.
pub fn sanitize_token(raw: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(raw.trim(), "_");
    DISALLOWED_CHARS.replace_all(&collapsed, "").into_owned()
}

/// Schema id for a locator: the file stem.
pub fn schema_id(locator: &str) -> &str {
    let file = locator.rsplit('/').next().unwrap_or(locator);
    file.strip_suffix(".json").unwrap_or(file)
}

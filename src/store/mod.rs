//! Request persistence.
//!
//! The workflow only sees the [`RequestStore`] contract: append a request and list
//! every record in creation order. The log is append-only. Continuing a draft adds
//! a new record tagged with the draft's id; earlier records are never rewritten.

pub mod request_log;
pub mod uploads;

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    core::error::{IntakeError, IntakeResult},
    form::SubmissionPayload,
};

pub use request_log::{RequestLog, RequestLogWriter};
pub use uploads::UploadDir;

pub const RECORD_ID_PREFIX: &str = "REQ-";

/// Status of a stored record.
///
/// Clients may only send `draft` or `submitted`. Older logs can hold any string,
/// which is kept as [`RequestStatus::Other`] and written back unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestStatus {
    Draft,
    Submitted,
    Other(String),
}

impl RequestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Submitted => "submitted",
            RequestStatus::Other(status) => status,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RequestStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "draft" => RequestStatus::Draft,
            "submitted" => RequestStatus::Submitted,
            _ => RequestStatus::Other(status),
        }
    }
}

impl From<RequestStatus> for String {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Other(status) => status,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "draft" => Ok(RequestStatus::Draft),
            "submitted" => Ok(RequestStatus::Submitted),
            other => Err(IntakeError::Validation(format!(
                "unknown request status {other:?}"
            ))),
        }
    }
}

/// Stored attachment. Keys match the legacy log format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    #[serde(rename = "originalname")]
    pub original_name: String,
    #[serde(rename = "path")]
    pub storage_path: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    #[serde(default)]
    pub body: SubmissionPayload,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    /// Keys this service does not interpret, such as `updatedAt`; kept on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RequestRecord {
    /// Records written before drafts existed carry no status and count as submitted.
    pub fn effective_status(&self) -> RequestStatus {
        self.status.clone().unwrap_or(RequestStatus::Submitted)
    }
}

/// A file received from the client, not yet stored.
#[derive(Clone, Debug)]
pub struct Upload {
    pub original_name: String,
    pub data: Bytes,
}

impl Upload {
    pub fn new(original_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            original_name: original_name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Everything needed to append one record; the store assigns id and timestamp.
#[derive(Clone, Debug, Default)]
pub struct NewRequest {
    pub body: SubmissionPayload,
    pub status: Option<RequestStatus>,
    pub original_id: Option<String>,
    pub uploads: Vec<Upload>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn append(&self, request: NewRequest) -> IntakeResult<RequestRecord>;

    /// All records in creation order.
    async fn list(&self) -> IntakeResult<Vec<RequestRecord>>;

    async fn get(&self, id: &str) -> IntakeResult<Option<RequestRecord>> {
        Ok(self.list().await?.into_iter().find(|r| r.id == id))
    }
}

/// Hands out `REQ-<millis>` ids that strictly increase, even within one millisecond.
#[derive(Debug, Default)]
pub struct RecordIds {
    last_millis: i64,
}

impl RecordIds {
    pub fn seeded<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a RequestRecord>,
    {
        let last_millis = records
            .into_iter()
            .filter_map(|r| r.id.strip_prefix(RECORD_ID_PREFIX))
            .filter_map(|n| n.parse::<i64>().ok())
            .max()
            .unwrap_or(0);
        Self { last_millis }
    }

    pub fn next(&mut self, now: DateTime<Utc>) -> (String, i64) {
        let millis = now.timestamp_millis().max(self.last_millis + 1);
        self.last_millis = millis;
        (format!("{RECORD_ID_PREFIX}{millis}"), millis)
    }
}

/// Process-local store. Attachments are recorded but not written anywhere.
#[derive(Default)]
pub struct MemoryRequestStore {
    inner: Mutex<(Vec<RequestRecord>, RecordIds)>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn append(&self, request: NewRequest) -> IntakeResult<RequestRecord> {
        let mut guard = self.inner.lock().await;
        let (records, ids) = &mut *guard;

        let now = Utc::now();
        let (id, millis) = ids.next(now);
        let files = request
            .uploads
            .iter()
            .map(|u| FileAttachment {
                original_name: u.original_name.clone(),
                storage_path: uploads::storage_path(&uploads::stored_name(millis, &u.original_name)),
                size_bytes: u.size(),
            })
            .collect();

        let record = RequestRecord {
            id,
            created_at: now,
            status: request.status,
            original_id: request.original_id,
            body: request.body,
            files,
            extra: Default::default(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn list(&self) -> IntakeResult<Vec<RequestRecord>> {
        Ok(self.inner.lock().await.0.clone())
    }
}

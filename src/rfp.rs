//! Plain-text RFP documents generated from stored requests.

use std::path::PathBuf;

use log::info;

use crate::{
    core::error::{IntakeError, IntakeResult},
    store::RequestRecord,
};

pub const RFP_URL_PREFIX: &str = "/data/rfps/";

/// Document lines: heading plus the body keys it is read from, first present wins.
const RFP_LINES: &[(&str, &[&str])] = &[
    ("Project Name", &["projectName"]),
    ("Description", &["description"]),
    ("Company", &["company_name", "companyName"]),
    ("Primary Contact", &["primary_contact", "primaryContact"]),
    ("Email", &["email"]),
    ("Request Type", &["request_type", "requestType"]),
    ("Services Needed", &["services_needed", "serviceNeeded"]),
    ("Target Markets", &["target_markets", "targetMarkets"]),
    ("Budget", &["budget"]),
    ("Decision Deadline", &["decisionDeadline"]),
    ("Additional Info", &["additional_info", "additionalInfo"]),
    ("Key Criteria", &["keyCriteria"]),
];

pub fn render_rfp(record: &RequestRecord) -> String {
    let mut lines = vec![
        "Request for Proposal (RFP)".to_string(),
        format!("Request ID: {}", record.id),
    ];

    for (heading, keys) in RFP_LINES {
        let value = keys
            .iter()
            .find_map(|key| record.body.get(key))
            .map(|v| v.choice_set().join(", "))
            .unwrap_or_default();
        lines.push(format!("{heading}: {value}"));
    }

    lines.push(String::new());
    lines.push("Thank you for considering this RFP.".to_string());
    lines.join("\n")
}

pub fn rfp_file_name(record_id: &str) -> String {
    format!("{record_id}_rfp.txt")
}

/// Directory of generated RFP documents.
#[derive(Clone, Debug)]
pub struct RfpArchive {
    dir: PathBuf,
}

impl RfpArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the document for `record` and return its download URL.
    ///
    /// Regenerating replaces the previous document.
    pub async fn write(&self, record: &RequestRecord) -> IntakeResult<String> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = rfp_file_name(&record.id);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, render_rfp(record)).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("RFP for {} written to {}", record.id, path.display());
        Ok(format!("{RFP_URL_PREFIX}{name}"))
    }

    pub async fn read(&self, name: &str) -> IntakeResult<Vec<u8>> {
        let not_found = || IntakeError::NotFound(format!("document {name}"));
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !plain {
            return Err(not_found());
        }

        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::form::{FieldValue, SubmissionPayload};

    fn record() -> RequestRecord {
        let mut body = SubmissionPayload::new();
        body.insert("projectName", FieldValue::text("Rollout"));
        body.insert("requestType", FieldValue::text("Commercial"));
        body.insert("target_markets", FieldValue::text(r#"["US","EU"]"#));
        body.insert("keyCriteria", FieldValue::choices(["Cost", "Speed"]));
        RequestRecord {
            id: "REQ-42".to_string(),
            created_at: Utc::now(),
            status: None,
            original_id: None,
            body,
            files: vec![],
            extra: Default::default(),
        }
    }

    #[test]
    fn test_render_rfp() {
        let text = render_rfp(&record());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Request for Proposal (RFP)");
        assert_eq!(lines[1], "Request ID: REQ-42");
        assert!(lines.contains(&"Project Name: Rollout"));
        assert!(lines.contains(&"Request Type: Commercial"));
        assert!(lines.contains(&"Target Markets: US, EU"));
        assert!(lines.contains(&"Key Criteria: Cost, Speed"));
        assert!(lines.contains(&"Budget: "));
        assert_eq!(lines.last(), Some(&"Thank you for considering this RFP."));
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RfpArchive::new(dir.path().join("rfps"));

        let url = archive.write(&record()).await.unwrap();
        assert_eq!(url, "/data/rfps/REQ-42_rfp.txt");

        let data = archive.read("REQ-42_rfp.txt").await.unwrap();
        assert!(String::from_utf8(data).unwrap().contains("Rollout"));

        for name in ["../requests.json", "", ".REQ-42_rfp.txt.tmp", "nope.txt"] {
            assert!(matches!(
                archive.read(name).await,
                Err(IntakeError::NotFound(_))
            ));
        }
    }
}

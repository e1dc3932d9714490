use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use super::{FileAttachment, Upload};
use crate::core::error::{IntakeError, IntakeResult};

/// URL prefix of stored attachments.
pub const UPLOAD_URL_PREFIX: &str = "/uploads/";

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9._-]").unwrap());

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn safe_file_name(original: &str) -> String {
    let safe = UNSAFE_CHARS.replace_all(original, "_");
    if safe.trim_matches('.').is_empty() {
        "file".to_string()
    } else {
        safe.into_owned()
    }
}

pub fn stored_name(millis: i64, original: &str) -> String {
    format!("{millis}_{}", safe_file_name(original))
}

pub fn storage_path(stored_name: &str) -> String {
    format!("{UPLOAD_URL_PREFIX}{stored_name}")
}

/// Directory holding uploaded attachments.
#[derive(Clone, Debug)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write one upload as `<millis>_<safe name>`.
    ///
    /// Never overwrites: a name already taken gets a `-<n>` counter after the millis.
    pub async fn save(&self, millis: i64, upload: &Upload) -> IntakeResult<FileAttachment> {
        let safe = safe_file_name(&upload.original_name);
        let mut attempt = 0u32;

        loop {
            let name = if attempt == 0 {
                format!("{millis}_{safe}")
            } else {
                format!("{millis}-{attempt}_{safe}")
            };
            let path = self.root.join(&name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let written = match file.write_all(&upload.data).await {
                        Ok(()) => file.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        drop(file);
                        if let Err(rm) = tokio::fs::remove_file(&path).await {
                            debug!("Partial upload {} left behind: {rm}", path.display());
                        }
                        return Err(e.into());
                    }
                    debug!(
                        "Stored upload {:?} as {} ({} bytes)",
                        upload.original_name,
                        path.display(),
                        upload.size()
                    );
                    return Ok(FileAttachment {
                        original_name: upload.original_name.clone(),
                        storage_path: storage_path(&name),
                        size_bytes: upload.size(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete a stored attachment. A file that is already gone is not an error.
    pub async fn remove(&self, attachment: &FileAttachment) -> IntakeResult<()> {
        let Some(stored_name) = attachment.storage_path.strip_prefix(UPLOAD_URL_PREFIX) else {
            return Err(IntakeError::NotFound(attachment.storage_path.clone()));
        };
        match tokio::fs::remove_file(self.root.join(stored_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a stored attachment by its stored name.
    pub async fn read(&self, stored_name: &str) -> IntakeResult<Vec<u8>> {
        let not_found = || IntakeError::NotFound(format!("upload {stored_name}"));
        if stored_name.is_empty()
            || stored_name.starts_with('.')
            || UNSAFE_CHARS.is_match(stored_name)
        {
            return Err(not_found());
        }

        match tokio::fs::read(self.root.join(stored_name)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("Spec Sheet (v2).pdf"), "Spec_Sheet__v2_.pdf");
        assert_eq!(safe_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(safe_file_name(".."), "file");
        assert_eq!(stored_name(42, "a b.txt"), "42_a_b.txt");
        assert_eq!(storage_path("42_a_b.txt"), "/uploads/42_a_b.txt");
    }

    #[tokio::test]
    async fn test_save_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadDir::new(dir.path());

        let first = uploads
            .save(7, &Upload::new("quote.pdf", b"one".to_vec()))
            .await
            .unwrap();
        let second = uploads
            .save(7, &Upload::new("quote.pdf", b"two".to_vec()))
            .await
            .unwrap();

        assert_eq!(first.storage_path, "/uploads/7_quote.pdf");
        assert_eq!(second.storage_path, "/uploads/7-1_quote.pdf");
        assert_eq!(first.size_bytes, 3);
        assert_eq!(uploads.read("7_quote.pdf").await.unwrap(), b"one");
        assert_eq!(uploads.read("7-1_quote.pdf").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadDir::new(dir.path());
        let saved = uploads
            .save(9, &Upload::new("note.txt", b"x".to_vec()))
            .await
            .unwrap();

        uploads.remove(&saved).await.unwrap();
        assert!(!dir.path().join("9_note.txt").exists());
        uploads.remove(&saved).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = UploadDir::new(dir.path());
        for name in ["", "..", "../x", "a/b", ".hidden"] {
            assert!(matches!(
                uploads.read(name).await,
                Err(IntakeError::NotFound(_))
            ));
        }
        assert!(matches!(
            uploads.read("missing.txt").await,
            Err(IntakeError::NotFound(_))
        ));
    }
}

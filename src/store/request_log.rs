//! JSON-file request log owned by a single writer task.
//!
//! The whole log is one JSON array. Every append rewrites it through a temp file and
//! a rename, so readers never see a partial file. Only the writer touches the file:
//! handles send commands over a channel and wait for the reply, which serializes
//! concurrent appends without a read-modify-write race.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::sync::{mpsc, oneshot};

use super::{
    FileAttachment, NewRequest, RecordIds, RequestRecord, RequestStatus, RequestStore, UploadDir,
};
use crate::core::error::{IntakeError, IntakeResult};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Append {
        request: NewRequest,
        reply: oneshot::Sender<IntakeResult<RequestRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<RequestRecord>>,
    },
}

/// Cloneable handle to the request log.
#[derive(Clone)]
pub struct RequestLog {
    sender: mpsc::Sender<Command>,
}

/// The task that owns the log file.
pub struct RequestLogWriter {
    path: PathBuf,
    uploads: UploadDir,
    records: Vec<RequestRecord>,
    ids: RecordIds,
    receiver: mpsc::Receiver<Command>,
}

impl RequestLog {
    /// Load the log at `path` and create the writer that will own it.
    ///
    /// A missing log starts empty. A log that does not parse is moved aside to
    /// `<path>.corrupt-<millis>` and the service starts with an empty one.
    pub fn open(
        path: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
    ) -> IntakeResult<(RequestLog, RequestLogWriter)> {
        let path = path.into();
        let upload_dir = upload_dir.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&upload_dir)?;

        let records = load_records(&path)?;
        info!(
            "Request log {} opened with {} records",
            path.display(),
            records.len()
        );

        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let writer = RequestLogWriter {
            ids: RecordIds::seeded(&records),
            path,
            uploads: UploadDir::new(upload_dir),
            records,
            receiver,
        };
        Ok((RequestLog { sender }, writer))
    }

    async fn send(&self, command: Command) -> IntakeResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| IntakeError::PersistFailure("request log writer is not running".into()))
    }
}

fn load_records(path: &Path) -> IntakeResult<Vec<RequestRecord>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(path, b"[]")?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<Vec<RequestRecord>>(&data) {
        Ok(records) => Ok(records),
        Err(e) => {
            let backup = format!(
                "{}.corrupt-{}",
                path.display(),
                Utc::now().timestamp_millis()
            );
            warn!(
                "Request log {} is unreadable ({e}), moved to {backup}, starting empty",
                path.display()
            );
            std::fs::rename(path, &backup)?;
            std::fs::write(path, b"[]")?;
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl RequestStore for RequestLog {
    async fn append(&self, request: NewRequest) -> IntakeResult<RequestRecord> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Append { request, reply }).await?;
        response
            .await
            .map_err(|_| IntakeError::PersistFailure("request log writer dropped the append".into()))?
    }

    async fn list(&self) -> IntakeResult<Vec<RequestRecord>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        response
            .await
            .map_err(|_| IntakeError::PersistFailure("request log writer dropped the listing".into()))
    }
}

impl RequestLogWriter {
    /// Process commands until shutdown or until every handle is gone.
    pub async fn serve(&mut self, mut shutdown: ShutdownWatch) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, closing request log");
                        break;
                    }
                },

                command = self.receiver.recv() => {
                    match command {
                        Some(Command::Append { request, reply }) => {
                            let result = self.append(request).await;
                            if let Err(e) = &result {
                                error!("Append to request log failed: {e}");
                            }
                            let _ = reply.send(result);
                        }
                        Some(Command::List { reply }) => {
                            let _ = reply.send(self.records.clone());
                        }
                        None => {
                            info!("Request log channel closed, stopping writer");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn append(&mut self, request: NewRequest) -> IntakeResult<RequestRecord> {
        let now = Utc::now();
        let (id, millis) = self.ids.next(now);

        let mut files = Vec::with_capacity(request.uploads.len());
        for upload in &request.uploads {
            match self.uploads.save(millis, upload).await {
                Ok(attachment) => files.push(attachment),
                Err(e) => {
                    self.discard_uploads(&files).await;
                    return Err(IntakeError::PersistFailure(format!("storing upload: {e}")));
                }
            }
        }

        let record = RequestRecord {
            id,
            created_at: now,
            status: request.status,
            original_id: request.original_id,
            body: request.body,
            files,
            extra: Default::default(),
        };

        self.records.push(record.clone());
        if let Err(e) = self.flush().await {
            self.records.pop();
            self.discard_uploads(&record.files).await;
            return Err(IntakeError::PersistFailure(format!(
                "writing {}: {e}",
                self.path.display()
            )));
        }

        info!(
            "Appended {} (status: {}, continues: {}, files: {})",
            record.id,
            record.status.as_ref().map_or("-", RequestStatus::as_str),
            record.original_id.as_deref().unwrap_or("-"),
            record.files.len()
        );
        Ok(record)
    }

    /// Remove attachments stored for an append that did not make it into the log.
    async fn discard_uploads(&self, files: &[FileAttachment]) {
        for file in files {
            if let Err(e) = self.uploads.remove(file).await {
                warn!("Unable to remove orphaned upload {}: {e}", file.storage_path);
            }
        }
    }

    async fn flush(&self) -> IntakeResult<()> {
        let data = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| IntakeError::Internal(format!("serializing request log: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Service for RequestLogWriter {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        self.serve(shutdown).await;
    }

    fn name(&self) -> &'static str {
        "request log"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::{
        form::{FieldValue, SubmissionPayload},
        store::Upload,
    };

    fn start(path: &Path, uploads: &Path) -> (RequestLog, watch::Sender<bool>) {
        let (log, mut writer) = RequestLog::open(path, uploads).unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { writer.serve(rx).await });
        (log, tx)
    }

    fn body(name: &str) -> SubmissionPayload {
        let mut body = SubmissionPayload::new();
        body.insert("projectName", FieldValue::text(name));
        body
    }

    #[tokio::test]
    async fn test_append_list_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/requests.json");
        let uploads = dir.path().join("uploads");

        let (log, shutdown) = start(&path, &uploads);
        assert!(log.list().await.unwrap().is_empty());

        let draft = log
            .append(NewRequest {
                body: body("Alpha"),
                status: Some(RequestStatus::Draft),
                uploads: vec![Upload::new("brief.pdf", b"pdf".to_vec())],
                ..Default::default()
            })
            .await
            .unwrap();
        let final_record = log
            .append(NewRequest {
                body: body("Alpha"),
                status: Some(RequestStatus::Submitted),
                original_id: Some(draft.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(draft.id < final_record.id);
        assert_eq!(draft.files.len(), 1);
        assert!(uploads
            .join(draft.files[0].storage_path.trim_start_matches("/uploads/"))
            .exists());

        let listed = log.list().await.unwrap();
        assert_eq!(listed, vec![draft.clone(), final_record.clone()]);

        shutdown.send(true).unwrap();
        let (reopened, _shutdown) = start(&path, &uploads);
        assert_eq!(reopened.list().await.unwrap(), listed);

        let third = reopened.append(NewRequest::default()).await.unwrap();
        assert!(third.id > final_record.id);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.json");
        let (log, _shutdown) = start(&path, &dir.path().join("uploads"));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.append(NewRequest {
                    body: body(&format!("p{i}")),
                    ..Default::default()
                })
                .await
                .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let listed = log.list().await.unwrap();
        assert_eq!(listed.len(), 20);
        assert!(listed.windows(2).all(|w| w[0].id < w[1].id));

        let on_disk: Vec<RequestRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 20);
    }

    #[tokio::test]
    async fn test_corrupt_log_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.json");
        std::fs::write(&path, b"{ not a list").unwrap();

        let (log, _shutdown) = start(&path, &dir.path().join("uploads"));
        assert!(log.list().await.unwrap().is_empty());

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_uploads_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.json");
        let uploads = dir.path().join("uploads");
        let (log, _shutdown) = start(&path, &uploads);

        // the temp file the log is rewritten through cannot be created
        let blocker = dir.path().join("requests.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let request = || NewRequest {
            body: body("Alpha"),
            uploads: vec![
                Upload::new("a.pdf", b"a".to_vec()),
                Upload::new("b.pdf", b"b".to_vec()),
            ],
            ..Default::default()
        };
        let stored = || std::fs::read_dir(&uploads).unwrap().count();

        for _ in 0..2 {
            assert!(matches!(
                log.append(request()).await,
                Err(IntakeError::PersistFailure(_))
            ));
        }
        assert_eq!(stored(), 0);
        assert!(log.list().await.unwrap().is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        let record = log.append(request()).await.unwrap();
        assert_eq!(record.files.len(), 2);
        assert_eq!(stored(), 2);
    }

    #[tokio::test]
    async fn test_stopped_writer_is_a_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (log, writer) =
            RequestLog::open(dir.path().join("requests.json"), dir.path().join("uploads"))
                .unwrap();
        drop(writer);

        assert!(matches!(
            log.append(NewRequest::default()).await,
            Err(IntakeError::PersistFailure(_))
        ));
        assert!(matches!(
            log.list().await,
            Err(IntakeError::PersistFailure(_))
        ));
    }
}

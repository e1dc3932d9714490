//! Server-held workflow controllers, one per form tab.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};
use pingora::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::{
    core::error::{IntakeError, IntakeResult},
    schema::SchemaSource,
    store::RequestStore,
    workflow::{WorkflowConfig, WorkflowController, WorkflowView},
};

pub struct Session {
    controller: Mutex<WorkflowController>,
    last_used: AtomicU64,
}

impl Session {
    pub async fn lock(&self) -> MutexGuard<'_, WorkflowController> {
        self.controller.lock().await
    }

    /// Lock without waiting; a busy session is a conflict.
    pub fn try_lock(&self) -> IntakeResult<MutexGuard<'_, WorkflowController>> {
        self.controller.try_lock().map_err(|_| {
            IntakeError::Workflow("another operation on this session is in progress".to_string())
        })
    }
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    schemas: Arc<dyn SchemaSource>,
    store: Arc<dyn RequestStore>,
    config: WorkflowConfig,
    idle_timeout: Duration,
    epoch: Instant,
}

impl SessionRegistry {
    pub fn new(
        schemas: Arc<dyn SchemaSource>,
        store: Arc<dyn RequestStore>,
        config: WorkflowConfig,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            schemas,
            store,
            config,
            idle_timeout,
            epoch: Instant::now(),
        }
    }

    pub fn workflow_config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Start a session with `locator` loaded.
    pub async fn create(&self, locator: &str) -> IntakeResult<(Uuid, WorkflowView)> {
        let mut controller =
            WorkflowController::new(self.schemas.clone(), self.store.clone(), self.config.clone());
        controller.load_schema(locator).await?;
        let view = controller.view();

        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Arc::new(Session {
                controller: Mutex::new(controller),
                last_used: AtomicU64::new(self.now_secs()),
            }),
        );
        info!("Session {id} opened on {locator}");
        Ok((id, view))
    }

    pub fn get(&self, id: &str) -> IntakeResult<Arc<Session>> {
        let not_found = || IntakeError::NotFound(format!("session {id}"));
        let id = Uuid::parse_str(id).map_err(|_| not_found())?;
        let session = self
            .sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(not_found)?;
        session.last_used.store(self.now_secs(), Ordering::Relaxed);
        Ok(session)
    }

    pub fn remove(&self, id: &str) -> IntakeResult<()> {
        let not_found = || IntakeError::NotFound(format!("session {id}"));
        let uuid = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.sessions.remove(&uuid).ok_or_else(not_found)?;
        info!("Session {id} closed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than the timeout. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let now = self.now_secs();
        let timeout = self.idle_timeout.as_secs();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.saturating_sub(s.last_used.load(Ordering::Relaxed)) < timeout);
        before.saturating_sub(self.sessions.len())
    }
}

/// Background task evicting idle sessions.
pub struct SessionReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let interval = (registry.idle_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self { registry, interval }
    }
}

#[async_trait]
impl BackgroundService for SessionReaper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Shutdown signal received, stopping session reaper");
                        return;
                    }
                },

                _ = ticker.tick() => {
                    let evicted = self.registry.evict_idle();
                    if evicted > 0 {
                        info!("Evicted {evicted} idle sessions, {} remain", self.registry.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{schema::SchemaCatalog, store::MemoryRequestStore, workflow::WorkflowState};

    fn registry(dir: &Path, idle_timeout: Duration) -> SessionRegistry {
        std::fs::write(
            dir.join("new_request.json"),
            r#"{"fields": [{"name": "projectName"}, {"name": "requestType", "type": "select", "options": ["A"]}]}"#,
        )
        .unwrap();
        SessionRegistry::new(
            Arc::new(SchemaCatalog::new(dir, "subforms")),
            Arc::new(MemoryRequestStore::new()),
            WorkflowConfig::default(),
            idle_timeout,
        )
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), Duration::from_secs(600));

        let (a, view) = registry.create("/formSchemas/new_request.json").await.unwrap();
        assert_eq!(view.state, WorkflowState::PrimaryLoaded);
        let (b, _) = registry.create("/formSchemas/new_request.json").await.unwrap();
        assert_ne!(a, b);

        let session = registry.get(&a.to_string()).unwrap();
        session
            .lock()
            .await
            .set_value("projectName", "only in a")
            .await
            .unwrap();

        let other = registry.get(&b.to_string()).unwrap();
        let value = other.lock().await.primary().unwrap().value("projectName");
        assert_eq!(value.unwrap().display_text(), "");

        registry.remove(&a.to_string()).unwrap();
        assert!(matches!(
            registry.get(&a.to_string()),
            Err(IntakeError::NotFound(_))
        ));
        assert!(matches!(registry.get("not-a-uuid"), Err(IntakeError::NotFound(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_busy_session_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), Duration::from_secs(600));
        let (id, _) = registry.create("/formSchemas/new_request.json").await.unwrap();

        let session = registry.get(&id.to_string()).unwrap();
        let _held = session.lock().await;
        assert!(matches!(session.try_lock(), Err(IntakeError::Workflow(_))));
    }

    #[tokio::test]
    async fn test_create_with_unknown_schema() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), Duration::from_secs(600));
        assert!(matches!(
            registry.create("/formSchemas/missing.json").await,
            Err(IntakeError::SchemaNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), Duration::ZERO);
        registry.create("/formSchemas/new_request.json").await.unwrap();
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }
}

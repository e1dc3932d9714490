//! Draft, subform and submit lifecycle of one form instance.
//!
//! ```text
//! Idle -> PrimaryLoaded -> DraftSaved -> SubformLoaded -> Finalized
//! ```
//!
//! A [`WorkflowController`] owns everything one form tab needs: the rendered primary
//! form, the optional subform chosen by the two selector fields, the bound draft id,
//! the staged files and the last persist notice. Nothing is shared between
//! controllers; the HTTP layer keeps one per session.

use std::{fmt, sync::Arc};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    core::error::{IntakeError, IntakeResult},
    form::{render, render_file_preview, FieldSet, FilePreview, SubmissionPayload},
    schema::{schema_id, SchemaSource, LOCATOR_PREFIX},
    store::{NewRequest, RequestRecord, RequestStatus, RequestStore, Upload},
    workflow_error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// No schema loaded
    Idle,
    /// Schema rendered, no draft saved in this session
    PrimaryLoaded,
    /// Primary form persisted as a draft and its id bound
    DraftSaved,
    /// A subform is rendered next to the primary form
    SubformLoaded,
    /// Submission persisted
    Finalized,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::PrimaryLoaded => "primary_loaded",
            WorkflowState::DraftSaved => "draft_saved",
            WorkflowState::SubformLoaded => "subform_loaded",
            WorkflowState::Finalized => "finalized",
        }
    }

    fn is_editable(&self) -> bool {
        matches!(
            self,
            WorkflowState::PrimaryLoaded | WorkflowState::DraftSaved | WorkflowState::SubformLoaded
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the two primary fields whose values pick the subform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selectors {
    pub request_type: String,
    pub service_needed: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            request_type: "requestType".to_string(),
            service_needed: "serviceNeeded".to_string(),
        }
    }
}

impl Selectors {
    fn contains(&self, name: &str) -> bool {
        self.request_type == name || self.service_needed == name
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Id of the only schema that supports save & continue
    pub new_request_schema: String,
    pub selectors: Selectors,
}

impl WorkflowConfig {
    /// Locator of the schema that supports save & continue.
    pub fn new_request_locator(&self) -> String {
        format!("{LOCATOR_PREFIX}{}.json", self.new_request_schema)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            new_request_schema: "new_request".to_string(),
            selectors: Selectors::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct LoadedForm {
    locator: String,
    fields: FieldSet,
}

/// Serializable snapshot of a controller.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub state: WorkflowState,
    pub locator: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub primary: Option<FieldSet>,
    pub subform_locator: Option<String>,
    pub subform: Option<FieldSet>,
    pub original_id: Option<String>,
    pub allow_upload: bool,
    pub files: Vec<FilePreview>,
    pub notice: Option<String>,
    pub last_record_id: Option<String>,
}

pub struct WorkflowController {
    schemas: Arc<dyn SchemaSource>,
    store: Arc<dyn RequestStore>,
    config: WorkflowConfig,
    state: WorkflowState,
    primary: Option<LoadedForm>,
    subform: Option<LoadedForm>,
    original_id: Option<String>,
    staged: Vec<Upload>,
    notice: Option<String>,
    last_record_id: Option<String>,
}

impl WorkflowController {
    pub fn new(
        schemas: Arc<dyn SchemaSource>,
        store: Arc<dyn RequestStore>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            schemas,
            store,
            config,
            state: WorkflowState::Idle,
            primary: None,
            subform: None,
            original_id: None,
            staged: Vec::new(),
            notice: None,
            last_record_id: None,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Id of the draft line this form continues.
    pub fn original_id(&self) -> Option<&str> {
        self.original_id.as_deref()
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn primary(&self) -> Option<&FieldSet> {
        self.primary.as_ref().map(|p| &p.fields)
    }

    pub fn subform(&self) -> Option<&FieldSet> {
        self.subform.as_ref().map(|s| &s.fields)
    }

    fn transition(&mut self, next: WorkflowState) {
        if self.state != next {
            info!("Workflow {} -> {next}", self.state);
            self.state = next;
        }
    }

    /// Render a catalog schema as a fresh form.
    ///
    /// Any draft binding, subform, staged files and notice from earlier work are
    /// dropped.
    pub async fn load_schema(&mut self, locator: &str) -> IntakeResult<()> {
        let schema = self.schemas.load_schema(locator).await?;

        self.primary = Some(LoadedForm {
            locator: locator.to_string(),
            fields: render(Arc::new(schema), None),
        });
        self.subform = None;
        self.original_id = None;
        self.staged.clear();
        self.notice = None;
        self.last_record_id = None;
        self.transition(WorkflowState::PrimaryLoaded);
        Ok(())
    }

    /// Load a stored record back into a form for editing.
    ///
    /// The record body prefills the form and the record id becomes the draft
    /// binding. When the body holds both selector values the matching subform is
    /// loaded right away, prefilled from the same body.
    pub async fn load_record(&mut self, locator: &str, record: &RequestRecord) -> IntakeResult<()> {
        let schema = self.schemas.load_schema(locator).await?;

        self.primary = Some(LoadedForm {
            locator: locator.to_string(),
            fields: render(Arc::new(schema), Some(&record.body)),
        });
        self.subform = None;
        self.original_id = Some(record.id.clone());
        self.staged.clear();
        self.notice = None;
        self.last_record_id = None;
        self.transition(WorkflowState::PrimaryLoaded);
        info!("Record {} loaded into {locator}", record.id);

        self.refresh_subform(Some(&record.body)).await;
        Ok(())
    }

    fn ensure_editable(&self, action: &str) -> IntakeResult<()> {
        if self.state.is_editable() {
            Ok(())
        } else {
            Err(workflow_error!("cannot {} while {}", action, self.state))
        }
    }

    /// Set a text, textarea or select field of the primary form or the subform.
    pub async fn set_value(&mut self, name: &str, value: &str) -> IntakeResult<()> {
        self.ensure_editable("edit fields")?;
        self.edit(name, |fields| fields.set_value(name, value)).await
    }

    /// Toggle one option of a checkbox field.
    pub async fn set_checked(&mut self, name: &str, option: &str, checked: bool) -> IntakeResult<()> {
        self.ensure_editable("edit fields")?;
        self.edit(name, |fields| fields.set_checked(name, option, checked))
            .await
    }

    async fn edit<F>(&mut self, name: &str, apply: F) -> IntakeResult<()>
    where
        F: FnOnce(&mut FieldSet) -> IntakeResult<()>,
    {
        if let Some(primary) = self.primary.as_mut().filter(|p| p.fields.field(name).is_some()) {
            let before = primary.fields.value(name);
            apply(&mut primary.fields)?;
            let changed = primary.fields.value(name) != before;

            if changed && self.config.selectors.contains(name) {
                debug!("Selector {name} changed, re-resolving subform");
                self.refresh_subform(None).await;
            }
            return Ok(());
        }

        if let Some(subform) = self.subform.as_mut().filter(|s| s.fields.field(name).is_some()) {
            return apply(&mut subform.fields);
        }

        Err(IntakeError::NotFound(format!("field {name}")))
    }

    /// Re-resolve the subform from the current selector values.
    ///
    /// Only runs once a draft is bound. Any loaded subform is discarded first.
    async fn refresh_subform(&mut self, prefill: Option<&SubmissionPayload>) {
        if self.original_id.is_none() {
            return;
        }
        let Some(primary) = &self.primary else {
            return;
        };

        let selected = |name: &str| {
            primary
                .fields
                .value(name)
                .map(|v| v.display_text())
                .unwrap_or_default()
        };
        let request_type = selected(&self.config.selectors.request_type);
        let service_needed = selected(&self.config.selectors.service_needed);

        self.subform = None;
        let found = if request_type.trim().is_empty() || service_needed.trim().is_empty() {
            Ok(None)
        } else {
            self.schemas
                .load_subform(&request_type, &service_needed)
                .await
        };

        match found {
            Ok(Some(schema)) => {
                let locator = self
                    .schemas
                    .resolve_subform_locator(&request_type, &service_needed);
                info!("Subform {locator} loaded for {request_type:?}/{service_needed:?}");
                let mut fields = render(Arc::new(schema), prefill);
                // A name the primary form already has is edited and collected there
                if let Some(primary) = &self.primary {
                    for shared in &primary.fields.fields {
                        if fields.remove_field(&shared.name) {
                            debug!("Subform field {} shadowed by the primary form", shared.name);
                        }
                    }
                }
                self.subform = Some(LoadedForm { locator, fields });
                self.transition(WorkflowState::SubformLoaded);
            }
            Ok(None) => {
                if self.state == WorkflowState::SubformLoaded {
                    self.transition(WorkflowState::PrimaryLoaded);
                }
            }
            Err(e) => {
                warn!("Subform for {request_type:?}/{service_needed:?} is unusable: {e}");
                self.notice = Some(format!("The matching subform could not be loaded: {e}"));
                if self.state == WorkflowState::SubformLoaded {
                    self.transition(WorkflowState::PrimaryLoaded);
                }
            }
        }
    }

    /// Replace the files selected for upload. Never changes the workflow state.
    pub fn stage_files(&mut self, files: Vec<Upload>) -> IntakeResult<()> {
        self.ensure_editable("attach files")?;
        if !self.allow_upload() && !files.is_empty() {
            return Err(IntakeError::Validation(
                "this form does not accept attachments".to_string(),
            ));
        }
        self.staged = files;
        Ok(())
    }

    pub fn file_preview(&self) -> Vec<FilePreview> {
        render_file_preview(self.staged.iter().map(|u| (u.original_name.as_str(), u.size())))
    }

    fn allow_upload(&self) -> bool {
        [&self.primary, &self.subform]
            .into_iter()
            .flatten()
            .any(|f| f.fields.allow_upload)
    }

    fn payload(&self) -> SubmissionPayload {
        let mut payload = self
            .primary
            .as_ref()
            .map(|p| p.fields.collect())
            .unwrap_or_default();
        if let Some(subform) = &self.subform {
            payload.merge(subform.fields.collect());
        }
        payload
    }

    fn is_new_request(&self) -> bool {
        self.primary
            .as_ref()
            .is_some_and(|p| schema_id(&p.locator) == self.config.new_request_schema)
    }

    /// Save & continue: persist the current form as a draft.
    ///
    /// The first save binds the new record id; later saves carry it as `originalId`.
    pub async fn save_draft(&mut self) -> IntakeResult<RequestRecord> {
        self.ensure_editable("save a draft")?;
        if !self.is_new_request() {
            return Err(workflow_error!(
                "only the {} form can be saved as a draft",
                self.config.new_request_schema
            ));
        }

        let record = self
            .persist(NewRequest {
                body: self.payload(),
                status: Some(RequestStatus::Draft),
                original_id: self.original_id.clone(),
                uploads: self.staged.clone(),
            })
            .await?;

        if self.original_id.is_none() {
            self.original_id = Some(record.id.clone());
        }
        if self.state == WorkflowState::PrimaryLoaded {
            self.transition(WorkflowState::DraftSaved);
        }
        if self.subform.is_none() {
            self.refresh_subform(None).await;
        }
        Ok(record)
    }

    /// Final submission of the primary form merged with the subform.
    pub async fn submit(&mut self) -> IntakeResult<RequestRecord> {
        self.ensure_editable("submit")?;

        let missing: Vec<String> = [&self.primary, &self.subform]
            .into_iter()
            .flatten()
            .flat_map(|f| f.fields.missing_required())
            .collect();
        if !missing.is_empty() {
            return Err(IntakeError::Validation(format!(
                "required fields are empty: {}",
                missing.join(", ")
            )));
        }

        let status = self.original_id.as_ref().map(|_| RequestStatus::Submitted);
        let record = self
            .persist(NewRequest {
                body: self.payload(),
                status,
                original_id: self.original_id.clone(),
                uploads: self.staged.clone(),
            })
            .await?;

        self.transition(WorkflowState::Finalized);
        Ok(record)
    }

    async fn persist(&mut self, request: NewRequest) -> IntakeResult<RequestRecord> {
        match self.store.append(request).await {
            Ok(record) => {
                self.staged.clear();
                self.notice = None;
                self.last_record_id = Some(record.id.clone());
                Ok(record)
            }
            Err(e) => {
                let e = match e {
                    IntakeError::PersistFailure(_) => e,
                    other => IntakeError::PersistFailure(other.to_string()),
                };
                warn!("Persist failed in state {}: {e}", self.state);
                self.notice = Some(format!("Saving failed, please try again. {e}"));
                Err(e)
            }
        }
    }

    pub fn view(&self) -> WorkflowView {
        let primary = self.primary.as_ref();
        WorkflowView {
            state: self.state,
            locator: primary.map(|p| p.locator.clone()),
            title: primary.map(|p| p.fields.title.clone()),
            description: primary.and_then(|p| p.fields.description.clone()),
            primary: primary.map(|p| p.fields.clone()),
            subform_locator: self.subform.as_ref().map(|s| s.locator.clone()),
            subform: self.subform.as_ref().map(|s| s.fields.clone()),
            original_id: self.original_id.clone(),
            allow_upload: self.allow_upload(),
            files: self.file_preview(),
            notice: self.notice.clone(),
            last_record_id: self.last_record_id.clone(),
        }
    }
}

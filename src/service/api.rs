//! Intake HTTP API.
//!
//! [`IntakeApi`] holds the operations behind each endpoint and is usable without a
//! live connection; [`IntakeHttpApp`] routes pingora sessions onto it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Response, StatusCode};
use log::{info, warn};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, listeners::tls::TlsSettings, protocols::http::ServerSession,
    services::listening::Service,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    config::{Formdesk, Tls},
    core::error::{ErrorContext, IntakeError, IntakeResult},
    form::{FieldValue, SubmissionPayload},
    rfp::RfpArchive,
    schema::{FormSchema, SchemaEntry, SchemaSource, LOCATOR_PREFIX},
    service::sessions::SessionRegistry,
    store::{NewRequest, RequestRecord, RequestStatus, RequestStore, UploadDir},
    utils::{
        multipart::{is_multipart, parse_multipart},
        request::{decode_path_params, get_content_type, get_query_value, read_request_body},
        response::{content_type, CommonErrors, ResponseBuilder},
    },
    validation_error,
    workflow::WorkflowView,
};

const ORIGINAL_ID_KEYS: [&str; 2] = ["originalId", "original_id"];
const STATUS_KEY: &str = "status";

#[derive(Debug, Serialize)]
pub struct CreatedRequest {
    pub success: bool,
    pub id: String,
    pub entry: RequestRecord,
}

#[derive(Debug, Serialize)]
pub struct GeneratedRfp {
    pub success: bool,
    pub download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub view: WorkflowView,
}

/// Result of a persisting session action.
#[derive(Debug, Serialize)]
pub struct SessionSave {
    pub success: bool,
    pub id: String,
    pub entry: RequestRecord,
    pub view: WorkflowView,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldUpdate {
    Toggle { option: String, checked: bool },
    Value { value: JsonValue },
}

#[derive(Debug, Default, Deserialize)]
struct LocatorBody {
    locator: Option<String>,
}

pub struct IntakeApi {
    schemas: Arc<dyn SchemaSource>,
    store: Arc<dyn RequestStore>,
    uploads: UploadDir,
    rfps: RfpArchive,
    sessions: Arc<SessionRegistry>,
    max_body_size: usize,
}

impl IntakeApi {
    pub fn new(
        schemas: Arc<dyn SchemaSource>,
        store: Arc<dyn RequestStore>,
        uploads: UploadDir,
        rfps: RfpArchive,
        sessions: Arc<SessionRegistry>,
        max_body_size: usize,
    ) -> Self {
        Self {
            schemas,
            store,
            uploads,
            rfps,
            sessions,
            max_body_size,
        }
    }

    pub async fn list_schemas(&self) -> Vec<SchemaEntry> {
        self.schemas.list_schemas().await
    }

    /// Schema by its path below the locator prefix.
    pub async fn schema(&self, path: &str) -> IntakeResult<FormSchema> {
        self.schemas
            .load_schema(&format!("{LOCATOR_PREFIX}{path}"))
            .await
    }

    /// Create or continue a request from a raw multipart or JSON body.
    ///
    /// The body is stored as sent: required fields are not re-checked here.
    pub async fn create_request(
        &self,
        content_type: Option<&str>,
        body: Bytes,
    ) -> IntakeResult<CreatedRequest> {
        let request = match content_type {
            Some(ct) if is_multipart(ct) => {
                let mut form = parse_multipart(ct, body).await?;
                let original_id = ORIGINAL_ID_KEYS
                    .iter()
                    .filter_map(|key| form.take_field(key))
                    .last();
                let status = form.take_field(STATUS_KEY);
                NewRequest {
                    status: parse_status(status.as_deref())?,
                    original_id,
                    body: SubmissionPayload::from_form_values(form.fields),
                    uploads: form.files,
                }
            }
            _ => json_request(&body)?,
        };

        let entry = self.store.append(request).await?;
        Ok(CreatedRequest {
            success: true,
            id: entry.id.clone(),
            entry,
        })
    }

    pub async fn list_requests(&self, descending: bool) -> IntakeResult<Vec<RequestRecord>> {
        let mut records = self.store.list().await?;
        if descending {
            records.reverse();
        }
        Ok(records)
    }

    async fn record(&self, id: &str) -> IntakeResult<RequestRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| IntakeError::NotFound(format!("request {id}")))
    }

    pub async fn upload(&self, name: &str) -> IntakeResult<Vec<u8>> {
        self.uploads.read(name).await
    }

    pub async fn generate_rfp(&self, id: &str) -> IntakeResult<GeneratedRfp> {
        let record = self.record(id).await?;
        let download_url = self.rfps.write(&record).await?;
        Ok(GeneratedRfp {
            success: true,
            download_url,
        })
    }

    pub async fn rfp(&self, name: &str) -> IntakeResult<Vec<u8>> {
        self.rfps.read(name).await
    }

    pub async fn create_session(&self, locator: Option<&str>) -> IntakeResult<SessionView> {
        let locator = locator
            .map(str::to_string)
            .unwrap_or_else(|| self.sessions.workflow_config().new_request_locator());
        let (id, view) = self.sessions.create(&locator).await?;
        Ok(SessionView {
            session_id: id.to_string(),
            view,
        })
    }

    pub async fn session_view(&self, id: &str) -> IntakeResult<SessionView> {
        let session = self.sessions.get(id)?;
        let view = session.lock().await.view();
        Ok(SessionView {
            session_id: id.to_string(),
            view,
        })
    }

    pub fn close_session(&self, id: &str) -> IntakeResult<()> {
        self.sessions.remove(id)
    }

    pub async fn update_field(
        &self,
        id: &str,
        name: &str,
        update: FieldUpdate,
    ) -> IntakeResult<SessionView> {
        let session = self.sessions.get(id)?;
        let mut controller = session.lock().await;
        match update {
            FieldUpdate::Toggle { option, checked } => {
                controller.set_checked(name, &option, checked).await?
            }
            FieldUpdate::Value { value } => {
                let value = FieldValue::from(value).display_text();
                controller.set_value(name, &value).await?
            }
        }
        Ok(SessionView {
            session_id: id.to_string(),
            view: controller.view(),
        })
    }

    pub async fn stage_files(
        &self,
        id: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> IntakeResult<SessionView> {
        let ct = content_type
            .filter(|ct| is_multipart(ct))
            .ok_or_else(|| validation_error!("files must be sent as multipart/form-data"))?;
        let form = parse_multipart(ct, body).await?;

        let session = self.sessions.get(id)?;
        let mut controller = session.lock().await;
        controller.stage_files(form.files)?;
        Ok(SessionView {
            session_id: id.to_string(),
            view: controller.view(),
        })
    }

    pub async fn save_draft(&self, id: &str) -> IntakeResult<SessionSave> {
        let session = self.sessions.get(id)?;
        let mut controller = session.lock().await;
        let entry = controller.save_draft().await?;
        Ok(SessionSave {
            success: true,
            id: entry.id.clone(),
            entry,
            view: controller.view(),
        })
    }

    /// Final submit. A session already busy with another operation answers
    /// with a conflict instead of queueing a second submission.
    pub async fn submit(&self, id: &str) -> IntakeResult<SessionSave> {
        let session = self.sessions.get(id)?;
        let mut controller = session.try_lock()?;
        let entry = controller.submit().await?;
        info!("Session {id} submitted {}", entry.id);
        Ok(SessionSave {
            success: true,
            id: entry.id.clone(),
            entry,
            view: controller.view(),
        })
    }

    pub async fn load_record(
        &self,
        id: &str,
        record_id: &str,
        locator: Option<&str>,
    ) -> IntakeResult<SessionView> {
        let record = self.record(record_id).await?;
        let locator = locator
            .map(str::to_string)
            .unwrap_or_else(|| self.sessions.workflow_config().new_request_locator());

        let session = self.sessions.get(id)?;
        let mut controller = session.lock().await;
        controller.load_record(&locator, &record).await?;
        Ok(SessionView {
            session_id: id.to_string(),
            view: controller.view(),
        })
    }
}

fn parse_status(raw: Option<&str>) -> IntakeResult<Option<RequestStatus>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

fn json_text(value: JsonValue) -> String {
    FieldValue::from(value).display_text()
}

/// Split a JSON object body into payload and request metadata.
fn json_request(body: &[u8]) -> IntakeResult<NewRequest> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| validation_error!("request body must be a JSON object: {}", e))?;
    let JsonValue::Object(object) = value else {
        return Err(validation_error!("request body must be a JSON object"));
    };

    let mut body = SubmissionPayload::new();
    let mut original_id = None;
    let mut status = None;
    for (key, value) in object {
        if ORIGINAL_ID_KEYS.contains(&key.as_str()) {
            original_id = Some(json_text(value)).filter(|s| !s.trim().is_empty());
        } else if key == STATUS_KEY {
            status = Some(json_text(value));
        } else {
            body.insert(key, FieldValue::from(value));
        }
    }

    Ok(NewRequest {
        body,
        status: parse_status(status.as_deref())?,
        original_id,
        uploads: Vec::new(),
    })
}

fn parse_json_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> IntakeResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| validation_error!("invalid JSON body: {}", e))
}

#[async_trait]
trait Handler {
    async fn handle(
        &self,
        api: &IntakeApi,
        session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>>;
}

fn param<'a>(params: &'a BTreeMap<String, String>, name: &str) -> IntakeResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| IntakeError::Internal(format!("route parameter {name} missing")))
}

pub struct IntakeHttpApp {
    api: Arc<IntakeApi>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
}

impl IntakeHttpApp {
    pub fn new(api: Arc<IntakeApi>) -> Self {
        let mut this = Self {
            api,
            router: Router::new(),
        };

        this.route("/api/schemas", Method::GET, Box::new(ListSchemasHandler))
            .route("/formSchemas/{*path}", Method::GET, Box::new(GetSchemaHandler))
            .route("/api/requests", Method::GET, Box::new(ListRequestsHandler))
            .route("/api/requests", Method::POST, Box::new(CreateRequestHandler))
            .route("/uploads/{name}", Method::GET, Box::new(GetUploadHandler))
            .route(
                "/api/generate_rfp/{id}",
                Method::POST,
                Box::new(GenerateRfpHandler),
            )
            .route("/data/rfps/{name}", Method::GET, Box::new(GetRfpHandler))
            .route("/api/sessions", Method::POST, Box::new(CreateSessionHandler))
            .route("/api/sessions/{id}", Method::GET, Box::new(GetSessionHandler))
            .route(
                "/api/sessions/{id}",
                Method::DELETE,
                Box::new(DeleteSessionHandler),
            )
            .route(
                "/api/sessions/{id}/fields/{name}",
                Method::PUT,
                Box::new(UpdateFieldHandler),
            )
            .route(
                "/api/sessions/{id}/files",
                Method::POST,
                Box::new(StageFilesHandler),
            )
            .route(
                "/api/sessions/{id}/draft",
                Method::POST,
                Box::new(SaveDraftHandler),
            )
            .route(
                "/api/sessions/{id}/submit",
                Method::POST,
                Box::new(SubmitHandler),
            )
            .route(
                "/api/sessions/{id}/load/{record_id}",
                Method::POST,
                Box::new(LoadRecordHandler),
            );

        this
    }

    /// Register a handler for a path and method
    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        if let Ok(routes) = self.router.at_mut(path) {
            routes.value.insert(method, handler);
        } else {
            let mut handlers = HashMap::new();
            handlers.insert(method, handler);
            if let Err(e) = self.router.insert(path, handlers) {
                log::error!("Unable to register route {path}: {e}");
            }
        }
        self
    }

    pub fn intake_http_service(cfg: &Formdesk, api: Arc<IntakeApi>) -> IntakeResult<Service<Self>> {
        let app = Self::new(api);
        let mut service = Service::new("Intake HTTP".to_string(), app);

        for listener in &cfg.listeners {
            let addr = listener.address.to_string();
            match &listener.tls {
                Some(Tls {
                    cert_path,
                    key_path,
                }) => {
                    let mut settings = TlsSettings::intermediate(cert_path, key_path)
                        .with_context("Adding TLS listener")?;
                    if listener.offer_h2 {
                        settings.enable_h2();
                    }
                    service.add_tls_with_settings(&addr, None, settings);
                }
                None => service.add_tcp(&addr),
            }
            info!("Intake API listening on {addr}");
        }

        Ok(service)
    }
}

#[async_trait]
impl ServeHttp for IntakeHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let result = match decode_path_params(params.iter()) {
                        Ok(params) => handler.handle(&self.api, http_session, params).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(resp) => resp,
                        Err(e) => {
                            if e.status_code().is_server_error() {
                                warn!("{method} {path} failed: {e}");
                            }
                            ResponseBuilder::from_error(&e)
                        }
                    }
                }
                None => CommonErrors::method_not_allowed(),
            },
            Err(_) => CommonErrors::not_found(),
        }
    }
}

struct ListSchemasHandler;

#[async_trait]
impl Handler for ListSchemasHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        Ok(ResponseBuilder::success_json(&api.list_schemas().await))
    }
}

struct GetSchemaHandler;

#[async_trait]
impl Handler for GetSchemaHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let schema = api.schema(param(&params, "path")?).await?;
        Ok(ResponseBuilder::success_json(&schema))
    }
}

struct ListRequestsHandler;

#[async_trait]
impl Handler for ListRequestsHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let descending = get_query_value(&http_session.req_header().uri, "order")
            .is_some_and(|order| order.eq_ignore_ascii_case("desc"));
        Ok(ResponseBuilder::success_json(
            &api.list_requests(descending).await?,
        ))
    }
}

struct CreateRequestHandler;

#[async_trait]
impl Handler for CreateRequestHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let content_type = get_content_type(http_session);
        let body = read_request_body(http_session, api.max_body_size).await?;
        let created = api.create_request(content_type.as_deref(), body).await?;
        Ok(ResponseBuilder::success_json(&created))
    }
}

struct GetUploadHandler;

#[async_trait]
impl Handler for GetUploadHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let name = param(&params, "name")?;
        let data = api.upload(name).await?;
        Ok(ResponseBuilder::success_http(
            data,
            Some(content_type::for_file_name(name)),
        ))
    }
}

struct GenerateRfpHandler;

#[async_trait]
impl Handler for GenerateRfpHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let generated = api.generate_rfp(param(&params, "id")?).await?;
        Ok(ResponseBuilder::success_json(&generated))
    }
}

struct GetRfpHandler;

#[async_trait]
impl Handler for GetRfpHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let data = api.rfp(param(&params, "name")?).await?;
        Ok(ResponseBuilder::success_http(
            data,
            Some(content_type::TEXT_PLAIN),
        ))
    }
}

struct CreateSessionHandler;

#[async_trait]
impl Handler for CreateSessionHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let body = read_request_body(http_session, api.max_body_size).await?;
        let LocatorBody { locator } = parse_json_or_default(&body)?;
        let created = api.create_session(locator.as_deref()).await?;
        Ok(ResponseBuilder::json(StatusCode::CREATED, &created))
    }
}

struct GetSessionHandler;

#[async_trait]
impl Handler for GetSessionHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let view = api.session_view(param(&params, "id")?).await?;
        Ok(ResponseBuilder::success_json(&view))
    }
}

struct DeleteSessionHandler;

#[async_trait]
impl Handler for DeleteSessionHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        api.close_session(param(&params, "id")?)?;
        Ok(ResponseBuilder::with_status(
            StatusCode::NO_CONTENT,
            Vec::new(),
            None,
        ))
    }
}

struct UpdateFieldHandler;

#[async_trait]
impl Handler for UpdateFieldHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let body = read_request_body(http_session, api.max_body_size).await?;
        let update: FieldUpdate = serde_json::from_slice(&body).map_err(|e| {
            validation_error!("expected {{\"value\"}} or {{\"option\", \"checked\"}}: {}", e)
        })?;
        let view = api
            .update_field(param(&params, "id")?, param(&params, "name")?, update)
            .await?;
        Ok(ResponseBuilder::success_json(&view))
    }
}

struct StageFilesHandler;

#[async_trait]
impl Handler for StageFilesHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let content_type = get_content_type(http_session);
        let body = read_request_body(http_session, api.max_body_size).await?;
        let view = api
            .stage_files(param(&params, "id")?, content_type.as_deref(), body)
            .await?;
        Ok(ResponseBuilder::success_json(&view))
    }
}

struct SaveDraftHandler;

#[async_trait]
impl Handler for SaveDraftHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let saved = api.save_draft(param(&params, "id")?).await?;
        Ok(ResponseBuilder::success_json(&saved))
    }
}

struct SubmitHandler;

#[async_trait]
impl Handler for SubmitHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let saved = api.submit(param(&params, "id")?).await?;
        Ok(ResponseBuilder::success_json(&saved))
    }
}

struct LoadRecordHandler;

#[async_trait]
impl Handler for LoadRecordHandler {
    async fn handle(
        &self,
        api: &IntakeApi,
        http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> IntakeResult<Response<Vec<u8>>> {
        let body = read_request_body(http_session, api.max_body_size).await?;
        let LocatorBody { locator } = parse_json_or_default(&body)?;
        let view = api
            .load_record(
                param(&params, "id")?,
                param(&params, "record_id")?,
                locator.as_deref(),
            )
            .await?;
        Ok(ResponseBuilder::success_json(&view))
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use super::*;
    use crate::{
        schema::SchemaCatalog,
        store::MemoryRequestStore,
        utils::multipart::tests::{content_type as multipart_type, encode},
        workflow::{WorkflowConfig, WorkflowState},
    };

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn api(dir: &Path) -> IntakeApi {
        let _ = env_logger::builder().is_test(true).try_init();
        let schema_dir = dir.join("formSchemas");
        write(
            &schema_dir,
            "new_request.json",
            r#"{
                "title": "New Request",
                "controls": {"allowUpload": true},
                "fields": [
                    {"name": "projectName", "required": true},
                    {"name": "requestType", "type": "select", "options": ["Commercial"]},
                    {"name": "serviceNeeded", "type": "select", "options": ["Packaging", "Testing"]},
                    {"name": "markets", "type": "checkbox", "options": ["US", "EU"]}
                ]
            }"#,
        );
        write(
            &schema_dir,
            "subforms/Commercial_Packaging.json",
            r#"{"fields": [{"name": "units", "required": true}]}"#,
        );
        write(&schema_dir, "broken.json", r#"{"fields": [{"name": "a"}, {"name": "a"}]}"#);

        let schemas: Arc<dyn SchemaSource> = Arc::new(SchemaCatalog::new(&schema_dir, "subforms"));
        let store: Arc<dyn RequestStore> = Arc::new(MemoryRequestStore::new());
        let sessions = Arc::new(SessionRegistry::new(
            schemas.clone(),
            store.clone(),
            WorkflowConfig::default(),
            Duration::from_secs(600),
        ));
        IntakeApi::new(
            schemas,
            store,
            UploadDir::new(dir.join("uploads")),
            RfpArchive::new(dir.join("data/rfps")),
            sessions,
            1024 * 1024,
        )
    }

    #[tokio::test]
    async fn test_schema_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let ids: Vec<String> = api.list_schemas().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["broken".to_string(), "new_request".to_string()]);

        assert_eq!(api.schema("new_request.json").await.unwrap().fields.len(), 4);
        let err = api.schema("broken.json").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let err = api.schema("nope.json").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_request_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let body = encode(
            &[
                ("projectName", "Alpha"),
                ("markets", "US"),
                ("markets", "EU"),
                ("status", "draft"),
            ],
            &[("files", "spec sheet.pdf", b"%PDF")],
        );
        let created = api
            .create_request(Some(&multipart_type()), Bytes::from(body))
            .await
            .unwrap();
        assert!(created.success);
        assert_eq!(created.entry.status, Some(RequestStatus::Draft));
        assert_eq!(
            created.entry.body.get("markets"),
            Some(&FieldValue::choices(["US", "EU"]))
        );
        assert!(created.entry.body.get("status").is_none());
        assert_eq!(created.entry.files.len(), 1);
        assert!(created.entry.files[0].storage_path.ends_with("_spec_sheet.pdf"));

        let continued = encode(
            &[("projectName", "Alpha"), ("originalId", &created.id)],
            &[],
        );
        let next = api
            .create_request(Some(&multipart_type()), Bytes::from(continued))
            .await
            .unwrap();
        assert_eq!(next.entry.original_id.as_deref(), Some(created.id.as_str()));
        assert!(next.entry.status.is_none());

        let all = api.list_requests(false).await.unwrap();
        assert_eq!(all.len(), 2);
        let newest_first = api.list_requests(true).await.unwrap();
        assert_eq!(newest_first[0].id, next.id);
    }

    #[tokio::test]
    async fn test_create_request_json() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let created = api
            .create_request(
                Some("application/json"),
                Bytes::from_static(
                    br#"{"projectName": "Beta", "markets": "[\"US\"]", "original_id": "REQ-1", "status": "submitted"}"#,
                ),
            )
            .await
            .unwrap();
        assert_eq!(created.entry.original_id.as_deref(), Some("REQ-1"));
        assert_eq!(created.entry.status, Some(RequestStatus::Submitted));
        assert_eq!(created.entry.body.len(), 2);

        for body in [
            &br#"{"status": "archived"}"#[..],
            br#"["not", "an", "object"]"#,
            b"garbage",
        ] {
            let err = api
                .create_request(Some("application/json"), Bytes::copy_from_slice(body))
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_rfp_generation() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let created = api
            .create_request(None, Bytes::from_static(br#"{"projectName": "Gamma"}"#))
            .await
            .unwrap();
        let generated = api.generate_rfp(&created.id).await.unwrap();
        assert_eq!(
            generated.download_url,
            format!("/data/rfps/{}_rfp.txt", created.id)
        );
        let name = generated.download_url.trim_start_matches("/data/rfps/");
        let text = String::from_utf8(api.rfp(name).await.unwrap()).unwrap();
        assert!(text.contains("Project Name: Gamma"));

        assert!(matches!(
            api.generate_rfp("REQ-404").await,
            Err(IntakeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_flow() {
        let dir = tempfile::tempdir().unwrap();
        let api = api(dir.path());

        let created = api.create_session(None).await.unwrap();
        let id = created.session_id.clone();
        assert_eq!(created.view.state, WorkflowState::PrimaryLoaded);

        let set = |name: &'static str, value: &'static str| {
            let update = FieldUpdate::Value {
                value: JsonValue::String(value.to_string()),
            };
            (name, update)
        };
        for (name, update) in [
            set("projectName", "Alpha"),
            set("requestType", "Commercial"),
            set("serviceNeeded", "Packaging"),
        ] {
            api.update_field(&id, name, update).await.unwrap();
        }
        api.update_field(
            &id,
            "markets",
            FieldUpdate::Toggle {
                option: "EU".to_string(),
                checked: true,
            },
        )
        .await
        .unwrap();

        let files = encode(&[], &[("files", "brief.txt", b"hello")]);
        let staged = api
            .stage_files(&id, Some(&multipart_type()), Bytes::from(files))
            .await
            .unwrap();
        assert_eq!(staged.view.files.len(), 1);

        let draft = api.save_draft(&id).await.unwrap();
        assert_eq!(draft.view.state, WorkflowState::SubformLoaded);
        assert_eq!(draft.entry.files.len(), 1);

        let err = api.submit(&id).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        api.update_field(
            &id,
            "units",
            FieldUpdate::Value {
                value: serde_json::json!(250),
            },
        )
        .await
        .unwrap();
        let done = api.submit(&id).await.unwrap();
        assert_eq!(done.view.state, WorkflowState::Finalized);
        assert_eq!(done.entry.original_id.as_deref(), Some(draft.id.as_str()));
        assert_eq!(done.entry.body.text("units"), Some("250"));
        assert_eq!(
            done.entry.body.get("markets"),
            Some(&FieldValue::choices(["EU"]))
        );

        let reloaded = api.load_record(&id, &done.id, None).await.unwrap();
        assert_eq!(reloaded.view.state, WorkflowState::SubformLoaded);
        assert_eq!(reloaded.view.original_id.as_deref(), Some(done.id.as_str()));

        api.close_session(&id).unwrap();
        assert!(matches!(
            api.session_view(&id).await,
            Err(IntakeError::NotFound(_))
        ));
    }

    #[test]
    fn test_routes() {
        let dir = tempfile::tempdir().unwrap();
        let app = IntakeHttpApp::new(Arc::new(api(dir.path())));

        let matched = app.router.at("/formSchemas/subforms/A_B.json").unwrap();
        assert!(matched.value.contains_key(&Method::GET));
        assert_eq!(matched.params.get("path"), Some("subforms/A_B.json"));

        let matched = app.router.at("/api/requests").unwrap();
        assert!(matched.value.contains_key(&Method::GET));
        assert!(matched.value.contains_key(&Method::POST));

        let matched = app.router.at("/api/sessions/abc/load/REQ-1").unwrap();
        assert_eq!(matched.params.get("record_id"), Some("REQ-1"));
        assert!(app.router.at("/api/unknown").is_err());
    }

    #[test]
    fn test_field_update_shapes() {
        let toggle: FieldUpdate =
            serde_json::from_str(r#"{"option": "EU", "checked": false}"#).unwrap();
        assert!(matches!(toggle, FieldUpdate::Toggle { checked: false, .. }));
        let value: FieldUpdate = serde_json::from_str(r#"{"value": "x"}"#).unwrap();
        assert!(matches!(value, FieldUpdate::Value { .. }));
        assert!(serde_json::from_str::<FieldUpdate>(r#"{"other": 1}"#).is_err());
    }
}

use std::sync::Arc;

use pingora::services::background::background_service;
use pingora_core::server::{configuration::Opt, Server};

use formdesk::{
    config::Config,
    core::status::{self, Component},
    logging::{init_stderr_logger, Logger},
    rfp::RfpArchive,
    schema::{SchemaCatalog, SchemaSource},
    service::{
        api::{IntakeApi, IntakeHttpApp},
        sessions::{SessionReaper, SessionRegistry},
        status::StatusHttpApp,
    },
    store::{RequestLog, RequestStore, UploadDir},
};

fn exit_with(context: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("{context}: {e}");
    std::process::exit(1);
}

fn main() {
    // Read command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => exit_with("Error loading configuration", e),
    };
    let cfg = &config.formdesk;

    // Initialize logging
    let logger = if let Some(log_cfg) = &cfg.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        init_stderr_logger();
        None
    };

    log::info!("Opening schema catalog at {}...", cfg.schema_dir);
    if let Err(e) = std::fs::read_dir(&cfg.schema_dir) {
        exit_with(&format!("Unable to read schema dir {}", cfg.schema_dir), e);
    }
    let schemas: Arc<dyn SchemaSource> =
        Arc::new(SchemaCatalog::new(&cfg.schema_dir, &cfg.subform_dir));
    status::mark_ready(Component::SchemaCatalog);

    log::info!("Opening request log...");
    let (request_log, request_log_writer) =
        match RequestLog::open(cfg.request_log_path(), &cfg.upload_dir) {
            Ok(opened) => opened,
            Err(e) => exit_with("Failed to open request log", e),
        };
    let store: Arc<dyn RequestStore> = Arc::new(request_log);
    status::mark_ready(Component::RequestLog);

    let sessions = Arc::new(SessionRegistry::new(
        schemas.clone(),
        store.clone(),
        cfg.workflow(),
        cfg.session_idle_timeout(),
    ));
    let api = Arc::new(IntakeApi::new(
        schemas,
        store,
        UploadDir::new(&cfg.upload_dir),
        RfpArchive::new(cfg.rfp_dir()),
        sessions.clone(),
        cfg.max_body_size,
    ));

    log::info!("Adding listeners...");
    let intake_service = match IntakeHttpApp::intake_http_service(cfg, api) {
        Ok(service) => service,
        Err(e) => exit_with("Failed to add listeners", e),
    };
    let status_service = cfg.status.as_ref().map(StatusHttpApp::status_http_service);

    let mut formdesk_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        formdesk_server.add_service(log_service);
    }

    log::info!("Adding request log writer...");
    formdesk_server.add_service(request_log_writer);
    formdesk_server.add_service(background_service(
        "session reaper",
        SessionReaper::new(sessions),
    ));

    if let Some(status_service) = status_service {
        log::info!("Adding Status HTTP...");
        formdesk_server.add_service(status_service);
    }

    log::info!("Bootstrapping...");
    formdesk_server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    formdesk_server.add_service(intake_service);

    log::info!("Starting Server...");
    formdesk_server.run_forever();
}

use std::{
    fs,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::workflow::{Selectors, WorkflowConfig};

const REQUEST_LOG_FILE: &str = "requests.json";
const RFP_DIR: &str = "rfps";

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub formdesk: Formdesk,
}

// Config file load and validation
impl Config {
    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Formdesk {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[serde(default = "Formdesk::default_schema_dir")]
    pub schema_dir: String,
    #[validate(custom(function = "Formdesk::validate_subform_dir"))]
    #[serde(default = "Formdesk::default_subform_dir")]
    pub subform_dir: String,
    #[serde(default = "Formdesk::default_data_dir")]
    pub data_dir: String,
    #[serde(default = "Formdesk::default_upload_dir")]
    pub upload_dir: String,

    #[validate(length(min = 1))]
    #[serde(default = "Formdesk::default_new_request_schema")]
    pub new_request_schema: String,
    #[validate(nested)]
    #[serde(default)]
    pub selectors: SelectorNames,

    pub log: Option<Log>,
    pub status: Option<Status>,

    /// Seconds a session may stay untouched before it is evicted
    #[validate(range(min = 1))]
    #[serde(default = "Formdesk::default_session_idle_timeout")]
    pub session_idle_timeout: u64,
    #[validate(range(min = 1))]
    #[serde(default = "Formdesk::default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for Formdesk {
    fn default() -> Self {
        Self {
            listeners: vec![],
            schema_dir: Self::default_schema_dir(),
            subform_dir: Self::default_subform_dir(),
            data_dir: Self::default_data_dir(),
            upload_dir: Self::default_upload_dir(),
            new_request_schema: Self::default_new_request_schema(),
            selectors: SelectorNames::default(),
            log: None,
            status: None,
            session_idle_timeout: Self::default_session_idle_timeout(),
            max_body_size: Self::default_max_body_size(),
        }
    }
}

impl Formdesk {
    fn default_schema_dir() -> String {
        "public/formSchemas".to_string()
    }

    fn default_subform_dir() -> String {
        "subforms".to_string()
    }

    fn default_data_dir() -> String {
        "data".to_string()
    }

    fn default_upload_dir() -> String {
        "uploads".to_string()
    }

    fn default_new_request_schema() -> String {
        "new_request".to_string()
    }

    fn default_session_idle_timeout() -> u64 {
        3600
    }

    fn default_max_body_size() -> usize {
        50 * 1024 * 1024
    }

    fn validate_subform_dir(dir: &str) -> Result<(), ValidationError> {
        let path = Path::new(dir);
        let plain = !dir.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if plain {
            Ok(())
        } else {
            Err(ValidationError::new("subform_dir_must_be_relative"))
        }
    }

    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig {
            new_request_schema: self.new_request_schema.clone(),
            selectors: Selectors {
                request_type: self.selectors.request_type.clone(),
                service_needed: self.selectors.service_needed.clone(),
            },
        }
    }

    pub fn request_log_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(REQUEST_LOG_FILE)
    }

    pub fn rfp_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join(RFP_DIR)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// Primary field names whose values pick the subform.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "SelectorNames::validate_distinct"))]
pub struct SelectorNames {
    #[validate(length(min = 1))]
    pub request_type: String,
    #[validate(length(min = 1))]
    pub service_needed: String,
}

impl Default for SelectorNames {
    fn default() -> Self {
        let Selectors {
            request_type,
            service_needed,
        } = Selectors::default();
        Self {
            request_type,
            service_needed,
        }
    }
}

impl SelectorNames {
    fn validate_distinct(&self) -> Result<(), ValidationError> {
        if self.request_type == self.service_needed {
            Err(ValidationError::new("selectors_must_differ"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

//! Form-driven service request intake.
//!
//! Schemas are read from a directory of JSON documents, rendered into editable field
//! sets, walked through a draft/submit workflow and appended to a request log.

pub mod config;
pub mod core;
pub mod form;
pub mod logging;
pub mod rfp;
pub mod schema;
pub mod service;
pub mod store;
pub mod utils;
pub mod workflow;

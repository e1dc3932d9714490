pub mod api;
pub mod sessions;
pub mod status;

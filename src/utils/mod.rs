pub mod multipart;
pub mod request;
pub mod response;

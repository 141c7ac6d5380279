pub mod archive;
pub mod config;
pub mod upload_limits;

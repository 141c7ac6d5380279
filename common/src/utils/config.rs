use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Service settings, read from an optional `config` file and the environment.
///
/// `image/avif` is always on the upload allow-list, but decoding it needs a
/// binary built with the `avif-native` feature (`cargo build -F avif-native`).
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_public_base_url: Option<String>,
    #[serde(default = "default_upload_max_bytes")]
    pub upload_max_bytes: u64,
    #[serde(default = "default_upload_max_files")]
    pub upload_max_files: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_job_ttl_hours")]
    pub job_ttl_hours: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_upload_max_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_upload_max_files() -> usize {
    20
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_job_ttl_hours() -> i64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "compressor".to_string(),
            surrealdb_database: "compressor".to_string(),
            data_dir: default_data_dir(),
            http_port: 3000,
            storage: default_storage_kind(),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_public_base_url: None,
            upload_max_bytes: default_upload_max_bytes(),
            upload_max_files: default_upload_max_files(),
            worker_concurrency: default_worker_concurrency(),
            job_ttl_hours: default_job_ttl_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Directory below `data_dir` where uploads and local outputs live.
pub const UPLOADS_DIR: &str = "uploads";
/// Key prefix for artifacts migrated to a remote backend.
pub const COMPRESSED_PREFIX: &str = "compressed";
/// Route that serves local artifacts over HTTP.
pub const LOCAL_FILES_ROUTE: &str = "/api/v1/compress/files";

/// Storage adapter over the configured object store.
///
/// A storage locator is what a job record keeps in `output_path`: an absolute
/// filesystem path for the local backend, the object key otherwise.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
    public_base_url: Option<String>,
}

impl StorageManager {
    /// Create a new StorageManager with the specified configuration.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
            public_base_url: public_base_url(cfg),
        })
    }

    /// Create a StorageManager with a custom storage backend.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            local_base: None,
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// True when artifacts must be migrated off the local disk.
    pub fn is_remote(&self) -> bool {
        matches!(self.backend_kind, StorageKind::S3)
    }

    /// Access the resolved local base directory when using the local backend.
    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    /// Resolve an object location to a filesystem path when using the local backend.
    ///
    /// Returns `None` when the backend is not local or when the provided location includes
    /// unsupported components (absolute paths or parent traversals).
    pub fn resolve_local_path(&self, location: &str) -> Option<PathBuf> {
        let base = self.local_base_path()?;
        let relative = Path::new(location);
        if !is_plain_relative(relative) {
            return None;
        }

        Some(base.join(relative))
    }

    /// Stores `data` under `key` and returns its locator.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<String, AppError> {
        let path = self.object_path(key)?;
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await?;

        Ok(self.locator_for(key))
    }

    /// Copies a local file into the backend under `destination_key`.
    #[tracing::instrument(skip(self), fields(backend = ?self.backend_kind))]
    pub async fn save(&self, source: &Path, destination_key: &str) -> Result<String, AppError> {
        let data = tokio::fs::read(source).await?;
        self.put(destination_key, Bytes::from(data)).await
    }

    /// Reads the full object behind a locator.
    pub async fn get_buffer(&self, locator: &str) -> Result<Bytes, AppError> {
        let path = self.object_path(locator)?;
        let result = self.store.get(&path).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => {
                AppError::NotFound(format!("No stored object at {locator}"))
            }
            other => AppError::Storage(other),
        })?;

        Ok(result.bytes().await?)
    }

    /// Removes the object behind a locator. A missing object counts as removed.
    pub async fn delete(&self, locator: &str) -> Result<(), AppError> {
        let path = self.object_path(locator)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(AppError::Storage(err)),
        }
    }

    /// Public URL for an artifact.
    pub fn get_url(&self, locator: &str) -> String {
        match self.backend_kind {
            StorageKind::Local => {
                let file_name = Path::new(locator)
                    .file_name()
                    .map_or_else(|| locator.to_string(), |name| name.to_string_lossy().into_owned());
                format!("{LOCAL_FILES_ROUTE}/{file_name}")
            }
            StorageKind::S3 => match &self.public_base_url {
                Some(base) => format!("{base}/{locator}"),
                None => locator.to_string(),
            },
            StorageKind::Memory => format!("memory://{locator}"),
        }
    }

    /// Locator of a local artifact addressed by bare file name, as served by the files route.
    pub fn local_file_locator(&self, file_name: &str) -> Option<String> {
        let name = Path::new(file_name);
        if name.components().count() != 1 || !is_plain_relative(name) {
            return None;
        }
        self.resolve_local_path(&format!("{UPLOADS_DIR}/{file_name}"))
            .map(|path| path.to_string_lossy().into_owned())
    }

    fn locator_for(&self, key: &str) -> String {
        match &self.local_base {
            Some(base) if matches!(self.backend_kind, StorageKind::Local) => {
                base.join(key).to_string_lossy().into_owned()
            }
            _ => key.to_string(),
        }
    }

    /// Maps a locator onto the backend's key space. Local absolute paths must sit
    /// below the storage root.
    fn object_path(&self, locator: &str) -> Result<ObjPath, AppError> {
        let candidate = Path::new(locator);

        if candidate.is_absolute() {
            let base = self
                .local_base
                .as_deref()
                .filter(|_| matches!(self.backend_kind, StorageKind::Local))
                .ok_or_else(|| {
                    AppError::Validation(format!("Absolute locator {locator} needs local storage"))
                })?;
            let relative = candidate.strip_prefix(base).map_err(|_| {
                AppError::Validation(format!("Locator {locator} is outside the storage root"))
            })?;
            return relative_object_path(relative, locator);
        }

        relative_object_path(candidate, locator)
    }
}

fn is_plain_relative(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn relative_object_path(relative: &Path, locator: &str) -> Result<ObjPath, AppError> {
    if !is_plain_relative(relative) {
        return Err(AppError::Validation(format!(
            "Unsupported storage locator {locator}"
        )));
    }

    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    Ok(ObjPath::from(joined))
}

fn public_base_url(cfg: &AppConfig) -> Option<String> {
    if let Some(url) = &cfg.s3_public_base_url {
        return Some(url.trim_end_matches('/').to_string());
    }

    match (&cfg.s3_bucket, &cfg.s3_region) {
        (Some(bucket), Some(region)) if cfg.s3_endpoint.is_none() => {
            Some(format!("https://{bucket}.s3.{region}.amazonaws.com"))
        }
        (Some(bucket), _) => cfg
            .s3_endpoint
            .as_ref()
            .map(|endpoint| format!("{}/{bucket}", endpoint.trim_end_matches('/'))),
        _ => None,
    }
}

/// Create a storage backend based on configuration.
async fn create_storage_backend(
    cfg: &AppConfig,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::S3 => {
            let bucket = cfg.s3_bucket.clone().ok_or_else(|| object_store::Error::Generic {
                store: "S3",
                source: "s3_bucket must be set when storage = s3".into(),
            })?;
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &cfg.s3_region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &cfg.s3_endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            Ok((Arc::new(builder.build()?), None))
        }
        StorageKind::Memory => {
            let store = InMemory::new();
            Ok((Arc::new(store), None))
        }
    }
}

/// Absolute form of `data_dir`.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    let configured = Path::new(&cfg.data_dir);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(configured)
    }
}

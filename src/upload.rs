use std::future::Future;
use std::path::{Path, PathBuf};

use base64::Engine;
use log::{error, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::StorageSettings;
use crate::error::{RelayError, Result};

static DATA_URL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:(image/\w+);base64,").expect("static regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl DecodedImage {
    pub fn extension(&self) -> &str {
        match self.mime.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

/// Strip the `data:image/<kind>;base64,` prefix and decode. A bare base64
/// payload is treated as PNG.
pub fn decode_data_url(data_url: &str) -> Result<DecodedImage> {
    let trimmed = data_url.trim();
    let (mime, payload) = match DATA_URL_PREFIX.captures(trimmed) {
        Some(caps) => {
            let prefix_len = caps.get(0).map(|m| m.end()).unwrap_or(0);
            (caps[1].to_string(), &trimmed[prefix_len..])
        }
        None => ("image/png".to_string(), trimmed),
    };

    if payload.is_empty() {
        return Err(RelayError::bad_request("Image payload is empty"));
    }

    let bytes = base64::prelude::BASE64_STANDARD
        .decode(payload)
        .map_err(|e| RelayError::bad_request(format!("Image is not valid base64: {}", e)))?;

    Ok(DecodedImage { mime, bytes })
}

/// Blob storage that hands back a publicly fetchable URL.
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

fn join_url(base: &str, key: &str) -> String {
    let encoded = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", base.trim_end_matches('/'), encoded)
}

/// Reject keys that could escape the store root.
fn checked_key(key: &str) -> Result<&str> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|s| s.is_empty() || s == "." || s == "..")
        || key.contains('\\');
    if bad {
        Err(RelayError::bad_request(format!("Invalid object key: {}", key)))
    } else {
        Ok(key)
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_key(key)?))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::read(path).await?)
    }
}

impl ObjectStore for LocalDirStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RelayError::upload(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| RelayError::upload(format!("{}: {}", path.display(), e)))?;
        Ok(join_url(&self.public_base_url, key))
    }
}

#[derive(Clone)]
pub struct HttpPutStore {
    client: reqwest::Client,
    endpoint: String,
    public_base_url: String,
    token: Option<String>,
}

impl HttpPutStore {
    pub fn new(endpoint: String, public_base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            public_base_url,
            token,
        }
    }
}

impl ObjectStore for HttpPutStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let key = checked_key(key)?;
        let mut request = self
            .client
            .put(join_url(&self.endpoint, key))
            .header("Content-Type", content_type)
            .header("Cache-Control", "public, max-age=3600");

        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|e| RelayError::upload(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RelayError::upload(format!("HTTP {}: {}", status, error_text)));
        }

        Ok(join_url(&self.public_base_url, key))
    }
}

/// The configured backend.
#[derive(Clone)]
pub enum Storage {
    Local(LocalDirStore),
    Http(HttpPutStore),
}

impl Storage {
    /// `fallback_public_base` is used for a local store without an explicit
    /// public URL, normally the relay's own `/uploads` route.
    pub fn from_settings(settings: &StorageSettings, fallback_public_base: &str) -> Self {
        match settings {
            StorageSettings::Local {
                dir,
                public_base_url,
                ..
            } => Storage::Local(LocalDirStore::new(
                dir,
                public_base_url
                    .clone()
                    .unwrap_or_else(|| fallback_public_base.to_string()),
            )),
            StorageSettings::Http {
                endpoint,
                public_base_url,
                token,
                ..
            } => Storage::Http(HttpPutStore::new(
                endpoint.clone(),
                public_base_url.clone(),
                token.clone(),
            )),
        }
    }

    pub fn local(&self) -> Option<&LocalDirStore> {
        match self {
            Storage::Local(store) => Some(store),
            Storage::Http(_) => None,
        }
    }
}

impl ObjectStore for Storage {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        match self {
            Storage::Local(store) => store.put(key, bytes, content_type).await,
            Storage::Http(store) => store.put(key, bytes, content_type).await,
        }
    }
}

/// Decodes uploaded canvas images and writes them to the object store.
#[derive(Clone)]
pub struct ImageRelay<S> {
    store: S,
    key_prefix: String,
}

impl<S: ObjectStore> ImageRelay<S> {
    pub fn new(store: S, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn object_key(&self, extension: &str) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}/{}-{}.{}",
            self.key_prefix.trim_matches('/'),
            millis,
            &suffix[..8],
            extension
        )
    }

    pub async fn upload_data_url(&self, data_url: &str) -> Result<String> {
        let image = decode_data_url(data_url).map_err(|e| {
            error!("Error decoding image: {}", e);
            RelayError::upload(e.to_string())
        })?;
        let key = self.object_key(image.extension());
        let size = image.bytes.len();

        match self.store.put(&key, image.bytes, &image.mime).await {
            Ok(url) => {
                info!("Uploaded {} ({} bytes) to {}", key, size, url);
                Ok(url)
            }
            Err(e) => {
                error!("Error uploading image {}: {}", key, e);
                Err(match e {
                    RelayError::Upload(_) => e,
                    other => RelayError::upload(other.to_string()),
                })
            }
        }
    }
}

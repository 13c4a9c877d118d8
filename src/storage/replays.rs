//! Replay publication to write-once blob storage.
//!
//! A replay is written under a fresh random name and its public URL is
//! returned only after the store has acknowledged the write as durable:
//!
//! - **Filesystem**: `create_new` + `write_all` + `sync_all` on the file and
//!   its directory
//! - **HTTP object store**: `PUT` that must come back 2xx
//!
//! No commit may happen before `publish` returns. Every write is bounded by
//! the publisher's timeout so a hung store fails the match instead of holding
//! its lease forever.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ReplayStoreConfig;
use crate::error::StorageError;
use crate::execution::ReplayArtifact;

/// Default key prefix for replay objects.
pub const REPLAY_PREFIX: &str = "replays";

/// Default bound on one replay write.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

/// Write-once object store with durable-completion acknowledgment.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `data` under `name`.
    ///
    /// Returns only once the store reports the object durable. Fails with
    /// `StorageError::AlreadyExists` rather than overwriting.
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Returns the public URL for `name`.
    fn public_url(&self, name: &str) -> String;
}

/// Rejects names that could escape the store root.
fn validate_name(name: &str) -> Result<(), StorageError> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Blob store on a local or mounted filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`, served at `public_base_url`.
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    /// Returns the on-disk path for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        validate_name(name)?;
        let path = self.path_for(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(name.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        // Persist the directory entry as well as the contents.
        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            fs::File::open(parent).await?.sync_all().await?;
        }

        debug!(path = %path.display(), bytes = data.len(), "Replay file synced");
        Ok(())
    }

    fn public_url(&self, name: &str) -> String {
        join_url(&self.public_base_url, name)
    }
}

/// Blob store behind an authenticated HTTP `PUT` endpoint.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    upload_base_url: String,
    public_base_url: String,
    bearer_token: String,
}

impl HttpBlobStore {
    /// Creates an HTTP store whose requests give up after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::MissingCredentials` if the token is empty, or
    /// `StorageError::Http` if the client cannot be built.
    pub fn new(
        upload_base_url: impl Into<String>,
        public_base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let bearer_token = bearer_token.into();
        if bearer_token.is_empty() {
            return Err(StorageError::MissingCredentials(
                "object store bearer token is empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            upload_base_url: upload_base_url.into(),
            public_base_url: public_base_url.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        validate_name(name)?;
        let url = join_url(&self.upload_base_url, name);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.bearer_token)
            .header(CONTENT_TYPE, "application/json")
            .header(IF_NONE_MATCH, "*")
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Rejected {
            name: name.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    fn public_url(&self, name: &str) -> String {
        join_url(&self.public_base_url, name)
    }
}

/// Builds the store described by configuration.
///
/// # Errors
///
/// Returns `StorageError::MissingCredentials` for an HTTP store without a token.
pub fn blob_store_from_config(
    config: &ReplayStoreConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn BlobStore>, StorageError> {
    match config {
        ReplayStoreConfig::Filesystem {
            root,
            public_base_url,
        } => Ok(Arc::new(FsBlobStore::new(root.clone(), public_base_url.clone()))),
        ReplayStoreConfig::Http {
            upload_base_url,
            public_base_url,
            bearer_token,
        } => {
            let token = bearer_token.clone().ok_or_else(|| {
                StorageError::MissingCredentials("REPLAY_STORE_TOKEN is not set".to_string())
            })?;
            Ok(Arc::new(HttpBlobStore::new(
                upload_base_url.clone(),
                public_base_url.clone(),
                token,
                request_timeout,
            )?))
        }
    }
}

/// A replay that has been durably stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedReplay {
    /// Object name within the store.
    pub name: String,
    /// Retrievable URL recorded on the match.
    pub url: String,
    /// SHA-256 of the stored bytes, hex encoded.
    pub checksum: String,
    pub size_bytes: u64,
}

/// Serializes replays and writes them to a [`BlobStore`].
#[derive(Clone)]
pub struct ReplayPublisher {
    store: Arc<dyn BlobStore>,
    prefix: String,
    timeout: Duration,
}

impl ReplayPublisher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            prefix: REPLAY_PREFIX.to_string(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bounds how long one write may take before the publish fails.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the key prefix for replay objects.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Writes the replay under a fresh random name and returns its URL.
    ///
    /// Resolves only after the store acknowledges the write as durable.
    /// Fails with `StorageError::Timeout` if that takes longer than the
    /// publisher's timeout.
    pub async fn publish(&self, artifact: &ReplayArtifact) -> Result<PublishedReplay, StorageError> {
        let name = self.generate_name();
        let bytes = artifact.as_bytes().to_vec();
        let checksum = compute_checksum(&bytes);
        let size_bytes = bytes.len() as u64;

        tokio::time::timeout(self.timeout, self.store.put(&name, bytes))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))??;

        let url = self.store.public_url(&name);
        info!(name = %name, size_bytes = size_bytes, checksum = %checksum, "Replay published");

        Ok(PublishedReplay {
            name,
            url,
            checksum,
            size_bytes,
        })
    }

    fn generate_name(&self) -> String {
        let file = format!("{}.json", Uuid::new_v4().simple());
        if self.prefix.is_empty() {
            file
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), file)
        }
    }
}

/// Computes the SHA-256 checksum of data.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn artifact() -> ReplayArtifact {
        ReplayArtifact::from_document(json!({"winner": 0, "turns": [[1, 2], [3, 4]]}))
            .expect("artifact")
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("replays/abc.json").is_ok());
        assert!(validate_name("abc.json").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("/abs.json").is_err());
        assert!(validate_name("replays/../../x").is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://storage.example.org/battlehack/", "replays/a.json"),
            "https://storage.example.org/battlehack/replays/a.json"
        );
        assert_eq!(join_url("https://x", "a.json"), "https://x/a.json");
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum(b"Hello, World!");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum(b"Hello, World!"));
        assert_ne!(checksum, compute_checksum(b"Different data"));
    }

    #[tokio::test]
    async fn test_publish_resolves_to_exact_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path(), "https://replays.example.org"));
        let publisher = ReplayPublisher::new(store.clone());
        let artifact = artifact();

        let published = publisher.publish(&artifact).await.expect("publish");

        assert!(published.name.starts_with("replays/"));
        assert!(published.name.ends_with(".json"));
        assert_eq!(
            published.url,
            format!("https://replays.example.org/{}", published.name)
        );
        assert_eq!(published.size_bytes, artifact.len() as u64);
        assert_eq!(published.checksum, compute_checksum(artifact.as_bytes()));

        let on_disk = std::fs::read(store.path_for(&published.name)).expect("read back");
        assert_eq!(on_disk, artifact.as_bytes());
    }

    #[tokio::test]
    async fn test_publish_generates_unique_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let publisher = ReplayPublisher::new(Arc::new(FsBlobStore::new(dir.path(), "http://x")))
            .with_prefix("scrims");
        let artifact = artifact();

        let mut names = HashSet::new();
        for _ in 0..20 {
            let published = publisher.publish(&artifact).await.expect("publish");
            assert!(published.name.starts_with("scrims/"));
            names.insert(published.name);
        }
        assert_eq!(names.len(), 20);
    }

    #[tokio::test]
    async fn test_fs_store_is_write_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "http://x");

        store
            .put("replays/fixed.json", b"first".to_vec())
            .await
            .expect("first write");
        let err = store
            .put("replays/fixed.json", b"second".to_vec())
            .await
            .expect_err("second write");

        assert!(matches!(err, StorageError::AlreadyExists(_)));
        let contents = std::fs::read(store.path_for("replays/fixed.json")).expect("read");
        assert_eq!(contents, b"first");
    }

    #[test]
    fn test_http_store_requires_token() {
        let err = HttpBlobStore::new("http://upload", "http://public", "", Duration::from_secs(5))
            .expect_err("no token");
        assert!(matches!(err, StorageError::MissingCredentials(_)));

        let config = ReplayStoreConfig::Http {
            upload_base_url: "http://upload".to_string(),
            public_base_url: "http://public".to_string(),
            bearer_token: None,
        };
        assert!(matches!(
            blob_store_from_config(&config, Duration::from_secs(5)),
            Err(StorageError::MissingCredentials(_))
        ));
    }

    /// Serves one HTTP request with `status` and returns the raw request.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_http_store_put_acknowledged() {
        let (base, server) = serve_once("HTTP/1.1 200 OK").await;
        let store = HttpBlobStore::new(
            &base,
            "https://public.example.org",
            "secret-token",
            Duration::from_secs(5),
        )
        .expect("store");

        store
            .put("replays/abc.json", b"{\"winner\":0}".to_vec())
            .await
            .expect("put");

        let request = server.await.expect("server");
        assert!(request.starts_with("PUT /replays/abc.json"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
        assert!(request.ends_with("{\"winner\":0}"));
        assert_eq!(
            store.public_url("replays/abc.json"),
            "https://public.example.org/replays/abc.json"
        );
    }

    #[tokio::test]
    async fn test_http_store_rejection() {
        let (base, server) = serve_once("HTTP/1.1 403 Forbidden").await;
        let store = HttpBlobStore::new(&base, "https://public", "token", Duration::from_secs(5))
            .expect("store");

        let err = store
            .put("replays/abc.json", b"{}".to_vec())
            .await
            .expect_err("rejected");
        server.await.expect("server");

        assert!(matches!(err, StorageError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_http_store_existing_object_not_overwritten() {
        let (base, server) = serve_once("HTTP/1.1 412 Precondition Failed").await;
        let store = HttpBlobStore::new(&base, "https://public", "token", Duration::from_secs(5))
            .expect("store");

        let err = store
            .put("replays/abc.json", b"{}".to_vec())
            .await
            .expect_err("already exists");
        let request = server.await.expect("server");

        assert!(request.to_ascii_lowercase().contains("if-none-match: *"));
        assert!(matches!(err, StorageError::AlreadyExists(name) if name == "replays/abc.json"));
    }

    /// Accepts connections and never answers them.
    async fn silent_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_http_store_gives_up_on_silent_server() {
        let (base, server) = silent_server().await;
        let store = HttpBlobStore::new(&base, "https://public", "token", Duration::from_millis(200))
            .expect("store");

        let started = std::time::Instant::now();
        let err = store
            .put("replays/abc.json", b"{}".to_vec())
            .await
            .expect_err("request timeout");
        server.abort();

        assert!(matches!(err, StorageError::Http(ref e) if e.is_timeout()), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Store whose writes never complete.
    struct StalledStore;

    #[async_trait]
    impl BlobStore for StalledStore {
        async fn put(&self, _name: &str, _data: Vec<u8>) -> Result<(), StorageError> {
            std::future::pending().await
        }

        fn public_url(&self, name: &str) -> String {
            join_url("http://x", name)
        }
    }

    #[tokio::test]
    async fn test_publish_times_out_on_stalled_store() {
        let publisher =
            ReplayPublisher::new(Arc::new(StalledStore)).with_timeout(Duration::from_millis(50));

        let err = publisher.publish(&artifact()).await.expect_err("timeout");

        assert!(matches!(err, StorageError::Timeout(d) if d == Duration::from_millis(50)));
    }
}

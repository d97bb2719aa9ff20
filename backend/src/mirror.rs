//! Distribution mirror client
//!
//! The template pipeline only needs to connect to a release site, log in and
//! stream named files. [`Mirror`] is that contract; [`HttpMirror`] implements
//! it over HTTP(S) with `reqwest`, treating the login as basic auth.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Archives that make up a base distribution, fetched in this order
pub const DIST_FILES: [&str; 3] = ["base.txz", "lib32.txz", "src.txz"];

/// Checksum listing published next to the archives
pub const MANIFEST: &str = "MANIFEST";

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Not connected to a mirror")]
    NotConnected,

    #[error("Invalid mirror site: {0}")]
    InvalidSite(String),

    #[error("Download failed: HTTP {status}: {url}")]
    Status { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No checksum for {0} in MANIFEST")]
    MissingChecksum(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

/// Stream of file contents returned by [`Mirror::fetch`]
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, MirrorError>> + Send>>;

/// A remote file source
pub trait Mirror: Send + Sync {
    fn connect(&mut self, site: &str) -> impl Future<Output = Result<(), MirrorError>> + Send;

    fn login(&mut self, user: &str, password: &str) -> impl Future<Output = Result<(), MirrorError>> + Send;

    /// Stream `remote_path`, relative to the connected site
    fn fetch(&self, remote_path: &str) -> impl Future<Output = Result<ByteStream, MirrorError>> + Send;
}

/// Path of a release file below the mirror root
///
/// Maps the architecture the way the FreeBSD release tree is laid out
/// (amd64 -> amd64/amd64, aarch64 -> arm64/aarch64).
pub fn release_path(architecture: &str, version: &str, file: &str) -> String {
    let arch_path = match architecture {
        "amd64" => "amd64/amd64",
        "i386" => "i386/i386",
        "aarch64" | "arm64" => "arm64/aarch64",
        other => other,
    };
    format!("{}/{}/{}", arch_path, version, file)
}

/// Stream `remote_path` into `dest`, returning the number of bytes written
pub async fn fetch_to_file<M: Mirror>(mirror: &M, remote_path: &str, dest: &Path) -> Result<u64, MirrorError> {
    let mut stream = mirror.fetch(remote_path).await?;
    let mut file = File::create(dest).await?;
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!("Fetched {} ({}) to {}", remote_path, bytes_to_mb(written), dest.display());
    Ok(written)
}

/// Fetch a small text file in full
pub async fn fetch_to_string<M: Mirror>(mirror: &M, remote_path: &str) -> Result<String, MirrorError> {
    let mut stream = mirror.fetch(remote_path).await?;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse a release MANIFEST into file name -> sha256.
///
/// Lines look like `base.txz<TAB>sha256<TAB>count<TAB>name<TAB>"desc"<TAB>on`.
pub fn parse_manifest(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let file = cols.next()?.trim();
            let sum = cols.next()?.trim();
            (!file.is_empty() && !sum.is_empty()).then(|| (file.to_string(), sum.to_lowercase()))
        })
        .collect()
}

/// SHA-256 of a file, hex encoded
pub async fn sha256_file(path: &Path) -> Result<String, MirrorError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok::<_, MirrorError>(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| MirrorError::Io(std::io::Error::other(e)))?
}

/// Compare `path` against its MANIFEST entry
pub async fn verify_checksum(manifest: &HashMap<String, String>, file: &str, path: &Path) -> Result<(), MirrorError> {
    let expected = manifest
        .get(file)
        .ok_or_else(|| MirrorError::MissingChecksum(file.to_string()))?;
    let actual = sha256_file(path).await?;

    if actual.eq_ignore_ascii_case(expected) {
        debug!("Checksum verified for {}", file);
        Ok(())
    } else {
        Err(MirrorError::ChecksumMismatch {
            file: file.to_string(),
            expected: expected.clone(),
            actual,
        })
    }
}

/// HTTP(S) mirror
#[derive(Debug, Clone)]
pub struct HttpMirror {
    client: Client,
    site: Option<Url>,
    credentials: Option<(String, String)>,
}

impl HttpMirror {
    pub fn new(timeout: Duration) -> Result<Self, MirrorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            site: None,
            credentials: None,
        })
    }

    fn url(&self, remote_path: &str) -> Result<Url, MirrorError> {
        let site = self.site.as_ref().ok_or(MirrorError::NotConnected)?;
        site.join(remote_path.trim_start_matches('/'))
            .map_err(|e| MirrorError::InvalidSite(format!("{}: {}", remote_path, e)))
    }
}

impl Mirror for HttpMirror {
    async fn connect(&mut self, site: &str) -> Result<(), MirrorError> {
        // A trailing slash makes Url::join append instead of replace
        let normalized = format!("{}/", site.trim_end_matches('/'));
        let url = Url::parse(&normalized).map_err(|e| MirrorError::InvalidSite(format!("{}: {}", site, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MirrorError::InvalidSite(site.to_string()));
        }
        debug!("Using mirror {}", url);
        self.site = Some(url);
        Ok(())
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), MirrorError> {
        if self.site.is_none() {
            return Err(MirrorError::NotConnected);
        }
        self.credentials = Some((user.to_string(), password.to_string()));
        Ok(())
    }

    async fn fetch(&self, remote_path: &str) -> Result<ByteStream, MirrorError> {
        let url = self.url(remote_path)?;
        info!("Downloading from: {}", url);

        let mut request = self.client.get(url.clone());
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(MirrorError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(MirrorError::from))))
    }
}

/// Convert bytes to megabytes
fn bytes_to_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
}

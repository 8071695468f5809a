//! Upstream storage-server client.
//!
//! Each configured upstream is a plain HTTP origin hosting resources.  Both
//! operations are single-shot: a non-200 status is a *value* returned to the
//! caller, not an error; only transport failures (connect refused, deadline
//! expiry, mid-body disconnect) surface as errors.  Retry policy belongs to
//! the fetch engine and the convergence loop.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// A storage server capability: probe for a resource, download a resource to
/// a file, and fetch the server's own registries listing.
///
/// The one production implementation is [`HttpStorageServer`]; tests use
/// in-process fakes.
#[async_trait]
pub trait StorageServer: Send + Sync {
    /// Base URL of the server, for logs and diagnostics.
    fn name(&self) -> &str;

    /// Issue a `HEAD {server}{resource}` and return the status code.
    async fn probe(&self, resource: &str) -> Result<u16>;

    /// Issue a `GET {server}{resource}` and stream the body into `dest`.
    /// On a non-200 status nothing is written and the status is returned.
    async fn download(&self, resource: &str, dest: &Path) -> Result<u16>;

    /// Fetch `{server}/registries` uncached and return `(status, body)`.
    async fn registries_listing(&self) -> Result<(u16, String)>;
}

/// [`StorageServer`] over a shared `reqwest::Client`.
pub struct HttpStorageServer {
    base_url: String,
    client: reqwest::Client,
    head_deadline: Duration,
}

impl HttpStorageServer {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client, head_deadline: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client,
            head_deadline,
        }
    }

    fn url_for(&self, resource: &str) -> String {
        format!("{}{}", self.base_url, resource)
    }
}

#[async_trait]
impl StorageServer for HttpStorageServer {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self, resource: &str) -> Result<u16> {
        let url = self.url_for(resource);
        let response = tokio::time::timeout(self.head_deadline, self.client.head(&url).send())
            .await
            .with_context(|| format!("HEAD {url} deadline expired"))?
            .with_context(|| format!("HEAD {url} failed"))?;
        Ok(response.status().as_u16())
    }

    async fn download(&self, resource: &str, dest: &Path) -> Result<u16> {
        let url = self.url_for(resource);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Ok(status);
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to open {}", dest.display()))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("GET {url} body read failed"))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("failed to flush {}", dest.display()))?;

        Ok(status)
    }

    async fn registries_listing(&self) -> Result<(u16, String)> {
        let url = self.url_for("/registries");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Ok((status, String::new()));
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("GET {url} body read failed"))?;
        Ok((status, body))
    }
}

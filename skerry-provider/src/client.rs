//! Block store trait and HTTP implementation
//!
//! `BlockStore` is the seam the pipelines place and fetch shards
//! through; `HttpBlockStore` talks to real providers. Blocks stream
//! to and from local files so memory use stays independent of shard
//! size.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use skerry_core::error::{Error, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Deadline for a single block transfer.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Storage-side view of a provider: put, get, and best-effort delete of
/// opaque blocks at a provider address.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Stream a block's bytes into `dest`, returning the byte count.
    async fn get_block(
        &self,
        addr: &str,
        renter_id: &str,
        block_id: &str,
        dest: &mut tokio::fs::File,
    ) -> Result<u64>;

    /// Upload `size` bytes read from `src` as a new block.
    async fn put_block(
        &self,
        addr: &str,
        renter_id: &str,
        block_id: &str,
        size: u64,
        src: tokio::fs::File,
    ) -> Result<()>;

    /// Remove a block. Used to undo partial uploads; best-effort.
    async fn delete_block(&self, addr: &str, renter_id: &str, block_id: &str) -> Result<()>;
}

/// HTTP block store client for real providers.
pub struct HttpBlockStore {
    http: reqwest::Client,
    token: Option<String>,
}

impl HttpBlockStore {
    pub fn new(token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(BLOCK_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { http, token })
    }

    fn block_url(&self, addr: &str, renter_id: &str, block_id: &str) -> String {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        format!("{base}/blocks/{block_id}?renterID={renter_id}")
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl BlockStore for HttpBlockStore {
    async fn get_block(
        &self,
        addr: &str,
        renter_id: &str,
        block_id: &str,
        dest: &mut tokio::fs::File,
    ) -> Result<u64> {
        let url = self.block_url(addr, renter_id, block_id);
        let resp = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(http_err)?;
        let resp = check_status(resp, block_id).await?;

        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http_err)?;
            dest.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        dest.flush().await?;
        debug!(block = block_id, bytes = total, "fetched block");
        Ok(total)
    }

    async fn put_block(
        &self,
        addr: &str,
        renter_id: &str,
        block_id: &str,
        size: u64,
        src: tokio::fs::File,
    ) -> Result<()> {
        let url = self.block_url(addr, renter_id, block_id);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(src));
        let resp = self
            .authorized(self.http.post(&url))
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(http_err)?;
        check_status(resp, block_id).await?;
        debug!(block = block_id, bytes = size, "stored block");
        Ok(())
    }

    async fn delete_block(&self, addr: &str, renter_id: &str, block_id: &str) -> Result<()> {
        let url = self.block_url(addr, renter_id, block_id);
        let resp = self
            .authorized(self.http.delete(&url))
            .send()
            .await
            .map_err(http_err)?;
        check_status(resp, block_id).await?;
        Ok(())
    }
}

fn http_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Network(err.to_string())
    }
}

async fn check_status(resp: reqwest::Response, block_id: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::NOT_FOUND => Error::NotFound(format!("block {block_id}")),
        _ => Error::Network(format!("{status}: {message}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_url_building() {
        let store = HttpBlockStore::new(None).unwrap();
        assert_eq!(
            store.block_url("127.0.0.1:8003", "r1", "b1"),
            "http://127.0.0.1:8003/blocks/b1?renterID=r1"
        );
        assert_eq!(
            store.block_url("https://pvdr.example/", "r1", "b1"),
            "https://pvdr.example/blocks/b1?renterID=r1"
        );
    }
}

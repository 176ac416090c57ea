//! Artifact download for the update pipeline
//!
//! Supported locators:
//! - `file:///path` local copy
//! - `http(s)://...` streamed download
//! - `block+http(s)://...` block-wise transfer against the kernel firmware server
//!
//! A whole fetch is bounded by one deadline; a stalled server fails the update
//! instead of holding the pipeline.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use fleetota_core::transfer::{self, Block, BlockOption, BlockSource, Served};
use fleetota_core::TransferError;

/// Encoded block option of a block-mode response
pub const BLOCK_HEADER: &str = "x-block";
/// Total artifact size, sent with every block
pub const CONTENT_SIZE_HEADER: &str = "x-content-size";
const API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unsupported locator: {0}")]
    UnsupportedLocator(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download did not finish within {0:?}")]
    Timeout(Duration),
}

enum Locator<'a> {
    File(&'a str),
    Http(&'a str),
    Block(&'a str),
}

fn parse_locator(locator: &str) -> Result<Locator<'_>, FetchError> {
    if let Some(path) = locator.strip_prefix("file://") {
        return Ok(Locator::File(path));
    }
    if let Some(url) = locator.strip_prefix("block+") {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Locator::Block(url));
        }
    }
    if locator.starts_with("http://") || locator.starts_with("https://") {
        return Ok(Locator::Http(locator));
    }
    Err(FetchError::UnsupportedLocator(locator.to_string()))
}

pub struct Fetcher {
    client: reqwest::Client,
    api_key: Option<String>,
    preferred_szx: Option<u8>,
    deadline: Duration,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, api_key: Option<String>, preferred_szx: Option<u8>) -> Self {
        Self { client, api_key, preferred_szx, deadline: DEFAULT_DEADLINE }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Downloads `locator` into `dest`, returns the byte count
    pub async fn fetch(&self, locator: &str, dest: &Path) -> Result<u64, FetchError> {
        match tokio::time::timeout(self.deadline, self.fetch_unbounded(locator, dest)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Fetch of {} gave up after {:?}", locator, self.deadline);
                Err(FetchError::Timeout(self.deadline))
            }
        }
    }

    async fn fetch_unbounded(&self, locator: &str, dest: &Path) -> Result<u64, FetchError> {
        let locator = parse_locator(locator)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let written = match locator {
            Locator::File(path) => tokio::fs::copy(path, dest).await?,
            Locator::Http(url) => self.download(url, dest).await?,
            Locator::Block(url) => {
                let mut source = HttpBlockSource {
                    client: self.client.clone(),
                    url: url.to_string(),
                    api_key: self.api_key.clone(),
                };
                let mut file = tokio::fs::File::create(dest).await?;
                let written = transfer::assemble(&mut source, self.preferred_szx, &mut file).await?;
                file.sync_all().await?;
                written
            }
        };

        info!("Fetched {} bytes into {}", written, dest.display());
        Ok(written)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: response.status().as_u16() });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }
}

/// Block requests against `GET {url}?block=<encoded>`
pub struct HttpBlockSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBlockSource {
    async fn request(&self, option: Option<BlockOption>) -> Result<Served, FetchError> {
        let mut request = self.client.get(&self.url);
        if let Some(opt) = option {
            request = request.query(&[("block", opt.encode())]);
        }
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status { url: self.url.clone(), status: response.status().as_u16() });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let block_header = header(BLOCK_HEADER);
        let size_header = header(CONTENT_SIZE_HEADER);
        let payload = response.bytes().await?.to_vec();

        let Some(raw) = block_header else {
            return Ok(Served::Whole(payload));
        };
        let encoded: u32 = raw
            .trim()
            .parse()
            .map_err(|_| TransferError::Protocol(format!("invalid {BLOCK_HEADER} header '{raw}'")))?;
        let option = BlockOption::decode(encoded)?;
        let total_size = match size_header {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|_| TransferError::Protocol(format!("invalid {CONTENT_SIZE_HEADER} header '{s}'")))?,
            None => 0,
        };

        debug!(num = option.num, more = option.more, szx = option.szx, "block received");
        Ok(Served::Block(Block { option, payload, total_size }))
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn fetch(&mut self, request: Option<BlockOption>) -> Result<Served, TransferError> {
        self.request(request).await.map_err(|e| match e {
            FetchError::Transfer(inner) => inner,
            other => TransferError::Source(other.to_string()),
        })
    }
}

//! Outage feed retrieval: one HTTP GET, CSV parsing, and a best-effort verbatim copy.

use std::borrow::Cow;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use csv::ByteRecord;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_FEED_URL: &str = "https://connecteddata.nationalgrid.co.uk/dataset/d6672e1e-c684-4cea-bb78-c7e5248b62a2/resource/292f788f-4339-455b-8cc0-153e14509d4d/download/power_outage_ext.csv";

/// The feed host rejects non-browser clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("feed is missing expected column {column:?}")]
    MissingColumn { column: String },
    #[error("blank incident id on line {line}")]
    BlankIncidentId { line: u64 },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A parsed CSV snapshot, headers and records exactly as received.
///
/// Records stay as raw bytes so a stray non-UTF-8 byte in a column nobody reads
/// cannot reject the whole feed. Fields are decoded on access.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    headers: Vec<String>,
    records: Vec<ByteRecord>,
}

impl RawTable {
    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes);
        let headers = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .collect();
        let records = reader.byte_records().collect::<Result<Vec<_>, _>>()?;
        Ok(Self { headers, records })
    }

    /// Field `col` of record `row`, decoded as UTF-8.
    ///
    /// Invalid sequences are replaced with U+FFFD and come back as
    /// [`Cow::Owned`]; valid text is borrowed. Missing fields read as empty.
    pub fn field(&self, row: usize, col: usize) -> Cow<'_, str> {
        let bytes = self
            .records
            .get(row)
            .and_then(|record| record.get(col))
            .unwrap_or_default();
        String::from_utf8_lossy(bytes)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Header lookup tolerant of surrounding whitespace and a UTF-8 BOM.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').trim() == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, ParseError> {
        self.column_index(name).ok_or_else(|| ParseError::MissingColumn {
            column: name.to_string(),
        })
    }

    /// Source line of a record, for error messages.
    pub fn line_of(&self, row: usize) -> u64 {
        self.records
            .get(row)
            .and_then(|r| r.position())
            .map(|p| p.line())
            .unwrap_or(row as u64 + 2)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub table: RawTable,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub byte_size: usize,
    pub sha256: String,
    pub saved_copy: bool,
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    url: String,
}

impl FeedFetcher {
    pub fn new(config: FeedClientConfig) -> Result<Self, FetchError> {
        let user_agent = if config.user_agent.trim().is_empty() {
            DEFAULT_USER_AGENT.to_string()
        } else {
            config.user_agent
        };
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            url: config.url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and parse the feed once. No retries; the caller's scheduler owns that.
    ///
    /// When `save_path` is given the response body is copied there verbatim. A
    /// failed copy is logged and ignored because the returned table is authoritative.
    pub async fn fetch_feed(&self, save_path: Option<&Path>) -> Result<FetchedFeed, FeedError> {
        let span = info_span!("feed_fetch", url = %self.url);
        self.fetch_once(save_path).instrument(span).await
    }

    async fn fetch_once(&self, save_path: Option<&Path>) -> Result<FetchedFeed, FeedError> {
        let fetched_at = Utc::now();
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(FetchError::Request)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(http_status_error(status, final_url).into());
        }
        let body = resp.bytes().await.map_err(FetchError::Request)?;

        let table = RawTable::from_csv_bytes(&body)?;
        let sha256 = sha256_hex(&body);
        info!(rows = table.len(), bytes = body.len(), %sha256, "fetched outage feed");

        let saved_copy = match save_path {
            Some(path) => match persist_copy(path, &body).await {
                Ok(()) => {
                    info!(path = %path.display(), "saved feed copy");
                    true
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "could not save feed copy; continuing"
                    );
                    false
                }
            },
            None => false,
        };

        Ok(FetchedFeed {
            table,
            final_url,
            fetched_at,
            byte_size: body.len(),
            sha256,
            saved_copy,
        })
    }
}

fn http_status_error(status: StatusCode, url: String) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub async fn persist_copy(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    let result = match written {
        Ok(()) => fs::rename(&temp_path, path).await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

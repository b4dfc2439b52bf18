//! External catalog client: the `CatalogSource` seam, a reqwest-backed
//! PokeAPI client, and a fixture-directory catalog for offline runs.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use dexops_core::CatalogRecord;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dexops-catalog";

pub const DEFAULT_BASE_URL: &str = "https://pokeapi.co/api/v2";

/// Lookup key for one upstream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogKey {
    Id(i64),
    Name(String),
}

impl CatalogKey {
    /// Upstream names are lowercase slugs. Trims and lowercases, then rejects
    /// anything outside `[a-z0-9-]+`.
    pub fn name(name: &str) -> Result<Self, NameError> {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(NameError::Blank);
        }
        if !normalized
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(NameError::Invalid { name: normalized });
        }
        Ok(CatalogKey::Name(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("pokemon name must not be blank")]
    Blank,
    #[error("pokemon name '{name}' may only contain a-z, 0-9 and '-'")]
    Invalid { name: String },
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogKey::Id(id) => write!(f, "{id}"),
            CatalogKey::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog has no pokemon '{key}'")]
    NotFound { key: CatalogKey },
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("catalog returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("catalog returned a malformed record for '{key}': {source}")]
    Malformed {
        key: CatalogKey,
        source: serde_json::Error,
    },
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound { .. })
    }

    /// Network, timeout and non-2xx failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, CatalogError::Request(_) | CatalogError::HttpStatus { .. })
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn label(&self) -> &'static str;

    async fn fetch(&self, key: &CatalogKey) -> Result<CatalogRecord, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpCatalogConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Single round trip per fetch: no retry, no cache, no rate limiting.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCatalog {
    pub fn new(config: HttpCatalogConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("parsing catalog base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("catalog base url {base_url} cannot carry a path");
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// The key is pushed as a single encoded path segment, so `/`, `?` and
    /// `#` in a name never leave `/pokemon/`.
    pub fn url_for(&self, key: &CatalogKey) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("pokemon").push(&key.to_string());
        }
        url
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    fn label(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, key: &CatalogKey) -> Result<CatalogRecord, CatalogError> {
        let url = self.url_for(key);
        debug!(%url, "fetching catalog record");

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound { key: key.clone() });
        }
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| CatalogError::Malformed {
            key: key.clone(),
            source,
        })
    }
}

/// In-memory catalog keyed by id, usually loaded from a directory of
/// upstream JSON records. Counts fetches so callers can assert on traffic.
#[derive(Debug, Default)]
pub struct FixtureCatalog {
    records: BTreeMap<i64, CatalogRecord>,
    fetches: AtomicUsize,
}

impl FixtureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = CatalogRecord>) -> anyhow::Result<Self> {
        let mut catalog = Self::new();
        for record in records {
            catalog.insert(record)?;
        }
        Ok(catalog)
    }

    /// Load every `*.json` file in `dir`, in file-name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading fixture directory {}", dir.display()))? {
            let path = entry
                .with_context(|| format!("listing fixture directory {}", dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut catalog = Self::new();
        for path in paths {
            let data = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let record: CatalogRecord =
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
            catalog
                .insert(record)
                .with_context(|| format!("loading {}", path.display()))?;
        }
        debug!(dir = %dir.display(), records = catalog.len(), "loaded fixture catalog");
        Ok(catalog)
    }

    pub fn insert(&mut self, record: CatalogRecord) -> anyhow::Result<()> {
        let id = record
            .id
            .with_context(|| format!("fixture record {} has no id", record.name))?;
        self.records.insert(id, record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn lookup(&self, key: &CatalogKey) -> Option<&CatalogRecord> {
        match key {
            CatalogKey::Id(id) => self.records.get(id),
            CatalogKey::Name(name) => self
                .records
                .values()
                .find(|r| r.name.eq_ignore_ascii_case(name)),
        }
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalog {
    fn label(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch(&self, key: &CatalogKey) -> Result<CatalogRecord, CatalogError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.lookup(key)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound { key: key.clone() })
    }
}

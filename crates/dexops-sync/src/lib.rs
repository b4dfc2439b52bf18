//! Sync engine: fetch upstream records and materialize them locally,
//! one id at a time or over an inclusive range. Also owns service config.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dexops_catalog::{
    CatalogError, CatalogKey, CatalogSource, FixtureCatalog, HttpCatalog, HttpCatalogConfig, NameError,
};
use dexops_core::{BatchRange, BatchReport, NewPokemon, RecordError, SyncOutcome};
use dexops_storage::{Session, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dexops-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub catalog_base_url: String,
    pub catalog_timeout_secs: u64,
    pub user_agent: String,
    pub catalog_fixtures_dir: Option<PathBuf>,
    pub bind_host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: dexops_storage::DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 5,
            catalog_base_url: dexops_catalog::DEFAULT_BASE_URL.to_string(),
            catalog_timeout_secs: 10,
            user_agent: "dexops/0.1".to_string(),
            catalog_fixtures_dir: None,
            bind_host: "127.0.0.1".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Optional YAML overlay; every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    pub db_max_connections: Option<u32>,
    pub catalog_base_url: Option<String>,
    pub catalog_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub catalog_fixtures_dir: Option<PathBuf>,
    pub bind_host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Defaults, then the YAML file (`path` or `DEXOPS_CONFIG`), then env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("DEXOPS_CONFIG").map(PathBuf::from));
        let file = path.as_deref().map(ConfigFile::read).transpose()?;
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    pub fn resolve(file: Option<ConfigFile>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.db_max_connections {
            self.db_max_connections = v;
        }
        if let Some(v) = file.catalog_base_url {
            self.catalog_base_url = v;
        }
        if let Some(v) = file.catalog_timeout_secs {
            self.catalog_timeout_secs = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if file.catalog_fixtures_dir.is_some() {
            self.catalog_fixtures_dir = file.catalog_fixtures_dir;
        }
        if let Some(v) = file.bind_host {
            self.bind_host = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.log_json {
            self.log_json = v;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env("DEXOPS_DB_MAX_CONNECTIONS") {
            self.db_max_connections = parse_var("DEXOPS_DB_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = env("DEXOPS_CATALOG_URL") {
            self.catalog_base_url = v;
        }
        if let Some(v) = env("DEXOPS_CATALOG_TIMEOUT_SECS") {
            self.catalog_timeout_secs = parse_var("DEXOPS_CATALOG_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("DEXOPS_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = env("DEXOPS_CATALOG_FIXTURES") {
            self.catalog_fixtures_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("DEXOPS_HOST") {
            self.bind_host = v;
        }
        if let Some(v) = env("DEXOPS_WEB_PORT") {
            self.port = parse_var("DEXOPS_WEB_PORT", &v)?;
        }
        if let Some(v) = env("DEXOPS_LOG") {
            self.log_level = v;
        }
        if let Some(v) = env("DEXOPS_LOG_JSON") {
            self.log_json = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
        }
    }

    pub fn http_catalog_config(&self) -> HttpCatalogConfig {
        HttpCatalogConfig {
            base_url: self.catalog_base_url.clone(),
            timeout: Duration::from_secs(self.catalog_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| anyhow!("invalid {key}={value:?}: {err}"))
}

/// Fixture directory when configured, the live HTTP catalog otherwise.
pub fn catalog_from_config(config: &ServiceConfig) -> Result<Arc<dyn CatalogSource>> {
    match &config.catalog_fixtures_dir {
        Some(dir) => Ok(Arc::new(FixtureCatalog::load_dir(dir)?)),
        None => Ok(Arc::new(HttpCatalog::new(config.http_catalog_config())?)),
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("pokemon id must be >= 1, got {0}")]
    InvalidId(i64),
    #[error(transparent)]
    InvalidName(#[from] NameError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("rejected upstream record: {0}")]
    Record(#[from] RecordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Insert-or-skip sync over a `CatalogSource`. Every operation runs on the
/// caller's `Session`; each insert is one transaction.
#[derive(Clone)]
pub struct SyncEngine {
    catalog: Arc<dyn CatalogSource>,
}

impl SyncEngine {
    pub fn new(catalog: Arc<dyn CatalogSource>) -> Self {
        Self { catalog }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Ok(Self::new(catalog_from_config(config)?))
    }

    pub fn catalog_label(&self) -> &'static str {
        self.catalog.label()
    }

    /// Already-stored ids return `AlreadyExists` without touching upstream.
    pub async fn sync_one(&self, session: &mut Session, id: i64) -> Result<SyncOutcome, SyncError> {
        if id < 1 {
            return Err(SyncError::InvalidId(id));
        }
        if let Some(existing) = session.find_pokemon(id).await? {
            debug!(id, name = %existing.name, "already synced, skipping fetch");
            return Ok(existing.into());
        }

        let record = self.catalog.fetch(&CatalogKey::Id(id)).await?;
        let pokemon = NewPokemon::from_record(&record, Some(id))?;
        self.persist(session, pokemon).await
    }

    /// Same as `sync_one`, keyed by upstream name. The record must carry its id.
    pub async fn create_by_name(&self, session: &mut Session, name: &str) -> Result<SyncOutcome, SyncError> {
        let key = CatalogKey::name(name)?;
        if let Some(existing) = session.find_pokemon_by_name(&key.to_string()).await? {
            debug!(id = existing.id, name = %existing.name, "already synced, skipping fetch");
            return Ok(existing.into());
        }

        let record = self.catalog.fetch(&key).await?;
        let pokemon = NewPokemon::from_record(&record, None)?;
        if let Some(existing) = session.find_pokemon(pokemon.id).await? {
            return Ok(existing.into());
        }
        self.persist(session, pokemon).await
    }

    /// Visit every id in ascending order. Failures are counted and sampled,
    /// never propagated.
    pub async fn sync_batch(&self, session: &mut Session, range: BatchRange) -> BatchReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_batch", %run_id, start = range.start(), end = range.end());
        async move {
            let mut report = BatchReport::new(range);
            for id in range.ids() {
                match self.sync_one(session, id).await {
                    Ok(outcome) => report.record(&outcome),
                    Err(err) => {
                        warn!(id, error = %err, "batch item failed");
                        report.record_failure(id, err.to_string());
                    }
                }
            }
            info!(
                inserted = report.inserted,
                skipped = report.skipped,
                failed = report.failed,
                "batch sync finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn persist(&self, session: &mut Session, pokemon: NewPokemon) -> Result<SyncOutcome, SyncError> {
        match session.insert_pokemon(&pokemon, Utc::now()).await {
            Ok(()) => {
                info!(id = pokemon.id, name = %pokemon.name, types = ?pokemon.types, "inserted pokemon");
                Ok(SyncOutcome::inserted(&pokemon))
            }
            Err(StoreError::Conflict { id, name }) => {
                // a concurrent sync inserted the same id between our check and insert
                if let Some(existing) = session.find_pokemon(pokemon.id).await? {
                    warn!(id, "lost insert race, reporting existing row");
                    return Ok(existing.into());
                }
                Err(StoreError::Conflict { id, name }.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

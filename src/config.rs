use std::collections::BTreeMap;
use std::time::Duration;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::loader::{LoaderSettings, Paging};
use crate::record::{EntityKind, KeyProjection};
use crate::retry::RetryPolicy;
use crate::ui::{print_command_status, CommandStatus};
use crate::uploader::UploadSettings;

/// Where `push` gets its existence set from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sweep the remote store on every run.
    #[default]
    Full,
    /// Resume from the persisted state file; sweep only when it is missing.
    Incremental,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: Option<String>,
    pub page_size: usize,
    pub min_page_size: usize,
    pub upload_batch_size: usize,
    pub workers: usize,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: f64,
    pub budget_per_second: f64,
    pub default_cost: f64,
    pub request_timeout_secs: u64,
    pub sort_key: String,
    pub paging: Paging,
    pub vertex_key_fields: Option<Vec<String>>,
    pub edge_key_fields: Option<Vec<String>>,
    pub key_delimiter: String,
    pub sync_mode: SyncMode,
    pub state_path: Option<PathBuf>,
    pub dispatch: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            page_size: 1000,
            min_page_size: 100,
            upload_batch_size: 100,
            workers: 4,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            jitter: 0.5,
            budget_per_second: 400.0,
            default_cost: 10.0,
            request_timeout_secs: 60,
            sort_key: "graph_id".to_string(),
            paging: Paging::Keyset,
            vertex_key_fields: None,
            edge_key_fields: None,
            key_delimiter: "|".to_string(),
            sync_mode: SyncMode::Full,
            state_path: None,
            dispatch: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub budget: Option<f64>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub page_size: Option<usize>,
    pub paging: Option<Paging>,
    pub sync_mode: Option<SyncMode>,
    pub state_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(endpoint) = overrides.endpoint {
            self.endpoint = Some(endpoint);
        }
        if let Some(budget) = overrides.budget {
            self.budget_per_second = budget;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.upload_batch_size = batch_size;
        }
        if let Some(page_size) = overrides.page_size {
            self.page_size = page_size;
            self.min_page_size = self.min_page_size.min(page_size);
        }
        if let Some(paging) = overrides.paging {
            self.paging = paging;
        }
        if let Some(mode) = overrides.sync_mode {
            self.sync_mode = mode;
        }
        if let Some(path) = overrides.state_path {
            self.state_path = Some(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.upload_batch_size == 0 {
            bail!("upload_batch_size must be at least 1");
        }
        if self.min_page_size == 0 || self.min_page_size > self.page_size {
            bail!(
                "min_page_size must be between 1 and page_size ({}), got {}",
                self.page_size,
                self.min_page_size
            );
        }
        if self.key_delimiter.is_empty() {
            bail!("key_delimiter must not be empty");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            bail!("jitter must be within [0, 1], got {}", self.jitter);
        }
        if self.sort_key.trim().is_empty() {
            bail!("sort_key must not be empty");
        }
        for (kind, fields) in [
            (EntityKind::Vertex, &self.vertex_key_fields),
            (EntityKind::Edge, &self.edge_key_fields),
        ] {
            if fields.as_ref().is_some_and(|fields| fields.is_empty()) {
                bail!("{} key fields must not be empty", kind.plural());
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            jitter: self.jitter,
        }
    }

    pub fn projection(&self, kind: EntityKind) -> KeyProjection {
        let fields = match kind {
            EntityKind::Vertex => self.vertex_key_fields.clone(),
            EntityKind::Edge => self.edge_key_fields.clone(),
        }
        .unwrap_or_else(|| KeyProjection::default_fields(kind));
        KeyProjection::new(kind, fields, self.key_delimiter.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::from_property_map(&self.dispatch)
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            page_size: self.page_size,
            min_page_size: self.min_page_size,
            sort_key: self.sort_key.clone(),
            paging: self.paging,
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            workers: self.workers,
            batch_size: self.upload_batch_size,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

pub fn global_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
    Ok(home.join(".gsync").join("config.json"))
}

fn parse(path: &Path, contents: &str) -> Result<EngineConfig> {
    let config: EngineConfig = serde_json::from_str(contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Reads the user-level config. Problems are reported and the defaults used.
pub fn load_file(path: &Path) -> EngineConfig {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return EngineConfig::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Error,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return EngineConfig::default();
        }
    };
    match parse(path, &contents) {
        Ok(config) => config,
        Err(e) => {
            print_command_status(CommandStatus::Error, &format!("Warning: {e:#}"));
            EngineConfig::default()
        }
    }
}

/// An explicitly requested config file must exist and parse; otherwise the
/// global file is used when there is one.
pub fn resolve(explicit: Option<&Path>, overrides: Overrides) -> Result<EngineConfig> {
    let mut config = match explicit {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            parse(path, &contents)?
        }
        None => match global_path() {
            Ok(path) => load_file(&path),
            Err(_) => EngineConfig::default(),
        },
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}

// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::live::DuplicateInsert;
use anyhow::Result;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use structopt::StructOpt;
use structopt_toml::StructOptToml;

#[derive(StructOpt, Debug, Clone, StructOptToml, Deserialize, Serialize)]
#[structopt(name = "statelinkd")]
#[serde(deny_unknown_fields, default)]
pub struct Opt {
    /// Database URI.
    #[structopt(long, default_value = "sqlite://.statelink.db?mode=rwc")]
    pub db_uri: String,
    /// Schema declaration file (JSON).
    #[structopt(long, default_value = "statelink.schema.json")]
    pub schema_path: PathBuf,
    /// Size of the database connection pool.
    #[structopt(short, long, default_value = "10")]
    pub nr_connections: usize,
    /// Log filter: silent|error|warn|info|debug.
    #[structopt(long, default_value = "info")]
    pub log_level: String,
    /// Reply timeout advertised to clients, in milliseconds.
    #[structopt(long, default_value = "5000")]
    pub reply_timeout_ms: u64,
    /// What to do with an INSERT for an already-tracked id: drop|error.
    #[structopt(long, default_value = "drop")]
    pub duplicate_insert: String,
    /// Read default configuration from this toml configuration file.
    #[structopt(long, short)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

impl Opt {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        let content = std::str::from_utf8(&content)?;

        Self::from_args_with_toml(content).map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    /// Maps the configured level onto an env_logger filter.
    pub fn log_filter(&self) -> &str {
        match self.log_level.as_str() {
            "silent" => "off",
            other => other,
        }
    }

    pub fn duplicate_insert_mode(&self) -> Result<DuplicateInsert> {
        match self.duplicate_insert.as_str() {
            "drop" => Ok(DuplicateInsert::Drop),
            "error" => Ok(DuplicateInsert::Error),
            other => anyhow::bail!("unknown duplicate-insert mode `{other}`"),
        }
    }
}

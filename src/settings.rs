// =============================================================================
// Engine settings — process-level configuration with atomic save
// =============================================================================
//
// Strategy behavior lives in per-strategy configuration documents; this file
// holds only what the process itself needs before any strategy exists.
//
// Persistence uses the tmp + rename pattern so a crash mid-write never
// corrupts the file. All fields carry serde defaults so adding new fields
// never breaks loading an older settings file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_database_path() -> String {
    "borealis.db".to_string()
}

fn default_account_poll_seconds() -> u64 {
    60
}

fn default_snapshot_retention_hours() -> u64 {
    24 * 7
}

fn default_true() -> bool {
    true
}

/// Whether orders go to real funds or the venue testnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueEnv {
    Live,
    Testnet,
}

impl Default for VenueEnv {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for VenueEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// SQLite file backing the ledger.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Venue endpoints to use. Defaults to testnet for safety.
    #[serde(default)]
    pub venue: VenueEnv,

    /// Cadence of the account snapshot loop.
    #[serde(default = "default_account_poll_seconds")]
    pub account_poll_seconds: u64,

    /// Snapshots older than this are pruned.
    #[serde(default = "default_snapshot_retention_hours")]
    pub snapshot_retention_hours: u64,

    /// Liquidate open positions when strategies stop at process shutdown.
    #[serde(default = "default_true")]
    pub close_positions_on_shutdown: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            venue: VenueEnv::default(),
            account_poll_seconds: default_account_poll_seconds(),
            snapshot_retention_hours: default_snapshot_retention_hours(),
            close_positions_on_shutdown: true,
        }
    }
}

impl EngineSettings {
    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            venue = %settings.venue,
            database = %settings.database_path,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Persist using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }
}

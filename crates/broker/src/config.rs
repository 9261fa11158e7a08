use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Broker deployment configuration. The participating model set comes from
/// the config file; everything else from flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Declared federation members. Boot completes only once every one of
    /// them has reported status.
    pub models: BTreeSet<String>,
    /// Bind address of the ingress port, where every publisher sends.
    pub ingress: String,
    /// Bind address of the egress port, where every subscriber reads.
    pub egress: String,
    /// The run ends after this pulse completes and the log drains.
    pub max_incstep: u32,
    pub initial_year: i32,
    /// How long boot may take before the missing set is fatal.
    pub boot_timer: Duration,
    /// Per-window liveness bound once booted.
    pub watchdog_timer: Duration,
    pub heartbeat_interval: Duration,
    pub pace_interval: Duration,
    /// Where the message log's collections are appended.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: BTreeSet::new(),
            ingress: "0.0.0.0:5555".to_string(),
            egress: "0.0.0.0:5556".to_string(),
            max_incstep: 50,
            initial_year: 2016,
            boot_timer: Duration::from_secs(60),
            watchdog_timer: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
            pace_interval: Duration::from_secs(1),
            data_dir: "/opt/data".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<String>,
}

/// Read the declared model set from a `{"models": [...]}` document.
pub fn load_models(path: impl AsRef<Path>) -> anyhow::Result<BTreeSet<String>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|err| anyhow::anyhow!("failed to read config {}: {err}", path.display()))?;
    let file: ModelsFile = serde_json::from_slice(&bytes)
        .map_err(|err| anyhow::anyhow!("failed to parse config {}: {err}", path.display()))?;
    Ok(file.models.into_iter().collect())
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment configuration of one hosted model.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker ingress endpoint, where this model publishes.
    pub broker_ingress: String,
    /// Broker egress endpoint, where this model subscribes.
    pub broker_egress: String,
    pub input_schema_dir: PathBuf,
    pub output_schema_dir: PathBuf,
    /// Initial-condition documents, delivered to `Model::configure`.
    pub config_dir: PathBuf,
    pub abstract_graph: PathBuf,
    pub instance_graph: PathBuf,
    /// Cadence of the status ticker.
    pub status_interval: Duration,
    /// How long the watchdog waits for a broker status before aborting.
    pub broker_timeout: Duration,
    /// Instance areas patched after graph load, id -> km².
    pub area_overrides: BTreeMap<String, f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_ingress: "broker:5555".to_string(),
            broker_egress: "broker:5556".to_string(),
            input_schema_dir: "/opt/schemas/input".into(),
            output_schema_dir: "/opt/schemas/output".into(),
            config_dir: "/opt/config".into(),
            abstract_graph: "/abstract-graph.geojson".into(),
            instance_graph: "/instance-graph.geojson".into(),
            status_interval: Duration::from_secs(1),
            broker_timeout: Duration::from_secs(10),
            area_overrides: BTreeMap::new(),
        }
    }
}

/// Load every `*.json` document in `dir`, keyed by filename stem. A missing
/// directory is an empty map.
pub fn load_json_documents(dir: impl AsRef<Path>) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    let dir = dir.as_ref();
    let mut documents = BTreeMap::new();
    if !dir.exists() {
        return Ok(documents);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let bytes = std::fs::read(&path)?;
        let document = serde_json::from_slice(&bytes)?;
        documents.insert(stem.to_string(), document);
    }
    Ok(documents)
}

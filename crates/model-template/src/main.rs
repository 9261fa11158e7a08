//! A skeleton federation member: logistic population growth at county
//! granularity. Copy this crate to start a new model; the only federation
//! code a model author writes is the `Model` implementation below.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use wrapper::{Config, Envelope, Model, Outputs, Payload, Runtime, Step};

/// Hosts the template model inside a federation.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Broker ingress endpoint, where this model publishes.
    #[arg(long, default_value = "broker:5555", env = "BROKER_INGRESS")]
    ingress: String,
    /// Broker egress endpoint, where this model subscribes.
    #[arg(long, default_value = "broker:5556", env = "BROKER_EGRESS")]
    egress: String,
    #[arg(long, default_value = "/opt/schemas/input", env = "INPUT_SCHEMA_DIR")]
    input_schemas: PathBuf,
    #[arg(long, default_value = "/opt/schemas/output", env = "OUTPUT_SCHEMA_DIR")]
    output_schemas: PathBuf,
    /// Directory of initial-condition documents.
    #[arg(long, default_value = "/opt/config", env = "CONFIG_DIR")]
    config_dir: PathBuf,
    #[arg(long, default_value = "/abstract-graph.geojson", env = "ABSTRACT_GRAPH")]
    abstract_graph: PathBuf,
    #[arg(long, default_value = "/instance-graph.geojson", env = "INSTANCE_GRAPH")]
    instance_graph: PathBuf,
    /// How long to wait for a broker heartbeat before giving up.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s", env = "BROKER_TIMEOUT")]
    broker_timeout: Duration,
}

/// Counties grow toward a national carrying capacity, each at a rate scaled
/// by its share of the total population.
struct TemplateModel {
    population: BTreeMap<String, f64>,
}

const CARRYING_CAPACITY: f64 = 400_000_000.0;
const GROWTH_RATE: f64 = 1.0071;

impl TemplateModel {
    fn new() -> Self {
        Self {
            population: BTreeMap::new(),
        }
    }
}

impl Model for TemplateModel {
    fn id(&self) -> &str {
        "template"
    }

    fn configure(&mut self, inputs: BTreeMap<String, serde_json::Value>) -> anyhow::Result<()> {
        let Some(seed) = inputs.get("county_populations") else {
            anyhow::bail!("county_populations initialization data not found");
        };
        self.population = serde_json::from_value(seed.clone())?;
        Ok(())
    }

    fn increment(
        &mut self,
        _step: Step,
        _inputs: BTreeMap<String, Payload>,
    ) -> anyhow::Result<Outputs> {
        let total: f64 = self.population.values().sum();
        self.population = self
            .population
            .iter()
            .map(|(county, &n)| {
                let capacity = (n / total) * CARRYING_CAPACITY;
                (
                    county.clone(),
                    n + GROWTH_RATE * n * ((capacity - n) / capacity),
                )
            })
            .collect();

        let payload = Payload::from([(
            "population".to_string(),
            Envelope {
                data: self.population.clone(),
                granularity: "county".to_string(),
            },
        )]);
        Ok(Outputs::default().data("population", payload))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ops::tracing::install();
    let cli = Cli::parse();

    let config = Config {
        broker_ingress: cli.ingress,
        broker_egress: cli.egress,
        input_schema_dir: cli.input_schemas,
        output_schema_dir: cli.output_schemas,
        config_dir: cli.config_dir,
        abstract_graph: cli.abstract_graph,
        instance_graph: cli.instance_graph,
        broker_timeout: cli.broker_timeout,
        ..Config::default()
    };

    if let Err(err) = Runtime::new(config).run(TemplateModel::new()).await {
        tracing::error!(error = format!("{err:#}"), "model failed");
        std::process::exit(1);
    }
    Ok(())
}

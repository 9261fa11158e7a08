use protocol::Payload;
use std::collections::BTreeMap;

/// Coordinates of the pulse a model is being advanced through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub incstep: u32,
    pub year: i32,
}

/// Everything a model hands back from one increment.
#[derive(Debug, Default)]
pub struct Outputs {
    /// Output schema name -> payload. One entry per declared output schema.
    pub data: BTreeMap<String, Payload>,
    /// Filename -> rendered HTML, published as `file_string` artifacts.
    pub pages: BTreeMap<String, String>,
    /// Filename -> raw bytes, published base64-encoded as `file_bytes`.
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl Outputs {
    pub fn data(mut self, schema: impl Into<String>, payload: Payload) -> Self {
        self.data.insert(schema.into(), payload);
        self
    }

    pub fn page(mut self, name: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(name.into(), html.into());
        self
    }

    pub fn blob(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.blobs.insert(name.into(), bytes);
        self
    }
}

/// The extension point a simulation model implements to join a federation.
/// The runtime owns every other concern: transport, validation, granularity
/// translation, status reporting, and the arrival barrier.
pub trait Model: Send + 'static {
    /// Unique name of this model within the federation, as declared in the
    /// broker's configuration.
    fn id(&self) -> &str;

    /// Called once before any increment, with the initial-condition
    /// documents found in the configuration directory, keyed by file stem.
    fn configure(&mut self, inputs: BTreeMap<String, serde_json::Value>) -> anyhow::Result<()>;

    /// Called once per increment pulse with the validated input payloads,
    /// one per declared input schema (empty at step 1). Returns one payload
    /// per declared output schema, plus any file artifacts.
    fn increment(
        &mut self,
        step: Step,
        inputs: BTreeMap<String, Payload>,
    ) -> anyhow::Result<Outputs>;
}

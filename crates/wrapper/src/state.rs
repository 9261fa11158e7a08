use anyhow::Context;
use mesh::Translator;
use protocol::{Envelope, Payload, Status};
use registry::{Schema, SchemaSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

/// Shared state of one hosted model, read and written by the runtime's
/// tasks. Maps sit behind a mutex; scalars are atomics.
pub(crate) struct State {
    pub model_id: String,
    /// Number of declared input schemas; the arrival barrier's target.
    pub expected_inputs: usize,
    pub input_schemas: SchemaSet,
    pub output_schemas: SchemaSet,
    pub translator: Translator,

    incstep: AtomicU32,
    initial_year: AtomicI32,
    connected_to_broker: AtomicBool,
    incrementing: AtomicBool,
    /// Input schema name -> the payload that validated it since the last pulse.
    validated: Mutex<BTreeMap<String, Payload>>,
}

impl State {
    pub fn new(
        model_id: String,
        input_schemas: SchemaSet,
        output_schemas: SchemaSet,
        translator: Translator,
    ) -> Self {
        Self {
            model_id,
            expected_inputs: input_schemas.len(),
            input_schemas,
            output_schemas,
            translator,
            incstep: AtomicU32::new(1),
            initial_year: AtomicI32::new(-1),
            connected_to_broker: AtomicBool::new(false),
            incrementing: AtomicBool::new(false),
            validated: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn incstep(&self) -> u32 {
        self.incstep.load(Ordering::Acquire)
    }

    pub fn set_incstep(&self, incstep: u32) {
        self.incstep.store(incstep, Ordering::Release);
    }

    pub fn initial_year(&self) -> i32 {
        self.initial_year.load(Ordering::Acquire)
    }

    pub fn year(&self, incstep: u32) -> i32 {
        self.initial_year() + incstep as i32
    }

    pub fn mark_connected(&self, initial_year: Option<i32>) {
        if let Some(year) = initial_year {
            self.initial_year.store(year, Ordering::Release);
        }
        self.connected_to_broker.store(true, Ordering::Release);
    }

    pub fn set_incrementing(&self, on: bool) {
        self.incrementing.store(on, Ordering::Release);
    }

    pub fn validated_count(&self) -> usize {
        self.validated.lock().unwrap().len()
    }

    /// Take the validated-schemas buffer, failing the arrival barrier if it
    /// is incomplete for pulses past the first.
    pub fn take_validated(&self, incstep: u32) -> anyhow::Result<BTreeMap<String, Payload>> {
        let mut validated = self.validated.lock().unwrap();
        if incstep > 1 && validated.len() != self.expected_inputs {
            anyhow::bail!(
                "number of validated schemas {} != expected inputs {}",
                validated.len(),
                self.expected_inputs
            );
        }
        Ok(std::mem::take(&mut *validated))
    }

    /// The deterministic status the ticker publishes.
    pub fn current_status(&self) -> Status {
        if !self.connected_to_broker.load(Ordering::Acquire) {
            return Status::Booting;
        }
        if self.incrementing.load(Ordering::Acquire) {
            return Status::Incrementing;
        }
        if self.incstep() == 1 {
            // Kickstart: the first pulse has no input precondition.
            return Status::Ready;
        }
        if self.validated_count() == self.expected_inputs {
            return Status::Ready;
        }
        Status::Waiting
    }

    /// Route one inbound data payload through schema matching and input
    /// translation into the validated buffer.
    ///
    /// Zero matches is logged and ignored. A schema that already holds a
    /// payload since the last pulse is a protocol failure, as is a
    /// translation failure; both are fatal to the model.
    pub fn insert_data_message(&self, payload: &Payload) -> anyhow::Result<()> {
        let value = serde_json::to_value(payload).context("payload is not representable as JSON")?;
        let matched = self.input_schemas.matches(&value);
        if matched.is_empty() {
            tracing::info!("message didn't match any input schemas");
            return Ok(());
        }

        let mut validated = self.validated.lock().unwrap();
        for schema in matched {
            if validated.contains_key(schema.name()) {
                anyhow::bail!(
                    "schema {:?} already validated a message since the last pulse",
                    schema.name()
                );
            }
            let translated = translate_payload(&self.translator, schema, payload)?;
            tracing::info!(schema = schema.name(), "validated incoming message");
            validated.insert(schema.name().to_string(), translated);
        }
        Ok(())
    }
}

/// Translate each variable of `payload` from its envelope granularity to the
/// granularity the schema declares for it, applying the schema's function
/// hints. Variables without a hint pass through unchanged.
pub(crate) fn translate_payload(
    translator: &Translator,
    schema: &Schema,
    payload: &Payload,
) -> anyhow::Result<Payload> {
    let mut out = Payload::new();
    for (variable, envelope) in payload {
        let translated = match schema.hint(variable) {
            Some(hint) if hint.granularity != envelope.granularity => {
                let data = translator
                    .translate(
                        &envelope.data,
                        &envelope.granularity,
                        &hint.granularity,
                        variable,
                        hint.agg.as_deref(),
                        hint.dagg.as_deref(),
                    )
                    .with_context(|| {
                        format!(
                            "translating {:?} from {:?} to {:?} for schema {:?}",
                            variable,
                            envelope.granularity,
                            hint.granularity,
                            schema.name()
                        )
                    })?;
                Envelope {
                    data,
                    granularity: hint.granularity.clone(),
                }
            }
            _ => envelope.clone(),
        };
        out.insert(variable.clone(), translated);
    }
    Ok(out)
}

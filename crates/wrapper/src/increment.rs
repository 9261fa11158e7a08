use crate::model::{Model, Step};
use crate::state::{translate_payload, State};
use anyhow::Context;
use protocol::Message;
use tokio::sync::mpsc;

/// Advance the hosted model through pulse `incstep`: enforce the arrival
/// barrier, snapshot and clear the validated buffer, run the model's
/// increment, validate every returned payload, translate each output
/// variable to its schema-declared granularity, and enqueue the resulting
/// data and file messages.
///
/// Any error is a protocol failure and fatal to the model process.
pub(crate) fn handle_increment<M: Model>(
    state: &State,
    model: &mut M,
    incstep: u32,
    publish: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    state.set_incrementing(true);
    state.set_incstep(incstep);
    let year = state.year(incstep);
    tracing::info!(incstep, year, "about to increment");

    let inputs = state.take_validated(incstep)?;
    let outputs = model
        .increment(Step { incstep, year }, inputs)
        .context("model increment failed")?;

    if outputs.data.len() != state.output_schemas.len() {
        anyhow::bail!(
            "model returned {} payloads but {} output schemas are declared",
            outputs.data.len(),
            state.output_schemas.len()
        );
    }
    for (name, payload) in &outputs.data {
        let value = serde_json::to_value(payload)?;
        registry::envelope_schema().validate(&value)?;
        let schema = state
            .output_schemas
            .get(name)
            .with_context(|| format!("no output schema named {name:?}"))?;
        schema.validate(&value)?;
    }
    state.set_incrementing(false);

    for (name, payload) in outputs.data {
        let schema = state.output_schemas.get(&name).expect("validated above");
        let translated = translate_payload(&state.translator, schema, &payload)?;
        publish.send(Message::data(
            state.model_id.as_str(),
            incstep,
            year,
            name.as_str(),
            translated,
        ))?;
    }
    for (filename, html) in outputs.pages {
        publish.send(Message::file_string(
            state.model_id.as_str(),
            incstep,
            year,
            filename,
            html,
        ))?;
    }
    for (filename, bytes) in outputs.blobs {
        publish.send(Message::file_bytes(
            state.model_id.as_str(),
            incstep,
            year,
            filename,
            &bytes,
        ))?;
    }

    tracing::info!(incstep, year, "finished increment");
    state.set_incstep(incstep + 1);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Outputs;
    use crate::testutil;
    use protocol::{Body, Payload};
    use std::collections::BTreeMap;

    /// Returns whatever payloads it was constructed with, once per pulse.
    struct Canned {
        outputs: BTreeMap<String, Payload>,
        pages: BTreeMap<String, String>,
        increments: u32,
    }

    impl Canned {
        fn returning(outputs: BTreeMap<String, Payload>) -> Self {
            Self {
                outputs,
                pages: BTreeMap::new(),
                increments: 0,
            }
        }
    }

    impl crate::Model for Canned {
        fn id(&self) -> &str {
            "canned"
        }

        fn configure(&mut self, _: BTreeMap<String, serde_json::Value>) -> anyhow::Result<()> {
            Ok(())
        }

        fn increment(
            &mut self,
            _: crate::Step,
            _: BTreeMap<String, Payload>,
        ) -> anyhow::Result<Outputs> {
            self.increments += 1;
            Ok(Outputs {
                data: self.outputs.clone(),
                pages: self.pages.clone(),
                blobs: BTreeMap::new(),
            })
        }
    }

    #[test]
    fn increment_publishes_translated_outputs() {
        let state = testutil::state();
        state.mark_connected(Some(2016));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        // The model reports at state granularity; the schema wants county.
        let mut model = Canned::returning(BTreeMap::from([(
            "population".to_string(),
            testutil::payload("population", "state", 100.0),
        )]));
        model.pages.insert("map.html".to_string(), "<html/>".to_string());

        handle_increment(&state, &mut model, 1, &tx).unwrap();
        assert_eq!(model.increments, 1);
        assert_eq!(state.incstep(), 2);

        let data = rx.try_recv().unwrap();
        assert_eq!(data.incstep, 1);
        assert_eq!(data.year, 2017);
        match data.body {
            Body::Data { schema, payload } => {
                assert_eq!(schema, "population");
                let envelope = &payload["population"];
                assert_eq!(envelope.granularity, "county");
                assert_eq!(envelope.data["c1"], 40.0);
                assert_eq!(envelope.data["c2"], 60.0);
            }
            other => panic!("expected data message, got {other:?}"),
        }

        let page = rx.try_recv().unwrap();
        assert!(matches!(page.body, Body::FileString { ref name, .. } if name == "map.html"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn barrier_violation_is_fatal() {
        let state = testutil::state();
        state.mark_connected(Some(2016));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let mut model = Canned::returning(BTreeMap::new());
        let err = handle_increment(&state, &mut model, 2, &tx).unwrap_err();
        assert!(err.to_string().contains("validated schemas"));
        // The model must not have run.
        assert_eq!(model.increments, 0);
    }

    #[test]
    fn output_count_mismatch_is_fatal() {
        let state = testutil::state();
        state.mark_connected(Some(2016));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let mut model = Canned::returning(BTreeMap::new());
        let err = handle_increment(&state, &mut model, 1, &tx).unwrap_err();
        assert!(err.to_string().contains("output schemas are declared"));
    }

    #[test]
    fn mismatched_output_schema_is_fatal() {
        let state = testutil::state();
        state.mark_connected(Some(2016));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        // Right count, wrong shape for the declared schema.
        let mut model = Canned::returning(BTreeMap::from([(
            "population".to_string(),
            testutil::payload("rainfall", "county", 2.0),
        )]));
        let err = handle_increment(&state, &mut model, 1, &tx).unwrap_err();
        assert!(err.to_string().contains("failed to validate"));
    }
}

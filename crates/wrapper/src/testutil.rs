//! Shared fixtures for runtime unit tests: a one-input one-output model
//! federation slice over a tiny usa48 -> state -> county mesh.

use crate::state::State;
use mesh::{Graph, Translator};
use protocol::{Envelope, Payload};
use registry::{Schema, SchemaSet};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn translator() -> Translator {
    let abstracts = Graph::from_value(json!({
        "nodes": [{"id": "usa48"}, {"id": "state"}, {"id": "county"}],
        "links": [
            {"source": "usa48", "target": "state"},
            {"source": "state", "target": "county"},
        ],
    }))
    .unwrap();
    let instances = Graph::from_value(json!({
        "nodes": [
            {"id": "us", "type": "usa48", "area": 10.0},
            {"id": "tx", "type": "state", "area": 10.0},
            {"id": "c1", "type": "county", "area": 4.0},
            {"id": "c2", "type": "county", "area": 6.0},
        ],
        "links": [
            {"source": "us", "target": "tx"},
            {"source": "tx", "target": "c1"},
            {"source": "tx", "target": "c2"},
        ],
    }))
    .unwrap();
    Translator::new(Arc::new(abstracts), Arc::new(instances))
}

fn population_schema(granularity: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "population": {
                "type": "object",
                "properties": {
                    "granularity": {"value": granularity},
                    "data": {"type": "object"},
                },
                "required": ["data", "granularity"],
            }
        },
        "required": ["population"],
        "additionalProperties": false,
    })
}

pub(crate) fn input_schemas() -> SchemaSet {
    let mut set = SchemaSet::default();
    set.insert(Schema::compile("population", population_schema("county")).unwrap());
    set
}

pub(crate) fn output_schemas() -> SchemaSet {
    let mut set = SchemaSet::default();
    set.insert(Schema::compile("population", population_schema("county")).unwrap());
    set
}

pub(crate) fn state() -> State {
    State::new(
        "population".to_string(),
        input_schemas(),
        output_schemas(),
        translator(),
    )
}

/// A single-variable payload. State-granularity data lives on `tx`,
/// county-granularity data on `c1`.
pub(crate) fn payload(variable: &str, granularity: &str, value: f64) -> Payload {
    let data: BTreeMap<String, f64> = match granularity {
        "state" => BTreeMap::from([("tx".to_string(), value)]),
        "county" => BTreeMap::from([("c1".to_string(), value)]),
        _ => BTreeMap::from([("x0".to_string(), value)]),
    };
    Payload::from([(
        variable.to_string(),
        Envelope {
            data,
            granularity: granularity.to_string(),
        },
    )])
}

pub(crate) fn population_payload(value: f64) -> Payload {
    payload("population", "county", value)
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// The broker's reserved `source` identifier. Model ids must not collide with it.
pub const BROKER_ID: &str = "broker";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode message as JSON")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message from JSON")]
    Decode(#[source] serde_json::Error),
    #[error("failed to decode base64 file payload")]
    Base64(#[from] base64::DecodeError),
}

/// Status of a participating process, carried by `status` messages.
/// Models cycle booting -> ready -> incrementing -> waiting -> ready;
/// the broker reports booting until every declared model has been heard
/// from, and booted thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Booting,
    Booted,
    Ready,
    Waiting,
    Incrementing,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Booting => "booting",
            Status::Booted => "booted",
            Status::Ready => "ready",
            Status::Waiting => "waiting",
            Status::Incrementing => "incrementing",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One variable's worth of keyed values, tagged with the granularity its
/// instance keys inhabit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: BTreeMap<String, f64>,
    pub granularity: String,
}

/// The payload of a `data` message: variable name to its envelope.
pub type Payload = BTreeMap<String, Envelope>;

/// Signal-specific portion of a [`Message`], tagged on the wire by `signal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Body {
    Status {
        status: Status,
        /// Broker statuses announce the federation's initial year.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_year: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_year: Option<i32>,
        /// Monotonic ticker count. Diagnostic only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Data {
        /// Output schema the payload validated against. Routing diagnostics only.
        schema: String,
        payload: Payload,
    },
    Increment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<Status>,
    },
    FileString {
        name: String,
        payload: String,
    },
    FileBytes {
        name: String,
        /// Standard base64 of the artifact bytes.
        payload: String,
    },
}

impl Body {
    pub fn signal(&self) -> &'static str {
        match self {
            Body::Status { .. } => "status",
            Body::Data { .. } => "data",
            Body::Increment { .. } => "increment",
            Body::FileString { .. } => "file_string",
            Body::FileBytes { .. } => "file_bytes",
        }
    }
}

/// The only wire object. Every participant publishes and consumes these,
/// serialized as one JSON object per line of UTF-8 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub source: String,
    pub incstep: u32,
    pub year: i32,
    /// Wall-clock seconds since the UNIX epoch at publish time.
    pub time: f64,
    #[serde(flatten)]
    pub body: Body,
}

impl Message {
    fn new(source: impl Into<String>, incstep: u32, year: i32, body: Body) -> Self {
        Self {
            source: source.into(),
            incstep,
            year,
            time: unix_seconds(),
            body,
        }
    }

    /// A model status heartbeat.
    pub fn status(source: impl Into<String>, incstep: u32, year: i32, status: Status, id: u64) -> Self {
        Self::new(
            source,
            incstep,
            year,
            Body::Status {
                status,
                initial_year: None,
                current_year: None,
                id: Some(id),
            },
        )
    }

    /// A broker status heartbeat, which additionally announces the year coordinates.
    pub fn broker_status(status: Status, incstep: u32, initial_year: i32) -> Self {
        Self::new(
            BROKER_ID,
            incstep,
            initial_year + incstep as i32,
            Body::Status {
                status,
                initial_year: Some(initial_year),
                current_year: Some(initial_year + incstep as i32),
                id: None,
            },
        )
    }

    /// The broker's increment pulse for `incstep`.
    pub fn increment(status: Status, incstep: u32, initial_year: i32) -> Self {
        Self::new(
            BROKER_ID,
            incstep,
            initial_year + incstep as i32,
            Body::Increment {
                status: Some(status),
            },
        )
    }

    pub fn data(
        source: impl Into<String>,
        incstep: u32,
        year: i32,
        schema: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(
            source,
            incstep,
            year,
            Body::Data {
                schema: schema.into(),
                payload,
            },
        )
    }

    pub fn file_string(
        source: impl Into<String>,
        incstep: u32,
        year: i32,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(
            source,
            incstep,
            year,
            Body::FileString {
                name: name.into(),
                payload: payload.into(),
            },
        )
    }

    /// Binary artifacts travel base64-encoded inside the JSON text.
    pub fn file_bytes(
        source: impl Into<String>,
        incstep: u32,
        year: i32,
        name: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        Self::new(
            source,
            incstep,
            year,
            Body::FileBytes {
                name: name.into(),
                payload: base64::encode(bytes),
            },
        )
    }

    pub fn signal(&self) -> &'static str {
        self.body.signal()
    }

    pub fn is_from_broker(&self) -> bool {
        self.source == BROKER_ID
    }

    /// Serialize to the single-line wire form.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::Encode)
    }

    pub fn decode(line: &str) -> Result<Self, Error> {
        serde_json::from_str(line).map_err(Error::Decode)
    }

    /// Recover the raw bytes of a `file_bytes` payload.
    pub fn decode_file_bytes(&self) -> Option<Result<Vec<u8>, Error>> {
        match &self.body {
            Body::FileBytes { payload, .. } => {
                Some(base64::decode(payload).map_err(Error::Base64))
            }
            _ => None,
        }
    }
}

pub fn unix_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_millis() as f64 / 1_000.0
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trip() {
        let msg = Message::broker_status(Status::Booted, 3, 2016);
        let line = msg.encode().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["signal"], "status");
        assert_eq!(parsed["status"], "booted");
        assert_eq!(parsed["source"], "broker");
        assert_eq!(parsed["initial_year"], 2016);
        assert_eq!(parsed["current_year"], 2019);

        let recovered = Message::decode(&line).unwrap();
        assert_eq!(recovered, msg);
    }

    #[test]
    fn data_round_trip() {
        let payload = Payload::from([(
            "population".to_string(),
            Envelope {
                data: BTreeMap::from([("48001".to_string(), 1250.5)]),
                granularity: "county".to_string(),
            },
        )]);
        let msg = Message::data("population", 2, 2018, "population", payload);
        let line = msg.encode().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["signal"], "data");
        assert_eq!(parsed["payload"]["population"]["granularity"], "county");
        assert_eq!(parsed["payload"]["population"]["data"]["48001"], 1250.5);

        assert_eq!(Message::decode(&line).unwrap(), msg);
    }

    #[test]
    fn increment_pulse_carries_broker_status() {
        let msg = Message::increment(Status::Booted, 1, 2016);
        let line = msg.encode().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["signal"], "increment");
        assert_eq!(parsed["incstep"], 1);
        assert_eq!(parsed["year"], 2017);
        assert_eq!(parsed["status"], "booted");
    }

    #[test]
    fn file_bytes_round_trip() {
        let bytes = b"\x89PNG\r\n\x1a\n";
        let msg = Message::file_bytes("climate", 4, 2020, "map.png", bytes);

        let line = msg.encode().unwrap();
        let recovered = Message::decode(&line).unwrap();
        assert_eq!(recovered.decode_file_bytes().unwrap().unwrap(), bytes);
    }

    #[test]
    fn model_status_omits_broker_fields() {
        let msg = Message::status("water", 1, 2015, Status::Waiting, 17);
        let parsed: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(parsed["status"], "waiting");
        assert_eq!(parsed["id"], 17);
        assert!(parsed.get("initial_year").is_none());
    }

    #[test]
    fn unknown_signal_is_a_decode_error() {
        let line = json!({
            "source": "water",
            "incstep": 1,
            "year": 2017,
            "time": 0.0,
            "signal": "telemetry",
        })
        .to_string();

        assert!(matches!(Message::decode(&line), Err(Error::Decode(_))));
    }
}

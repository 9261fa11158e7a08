use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read schema directory {path}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read schema file {path}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("schema {name:?} failed to compile: {detail}")]
    Compile { name: String, detail: String },
    #[error("payload failed to validate schema {name:?}: {detail}")]
    Validation { name: String, detail: String },
}

/// Per-variable translation hints declared inside a schema document, at
/// `properties.<var>.properties.granularity.value` with optional sibling
/// `agg.value` / `dagg.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub granularity: String,
    pub agg: Option<String>,
    pub dagg: Option<String>,
}

/// One named, compiled schema document.
pub struct Schema {
    name: String,
    document: serde_json::Value,
    validator: jsonschema::Validator,
    hints: BTreeMap<String, Hint>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("hints", &self.hints)
            .finish_non_exhaustive()
    }
}

impl Schema {
    pub fn compile(name: impl Into<String>, document: serde_json::Value) -> Result<Self, Error> {
        let name = name.into();
        let validator = jsonschema::validator_for(&document).map_err(|err| Error::Compile {
            name: name.clone(),
            detail: err.to_string(),
        })?;
        let hints = extract_hints(&document);
        Ok(Self {
            name,
            document,
            validator,
            hints,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &serde_json::Value {
        &self.document
    }

    pub fn hints(&self) -> &BTreeMap<String, Hint> {
        &self.hints
    }

    pub fn hint(&self, variable: &str) -> Option<&Hint> {
        self.hints.get(variable)
    }

    pub fn is_valid(&self, payload: &serde_json::Value) -> bool {
        self.validator.is_valid(payload)
    }

    /// Validate, surfacing the first violation for diagnostics.
    pub fn validate(&self, payload: &serde_json::Value) -> Result<(), Error> {
        match self.validator.iter_errors(payload).next() {
            None => Ok(()),
            Some(err) => Err(Error::Validation {
                name: self.name.clone(),
                detail: err.to_string(),
            }),
        }
    }
}

/// A model's set of input or output schemas, keyed by file stem.
#[derive(Debug, Default)]
pub struct SchemaSet {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaSet {
    /// Load and compile every `*.json` document in `dir`, keyed by filename
    /// stem. A missing directory is an empty set.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let mut schemas = BTreeMap::new();

        if !dir.exists() {
            tracing::warn!(path = %dir.display(), "schema directory does not exist; loading none");
            return Ok(Self { schemas });
        }
        let entries = std::fs::read_dir(dir).map_err(|source| Error::ReadDir {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::ReadDir {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|source| Error::ReadFile {
                path: path.display().to_string(),
                source,
            })?;
            let document = serde_json::from_slice(&bytes).map_err(|source| Error::Parse {
                path: path.display().to_string(),
                source,
            })?;
            let schema = Schema::compile(stem, document)?;
            schemas.insert(stem.to_string(), schema);
        }
        Ok(Self { schemas })
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    pub fn insert(&mut self, schema: Schema) {
        self.schemas.insert(schema.name().to_string(), schema);
    }

    /// Every schema in the set that validates `payload`, in name order.
    pub fn matches(&self, payload: &serde_json::Value) -> Vec<&Schema> {
        self.schemas
            .values()
            .filter(|schema| schema.is_valid(payload))
            .collect()
    }
}

/// The generic data-message wrapper: every variable of a payload must be an
/// object carrying `data` (an object) and `granularity` (a string).
pub fn envelope_schema() -> &'static Schema {
    static ENVELOPE: OnceLock<Schema> = OnceLock::new();
    ENVELOPE.get_or_init(|| {
        let document = serde_json::json!({
            "type": "object",
            "patternProperties": {
                ".*": {
                    "type": "object",
                    "properties": {
                        "data": {"type": "object"},
                        "granularity": {"type": "string"},
                    },
                    "required": ["data", "granularity"],
                }
            },
        });
        Schema::compile("envelope", document).expect("the envelope schema always compiles")
    })
}

fn extract_hints(document: &serde_json::Value) -> BTreeMap<String, Hint> {
    let mut hints = BTreeMap::new();
    let Some(properties) = document.get("properties").and_then(|p| p.as_object()) else {
        return hints;
    };
    for (variable, subschema) in properties {
        let Some(inner) = subschema.get("properties") else {
            continue;
        };
        let value_of = |key: &str| -> Option<String> {
            inner
                .get(key)?
                .get("value")?
                .as_str()
                .map(str::to_string)
        };
        let Some(granularity) = value_of("granularity") else {
            continue;
        };
        hints.insert(
            variable.clone(),
            Hint {
                granularity,
                agg: value_of("agg"),
                dagg: value_of("dagg"),
            },
        );
    }
    hints
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn population_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "population": {
                    "type": "object",
                    "properties": {
                        "granularity": {"value": "county"},
                        "agg": {"value": "simple_sum"},
                        "data": {"type": "object"},
                    },
                    "required": ["data", "granularity"],
                }
            },
            "required": ["population"],
        })
    }

    fn rainfall_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "rainfall": {
                    "type": "object",
                    "properties": {
                        "granularity": {"value": "huc8"},
                    },
                    "required": ["data", "granularity"],
                }
            },
            "required": ["rainfall"],
        })
    }

    fn set_of(docs: &[(&str, serde_json::Value)]) -> SchemaSet {
        let mut set = SchemaSet::default();
        for (name, doc) in docs {
            set.insert(Schema::compile(*name, doc.clone()).unwrap());
        }
        set
    }

    #[test]
    fn matching_is_zero_one_or_many() {
        let set = set_of(&[
            ("population", population_schema()),
            ("rainfall", rainfall_schema()),
        ]);

        let payload = json!({
            "population": {"data": {"48001": 10.0}, "granularity": "county"},
        });
        let matched = set.matches(&payload);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "population");

        let neither = json!({"temperature": {"data": {}, "granularity": "latlon"}});
        assert!(set.matches(&neither).is_empty());

        let both = json!({
            "population": {"data": {}, "granularity": "county"},
            "rainfall": {"data": {}, "granularity": "huc8"},
        });
        assert_eq!(set.matches(&both).len(), 2);
    }

    #[test]
    fn hints_are_extracted_per_variable() {
        let schema = Schema::compile("population", population_schema()).unwrap();
        let hint = schema.hint("population").unwrap();
        assert_eq!(hint.granularity, "county");
        assert_eq!(hint.agg.as_deref(), Some("simple_sum"));
        assert_eq!(hint.dagg, None);
        assert!(schema.hint("rainfall").is_none());
    }

    #[test]
    fn envelope_schema_gates_payload_shape() {
        let envelope = envelope_schema();
        assert!(envelope.is_valid(&json!({
            "population": {"data": {"48001": 1.0}, "granularity": "county"},
        })));
        assert!(!envelope.is_valid(&json!({
            "population": {"data": {}},
        })));
        assert!(envelope
            .validate(&json!({"population": 12}))
            .is_err());
    }

    #[test]
    fn loads_documents_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (name, doc) in [
            ("population", population_schema()),
            ("rainfall", rainfall_schema()),
        ] {
            let mut f = std::fs::File::create(dir.path().join(format!("{name}.json"))).unwrap();
            write!(f, "{}", serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = SchemaSet::from_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.names().collect::<Vec<_>>(), ["population", "rainfall"]);

        let missing = SchemaSet::from_dir(dir.path().join("nope")).unwrap();
        assert!(missing.is_empty());
    }
}

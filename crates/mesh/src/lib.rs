mod functions;
mod graph;
mod translate;

pub use functions::{Aggregator, Disaggregator, Registry};
pub use graph::{Graph, Node};
pub use translate::{meet, Series, Translator};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read graph file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse graph file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate node id {0:?}")]
    DuplicateNode(String),
    #[error("link endpoint {0:?} is not a declared node")]
    UnknownLinkNode(String),
    #[error("node {id:?} has negative area {area}")]
    NegativeArea { id: String, area: f64 },
    #[error("granularity {0:?} is not a node of the abstract graph")]
    UnknownGranularity(String),
    #[error("no path in the abstract graph from {src:?} to {dest:?}")]
    NoAbstractPath { src: String, dest: String },
    #[error("cannot translate {variable:?} from {src:?} to {dest:?}: meet {meet:?} is unreachable")]
    NoTranslationPath {
        variable: String,
        src: String,
        dest: String,
        meet: String,
    },
    #[error("instance {instance:?} has {count} parents of kind {kind:?}, expected exactly one")]
    AmbiguousParent {
        instance: String,
        kind: String,
        count: usize,
    },
}

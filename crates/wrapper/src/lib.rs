mod config;
mod increment;
mod model;
mod runtime;
mod state;
#[cfg(test)]
mod testutil;

pub use config::{load_json_documents, Config};
pub use model::{Model, Outputs, Step};
pub use runtime::Runtime;

// Re-exported so model crates depend on `wrapper` alone.
pub use protocol::{Envelope, Payload};

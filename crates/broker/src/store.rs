use protocol::Message;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// The append-only message log contract. One logical collection per message
/// class; the broker inserts and never reads back.
pub trait MessageStore: Send + 'static {
    fn append(&mut self, collection: &str, message: &Message) -> anyhow::Result<()>;
}

/// The shipped store: one `<collection>.jsonl` file per collection under a
/// data directory, one canonical JSON serialization per line.
pub struct JsonlStore {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
        })
    }
}

impl MessageStore for JsonlStore {
    fn append(&mut self, collection: &str, message: &Message) -> anyhow::Result<()> {
        let file = match self.files.get_mut(collection) {
            Some(file) => file,
            None => {
                let path = self.dir.join(format!("{collection}.jsonl"));
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                self.files.entry(collection.to_string()).or_insert(file)
            }
        };
        ops::write_json_line(file, message)?;
        Ok(())
    }
}

//! JSON file persistence: `{conversation_id: [{role, content}, ...]}`,
//! rewritten atomically after every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{HistoryPersistence, Message, PersistError};
use crate::settings::write_atomic;

pub struct JsonFileHistory {
    path: PathBuf,
    mirror: Mutex<HashMap<String, Vec<Message>>>,
}

impl JsonFileHistory {
    /// Open (or start) the history file at `path`. An unreadable file is
    /// logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mirror = match read_file(&path) {
            Ok(map) => map,
            Err(e) => {
                log::error!("Error loading chat history {:?}: {}", path, e);
                HashMap::new()
            }
        };
        Self {
            path,
            mirror: Mutex::new(mirror),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, change: F) -> Result<(), PersistError>
    where
        F: FnOnce(&mut HashMap<String, Vec<Message>>),
    {
        let mut mirror = self
            .mirror
            .lock()
            .map_err(|_| PersistError::Io("history lock poisoned".to_string()))?;
        change(&mut mirror);

        let contents = serde_json::to_string_pretty(&*mirror)
            .map_err(|e| PersistError::Format(e.to_string()))?;
        write_atomic(&self.path, &contents).map_err(PersistError::Io)?;
        log::debug!("Saved chat history: {} conversations", mirror.len());
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<HashMap<String, Vec<Message>>, PersistError> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
        Ok(contents) => {
            serde_json::from_str(&contents).map_err(|e| PersistError::Format(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(PersistError::Io(e.to_string())),
    }
}

impl HistoryPersistence for JsonFileHistory {
    fn append(&self, conversation_id: &str, message: &Message) -> Result<(), PersistError> {
        self.update(|map| {
            map.entry(conversation_id.to_string())
                .or_default()
                .push(message.clone())
        })
    }

    fn load_all(&self) -> Result<HashMap<String, Vec<Message>>, PersistError> {
        self.mirror
            .lock()
            .map(|m| m.clone())
            .map_err(|_| PersistError::Io("history lock poisoned".to_string()))
    }

    fn remove(&self, conversation_id: &str) -> Result<(), PersistError> {
        self.update(|map| {
            map.remove(conversation_id);
        })
    }

    fn clear(&self) -> Result<(), PersistError> {
        self.update(|map| map.clear())
    }
}

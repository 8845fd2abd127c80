//! Server-side mirror of the variables exposed by the connected firmware.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::ScrutinyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Float32,
    Float64,
    Boolean,
}

/// Memory location and type of one firmware variable, as described by an SFD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDef {
    pub var_type: VariableType,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Var,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreEntry {
    pub entry_type: EntryType,
    pub display_path: String,
    pub variable_def: VariableDef,
}

/// Entries are keyed by display path; inserting the same path twice is an
/// error the caller decides how to handle.
#[derive(Debug, Default)]
pub struct Datastore {
    entries: HashMap<String, DatastoreEntry>,
}

impl Datastore {
    pub fn new() -> Self {
        Datastore::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn add_entry(&mut self, entry: DatastoreEntry) -> Result<(), ScrutinyError> {
        if self.entries.contains_key(&entry.display_path) {
            return Err(ScrutinyError::DuplicateEntry(entry.display_path));
        }
        self.entries.insert(entry.display_path.clone(), entry);
        Ok(())
    }

    pub fn get(&self, display_path: &str) -> Option<&DatastoreEntry> {
        self.entries.get(display_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

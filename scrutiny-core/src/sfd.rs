//! Scrutiny Firmware Descriptions: offline-built manifests of the variables
//! a given firmware build exposes, keyed by firmware ID.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::datastore::{VariableDef, VariableType};
use crate::error::ScrutinyError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfdMetadata {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfdVariable {
    pub display_path: String,
    pub var_type: VariableType,
    pub address: u64,
}

/// One firmware description. `firmware_id` is the ASCII-hex form of the
/// 16-byte ID embedded in the firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareDescription {
    firmware_id: String,
    #[serde(default)]
    metadata: SfdMetadata,
    variables: Vec<SfdVariable>,
}

impl FirmwareDescription {
    pub fn new(firmware_id: String, metadata: SfdMetadata, variables: Vec<SfdVariable>) -> Self {
        FirmwareDescription {
            firmware_id,
            metadata,
            variables,
        }
    }

    pub fn firmware_id(&self) -> &str {
        &self.firmware_id
    }

    pub fn metadata(&self) -> &SfdMetadata {
        &self.metadata
    }

    /// Yields every variable as a `(display_path, definition)` pair, ready
    /// for datastore insertion.
    pub fn get_vars_for_datastore(&self) -> impl Iterator<Item = (&str, VariableDef)> {
        self.variables.iter().map(|variable| {
            (
                variable.display_path.as_str(),
                VariableDef {
                    var_type: variable.var_type,
                    address: variable.address,
                },
            )
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ScrutinyError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ScrutinyError::Config(format!("cannot parse SFD file {}: {e}", path.display())))
    }
}

/// In-memory registry of installed firmware descriptions.
#[derive(Debug, Default)]
pub struct SfdStorage {
    installed: HashMap<String, FirmwareDescription>,
}

impl SfdStorage {
    pub fn new() -> Self {
        SfdStorage::default()
    }

    pub fn install(&mut self, sfd: FirmwareDescription) {
        debug!("Installing SFD for firmware ID {}", sfd.firmware_id());
        self.installed.insert(sfd.firmware_id().to_string(), sfd);
    }

    pub fn is_installed(&self, firmware_id: &str) -> bool {
        self.installed.contains_key(firmware_id)
    }

    pub fn get(&self, firmware_id: &str) -> Option<&FirmwareDescription> {
        self.installed.get(firmware_id)
    }

    /// Installs every `.json` manifest found in `dir`. Unparsable files are
    /// skipped with a warning. Returns the number of SFDs installed.
    pub fn load_from_dir(&mut self, dir: &Path) -> Result<usize, ScrutinyError> {
        let mut count = 0usize;
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match FirmwareDescription::from_file(&path) {
                Ok(sfd) => {
                    self.install(sfd);
                    count += 1;
                }
                Err(e) => warn!("Skipping {}. {e}", path.display()),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_sfd(firmware_id: &str) -> FirmwareDescription {
        FirmwareDescription::new(
            firmware_id.to_string(),
            SfdMetadata {
                project_name: Some("demo".into()),
                version: Some("1.2.3".into()),
            },
            vec![
                SfdVariable {
                    display_path: "/main/counter".into(),
                    var_type: VariableType::Uint32,
                    address: 0x2000_0000,
                },
                SfdVariable {
                    display_path: "/main/mode".into(),
                    var_type: VariableType::Uint8,
                    address: 0x2000_0004,
                },
            ],
        )
    }

    #[test]
    fn test_storage_lookup() {
        let mut storage = SfdStorage::new();
        assert!(!storage.is_installed("abcd"));
        storage.install(sample_sfd("abcd"));
        assert!(storage.is_installed("abcd"));
        assert_eq!(storage.get("abcd").unwrap().firmware_id(), "abcd");
        assert!(storage.get("ffff").is_none());
    }

    #[test]
    fn test_sfd_json_round_trip() {
        let sfd = sample_sfd("00112233445566778899aabbccddeeff");
        let json = serde_json::to_string(&sfd).unwrap();
        let back: FirmwareDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sfd);
        assert_eq!(back.get_vars_for_datastore().count(), 2);
    }
}

//! Local record of what has been applied: one entry per resource address
//! holding its server id and last known attributes.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

use derive_more::Display;
use rootcause::prelude::ResultExt;
use rootcause::{Report, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::resource::Kind;
use crate::schema::Record;

/// `<kind>.<label>`, the key of a resource in manifest and state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{kind}.{label}")]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub kind: Kind,
    pub label: String,
}

impl Address {
    pub fn new(kind: Kind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }
}

impl FromStr for Address {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, label)) = s.split_once('.') else {
            bail!("'{s}' is not a resource address, expected '<kind>.<label>'");
        };
        if label.is_empty() {
            bail!("'{s}' has an empty label");
        }
        Ok(Self::new(kind.parse()?, label))
    }
}

impl TryFrom<String> for Address {
    type Error = Report;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub attributes: Record,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub resources: BTreeMap<Address, ResourceState>,
}

impl State {
    /// Reads the state file; a missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self, Report> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet");
                return Ok(Self::default());
            }
            Err(e) => Err(e)
                .context("Couldn't read state file")
                .attach(format!("path: '{}'", path.display()))?,
        };

        let state = serde_json::from_str(&raw)
            .context("State file is not valid")
            .attach(format!("path: '{}'", path.display()))?;
        Ok(state)
    }

    /// Writes to a sibling temp file first so a crash never leaves a
    /// truncated state behind.
    pub fn save(&self, path: &Path) -> Result<(), Report> {
        let json = serde_json::to_string_pretty(self).context("Couldn't serialize state")?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        std::fs::write(&tmp, json)
            .context("Couldn't write state file")
            .attach(format!("path: '{}'", Path::new(&tmp).display()))?;
        std::fs::rename(&tmp, path)
            .context("Couldn't replace state file")
            .attach(format!("path: '{}'", path.display()))?;
        Ok(())
    }

    pub fn get(&self, address: &Address) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    pub fn put(&mut self, address: Address, id: String, attributes: Record) {
        self.resources
            .insert(address, ResourceState { id, attributes });
    }

    pub fn forget(&mut self, address: &Address) -> Option<ResourceState> {
        self.resources.remove(address)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn address_parses_kind_and_label() {
        let address: Address = "user.alice.smith".parse().unwrap();

        assert_eq!(address, Address::new(Kind::User, "alice.smith"));
        assert_eq!(address.to_string(), "user.alice.smith");
        assert!("user".parse::<Address>().is_err());
        assert!("user.".parse::<Address>().is_err());
        assert!("zone.a".parse::<Address>().is_err());
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();

        let state = State::load(&dir.path().join("state.json")).unwrap();

        assert!(state.resources.is_empty());
    }

    #[test]
    fn save_then_load_keeps_resources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = State::default();
        state.put(
            Address::new(Kind::Account, "ops"),
            "ops".to_string(),
            json!({ "name": "ops" }).as_object().unwrap().clone(),
        );

        state.save(&path).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let loaded = State::load(&path).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(raw["resources"]["account.ops"]["id"], json!("ops"));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = State::load(&path).unwrap_err();

        assert!(err.to_string().contains("not valid"));
    }
}

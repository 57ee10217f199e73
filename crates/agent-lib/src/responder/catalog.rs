//! Approved remediation actions
//!
//! Only actions listed here can ever be executed. Each entry carries its own
//! cooldown window, which is also the TTL of the claim taken before running.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One approved action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub cooldown_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Argument vector run by the command executor; `{target_id}` and
    /// `{target_name}` are substituted
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, cooldown: Duration, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            cooldown_secs: cooldown.as_secs(),
            timeout_secs: timeout.as_secs(),
            command: None,
        }
    }

    pub fn with_command(mut self, argv: Vec<String>) -> Self {
        self.command = Some(argv);
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Fixed whitelist of actions, keyed by name
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    actions: BTreeMap<String, ActionSpec>,
}

impl ActionCatalog {
    /// Build a catalog, rejecting duplicate names and zero windows
    pub fn new(actions: impl IntoIterator<Item = ActionSpec>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for spec in actions {
            if spec.name.trim().is_empty() {
                bail!("Action name must not be empty");
            }
            if spec.cooldown_secs == 0 {
                bail!("Action {} must have a positive cooldown", spec.name);
            }
            if spec.timeout_secs == 0 {
                bail!("Action {} must have a positive timeout", spec.name);
            }
            if let Some(previous) = map.insert(spec.name.clone(), spec) {
                bail!("Action {} is listed twice", previous.name);
            }
        }
        Ok(Self { actions: map })
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        let timeout = Duration::from_secs(default_timeout_secs());
        let actions = [
            ActionSpec::new("restart", Duration::from_secs(60), timeout),
            ActionSpec::new("scale", Duration::from_secs(300), timeout),
            ActionSpec::new("isolate", Duration::from_secs(600), timeout),
        ];
        Self {
            actions: actions
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = ActionCatalog::default();
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["isolate", "restart", "scale"]);
        assert_eq!(
            catalog.get("restart").unwrap().cooldown(),
            Duration::from_secs(60)
        );
        assert!(catalog.get("drop-database").is_none());
    }

    #[test]
    fn test_catalog_rejects_bad_entries() {
        let timeout = Duration::from_secs(5);
        assert!(ActionCatalog::new([ActionSpec::new("restart", Duration::ZERO, timeout)]).is_err());
        assert!(ActionCatalog::new([
            ActionSpec::new("restart", Duration::from_secs(1), timeout),
            ActionSpec::new("restart", Duration::from_secs(2), timeout),
        ])
        .is_err());
    }

    #[test]
    fn test_spec_deserializes_with_default_timeout() {
        let spec: ActionSpec =
            serde_json::from_str(r#"{"name":"restart","cooldown_secs":60}"#).unwrap();
        assert_eq!(spec.timeout(), Duration::from_secs(30));
        assert_eq!(spec.command, None);
    }
}

//! The committed configuration document fetched from the control plane.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use fleet_state::CommitId;

use crate::domain::bundle::BundleKind;
use crate::domain::error::{AgentError, Result};

const RESERVED_KEYS: [&str; 2] = ["commit_id", "bundle_order"];

/// Full declarative configuration for a device at one commit.
///
/// Bundle payloads are kept raw here; each is parsed on its own so that a
/// malformed bundle invalidates only itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedConfig {
    pub commit_id: CommitId,
    /// Ordering hint, ahead of name ordering among ready bundles
    pub bundle_order: Vec<BundleKind>,
    pub bundles: BTreeMap<BundleKind, Value>,
    /// Bundle types this agent does not know about
    pub ignored: Vec<String>,
    raw: Value,
}

impl CommittedConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| AgentError::Parse("document is not a JSON object".to_string()))?;

        let commit_id = match object.get("commit_id") {
            Some(Value::String(id)) if !id.is_empty() => CommitId::new(id.clone()),
            Some(_) => return Err(AgentError::Parse("commit_id must be a non-empty string".into())),
            None => return Err(AgentError::Parse("missing commit_id".into())),
        };

        let bundle_order = match object.get("bundle_order") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(|n| n.as_str().and_then(BundleKind::from_wire))
                .collect(),
            Some(_) => return Err(AgentError::Parse("bundle_order must be a list".into())),
        };

        let mut bundles = BTreeMap::new();
        let mut ignored = Vec::new();
        for (key, payload) in object {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            match BundleKind::from_wire(key) {
                Some(kind) => {
                    bundles.insert(kind, payload.clone());
                }
                None => {
                    debug!(bundle = %key, "ignoring unknown bundle type");
                    ignored.push(key.clone());
                }
            }
        }

        Ok(Self {
            commit_id,
            bundle_order,
            bundles,
            ignored,
            raw: value,
        })
    }

    /// The document as received.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Position of `kind` in the ordering hint, if listed.
    pub fn order_hint(&self, kind: BundleKind) -> Option<usize> {
        self.bundle_order.iter().position(|k| *k == kind)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;

/// Account/campaign scope under which items are addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seller SKU, the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub context_id: ContextId,
    pub name: String,
    pub link: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StartJobRequest {
    pub context_id: String,
    pub items: Vec<String>,
    #[serde(default = "default_skip_completed")]
    pub skip_completed: bool,
}

fn default_skip_completed() -> bool {
    true
}

impl StartJobRequest {
    /// Trims identifiers and drops blank entries, keeping the caller's order.
    pub fn normalized(self) -> Option<(ContextId, Vec<ItemId>, bool)> {
        let context = self.context_id.trim();
        if context.is_empty() {
            return None;
        }
        let items: Vec<ItemId> = self
            .items
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(ItemId::new)
            .collect();
        if items.is_empty() {
            return None;
        }
        Some((ContextId::new(context), items, self.skip_completed))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
}

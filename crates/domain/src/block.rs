//! Content blocks — the typed, ordered units of model output.
//!
//! The streaming parser derives a sequence of these from the model's
//! text as it arrives; the dispatcher and conversation history consume
//! them. A block is either free text or a structured tool invocation.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolParams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered tool-invocation parameters.
///
/// Preserves the order parameters appeared in the model output, which a
/// plain `HashMap` would lose. Serializes as a JSON object in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolParams {
    entries: Vec<(String, String)>,
}

impl ToolParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter. A repeated name overwrites the earlier value
    /// in place, keeping its original position.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ToolParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for ToolParams {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (n, v) in iter {
            params.push(n, v);
        }
        params
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContentBlock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One unit of parsed model output.
///
/// At most the *last* block in a parsed sequence may be partial, and
/// only an unclosed tool invocation ever is — completed text is always
/// final. Only non-partial `ToolUse` blocks are eligible for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        partial: bool,
    },
    ToolUse {
        name: String,
        params: ToolParams,
        partial: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            partial: false,
        }
    }

    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial,
        }
    }

    /// True for a tool invocation whose closing tag has been seen.
    pub fn is_executable_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { partial: false, .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

//! Session parameters for streaming data-plane connections.

use serde::{Deserialize, Serialize};

/// Per-session parameters supplied by the caller when opening a streaming
/// connection. Connections are pooled by [`SessionParams::pool_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionParams {
    pub model: String,
    pub language: String,
}

impl SessionParams {
    pub fn new(model: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            language: language.into(),
        }
    }

    /// Composite key used to pool connections opened with these parameters.
    ///
    /// Backslashes and colons inside either part are escaped with a
    /// backslash, so the one unescaped `:` separates model from language.
    pub fn pool_key(&self) -> String {
        format!("{}:{}", escape_key_part(&self.model), escape_key_part(&self.language))
    }
}

fn escape_key_part(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == ':' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

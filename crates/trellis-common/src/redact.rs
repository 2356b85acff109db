//! Scrubbing of secret material from text bound for logs or conditions
//!
//! A [`Redactor`] is created for one reconcile pass and handed down the call
//! chain. The resolver records every sensitive value it reads; anything that
//! might echo those values (error messages, payload previews) goes through
//! [`Redactor::redact`] before it leaves the pass.

use std::collections::BTreeSet;

/// Replacement text for scrubbed values
pub const REDACTED: &str = "[REDACTED]";

/// Values shorter than this are not scrubbed; they would mangle unrelated text.
const MIN_SECRET_LEN: usize = 4;

/// Set of sensitive values observed during one pass
#[derive(Clone, Debug, Default)]
pub struct Redactor {
    secrets: BTreeSet<String>,
}

impl Redactor {
    /// Create an empty redactor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sensitive value
    pub fn add(&mut self, value: impl AsRef<str>) {
        let value = value.as_ref().trim();
        if value.len() >= MIN_SECRET_LEN {
            self.secrets.insert(value.to_string());
        }
    }

    /// Record sensitive bytes, if they are text
    pub fn add_bytes(&mut self, value: &[u8]) {
        if let Ok(text) = std::str::from_utf8(value) {
            self.add(text);
        }
    }

    /// Number of recorded values
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Check if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Replace every recorded value in `text`
    pub fn redact(&self, text: &str) -> String {
        let mut ordered: Vec<&String> = self.secrets.iter().collect();
        // longest first so a secret containing another is scrubbed whole
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut out = text.to_string();
        for secret in ordered {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

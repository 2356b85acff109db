//! cloud-init `#cloud-config` document model

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use trellis_common::Error;

/// Header every cloud-config payload starts with
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// One `write_files` entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteFile {
    /// Absolute path on the node
    pub path: String,
    /// `user:group`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Octal permissions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// `b64` when content is base64-encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// File content
    pub content: String,
}

impl WriteFile {
    /// A file with text content and the given permissions
    pub fn text(path: impl Into<String>, content: impl Into<String>, permissions: &str) -> Self {
        Self {
            path: path.into(),
            owner: None,
            permissions: Some(permissions.to_string()),
            encoding: None,
            content: content.into(),
        }
    }

    /// A file from raw bytes; non-UTF-8 content is base64-encoded
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        let (encoding, content) = match std::str::from_utf8(bytes) {
            Ok(text) => (None, text.to_string()),
            Err(_) => (Some("b64".to_string()), STANDARD.encode(bytes)),
        };
        Self {
            path: path.into(),
            owner: None,
            permissions: None,
            encoding,
            content,
        }
    }
}

/// The subset of cloud-config used for bootstrap payloads
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CloudConfig {
    /// Files written before any command runs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFile>,
    /// Commands run in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<String>,
}

impl CloudConfig {
    /// Check structural validity of the assembled document
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = BTreeSet::new();
        for file in &self.write_files {
            if !seen.insert(file.path.as_str()) {
                return Err(Error::serialization_for_kind(
                    "cloud-config",
                    format!("duplicate write_files path {}", file.path),
                ));
            }
        }
        Ok(())
    }

    /// Validate and render to `#cloud-config` YAML
    pub fn render(&self) -> Result<String, Error> {
        self.validate()?;
        let body = serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("cloud-config", e.to_string()))?;
        Ok(format!("{}{}", CLOUD_CONFIG_HEADER, body))
    }
}

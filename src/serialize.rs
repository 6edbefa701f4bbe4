//! Boundary wire shapes
//!
//! The serializable projections exchanged with guests. Schemas evolve on the
//! guest side, so every shape defaults absent fields and carries unknown
//! ones through a flattened map instead of dropping them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vfs::ContentProducer;

/// One file handed to an analyzer. Content is produced lazily so a guest
/// that never opens the file never pays for it.
pub struct AnalysisInput {
    pub file_path: String,
    pub content: ContentProducer,
}

impl AnalysisInput {
    /// Input backed by an in-memory buffer.
    pub fn new(file_path: impl Into<String>, content: Vec<u8>) -> Self {
        Self::lazy(file_path, Box::new(move || Ok(content)))
    }

    /// Input whose bytes are produced on first read.
    pub fn lazy(file_path: impl Into<String>, content: ContentProducer) -> Self {
        Self {
            file_path: file_path.into(),
            content,
        }
    }
}

impl fmt::Debug for AnalysisInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisInput")
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

/// What an analyzer reports for one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub os: Option<OsInfo>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The scan report as guests see it: only the results array matters to the
/// host, everything else rides along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub results: Vec<ScanResult>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Convenience for lazy inputs sourced from the real filesystem.
pub fn file_content(path: std::path::PathBuf) -> ContentProducer {
    Box::new(move || std::fs::read(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_decodes_to_defaults() {
        let result: AnalysisResult = serde_json::from_str("{}").unwrap();
        assert_eq!(result, AnalysisResult::default());
    }

    #[test]
    fn null_os_and_empty_packages() {
        let result: AnalysisResult =
            serde_json::from_str(r#"{"os":null,"packages":[]}"#).unwrap();
        assert!(result.os.is_none());
        assert!(result.packages.is_empty());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{"target":"a.txt","class":"lang-pkgs","type":"gobinary","Vulnerabilities":[{"id":"CVE-1"}]}"#;
        let decoded: ScanResult = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.target, "a.txt");
        assert_eq!(decoded.kind, "gobinary");
        assert!(decoded.extra.contains_key("Vulnerabilities"));

        let reencoded = serde_json::to_value(&decoded).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn lazy_input_defers_content() {
        let input = AnalysisInput::lazy("a.txt", Box::new(|| Ok(b"body".to_vec())));
        assert_eq!(input.file_path, "a.txt");
        assert_eq!((input.content)().unwrap(), b"body");
    }
}

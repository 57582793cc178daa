//! Document store capability injected by the host application
//!
//! The conversation engine never touches files itself. Hosts implement
//! [`DocumentStore`] over whatever they manage (a notes vault, a database,
//! an object store) and hand it to the tool registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A document visible through the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Display name
    pub name: String,
    /// Opaque locator accepted by `read_document` / `write_document`
    pub locator: String,
}

impl DocumentRef {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
        }
    }
}

/// How `write_document` treats existing content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Replace => "replace",
            WriteMode::Append => "append",
        }
    }
}

impl std::str::FromStr for WriteMode {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(WriteMode::Replace),
            "append" => Ok(WriteMode::Append),
            other => Err(DocumentError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid write mode: {0} (expected \"replace\" or \"append\")")]
    InvalidMode(String),

    #[error("Document store error: {0}")]
    Store(String),
}

/// Read/write access to the host's documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents whose name matches `query` (empty query lists everything)
    async fn list_documents(&self, query: &str) -> Result<Vec<DocumentRef>, DocumentError>;

    async fn read_document(&self, locator: &str) -> Result<String, DocumentError>;

    async fn write_document(
        &self,
        locator: &str,
        content: &str,
        mode: WriteMode,
    ) -> Result<(), DocumentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mode_parsing() {
        assert_eq!("append".parse::<WriteMode>(), Ok(WriteMode::Append));
        assert_eq!("replace".parse::<WriteMode>(), Ok(WriteMode::Replace));
        assert_eq!(WriteMode::default(), WriteMode::Replace);
        assert!(matches!(
            "overwrite".parse::<WriteMode>(),
            Err(DocumentError::InvalidMode(_))
        ));
    }
}

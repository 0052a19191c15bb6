//! Document provider: read with hash, atomic overwrite.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::atomic::write_atomic;
use crate::digest::ContentHash;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("target is not valid UTF-8: {0}")]
    NotUtf8(String),
    #[error("I/O error on {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of truth for the target document.
pub trait DocumentStore: Send + Sync {
    /// Current content and its hash.
    fn read(&self, target: &str) -> Result<(String, ContentHash), DocumentError>;

    /// Replace the content atomically. Returns the hash of what was written.
    fn write_atomic(&self, target: &str, content: &str) -> Result<ContentHash, DocumentError>;

    fn exists(&self, target: &str) -> bool;
}

/// Filesystem documents. Relative targets resolve against `root`.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentStore {
    root: Option<PathBuf>,
}

impl FsDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, target: &str) -> PathBuf {
        let path = Path::new(target);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl DocumentStore for FsDocumentStore {
    fn read(&self, target: &str) -> Result<(String, ContentHash), DocumentError> {
        let bytes = std::fs::read(self.resolve(target)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DocumentError::NotFound(target.to_string()),
            _ => DocumentError::Io {
                target: target.to_string(),
                source: e,
            },
        })?;
        let hash = ContentHash::of(&bytes);
        let content =
            String::from_utf8(bytes).map_err(|_| DocumentError::NotUtf8(target.to_string()))?;
        Ok((content, hash))
    }

    fn write_atomic(&self, target: &str, content: &str) -> Result<ContentHash, DocumentError> {
        write_atomic(&self.resolve(target), content.as_bytes()).map_err(|source| {
            DocumentError::Io {
                target: target.to_string(),
                source,
            }
        })?;
        Ok(ContentHash::of(content.as_bytes()))
    }

    fn exists(&self, target: &str) -> bool {
        self.resolve(target).is_file()
    }
}

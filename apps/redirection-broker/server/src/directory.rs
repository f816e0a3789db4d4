//! Endpoint directory contract and a static, file-backed implementation.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use redirection_core::{ConnectionParameters, EndpointId};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("endpoint {0} is not known to the directory")]
    NotFound(EndpointId),
    #[error("directory lookup failed: {0}")]
    Unavailable(String),
    #[error("failed to read directory file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid directory file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("endpoint {0} is listed more than once")]
    Duplicate(EndpointId),
}

impl DirectoryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DirectoryError::NotFound(_) => "not_found",
            DirectoryError::Unavailable(_) => "unavailable",
            DirectoryError::Read { .. } => "read",
            DirectoryError::Parse(_) => "parse",
            DirectoryError::Duplicate(_) => "duplicate",
        }
    }
}

/// Resolves an endpoint to the parameters needed to reach it.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    async fn resolve(&self, endpoint_id: &EndpointId)
        -> Result<ConnectionParameters, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    id: EndpointId,
    #[serde(flatten)]
    params: ConnectionParameters,
}

/// In-memory directory, usually loaded once from a TOML file.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    endpoints: HashMap<EndpointId, ConnectionParameters>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (EndpointId, ConnectionParameters)>,
    ) -> Self {
        Self {
            endpoints: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, endpoint_id: EndpointId, params: ConnectionParameters) {
        self.endpoints.insert(endpoint_id, params);
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn parse(source: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = toml::from_str(source)?;
        let mut endpoints = HashMap::with_capacity(file.endpoints.len());
        for entry in file.endpoints {
            if endpoints.contains_key(&entry.id) {
                return Err(DirectoryError::Duplicate(entry.id));
            }
            endpoints.insert(entry.id, entry.params);
        }
        Ok(Self { endpoints })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| DirectoryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&source)
    }
}

#[async_trait]
impl EndpointDirectory for StaticDirectory {
    async fn resolve(
        &self,
        endpoint_id: &EndpointId,
    ) -> Result<ConnectionParameters, DirectoryError> {
        self.endpoints
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(endpoint_id.clone()))
    }
}

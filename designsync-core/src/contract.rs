//! # contract: collaborator interfaces of the export core
//!
//! The core never talks HTTP, parses config files or writes output itself. It
//! calls out through the traits in this module:
//!
//! - [`Fetcher`]: one generic remote call, used for component listings,
//!   variable collections and lightweight file version metadata.
//! - [`FileDownloader`]: resolves one remote file reference to a local path.
//!   Batched by the [`crate::queue::DownloadQueue`].
//! - [`ConfigExporter`]: turns one config file into an [`ExportPlan`] and emits
//!   the output of individual units.
//!
//! ## Mocking & Testing
//! - The traits are annotated for `mockall` so consumers can generate
//!   deterministic mocks (`MockFetcher`, `MockFileDownloader`,
//!   `MockConfigExporter`) behind the `test-export-mocks` feature.
//!
//! ## Data
//! Remote records are decoded from the normalized JSON [`Content`] a
//! [`Fetcher`] returns. Translating the real wire format into these shapes is
//! the fetcher's job.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::ExportContext;
use crate::error::{ExportError, RemoteError};
use crate::export::{ExportPlan, ExportUnit};

/// Normalized remote response body.
pub type Content = serde_json::Value;

/// The remote calls the core makes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Published components of a file.
    Components { file_id: String },
    /// Variable collections of a file.
    Variables { file_id: String },
    /// Lightweight version metadata of a file (no document tree).
    FileVersion { file_id: String },
}

impl Endpoint {
    pub fn file_id(&self) -> &str {
        match self {
            Endpoint::Components { file_id }
            | Endpoint::Variables { file_id }
            | Endpoint::FileVersion { file_id } => file_id,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Components { file_id } => write!(f, "components({file_id})"),
            Endpoint::Variables { file_id } => write!(f, "variables({file_id})"),
            Endpoint::FileVersion { file_id } => write!(f, "version({file_id})"),
        }
    }
}

/// Decodes a fetched [`Content`] into a typed record.
pub fn decode<T: DeserializeOwned>(endpoint: &Endpoint, content: Content) -> Result<T, RemoteError> {
    serde_json::from_value(content).map_err(|e| RemoteError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// One published component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub node_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered asset for the component, when the remote provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Component listing of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentListing {
    pub file_id: String,
    #[serde(default)]
    pub components: Vec<Component>,
}

/// Version metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub file_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One variable and its per-mode values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

/// A named variable collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableCollection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// All variable collections of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSets {
    pub file_id: String,
    #[serde(default)]
    pub collections: Vec<VariableCollection>,
}

impl VariableSets {
    pub fn collection(&self, name: &str) -> Option<&VariableCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name.clone()).collect()
    }
}

/// A pre-fetched node tree, kept opaque by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    pub file_id: String,
    pub root: serde_json::Value,
}

/// A file that has to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteFile {
    pub url: String,
    /// File name to use locally.
    pub name: String,
}

/// A downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub remote: RemoteFile,
    pub path: PathBuf,
}

/// An input file of a unit: either already local or still remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    Local(PathBuf),
    Remote(RemoteFile),
}

impl FileRef {
    pub fn is_remote(&self) -> bool {
        matches!(self, FileRef::Remote(_))
    }
}

/// Generic remote call.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the call and returns its normalized body.
    async fn fetch(&self, endpoint: &Endpoint) -> Result<Content, RemoteError>;
}

/// Downloads single files. Batched by the download queue.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait FileDownloader: Send + Sync {
    /// Retrieves `file` and returns where it now lives locally.
    async fn download_file(&self, file: &RemoteFile) -> Result<PathBuf, RemoteError>;
}

/// Knows a config format and an output format.
///
/// The batch driver only sees config paths; the exporter turns each into a
/// plan of units and writes the output of the units that need it.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ConfigExporter: Send + Sync {
    /// Reads `config` and lists its units of work.
    ///
    /// Remote lookups should go through `ctx` so they are shared with other
    /// configs of the same run.
    async fn plan(&self, config: &Path, ctx: &ExportContext) -> Result<ExportPlan, ExportError>;

    /// Writes the output of one unit. `files` are the unit's inputs, resolved
    /// to local paths in the order of [`ExportUnit::files`].
    async fn emit(
        &self,
        plan: &ExportPlan,
        unit: &ExportUnit,
        files: &[PathBuf],
    ) -> Result<(), ExportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reports_endpoint_on_failure() {
        let endpoint = Endpoint::FileVersion {
            file_id: "f1".into(),
        };
        let err = decode::<FileVersion>(&endpoint, serde_json::json!({"nope": 1})).unwrap_err();
        match err {
            RemoteError::Decode { endpoint, .. } => assert_eq!(endpoint, "version(f1)"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn decode_component_listing_with_defaults() {
        let endpoint = Endpoint::Components {
            file_id: "f1".into(),
        };
        let listing: ComponentListing = decode(
            &endpoint,
            serde_json::json!({
                "file_id": "f1",
                "components": [{"node_id": "1:2", "name": "Icon/Close"}]
            }),
        )
        .unwrap();
        assert_eq!(listing.components.len(), 1);
        assert!(listing.components[0].image_url.is_none());
        assert_eq!(endpoint.file_id(), "f1");
    }

    #[test]
    fn variable_sets_lookup_by_name() {
        let sets = VariableSets {
            file_id: "f1".into(),
            collections: vec![VariableCollection {
                id: "c1".into(),
                name: "Colors".into(),
                variables: vec![],
            }],
        };
        assert!(sets.collection("Colors").is_some());
        assert!(sets.collection("Spacing").is_none());
        assert_eq!(sets.collection_names(), vec!["Colors".to_string()]);
    }
}

//! # Remote client
//!
//! Implements the core's [`Fetcher`] and [`FileDownloader`] against the
//! design tool's REST API with `reqwest`.
//!
//! - Construct [`HttpClient`] from the environment (`DESIGNSYNC_TOKEN`,
//!   optional `DESIGNSYNC_API_URL`).
//! - Responses are translated into the normalized shapes the core decodes
//!   (see `designsync_core::contract`); the `normalize_*` functions do that
//!   translation and carry no I/O.
//! - Downloaded files land in a temporary directory owned by the client and
//!   removed when it is dropped.

use std::env;
use std::path::PathBuf;

use async_trait::async_trait;
use designsync_core::contract::{Content, Endpoint, Fetcher, FileDownloader, RemoteFile};
use designsync_core::error::RemoteError;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

pub const DEFAULT_API_URL: &str = "https://api.figma.com";

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    download_dir: TempDir,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let download_dir = tempfile::Builder::new().prefix("designsync-").tempdir()?;
        tracing::info!(
            base_url = %base_url,
            download_dir = %download_dir.path().display(),
            "Initialized HttpClient"
        );
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.into(),
            download_dir,
        })
    }

    pub fn new_from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let token = match env::var("DESIGNSYNC_TOKEN") {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = ?e, "DESIGNSYNC_TOKEN missing in environment");
                anyhow::bail!("DESIGNSYNC_TOKEN environment variable not set: {e}");
            }
        };
        let base_url = env::var("DESIGNSYNC_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::new(base_url, token)
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        match endpoint {
            Endpoint::Components { file_id } => {
                format!("{}/v1/files/{}/components", self.base_url, file_id)
            }
            Endpoint::Variables { file_id } => {
                format!("{}/v1/files/{}/variables/local", self.base_url, file_id)
            }
            Endpoint::FileVersion { file_id } => {
                format!("{}/v1/files/{}?depth=1", self.base_url, file_id)
            }
        }
    }

    async fn get(&self, url: &str, authenticated: bool) -> Result<reqwest::Response, RemoteError> {
        let mut request = self.client.get(url);
        if authenticated {
            request = request.header("X-Figma-Token", &self.token);
        }
        let response = request.send().await.map_err(|e| {
            tracing::error!(error = ?e, url = %url, "Request failed");
            RemoteError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, url = %url, "Remote returned error status");
            return Err(RemoteError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, endpoint: &Endpoint) -> Result<Content, RemoteError> {
        let url = self.url(endpoint);
        tracing::info!(endpoint = %endpoint, url = %url, "Fetching");
        let raw: Value = self
            .get(&url, true)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        normalize(endpoint, &raw)
    }
}

#[async_trait]
impl FileDownloader for HttpClient {
    async fn download_file(&self, file: &RemoteFile) -> Result<PathBuf, RemoteError> {
        // Signed asset URLs must not carry the API token.
        let bytes = self
            .get(&file.url, false)
            .await?
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport {
                url: file.url.clone(),
                reason: e.to_string(),
            })?;
        let path = self
            .download_dir
            .path()
            .join(format!("{}-{}", Uuid::new_v4(), sanitize(&file.name)));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            tracing::error!(error = ?e, path = %path.display(), "Failed to store download");
            RemoteError::Transport {
                url: file.url.clone(),
                reason: format!("could not write {}: {e}", path.display()),
            }
        })?;
        tracing::debug!(url = %file.url, path = %path.display(), bytes = bytes.len(), "Downloaded file");
        Ok(path)
    }
}

/// File system safe version of a remote file name.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Translates a raw API response into the shape the core decodes.
pub fn normalize(endpoint: &Endpoint, raw: &Value) -> Result<Content, RemoteError> {
    let decode_err = |reason: &str| RemoteError::Decode {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };
    let file_id = endpoint.file_id();
    match endpoint {
        Endpoint::Components { .. } => {
            let components = raw["meta"]["components"]
                .as_array()
                .ok_or_else(|| decode_err("missing meta.components"))?
                .iter()
                .map(|c| {
                    json!({
                        "node_id": c["node_id"],
                        "name": c["name"],
                        "description": c["description"].as_str().filter(|d| !d.is_empty()),
                        "image_url": c["thumbnail_url"].as_str(),
                    })
                })
                .collect::<Vec<_>>();
            Ok(json!({ "file_id": file_id, "components": components }))
        }
        Endpoint::Variables { .. } => {
            let meta = &raw["meta"];
            let collections = meta["variableCollections"]
                .as_object()
                .ok_or_else(|| decode_err("missing meta.variableCollections"))?;
            let variables = meta["variables"].as_object().cloned().unwrap_or_default();
            let mut normalized: Vec<Value> = collections
                .values()
                .map(|collection| {
                    let id = collection["id"].as_str().unwrap_or_default();
                    let mut members: Vec<Value> = variables
                        .values()
                        .filter(|v| v["variableCollectionId"].as_str() == Some(id))
                        .map(|v| {
                            json!({
                                "id": v["id"],
                                "name": v["name"],
                                "values": v["valuesByMode"],
                            })
                        })
                        .collect();
                    members.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
                    json!({ "id": id, "name": collection["name"], "variables": members })
                })
                .collect();
            normalized.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
            Ok(json!({ "file_id": file_id, "collections": normalized }))
        }
        Endpoint::FileVersion { .. } => {
            let version = raw["version"]
                .as_str()
                .ok_or_else(|| decode_err("missing version"))?;
            Ok(json!({
                "file_id": file_id,
                "version": version,
                "last_modified": raw["lastModified"].as_str(),
                "name": raw["name"].as_str(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use designsync_core::contract::{decode, ComponentListing, FileVersion, VariableSets};

    #[test]
    fn components_response_is_normalized() {
        let endpoint = Endpoint::Components {
            file_id: "f1".into(),
        };
        let raw = json!({
            "status": 200,
            "meta": {"components": [
                {"node_id": "1:2", "name": "Icon/Close", "description": "", "thumbnail_url": "https://cdn/x.png"}
            ]}
        });
        let listing: ComponentListing = decode(&endpoint, normalize(&endpoint, &raw).unwrap()).unwrap();
        assert_eq!(listing.file_id, "f1");
        assert_eq!(listing.components[0].node_id, "1:2");
        assert_eq!(listing.components[0].description, None);
        assert_eq!(listing.components[0].image_url.as_deref(), Some("https://cdn/x.png"));
    }

    #[test]
    fn variables_are_grouped_by_collection() {
        let endpoint = Endpoint::Variables {
            file_id: "f1".into(),
        };
        let raw = json!({"meta": {
            "variableCollections": {
                "VC:1": {"id": "VC:1", "name": "Colors"},
                "VC:2": {"id": "VC:2", "name": "Spacing"}
            },
            "variables": {
                "V:1": {"id": "V:1", "name": "red", "variableCollectionId": "VC:1", "valuesByMode": {"m1": "#f00"}},
                "V:2": {"id": "V:2", "name": "sm", "variableCollectionId": "VC:2", "valuesByMode": {"m1": 4}},
                "V:3": {"id": "V:3", "name": "blue", "variableCollectionId": "VC:1", "valuesByMode": {"m1": "#00f"}}
            }
        }});
        let sets: VariableSets = decode(&endpoint, normalize(&endpoint, &raw).unwrap()).unwrap();
        assert_eq!(sets.collection_names(), vec!["Colors".to_string(), "Spacing".to_string()]);
        let colors = sets.collection("Colors").unwrap();
        let names: Vec<&str> = colors.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["blue", "red"]);
    }

    #[test]
    fn file_version_requires_version() {
        let endpoint = Endpoint::FileVersion {
            file_id: "f1".into(),
        };
        let ok = normalize(&endpoint, &json!({"version": "42", "name": "Design", "lastModified": "2024-01-01T00:00:00Z"})).unwrap();
        let version: FileVersion = decode(&endpoint, ok).unwrap();
        assert_eq!(version.version, "42");
        assert_eq!(version.name.as_deref(), Some("Design"));

        let err = normalize(&endpoint, &json!({"name": "Design"})).unwrap_err();
        assert!(matches!(err, RemoteError::Decode { .. }));
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize("Icon/Close 24.svg"), "Icon_Close_24.svg");
        assert_eq!(sanitize(""), "unnamed");
    }

    #[test]
    fn endpoint_urls() {
        let client = HttpClient::new("https://api.example/", "t").unwrap();
        assert_eq!(
            client.url(&Endpoint::Components { file_id: "abc".into() }),
            "https://api.example/v1/files/abc/components"
        );
        assert_eq!(
            client.url(&Endpoint::FileVersion { file_id: "abc".into() }),
            "https://api.example/v1/files/abc?depth=1"
        );
    }
}

//! JSON output for YAML export configs.
//!
//! Each published component becomes one unit whose rendered image, when the
//! remote provides one, is downloaded through the shared queue. The named
//! variable collection, if any, becomes one more unit. Every unit is written
//! as `<output_dir>/<name>_<id>.json`, assets go to `<output_dir>/assets/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use designsync_core::context::ExportContext;
use designsync_core::contract::{Component, ConfigExporter, FileRef, RemoteFile, VariableCollection};
use designsync_core::error::ExportError;
use designsync_core::export::{ExportPlan, ExportUnit};
use serde::Serialize;
use serde_json::json;

use crate::http::sanitize;
use crate::load_config::{load_config, ExportConfig};

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExporter;

impl JsonExporter {
    pub fn new() -> Self {
        Self
    }
}

/// The fingerprinted view of a component. The image URL is signed and
/// expires, so it stays out of the content.
#[derive(Serialize)]
struct ComponentContent<'a> {
    node_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

fn component_unit(component: &Component) -> Result<ExportUnit, ExportError> {
    let view = ComponentContent {
        node_id: &component.node_id,
        name: &component.name,
        description: component.description.as_deref(),
    };
    let content = serde_json::to_vec(&view).map_err(|e| ExportError::Emit {
        unit: component.node_id.clone(),
        reason: e.to_string(),
    })?;
    let files = component
        .image_url
        .iter()
        .map(|url| {
            FileRef::Remote(RemoteFile {
                url: url.clone(),
                name: format!("{}_{}.png", sanitize(&component.name), sanitize(&component.node_id)),
            })
        })
        .collect();
    Ok(ExportUnit {
        id: component.node_id.clone(),
        name: component.name.clone(),
        content,
        files,
    })
}

fn collection_unit(collection: &VariableCollection) -> Result<ExportUnit, ExportError> {
    let id = format!("collection:{}", collection.id);
    let content = serde_json::to_vec(collection).map_err(|e| ExportError::Emit {
        unit: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(ExportUnit {
        id,
        name: collection.name.clone(),
        content,
        files: vec![],
    })
}

fn output_name(unit: &ExportUnit) -> String {
    format!("{}_{}.json", sanitize(&unit.name), sanitize(&unit.id))
}

fn asset_name(input: &FileRef, local: &Path) -> String {
    match input {
        FileRef::Remote(remote) => remote.name.clone(),
        FileRef::Local(path) => path
            .file_name()
            .or_else(|| local.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "asset".to_string()),
    }
}

#[async_trait]
impl ConfigExporter for JsonExporter {
    async fn plan(&self, config: &Path, ctx: &ExportContext) -> Result<ExportPlan, ExportError> {
        let ExportConfig {
            file_id,
            output_dir,
            priority,
            components,
            collection,
        } = load_config(config).map_err(|e| ExportError::Config {
            path: config.to_path_buf(),
            reason: format!("{e:#}"),
        })?;

        let listing = async {
            if components {
                ctx.components(&file_id).await.map(Some).map_err(ExportError::from)
            } else {
                Ok(None)
            }
        };
        let variables = async {
            match &collection {
                Some(name) => ctx.variable_collection(&file_id, name).await.map(Some),
                None => Ok(None),
            }
        };
        let (listing, variables) = futures::try_join!(listing, variables)?;

        let mut units = Vec::new();
        if let Some(listing) = listing {
            for component in &listing.components {
                units.push(component_unit(component)?);
            }
        }
        if let Some(collection) = variables {
            units.push(collection_unit(&collection)?);
        }

        tracing::info!(
            config = %config.display(),
            file_id = %file_id,
            units = units.len(),
            "Planned export"
        );
        Ok(ExportPlan {
            config_id: config.display().to_string(),
            file_id,
            priority,
            output_dir,
            units,
        })
    }

    async fn emit(
        &self,
        plan: &ExportPlan,
        unit: &ExportUnit,
        files: &[PathBuf],
    ) -> Result<(), ExportError> {
        let emit_err = |reason: String| ExportError::Emit {
            unit: unit.id.clone(),
            reason,
        };

        let mut assets = Vec::with_capacity(files.len());
        if !files.is_empty() {
            let asset_dir = plan.output_dir.join("assets");
            tokio::fs::create_dir_all(&asset_dir)
                .await
                .map_err(|e| emit_err(format!("create {}: {e}", asset_dir.display())))?;
            for (input, local) in unit.files.iter().zip(files) {
                let name = asset_name(input, local);
                let target = asset_dir.join(&name);
                tokio::fs::copy(local, &target)
                    .await
                    .map_err(|e| emit_err(format!("copy {} to {}: {e}", local.display(), target.display())))?;
                assets.push(format!("assets/{name}"));
            }
        }

        let content: serde_json::Value =
            serde_json::from_slice(&unit.content).map_err(|e| emit_err(e.to_string()))?;
        let document = json!({
            "id": unit.id,
            "name": unit.name,
            "source": plan.file_id,
            "content": content,
            "assets": assets,
        });
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| emit_err(e.to_string()))?;

        tokio::fs::create_dir_all(&plan.output_dir)
            .await
            .map_err(|e| emit_err(format!("create {}: {e}", plan.output_dir.display())))?;
        let target = plan.output_dir.join(output_name(unit));
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| emit_err(format!("write {}: {e}", target.display())))?;
        tracing::debug!(unit = %unit.id, path = %target.display(), "Emitted unit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use designsync_core::context::ContextSeed;
    use designsync_core::contract::{ComponentListing, Endpoint, MockFetcher};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn seeded_context(fetcher: MockFetcher) -> ExportContext {
        ExportContext::new(
            Arc::new(fetcher),
            ContextSeed {
                components: vec![ComponentListing {
                    file_id: "f1".into(),
                    components: vec![
                        Component {
                            node_id: "1:1".into(),
                            name: "Icon/Close".into(),
                            description: None,
                            image_url: Some("https://cdn.example/close.png".into()),
                        },
                        Component {
                            node_id: "1:2".into(),
                            name: "Badge".into(),
                            description: Some("small".into()),
                            image_url: None,
                        },
                    ],
                }],
                ..ContextSeed::default()
            },
        )
    }

    #[tokio::test]
    async fn plan_builds_component_and_collection_units() {
        let dir = tempdir().unwrap();
        let config = write_config(
            dir.path(),
            "file_id: f1\noutput_dir: ./out\npriority: 3\ncollection: Colors\n",
        );
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|e: &Endpoint| matches!(e, Endpoint::Variables { .. }))
            .times(1)
            .returning(|_| {
                Ok(json!({
                    "file_id": "f1",
                    "collections": [{"id": "VC:1", "name": "Colors", "variables": []}]
                }))
            });
        let ctx = seeded_context(fetcher);

        let plan = JsonExporter::new().plan(&config, &ctx).await.unwrap();
        assert_eq!(plan.priority, 3);
        assert_eq!(plan.file_id, "f1");
        let ids: Vec<&str> = plan.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["1:1", "1:2", "collection:VC:1"]);
        assert!(plan.units[0].files[0].is_remote());
        assert!(plan.units[1].files.is_empty());
    }

    #[tokio::test]
    async fn plan_reports_missing_collection() {
        let dir = tempdir().unwrap();
        let config = write_config(
            dir.path(),
            "file_id: f1\noutput_dir: ./out\ncomponents: false\ncollection: Spacing\n",
        );
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|_| {
            Ok(json!({"file_id": "f1", "collections": [{"id": "VC:1", "name": "Colors"}]}))
        });

        let err = JsonExporter::new()
            .plan(&config, &seeded_context(fetcher))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
    }

    #[tokio::test]
    async fn plan_rejects_unreadable_config() {
        let ctx = seeded_context(MockFetcher::new());
        let err = JsonExporter::new()
            .plan(Path::new("/definitely/not/here.yaml"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Config { .. }));
    }

    #[tokio::test]
    async fn emit_writes_document_and_assets() {
        let dir = tempdir().unwrap();
        let downloaded = dir.path().join("download.bin");
        std::fs::write(&downloaded, b"png-bytes").unwrap();

        let component = Component {
            node_id: "1:1".into(),
            name: "Icon/Close".into(),
            description: None,
            image_url: Some("https://cdn.example/close.png".into()),
        };
        let unit = component_unit(&component).unwrap();
        let plan = ExportPlan {
            config_id: "c.yaml".into(),
            file_id: "f1".into(),
            priority: 0,
            output_dir: dir.path().join("out"),
            units: vec![unit.clone()],
        };

        JsonExporter::new()
            .emit(&plan, &unit, &[downloaded])
            .await
            .unwrap();

        let out = dir.path().join("out");
        assert_eq!(std::fs::read(out.join("assets/Icon_Close_1_1.png")).unwrap(), b"png-bytes");
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("Icon_Close_1_1.json")).unwrap()).unwrap();
        assert_eq!(doc["id"], "1:1");
        assert_eq!(doc["source"], "f1");
        assert_eq!(doc["content"]["name"], "Icon/Close");
        assert!(doc["content"].get("image_url").is_none());
        assert_eq!(doc["assets"], json!(["assets/Icon_Close_1_1.png"]));
    }

    fn variant(node_id: &str, image_url: &str) -> Component {
        Component {
            node_id: node_id.into(),
            name: "Size=Small".into(),
            description: None,
            image_url: Some(image_url.into()),
        }
    }

    #[tokio::test]
    async fn same_named_components_keep_separate_assets() {
        let dir = tempdir().unwrap();
        let first = variant("1:1", "https://cdn.example/a.png");
        let second = variant("2:1", "https://cdn.example/b.png");
        let units = vec![component_unit(&first).unwrap(), component_unit(&second).unwrap()];
        let plan = ExportPlan {
            config_id: "c.yaml".into(),
            file_id: "f1".into(),
            priority: 0,
            output_dir: dir.path().join("out"),
            units: units.clone(),
        };

        for (unit, bytes) in units.iter().zip([b"AAAA", b"BBBB"]) {
            let downloaded = dir.path().join(format!("{}.bin", sanitize(&unit.id)));
            std::fs::write(&downloaded, bytes).unwrap();
            JsonExporter::new()
                .emit(&plan, unit, &[downloaded])
                .await
                .unwrap();
        }

        let out = dir.path().join("out");
        assert_eq!(std::fs::read(out.join("assets/Size=Small_1_1.png")).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(out.join("assets/Size=Small_2_1.png")).unwrap(), b"BBBB");
        for (doc, asset) in [
            ("Size=Small_1_1.json", "assets/Size=Small_1_1.png"),
            ("Size=Small_2_1.json", "assets/Size=Small_2_1.png"),
        ] {
            let doc: serde_json::Value =
                serde_json::from_slice(&std::fs::read(out.join(doc)).unwrap()).unwrap();
            assert_eq!(doc["assets"], json!([asset]));
        }
    }

    #[test]
    fn fingerprint_ignores_image_url() {
        let before = component_unit(&variant("1:1", "https://cdn.example/a.png?sig=1")).unwrap();
        let after = component_unit(&variant("1:1", "https://cdn.example/a.png?sig=2")).unwrap();
        assert_eq!(before.fingerprint(), after.fingerprint());

        let described = Component {
            description: Some("compact".into()),
            ..variant("1:1", "https://cdn.example/a.png?sig=1")
        };
        assert_ne!(component_unit(&described).unwrap().fingerprint(), before.fingerprint());
    }
}

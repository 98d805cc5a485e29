//! Manifest sources: plain directories and in-memory fixtures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use drift_core::{fnv1a_hex, DriftError, DriftResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// Where an application's desired state comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceRef {
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
}

impl SourceRef {
    pub fn new(repo_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self { repo_url: repo_url.into(), path: path.into(), target_revision: "HEAD".into() }
    }
}

/// Manifests at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rendered {
    pub revision: String,
    pub manifests: Vec<Json>,
}

#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, source: &SourceRef) -> DriftResult<Rendered>;
}

/// Reads `*.yaml`, `*.yml` and `*.json` files under `<root>/<source.path>` (recursively,
/// in path order). The revision is a content hash.
pub struct DirectoryRenderer {
    root: PathBuf,
}

impl DirectoryRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    fn render_dir(&self, source: &SourceRef) -> Result<Rendered> {
        let dir = self.root.join(&source.path);
        let mut files = Vec::new();
        collect_files(&dir, &mut files).with_context(|| format!("reading {}", dir.display()))?;
        files.sort();
        let mut manifests = Vec::new();
        let mut digest = Vec::new();
        for f in files.iter() {
            let text = std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display()))?;
            let rel = f.strip_prefix(&dir).unwrap_or(f);
            digest.extend_from_slice(rel.to_string_lossy().as_bytes());
            digest.push(0);
            digest.extend_from_slice(text.as_bytes());
            let docs = if f.extension().map_or(false, |e| e == "json") { parse_json(&text) } else { parse_yaml(&text) };
            let docs = docs.with_context(|| format!("parsing {}", rel.display()))?;
            manifests.extend(docs);
        }
        debug!(dir = %dir.display(), files = files.len(), manifests = manifests.len(), "rendered directory");
        Ok(Rendered { revision: fnv1a_hex(&digest), manifests })
    }
}

#[async_trait]
impl ManifestRenderer for DirectoryRenderer {
    async fn render(&self, source: &SourceRef) -> DriftResult<Rendered> {
        self.render_dir(source).map_err(|e| DriftError::Render(format!("{:#}", e)))
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")) {
            out.push(path);
        }
    }
    Ok(())
}

fn parse_yaml(text: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let v = Json::deserialize(doc)?;
        flatten(v, &mut out);
    }
    Ok(out)
}

fn parse_json(text: &str) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    flatten(serde_json::from_str(text)?, &mut out);
    Ok(out)
}

/// Empty documents are dropped; arrays and `kind: List` are unpacked.
fn flatten(v: Json, out: &mut Vec<Json>) {
    match v {
        Json::Null => {}
        Json::Array(items) => items.into_iter().for_each(|i| flatten(i, out)),
        Json::Object(mut map) if map.get("kind").and_then(|k| k.as_str()) == Some("List") => {
            if let Some(Json::Array(items)) = map.remove("items") {
                items.into_iter().for_each(|i| flatten(i, out));
            }
        }
        other => out.push(other),
    }
}

/// In-memory renderer keyed by source path; a path can be switched to failing.
#[derive(Default)]
pub struct StaticRenderer {
    sources: Mutex<HashMap<String, Result<Rendered, String>>>,
}

impl StaticRenderer {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, path: impl Into<String>, revision: impl Into<String>, manifests: Vec<Json>) {
        self.lock().insert(path.into(), Ok(Rendered { revision: revision.into(), manifests }));
    }

    pub fn fail(&self, path: impl Into<String>, message: impl Into<String>) { self.lock().insert(path.into(), Err(message.into())); }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Result<Rendered, String>>> {
        self.sources.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ManifestRenderer for StaticRenderer {
    async fn render(&self, source: &SourceRef) -> DriftResult<Rendered> {
        match self.lock().get(&source.path) {
            Some(Ok(r)) => Ok(r.clone()),
            Some(Err(msg)) => Err(DriftError::Render(msg.clone())),
            None => Err(DriftError::Render(format!("no manifests at path {:?}", source.path))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_renderer_reads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("guestbook");
        std::fs::create_dir_all(app.join("nested")).unwrap();
        std::fs::write(
            app.join("a.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: one\n---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: two\n",
        )
        .unwrap();
        std::fs::write(app.join("nested/b.json"), r#"{"kind":"List","items":[{"apiVersion":"v1","kind":"Service","metadata":{"name":"svc"}}]}"#).unwrap();
        std::fs::write(app.join("README.md"), "not a manifest").unwrap();

        let r = DirectoryRenderer::new(dir.path());
        let out = r.render(&SourceRef::new("file://local", "guestbook")).await.unwrap();
        let names: Vec<&str> = out.manifests.iter().filter_map(|m| m["metadata"]["name"].as_str()).collect();
        assert_eq!(names, vec!["one", "two", "svc"]);
        assert_eq!(out.revision.len(), 16);

        let again = r.render(&SourceRef::new("file://local", "guestbook")).await.unwrap();
        assert_eq!(out.revision, again.revision);
        std::fs::write(app.join("a.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: one\n").unwrap();
        let changed = r.render(&SourceRef::new("file://local", "guestbook")).await.unwrap();
        assert_ne!(out.revision, changed.revision);
    }

    #[tokio::test]
    async fn directory_renderer_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "kind: [unterminated").unwrap();
        let err = DirectoryRenderer::new(dir.path()).render(&SourceRef::new("", "")).await.unwrap_err();
        assert!(matches!(err, DriftError::Render(ref m) if m.contains("bad.yaml")));
    }

    #[tokio::test]
    async fn static_renderer_switches_to_failure() {
        let r = StaticRenderer::new();
        r.set("app", "rev-1", vec![serde_json::json!({"kind": "ConfigMap"})]);
        assert_eq!(r.render(&SourceRef::new("", "app")).await.unwrap().revision, "rev-1");
        r.fail("app", "template exploded");
        assert_eq!(r.render(&SourceRef::new("", "app")).await.unwrap_err(), DriftError::Render("template exploded".into()));
    }
}

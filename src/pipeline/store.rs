//! Pipeline definitions persisted as JSON under `<state_dir>/pipelines/`.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::definition::PipelineDefinition;
use crate::error::{FerrymanError, Result};

#[derive(Debug, Clone)]
pub struct PipelineStore {
    root: PathBuf,
}

impl PipelineStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join("pipelines"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids become file names, so anything that could leave `root` is refused.
    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id.contains("..") {
            return Err(FerrymanError::Config(format!("invalid pipeline id '{id}'")));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    pub async fn save(&self, definition: &PipelineDefinition) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&definition.id)?;
        let contents = serde_json::to_string_pretty(definition)?;
        tokio::fs::write(&path, contents).await?;
        debug!(pipeline = %definition.id, path = %path.display(), "pipeline saved");
        Ok(path)
    }

    pub async fn load(&self, id: &str) -> Result<PipelineDefinition> {
        let path = self.path_for(id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FerrymanError::PipelineNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Ids of every stored pipeline, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem()
            {
                ids.push(stem.to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes a stored definition. Returns whether one existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Job, JobType, Pipeline, PipelineConfig};

    fn pipeline() -> Pipeline {
        Pipeline::new("archive", PipelineConfig::default()).with_jobs([
            Job::new("fetch", JobType::Download).with_id("fetch"),
            Job::new("push", JobType::Upload)
                .with_id("push")
                .depends_on("fetch")
                .with_config("engine", "s5cmd"),
        ])
    }

    #[tokio::test]
    async fn save_then_load_restores_definition() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::new(dir.path());
        let definition = pipeline().definition();

        let path = store.save(&definition).await.unwrap();
        assert!(path.starts_with(dir.path().join("pipelines")));

        let loaded = store.load(&definition.id).await.unwrap();
        assert_eq!(loaded, definition);
    }

    #[tokio::test]
    async fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        let a = pipeline().definition();
        let b = pipeline().definition();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(store.list().await.unwrap(), expected);

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn missing_pipeline_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::new(dir.path());
        assert!(matches!(
            store.load("nope").await,
            Err(FerrymanError::PipelineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::new(dir.path().join("state"));
        let secret = dir.path().join("secret.json");
        tokio::fs::write(&secret, "{}").await.unwrap();

        for id in ["../../secret", "..", "a/b", "a\\b", ""] {
            assert!(
                matches!(store.load(id).await, Err(FerrymanError::Config(_))),
                "load accepted {id:?}"
            );
            assert!(store.delete(id).await.is_err(), "delete accepted {id:?}");
        }
        assert!(secret.exists());

        let mut definition = pipeline().definition();
        definition.id = "../escaped".into();
        assert!(store.save(&definition).await.is_err());
        assert!(!dir.path().join("state/escaped.json").exists());
    }
}

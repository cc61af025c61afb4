use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Category, Example, Task};
use crate::error::{EvalError, Result};

pub const DEFAULT_SUPPORT_SPLIT: &str = "dev";

#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load(&self, task: &Task, category: &Category, split: &str) -> Result<Vec<Example>>;

    /// Few-shot pool for a category. Empty when the task ships none.
    async fn support(&self, task: &Task, category: &Category) -> Result<Vec<Example>>;
}

/// Reads `<root>/<task>/<split>/<category>.jsonl`, one record per line.
pub struct JsonlDataset {
    root: PathBuf,
    support_split: String,
}

impl JsonlDataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            support_split: DEFAULT_SUPPORT_SPLIT.to_string(),
        }
    }

    pub fn with_support_split(mut self, split: impl Into<String>) -> Self {
        self.support_split = split.into();
        self
    }

    pub fn path_for(&self, task: &str, split: &str, category: &str) -> PathBuf {
        self.root
            .join(task)
            .join(split)
            .join(format!("{}.jsonl", category))
    }

    async fn read(&self, task: &Task, path: &Path) -> Result<Vec<Example>> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EvalError::io(path, e))?;

        let mut examples = Vec::new();
        for (lineno, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let example = Example::from_record(task.family, line).map_err(|e| {
                EvalError::Dataset(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            examples.push(example);
        }
        debug!(path = %path.display(), examples = examples.len(), "Loaded dataset file");
        Ok(examples)
    }
}

#[async_trait]
impl DatasetSource for JsonlDataset {
    async fn load(&self, task: &Task, category: &Category, split: &str) -> Result<Vec<Example>> {
        let path = self.path_for(&task.name, split, &category.key);
        let examples = self.read(task, &path).await?;
        info!(
            task = %task.name,
            category = %category.key,
            split = %split,
            examples = examples.len(),
            "Loaded category"
        );
        Ok(examples)
    }

    async fn support(&self, task: &Task, category: &Category) -> Result<Vec<Example>> {
        let path = self.path_for(&task.name, &self.support_split, &category.key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        self.read(task, &path).await
    }
}

/// Dataset held in memory, keyed by (task, split, category).
#[derive(Default)]
pub struct InMemoryDataset {
    examples: HashMap<(String, String, String), Vec<Example>>,
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_examples(
        mut self,
        task: &str,
        split: &str,
        category: &str,
        examples: Vec<Example>,
    ) -> Self {
        self.examples.insert(
            (task.to_string(), split.to_string(), category.to_string()),
            examples,
        );
        self
    }
}

#[async_trait]
impl DatasetSource for InMemoryDataset {
    async fn load(&self, task: &Task, category: &Category, split: &str) -> Result<Vec<Example>> {
        self.examples
            .get(&(task.name.clone(), split.to_string(), category.key.clone()))
            .cloned()
            .ok_or_else(|| {
                EvalError::Dataset(format!(
                    "no {} examples for {}/{}",
                    split, task.name, category.key
                ))
            })
    }

    async fn support(&self, task: &Task, category: &Category) -> Result<Vec<Example>> {
        Ok(self
            .examples
            .get(&(
                task.name.clone(),
                DEFAULT_SUPPORT_SPLIT.to_string(),
                category.key.clone(),
            ))
            .cloned()
            .unwrap_or_default())
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::{BenchmarkFamily, Category, Task};
use crate::error::EvalError;

/// A benchmark as it ships, before a run picks split and languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub family: BenchmarkFamily,
    #[serde(default)]
    pub description: String,
    /// Language the dataset is written in.
    pub language: String,
    #[serde(default = "default_split")]
    pub default_split: String,
    pub categories: Vec<Category>,
}

fn default_split() -> String {
    "test".to_string()
}

pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskDefinition>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for def in builtin_definitions() {
            registry.register(def);
        }
        registry
    }

    pub fn register(&mut self, def: TaskDefinition) {
        self.tasks.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    /// Add definitions from a YAML list. Later definitions replace earlier
    /// ones with the same name.
    pub fn load_yaml(&mut self, path: &Path) -> Result<usize> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task definitions {}", path.display()))?;
        let defs: Vec<TaskDefinition> = serde_yaml::from_str(&body)
            .with_context(|| format!("Failed to parse task definitions {}", path.display()))?;
        let count = defs.len();
        for def in defs {
            self.register(def);
        }
        info!("Loaded {} task definitions from {}", count, path.display());
        Ok(count)
    }

    /// Build the immutable run task, keeping only `only` categories when given.
    pub fn resolve(
        &self,
        name: &str,
        split: Option<&str>,
        target_language: Option<&str>,
        only: &[String],
    ) -> crate::error::Result<Task> {
        let def = self
            .get(name)
            .ok_or_else(|| EvalError::config(format!("unknown task '{}'", name)))?;

        let categories: Vec<Category> = if only.is_empty() {
            def.categories.clone()
        } else {
            let unknown: Vec<&String> = only
                .iter()
                .filter(|k| !def.categories.iter().any(|c| &c.key == *k))
                .collect();
            if !unknown.is_empty() {
                return Err(EvalError::config(format!(
                    "task '{}' has no categories {:?}",
                    name, unknown
                )));
            }
            def.categories
                .iter()
                .filter(|c| only.contains(&c.key))
                .cloned()
                .collect()
        };

        if categories.is_empty() {
            return Err(EvalError::config(format!("task '{}' has no categories", name)));
        }

        Ok(Task {
            name: def.name.clone(),
            family: def.family,
            split: split.unwrap_or(&def.default_split).to_string(),
            source_language: def.language.clone(),
            target_language: target_language.map(str::to_string),
            categories,
        })
    }
}

fn def(
    name: &str,
    family: BenchmarkFamily,
    language: &str,
    description: &str,
    categories: &[(&str, &str, &str)],
) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        family,
        description: description.to_string(),
        language: language.to_string(),
        default_split: default_split(),
        categories: categories
            .iter()
            .map(|(k, d, g)| Category::new(k, d, g))
            .collect(),
    }
}

fn builtin_definitions() -> Vec<TaskDefinition> {
    vec![
        def(
            "mmlu",
            BenchmarkFamily::Mcqa,
            "en",
            "Massive multitask language understanding",
            &[
                ("abstract_algebra", "Abstract Algebra", "stem"),
                ("college_physics", "College Physics", "stem"),
                ("high_school_biology", "High School Biology", "stem"),
                ("philosophy", "Philosophy", "humanities"),
                ("world_religions", "World Religions", "humanities"),
                ("econometrics", "Econometrics", "social_sciences"),
                ("sociology", "Sociology", "social_sciences"),
                ("anatomy", "Anatomy", "other"),
                ("virology", "Virology", "other"),
            ],
        ),
        def(
            "kmmlu",
            BenchmarkFamily::Mcqa,
            "ko",
            "Korean multitask language understanding",
            &[
                ("math", "Math", "stem"),
                ("computer_science", "Computer Science", "stem"),
                ("korean_history", "Korean History", "humanities"),
                ("law", "Law", "social_sciences"),
                ("health", "Health", "other"),
            ],
        ),
        def(
            "gsm8k",
            BenchmarkFamily::OpenQa,
            "en",
            "Grade school math word problems",
            &[("main", "Main", "math")],
        ),
        def(
            "humaneval",
            BenchmarkFamily::Code,
            "en",
            "Hand-written Python programming problems",
            &[("openai_humaneval", "HumanEval", "code")],
        ),
        def(
            "mt-bench",
            BenchmarkFamily::MultiTurn,
            "en",
            "Two-turn open-ended conversations",
            &[
                ("writing", "Writing", "writing"),
                ("roleplay", "Roleplay", "writing"),
                ("reasoning", "Reasoning", "reasoning"),
                ("math", "Math", "reasoning"),
                ("coding", "Coding", "reasoning"),
                ("extraction", "Extraction", "knowledge"),
                ("stem", "STEM", "knowledge"),
                ("humanities", "Humanities", "knowledge"),
            ],
        ),
        def(
            "flores",
            BenchmarkFamily::Translation,
            "en",
            "Sentence-level machine translation",
            &[("devtest", "Devtest", "translation")],
        ),
    ]
}

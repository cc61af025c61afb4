use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{FamilyTemplates, PromptTemplates, TemplateStrategy};
use crate::error::EvalError;
use crate::task::BenchmarkFamily;

pub const FALLBACK_LANGUAGE: &str = "en";

const FAMILIES: [BenchmarkFamily; 5] = [
    BenchmarkFamily::Mcqa,
    BenchmarkFamily::OpenQa,
    BenchmarkFamily::Code,
    BenchmarkFamily::Translation,
    BenchmarkFamily::MultiTurn,
];

/// Built once at startup and shared by `Arc`; lookups fall back to English.
pub struct TemplateRegistry {
    strategies: HashMap<(BenchmarkFamily, String), Arc<dyn TemplateStrategy>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for family in FAMILIES {
            registry.register(
                family,
                FALLBACK_LANGUAGE,
                Arc::new(FamilyTemplates::builtin(family)),
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        family: BenchmarkFamily,
        language: &str,
        strategy: Arc<dyn TemplateStrategy>,
    ) {
        debug!(family = %family, language = %language, "Registered template");
        self.strategies
            .insert((family, language.to_string()), strategy);
    }

    pub fn get(
        &self,
        family: BenchmarkFamily,
        language: &str,
    ) -> crate::error::Result<Arc<dyn TemplateStrategy>> {
        self.strategies
            .get(&(family, language.to_string()))
            .or_else(|| {
                self.strategies
                    .get(&(family, FALLBACK_LANGUAGE.to_string()))
            })
            .cloned()
            .ok_or_else(|| {
                EvalError::config(format!(
                    "no {} template for language '{}'",
                    family, language
                ))
            })
    }

    /// Register templates from YAML shaped `family: { language: templates }`.
    pub fn load_yaml(&mut self, path: &Path) -> Result<usize> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read templates {}", path.display()))?;
        let parsed: BTreeMap<BenchmarkFamily, BTreeMap<String, PromptTemplates>> =
            serde_yaml::from_str(&body)
                .with_context(|| format!("Failed to parse templates {}", path.display()))?;

        let mut count = 0;
        for (family, languages) in parsed {
            for (language, templates) in languages {
                self.register(
                    family,
                    &language,
                    Arc::new(FamilyTemplates::new(family, templates)),
                );
                count += 1;
            }
        }
        info!("Loaded {} prompt templates from {}", count, path.display());
        Ok(count)
    }
}

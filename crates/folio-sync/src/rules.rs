//! Category seed configuration loaded from `rules/categories.yaml`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use folio_core::{CategoryRule, UNCATEGORIZED};
use folio_storage::{FinanceStore, NewCategory};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct CategorySeed {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    pub categories: Vec<SeedCategory>,
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCategory {
    pub name: String,
    #[serde(default)]
    pub provider_alias: Option<String>,
    #[serde(default = "default_expense")]
    pub expense: bool,
}

fn default_expense() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRule {
    pub id: i64,
    #[serde(rename = "match")]
    pub match_text: String,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub categories: usize,
    pub rules: usize,
}

impl CategorySeed {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let seed: CategorySeed = serde_yaml::from_str(raw)?;
        seed.validate()?;
        Ok(seed)
    }

    fn validate(&self) -> Result<()> {
        if !self.categories.iter().any(|c| c.name.eq_ignore_ascii_case(UNCATEGORIZED)) {
            bail!("category seed must define `{UNCATEGORIZED}`");
        }
        let mut seen_ids = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen_ids.insert(rule.id) {
                bail!("duplicate rule id {}", rule.id);
            }
            if rule.match_text.trim().is_empty() {
                bail!("rule {} has an empty match", rule.id);
            }
            if !self.categories.iter().any(|c| c.name == rule.category) {
                bail!("rule {} targets unknown category `{}`", rule.id, rule.category);
            }
        }
        Ok(())
    }

    /// Upserts categories by name, then rules by id.
    pub async fn apply(&self, store: &dyn FinanceStore) -> Result<SeedReport> {
        let mut ids = HashMap::new();
        for category in &self.categories {
            let id = store
                .upsert_category(&NewCategory {
                    name: category.name.clone(),
                    provider_alias: category.provider_alias.clone(),
                    expense: category.expense,
                })
                .await
                .with_context(|| format!("seeding category {}", category.name))?;
            ids.insert(category.name.as_str(), id);
        }

        for rule in &self.rules {
            let Some(category_id) = ids.get(rule.category.as_str()).copied() else {
                bail!("rule {} targets unknown category `{}`", rule.id, rule.category);
            };
            store
                .upsert_category_rule(&CategoryRule {
                    id: rule.id,
                    match_text: rule.match_text.clone(),
                    category_id,
                })
                .await
                .with_context(|| format!("seeding rule {}", rule.id))?;
        }

        info!(categories = self.categories.len(), rules = self.rules.len(), "category seed applied");
        Ok(SeedReport {
            categories: self.categories.len(),
            rules: self.rules.len(),
        })
    }
}

//! Deterministic transaction categorization.
//!
//! Operator rules are tried first, in ascending rule id, against the
//! lowercased display and merchant names. Without a rule match the bank
//! aggregator's primary category is looked up against category aliases, and
//! anything left over lands in `Uncategorized`.

use std::collections::HashMap;

use crate::{Category, CategoryId, CategoryRule, UNCATEGORIZED};

#[derive(Debug, Clone, Default)]
pub struct CategoryResolver {
    rules: Vec<(String, CategoryId)>,
    aliases: HashMap<String, CategoryId>,
    uncategorized: Option<CategoryId>,
}

impl CategoryResolver {
    pub fn new(rules: &[CategoryRule], categories: &[Category]) -> Self {
        let mut ordered_rules = rules
            .iter()
            .filter(|rule| !rule.match_text.trim().is_empty())
            .collect::<Vec<_>>();
        ordered_rules.sort_by_key(|rule| rule.id);

        let mut ordered_categories = categories.iter().collect::<Vec<_>>();
        ordered_categories.sort_by_key(|category| category.id);

        let mut aliases = HashMap::new();
        let mut uncategorized = None;
        for category in ordered_categories {
            if let Some(alias) = &category.provider_alias {
                aliases.entry(alias.clone()).or_insert(category.id);
            }
            if uncategorized.is_none() && category.name.eq_ignore_ascii_case(UNCATEGORIZED) {
                uncategorized = Some(category.id);
            }
        }

        Self {
            rules: ordered_rules
                .into_iter()
                .map(|rule| (rule.match_text.to_lowercase(), rule.category_id))
                .collect(),
            aliases,
            uncategorized,
        }
    }

    pub fn uncategorized(&self) -> Option<CategoryId> {
        self.uncategorized
    }

    pub fn resolve(
        &self,
        name: &str,
        merchant_name: Option<&str>,
        provider_primary: Option<&str>,
    ) -> Option<CategoryId> {
        let name = name.to_lowercase();
        let merchant = merchant_name.map(str::to_lowercase).unwrap_or_default();

        for (needle, category_id) in &self.rules {
            if name.contains(needle.as_str()) || (!merchant.is_empty() && merchant.contains(needle.as_str())) {
                return Some(*category_id);
            }
        }

        provider_primary
            .and_then(|primary| self.aliases.get(primary).copied())
            .or(self.uncategorized)
    }
}

/// One-shot form of [`CategoryResolver::resolve`].
pub fn resolve_category(
    name: &str,
    merchant_name: Option<&str>,
    provider_primary: Option<&str>,
    rules: &[CategoryRule],
    categories: &[Category],
) -> Option<CategoryId> {
    CategoryResolver::new(rules, categories).resolve(name, merchant_name, provider_primary)
}

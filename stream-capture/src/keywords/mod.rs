//! Keyword rules deciding which shows get recorded.
//!
//! Rules are kept in file order; the first rule matching a show wins and its
//! position becomes the job's priority rank.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Preferences, ShowEntry};
use crate::{Error, Result};

/// One rule as written in the keywords file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordRule {
    pub name: String,
    /// Rows matched against the show name.
    pub keywords: Vec<String>,
    /// Rows that veto a name match.
    pub exclude: Vec<String>,
    /// Rows matched against the category; empty accepts any category.
    pub categories: Vec<String>,
    pub pre_minutes: i64,
    pub post_minutes: i64,
    pub starred: bool,
    pub email: bool,
    pub quality_pref: String,
    pub lang_pref: String,
    pub channel_pref: String,
}

impl KeywordRule {
    pub fn preferences(&self) -> Preferences {
        Preferences {
            quality: self.quality_pref.clone(),
            language: self.lang_pref.clone(),
            channel: self.channel_pref.clone(),
        }
    }
}

/// Looks up the rule matching a show.
pub trait KeywordMatcher: Send + Sync {
    /// The first matching rule and its rank.
    fn find_match(&self, show: &ShowEntry) -> Option<(KeywordRule, usize)>;
}

/// Rows of comma separated patterns. A row matches when all of its patterns
/// do; the set matches when any row does.
#[derive(Debug, Clone)]
struct PatternRows(Vec<Vec<Regex>>);

impl PatternRows {
    fn compile(rows: &[String]) -> Result<Self> {
        rows.iter()
            .map(|row| {
                row.split(',')
                    .map(|item| Regex::new(&item.to_lowercase()).map_err(Error::from))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.0
            .iter()
            .any(|row| row.iter().all(|pattern| pattern.is_match(&text)))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: KeywordRule,
    keywords: PatternRows,
    exclude: PatternRows,
    categories: PatternRows,
}

/// Ordered, compiled keyword rules.
#[derive(Debug, Clone)]
pub struct KeywordRules {
    rules: Vec<CompiledRule>,
}

impl KeywordRules {
    pub fn new(rules: Vec<KeywordRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    keywords: PatternRows::compile(&rule.keywords)?,
                    exclude: PatternRows::compile(&rule.exclude)?,
                    categories: PatternRows::compile(&rule.categories)?,
                    rule,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Load rules from a JSON array.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading keywords", path, e))?;
        let rules: Vec<KeywordRule> = serde_json::from_str(&text)?;
        info!(rules = rules.len(), path = %path.display(), "Loaded keyword rules");
        Self::new(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl KeywordMatcher for KeywordRules {
    fn find_match(&self, show: &ShowEntry) -> Option<(KeywordRule, usize)> {
        self.rules.iter().enumerate().find_map(|(rank, compiled)| {
            let matched = compiled.keywords.matches(&show.name)
                && (compiled.categories.is_empty() || compiled.categories.matches(&show.category))
                && !compiled.exclude.matches(&show.name);
            matched.then(|| (compiled.rule.clone(), rank))
        })
    }
}

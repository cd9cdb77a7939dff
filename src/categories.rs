use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Catch-all category. Always present, never deletable, never has keywords.
pub const DEFAULT_CATEGORY: &str = "General";

/// Category the heuristic strategy assigns to exclamation-heavy mail.
pub const PROMOTIONAL_CATEGORY: &str = "Promotional";

/// Marker background for categories the configuration does not know.
pub const FALLBACK_COLOR: &str = "#1976d2";

const SEED: &[(&str, &[&str], &str)] = &[
    (
        PROMOTIONAL_CATEGORY,
        &["sale", "event", "promotion", "discount"],
        "#83781b",
    ),
    ("Social", &["facebook", "twitter", "instagram"], "#03a9f4"),
    ("Work", &["meeting", "report", "project"], "#8bc34a"),
    ("Personal", &["family", "friend", "personal"], "#e91e63"),
    (DEFAULT_CATEGORY, &[], "#9e9e9e"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub name: String,
    pub keywords: Vec<String>,
    pub color: String,
}

impl CategoryDefinition {
    pub fn new(name: &str, keywords: &[&str], color: &str) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            color: color.to_string(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CATEGORY
    }
}

/// Stored record shape for one category (`categoryMap[name]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CategoryRecord {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    color: Option<String>,
}

/// Ordered category set. Order is display order and the classification
/// tie-break; the default category is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryConfiguration {
    categories: Vec<CategoryDefinition>,
}

impl Default for CategoryConfiguration {
    fn default() -> Self {
        Self {
            categories: SEED
                .iter()
                .map(|(name, keywords, color)| CategoryDefinition::new(name, keywords, color))
                .collect(),
        }
    }
}

impl CategoryConfiguration {
    /// Builds a configuration from definitions, dropping duplicate and
    /// empty names and enforcing the default-category invariant.
    pub fn from_definitions(definitions: Vec<CategoryDefinition>) -> Self {
        let mut categories: Vec<CategoryDefinition> = Vec::with_capacity(definitions.len() + 1);
        for definition in definitions {
            if definition.name.trim().is_empty() {
                log::warn!("Ignoring category with an empty name");
                continue;
            }
            if categories.iter().any(|c| c.name == definition.name) {
                log::warn!("Ignoring duplicate category '{}'", definition.name);
                continue;
            }
            categories.push(definition);
        }
        let mut config = Self { categories };
        config.ensure_default();
        config
    }

    fn ensure_default(&mut self) {
        match self.categories.iter_mut().find(|c| c.is_default()) {
            Some(default) => {
                if !default.keywords.is_empty() {
                    log::warn!("Dropping keywords configured on '{DEFAULT_CATEGORY}'");
                    default.keywords.clear();
                }
            }
            None => {
                let color = seed_color(DEFAULT_CATEGORY).unwrap_or(FALLBACK_COLOR);
                self.categories
                    .push(CategoryDefinition::new(DEFAULT_CATEGORY, &[], color));
            }
        }
    }

    /// Reads the stored `categoryMap` value.
    ///
    /// Canonical records and the legacy `name -> [keywords]` shape are both
    /// accepted; anything else falls back to the built-in defaults.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let Value::Object(entries) = value else {
            log::warn!(
                "Stored category map is not an object ({}), using defaults",
                value_kind(value)
            );
            return Self::default();
        };

        let mut definitions = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            match entry {
                Value::Array(_) => match serde_json::from_value::<Vec<String>>(entry.clone()) {
                    Ok(keywords) => {
                        log::debug!("Upgrading legacy keyword list for '{name}'");
                        definitions.push(CategoryDefinition {
                            name: name.clone(),
                            keywords,
                            color: seed_color(name).unwrap_or(FALLBACK_COLOR).to_string(),
                        });
                    }
                    Err(e) => log::warn!("Skipping category '{name}': {e}"),
                },
                Value::Object(_) => match serde_json::from_value::<CategoryRecord>(entry.clone()) {
                    Ok(record) => definitions.push(CategoryDefinition {
                        name: name.clone(),
                        keywords: record.keywords,
                        color: record
                            .color
                            .filter(|c| !c.trim().is_empty())
                            .unwrap_or_else(|| {
                                seed_color(name).unwrap_or(FALLBACK_COLOR).to_string()
                            }),
                    }),
                    Err(e) => log::warn!("Skipping category '{name}': {e}"),
                },
                other => log::warn!(
                    "Skipping category '{name}': expected a record, found {}",
                    value_kind(other)
                ),
            }
        }
        Self::from_definitions(definitions)
    }

    /// Canonical stored shape, in display order.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for category in &self.categories {
            let record = CategoryRecord {
                keywords: category.keywords.clone(),
                color: Some(category.color.clone()),
            };
            map.insert(
                category.name.clone(),
                serde_json::to_value(record).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryDefinition> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&CategoryDefinition> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CategoryDefinition> {
        self.categories.iter_mut().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a category. Returns false if the name already exists.
    pub fn insert(&mut self, definition: CategoryDefinition) -> bool {
        if self.contains(&definition.name) {
            return false;
        }
        self.categories.push(definition);
        true
    }

    /// Removes a category; the default category is never removed.
    pub fn remove(&mut self, name: &str) -> Option<CategoryDefinition> {
        if name == DEFAULT_CATEGORY {
            return None;
        }
        let position = self.categories.iter().position(|c| c.name == name)?;
        Some(self.categories.remove(position))
    }

    /// Configured color for `name`, or the fallback for unknown names.
    pub fn color_for(&self, name: &str) -> &str {
        self.get(name)
            .map(|c| c.color.as_str())
            .unwrap_or(FALLBACK_COLOR)
    }
}

fn seed_color(name: &str) -> Option<&'static str> {
    SEED.iter()
        .find(|(seed_name, _, _)| *seed_name == name)
        .map(|(_, _, color)| *color)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How items are mapped to categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassificationMode {
    /// First category whose keyword is a substring of subject or snippet.
    #[default]
    Keyword,
    /// Highest keyword/token overlap, ties resolve to the default category.
    ScoredKeyword,
    /// Exclamation-count placeholder; ignores keyword configuration.
    Heuristic,
}

impl ClassificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMode::Keyword => "keyword",
            ClassificationMode::ScoredKeyword => "scored",
            ClassificationMode::Heuristic => "ml",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyword" => Some(ClassificationMode::Keyword),
            "scored" => Some(ClassificationMode::ScoredKeyword),
            "ml" | "heuristic" => Some(ClassificationMode::Heuristic),
            _ => None,
        }
    }

    /// Reads the stored `mode` value; absent or unrecognised -> `Keyword`.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::default(),
            Some(Value::String(s)) => Self::parse(s).unwrap_or_else(|| {
                log::warn!("Unknown classification mode '{s}', using keyword");
                Self::default()
            }),
            Some(other) => {
                log::warn!(
                    "Stored mode is {} rather than a string, using keyword",
                    value_kind(other)
                );
                Self::default()
            }
        }
    }
}

impl fmt::Display for ClassificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

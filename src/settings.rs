//! Settings editor operations.
//!
//! Each operation reads the whole category map, changes it and writes it
//! back in one piece. Concurrent editors are last-writer-wins.

use crate::categories::{
    CategoryConfiguration, CategoryDefinition, ClassificationMode, DEFAULT_CATEGORY,
    FALLBACK_COLOR,
};
use crate::store::{
    read_scan_settings, ConfigStore, ScanSettings, ValueBag, CATEGORY_MAP_KEY, MODE_KEY,
};
use anyhow::{anyhow, bail, Result};
use serde_json::Value;

pub async fn load_categories(store: &dyn ConfigStore) -> Result<CategoryConfiguration> {
    let bag = store.get(&[CATEGORY_MAP_KEY]).await?;
    Ok(CategoryConfiguration::from_value(bag.get(CATEGORY_MAP_KEY)))
}

pub async fn save_categories(
    store: &dyn ConfigStore,
    config: &CategoryConfiguration,
) -> Result<()> {
    let mut bag = ValueBag::new();
    bag.insert(CATEGORY_MAP_KEY.to_string(), config.to_value());
    store.set(bag).await
}

async fn update_categories<F>(store: &dyn ConfigStore, edit: F) -> Result<bool>
where
    F: FnOnce(&mut CategoryConfiguration) -> Result<bool>,
{
    let mut config = load_categories(store).await?;
    let changed = edit(&mut config)?;
    if changed {
        save_categories(store, &config).await?;
    }
    Ok(changed)
}

/// Adds an empty category. Returns false if it already exists.
pub async fn add_category(
    store: &dyn ConfigStore,
    name: &str,
    color: Option<&str>,
) -> Result<bool> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Category name cannot be empty");
    }
    let color = color
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(FALLBACK_COLOR);
    let changed = update_categories(store, |config| {
        Ok(config.insert(CategoryDefinition::new(name, &[], color)))
    })
    .await?;
    if changed {
        log::info!("Added category '{name}' ({color})");
    }
    Ok(changed)
}

pub async fn remove_category(store: &dyn ConfigStore, name: &str) -> Result<()> {
    let name = name.trim();
    if name == DEFAULT_CATEGORY {
        bail!("The '{DEFAULT_CATEGORY}' category cannot be removed");
    }
    update_categories(store, |config| {
        config
            .remove(name)
            .map(|_| true)
            .ok_or_else(|| anyhow!("Unknown category '{name}'"))
    })
    .await?;
    log::info!("Removed category '{name}'");
    Ok(())
}

/// Adds a keyword. Returns false if the category already had it.
pub async fn add_keyword(
    store: &dyn ConfigStore,
    category: &str,
    keyword: &str,
) -> Result<bool> {
    let category = category.trim();
    let keyword = keyword.trim();
    if keyword.is_empty() {
        bail!("Keyword cannot be empty");
    }
    if category == DEFAULT_CATEGORY {
        bail!("The '{DEFAULT_CATEGORY}' category is a catch-all and takes no keywords");
    }
    update_categories(store, |config| {
        let definition = config
            .get_mut(category)
            .ok_or_else(|| anyhow!("Unknown category '{category}'"))?;
        if definition.keywords.iter().any(|k| k == keyword) {
            return Ok(false);
        }
        definition.keywords.push(keyword.to_string());
        Ok(true)
    })
    .await
}

/// Removes a keyword. Returns false if the category did not have it.
pub async fn remove_keyword(
    store: &dyn ConfigStore,
    category: &str,
    keyword: &str,
) -> Result<bool> {
    let category = category.trim();
    let keyword = keyword.trim();
    update_categories(store, |config| {
        let definition = config
            .get_mut(category)
            .ok_or_else(|| anyhow!("Unknown category '{category}'"))?;
        let before = definition.keywords.len();
        definition.keywords.retain(|k| k != keyword);
        Ok(definition.keywords.len() != before)
    })
    .await
}

pub async fn change_color(store: &dyn ConfigStore, category: &str, color: &str) -> Result<()> {
    let category = category.trim();
    let color = color.trim();
    if color.is_empty() {
        bail!("Color cannot be empty");
    }
    update_categories(store, |config| {
        let definition = config
            .get_mut(category)
            .ok_or_else(|| anyhow!("Unknown category '{category}'"))?;
        definition.color = color.to_string();
        Ok(true)
    })
    .await?;
    Ok(())
}

pub async fn set_mode(store: &dyn ConfigStore, mode: ClassificationMode) -> Result<()> {
    let mut bag = ValueBag::new();
    bag.insert(MODE_KEY.to_string(), Value::String(mode.as_str().to_string()));
    store.set(bag).await?;
    log::info!("Classification mode set to {mode}");
    Ok(())
}

pub async fn show(store: &dyn ConfigStore) -> ScanSettings {
    read_scan_settings(store).await
}

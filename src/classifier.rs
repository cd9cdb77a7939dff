use crate::categories::{
    CategoryConfiguration, ClassificationMode, DEFAULT_CATEGORY, PROMOTIONAL_CATEGORY,
};
use crate::provider::ExtractedFields;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref TOKEN_SPLIT: Regex = Regex::new(r"[^\p{L}\p{N}]+").unwrap();
}

/// Exclamation-delimited segment count above which the heuristic calls an
/// item promotional (i.e. four or more `!`).
const PROMOTIONAL_SEGMENT_THRESHOLD: usize = 4;

/// Maps extracted fields to exactly one category name. Pure.
pub fn classify(
    fields: &ExtractedFields,
    config: &CategoryConfiguration,
    mode: ClassificationMode,
) -> String {
    match mode {
        ClassificationMode::Keyword => keyword_match(fields, config),
        ClassificationMode::ScoredKeyword => scored_match(fields, config),
        ClassificationMode::Heuristic => heuristic_match(fields),
    }
}

/// First category, in configuration order, with a keyword that occurs
/// literally in the subject or snippet. The sender is never consulted.
pub fn keyword_match(fields: &ExtractedFields, config: &CategoryConfiguration) -> String {
    config
        .iter()
        .find(|category| {
            category.keywords.iter().any(|keyword| {
                !keyword.is_empty()
                    && (fields.subject.contains(keyword.as_str())
                        || fields.snippet.contains(keyword.as_str()))
            })
        })
        .map(|category| category.name.clone())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

/// Lower-cased alphanumeric tokens longer than one character.
pub fn tokenize(text: &str) -> HashSet<String> {
    TOKEN_SPLIT
        .split(&text.to_lowercase())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

/// Category with the strictly highest keyword/token overlap. Any tie for
/// the lead, including everyone at zero, yields the default category.
pub fn scored_match(fields: &ExtractedFields, config: &CategoryConfiguration) -> String {
    let tokens = tokenize(&format!("{} {}", fields.subject, fields.snippet));

    let mut leader: Option<&str> = None;
    let mut best_score = 0usize;
    let mut tied = false;

    for category in config.iter() {
        let score = category
            .keywords
            .iter()
            .filter(|keyword| tokens.contains(&keyword.to_lowercase()))
            .count();
        if score > best_score {
            best_score = score;
            leader = Some(category.name.as_str());
            tied = false;
        } else if score == best_score && score > 0 {
            tied = true;
        }
    }

    match leader {
        Some(name) if !tied => name.to_string(),
        _ => DEFAULT_CATEGORY.to_string(),
    }
}

/// Placeholder for a learned model: lots of exclamation marks means
/// promotional, everything else is general.
pub fn heuristic_match(fields: &ExtractedFields) -> String {
    let combined = format!("{}{}", fields.subject, fields.snippet);
    if combined.split('!').count() > PROMOTIONAL_SEGMENT_THRESHOLD {
        PROMOTIONAL_CATEGORY.to_string()
    } else {
        DEFAULT_CATEGORY.to_string()
    }
}

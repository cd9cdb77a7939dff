use crate::annotator::is_marker;
use crate::dom::selector::SelectorList;
use crate::dom::{Document, NodeId};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text pulled out of one list item. Missing regions are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub subject: String,
    pub sender: String,
    pub snippet: String,
}

/// Supported webmail markup variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Outlook,
}

/// Host names that select a provider variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider: ProviderKind,
    pub hosts: Vec<String>,
}

pub struct ProviderSelectors {
    pub root: SelectorList,
    pub item: SelectorList,
    pub subject: SelectorList,
    pub sender: SelectorList,
    pub snippet: SelectorList,
}

impl ProviderSelectors {
    fn parse(root: &str, item: &str, subject: &str, sender: &str, snippet: &str) -> Self {
        // Literals below; a parse failure is a programming error.
        let parse = |s: &str| s.parse::<SelectorList>().unwrap();
        Self {
            root: parse(root),
            item: parse(item),
            subject: parse(subject),
            sender: parse(sender),
            snippet: parse(snippet),
        }
    }
}

lazy_static! {
    static ref GMAIL: ProviderSelectors = ProviderSelectors::parse(
        "div[role=main]",
        "tr.zA",
        ".bog",
        ".yX.xY .yP, .yW .yP",
        ".y2",
    );
    static ref OUTLOOK: ProviderSelectors = ProviderSelectors::parse(
        "div[role=listbox]",
        "div[role=option][data-convid]",
        "span.TtcXM",
        "span.OZZZK",
        "span.FqgPc",
    );
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

impl ProviderKind {
    pub fn selectors(&self) -> &'static ProviderSelectors {
        match self {
            ProviderKind::Gmail => &GMAIL,
            ProviderKind::Outlook => &OUTLOOK,
        }
    }

    pub fn default_hosts(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::Gmail => &["mail.google.com"],
            ProviderKind::Outlook => &[
                "outlook.live.com",
                "outlook.office.com",
                "outlook.office365.com",
            ],
        }
    }

    pub fn default_bindings() -> Vec<ProviderBinding> {
        [ProviderKind::Gmail, ProviderKind::Outlook]
            .into_iter()
            .map(|provider| ProviderBinding {
                provider,
                hosts: provider
                    .default_hosts()
                    .iter()
                    .map(|h| h.to_string())
                    .collect(),
            })
            .collect()
    }

    /// Provider for a document host; exact, case-insensitive match.
    pub fn resolve(host: Option<&str>, bindings: &[ProviderBinding]) -> Option<ProviderKind> {
        let host = host?;
        bindings
            .iter()
            .find(|binding| binding.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
            .map(|binding| binding.provider)
    }

    pub fn for_document(doc: &Document, bindings: &[ProviderBinding]) -> Option<ProviderKind> {
        Self::resolve(doc.host(), bindings)
    }

    /// Container worth observing for list changes, if this view has one.
    pub fn monitored_root(&self, doc: &Document) -> Option<NodeId> {
        doc.query_selector(doc.body(), &self.selectors().root)
    }

    /// Every rendered list item in document order.
    pub fn visible_items(&self, doc: &Document) -> Vec<NodeId> {
        doc.query_selector_all(doc.body(), &self.selectors().item)
            .into_iter()
            .filter(|item| doc.is_rendered(*item))
            .collect()
    }

    pub fn subject_region(&self, doc: &Document, item: NodeId) -> Option<NodeId> {
        doc.query_selector(item, &self.selectors().subject)
    }

    /// Reads subject, sender and snippet from `item`. Partially rendered
    /// items simply produce empty fields.
    pub fn extract(&self, doc: &Document, item: NodeId) -> ExtractedFields {
        let selectors = self.selectors();
        ExtractedFields {
            subject: region_text(doc, item, &selectors.subject),
            sender: region_text(doc, item, &selectors.sender),
            snippet: region_text(doc, item, &selectors.snippet),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gmail => write!(f, "gmail"),
            ProviderKind::Outlook => write!(f, "outlook"),
        }
    }
}

/// Collapsed text of the first region match, markers excluded.
fn region_text(doc: &Document, item: NodeId, selector: &SelectorList) -> String {
    let Some(region) = doc.query_selector(item, selector) else {
        return String::new();
    };
    let raw = doc.text_content_filtered(region, is_marker);
    WHITESPACE.replace_all(raw.trim(), " ").into_owned()
}

use super::{Document, NodeId};
use anyhow::{anyhow, bail, Result};
use std::str::FromStr;

/// A comma separated group of selectors.
///
/// Supported grammar: type, `.class`, `#id`, `[attr]`, `[attr=value]`
/// (value optionally quoted), compounds of those, and the descendant
/// combinator. Anything else is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    selectors: Vec<ComplexSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ComplexSelector {
    // Outermost ancestor first, subject last.
    compounds: Vec<CompoundSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CompoundSelector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttributeSelector {
    name: String,
    value: Option<String>,
}

impl FromStr for SelectorList {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut selectors = Vec::new();
        for group in split_top_level(input, |c| c == ',') {
            let group = group.trim();
            if group.is_empty() {
                bail!("Empty selector in '{input}'");
            }
            let compounds = split_top_level(group, char::is_whitespace)
                .into_iter()
                .filter(|part| !part.is_empty())
                .map(parse_compound)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| anyhow!("Invalid selector '{input}': {e}"))?;
            selectors.push(ComplexSelector { compounds });
        }
        Ok(Self { selectors })
    }
}

impl SelectorList {
    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        doc.is_element(node) && self.selectors.iter().any(|s| s.matches(doc, node))
    }
}

impl ComplexSelector {
    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some((subject, ancestors)) = self.compounds.split_last() else {
            return false;
        };
        if !subject.matches(doc, node) {
            return false;
        }
        // Descendant-only chains can be matched greedily against the
        // nearest qualifying ancestor.
        let mut current = doc.parent(node);
        for compound in ancestors.iter().rev() {
            loop {
                match current {
                    Some(id) if compound.matches(doc, id) => {
                        current = doc.parent(id);
                        break;
                    }
                    Some(id) => current = doc.parent(id),
                    None => return false,
                }
            }
        }
        true
    }
}

impl CompoundSelector {
    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some(tag) = doc.tag(node) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if expected != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if doc.attribute(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| doc.has_class(node, c)) {
            return false;
        }
        self.attributes.iter().all(|attr| match (&attr.value, doc.attribute(node, &attr.name)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
        })
    }
}

/// Splits on `is_separator` outside of `[...]` blocks and quotes.
fn split_top_level<F>(input: &str, is_separator: F) -> Vec<&str>
where
    F: Fn(char) -> bool,
{
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if depth == 0 && is_separator(c) => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(chars: &[char], pos: &mut usize) -> Result<String> {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    if *pos == start {
        bail!("expected identifier at offset {start}");
    }
    Ok(chars[start..*pos].iter().collect())
}

fn parse_compound(input: &str) -> Result<CompoundSelector> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut compound = CompoundSelector::default();

    if pos < chars.len() && chars[pos] == '*' {
        pos += 1;
    } else if pos < chars.len() && is_ident_char(chars[pos]) {
        compound.tag = Some(take_ident(&chars, &mut pos)?.to_ascii_lowercase());
    }

    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                pos += 1;
                compound.classes.push(take_ident(&chars, &mut pos)?);
            }
            '#' => {
                pos += 1;
                compound.id = Some(take_ident(&chars, &mut pos)?);
            }
            '[' => {
                let close = attribute_block_end(&chars, pos)
                    .ok_or_else(|| anyhow!("unterminated attribute selector"))?;
                let body: String = chars[pos + 1..close].iter().collect();
                compound.attributes.push(parse_attribute(&body)?);
                pos = close + 1;
            }
            other => bail!("unsupported token '{other}'"),
        }
    }
    Ok(compound)
}

/// Index of the `]` closing the block opened at `open`; brackets inside
/// quoted values do not count.
fn attribute_block_end(chars: &[char], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in chars.iter().enumerate().skip(open + 1) {
        match (quote, *c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(*c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_attribute(body: &str) -> Result<AttributeSelector> {
    let (name, value) = match body.split_once('=') {
        Some((name, value)) => {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (name.trim(), Some(unquoted.to_string()))
        }
        None => (body.trim(), None),
    };
    if name.is_empty() || !name.chars().all(is_ident_char) {
        bail!("invalid attribute name '{name}'");
    }
    Ok(AttributeSelector {
        name: name.to_ascii_lowercase(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn element(doc: &mut Document, parent: NodeId, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let node = doc.create_element(tag);
        for (name, value) in attrs {
            doc.set_attribute(node, name, value).unwrap();
        }
        doc.append_child(parent, node).unwrap();
        node
    }

    #[test]
    fn test_parse_rejects_unsupported_syntax() {
        assert!("tr > td".parse::<SelectorList>().is_err());
        assert!("a,,b".parse::<SelectorList>().is_err());
        assert!(".".parse::<SelectorList>().is_err());
        assert!("[role".parse::<SelectorList>().is_err());
        assert!("tr.zA".parse::<SelectorList>().is_ok());
        assert!("div[role=\"main\"] .y2".parse::<SelectorList>().is_ok());
    }

    #[test]
    fn test_compound_and_descendant_matching() {
        let mut doc = Document::new(Url::parse("https://mail.google.com/").unwrap());
        let body = doc.body();
        let sender_cell = element(&mut doc, body, "td", &[("class", "yX xY")]);
        let sender = element(&mut doc, sender_cell, "span", &[("class", "yP")]);
        let stray = element(&mut doc, body, "span", &[("class", "yP")]);

        let selector: SelectorList = ".yX.xY .yP, .yW .yP".parse().unwrap();
        assert!(selector.matches(&doc, sender));
        assert!(!selector.matches(&doc, stray));
        assert_eq!(doc.query_selector_all(body, &selector), vec![sender]);
    }

    #[test]
    fn test_attribute_selectors() {
        let mut doc = Document::new(Url::parse("https://outlook.live.com/").unwrap());
        let body = doc.body();
        let option = element(
            &mut doc,
            body,
            "div",
            &[("role", "option"), ("data-convid", "abc")],
        );
        let plain = element(&mut doc, body, "div", &[("role", "listbox")]);

        let by_value: SelectorList = "div[role='option'][data-convid]".parse().unwrap();
        assert!(by_value.matches(&doc, option));
        assert!(!by_value.matches(&doc, plain));

        let titled = element(&mut doc, body, "span", &[("title", "a]b c")]);
        let quoted: SelectorList = "span[title=\"a]b c\"]".parse().unwrap();
        assert!(quoted.matches(&doc, titled));
        assert!("span[title=\"a]b\"".parse::<SelectorList>().is_err());

        let by_id: SelectorList = "#missing".parse().unwrap();
        assert!(doc.query_selector(body, &by_id).is_none());
    }

    #[test]
    fn test_closest_walks_ancestors() {
        let mut doc = Document::new(Url::parse("https://mail.google.com/").unwrap());
        let body = doc.body();
        let row = element(&mut doc, body, "tr", &[("class", "zA")]);
        let cell = element(&mut doc, row, "td", &[]);
        let selector: SelectorList = "tr.zA".parse().unwrap();

        assert_eq!(doc.closest(cell, &selector), Some(row));
        assert_eq!(doc.closest(body, &selector), None);
    }
}

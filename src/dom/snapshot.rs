use super::{Document, NodeId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use url::Url;

/// Serialized page state: a location plus the children of `body`.
///
/// ```yaml
/// location: https://mail.google.com/mail/u/0/#inbox
/// body:
///   - tag: div
///     attrs: { role: main }
///     children:
///       - tag: tr
///         class: zA
///         children:
///           - { tag: span, class: bog, text: "Weekly report" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub location: String,
    #[serde(default)]
    pub body: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Text(String),
    Element(ElementSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl Snapshot {
    /// Parses YAML (and therefore JSON) snapshot text.
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse page snapshot")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot: {}", path.as_ref().display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid snapshot: {}", path.as_ref().display()))
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.location)
            .with_context(|| format!("Invalid snapshot location '{}'", self.location))
    }

    pub fn to_document(&self) -> Result<Document> {
        let mut doc = Document::new(self.url()?);
        let body = doc.body();
        build_children(&mut doc, body, &self.body)?;
        Ok(doc)
    }

    /// Applies this snapshot to a live document the way a single-page app
    /// re-renders: navigate if the location moved, then swap the body
    /// content. Every change goes through the normal mutation path and the
    /// old content is released.
    pub fn apply_to(&self, doc: &mut Document) -> Result<()> {
        let url = self.url()?;
        if doc.location() != &url {
            doc.navigate(url);
        }
        let body = doc.body();
        for child in doc.children(body).to_vec() {
            doc.remove_child(body, child)?;
            doc.release(child)?;
        }
        build_children(doc, body, &self.body)?;
        Ok(())
    }
}

fn build_children(doc: &mut Document, parent: NodeId, specs: &[NodeSpec]) -> Result<()> {
    for spec in specs {
        let node = match spec {
            NodeSpec::Text(text) => doc.create_text(text),
            NodeSpec::Element(element) => build_element(doc, element)?,
        };
        doc.append_child(parent, node)?;
    }
    Ok(())
}

fn build_element(doc: &mut Document, spec: &ElementSpec) -> Result<NodeId> {
    let node = doc.create_element(&spec.tag);
    if let Some(class) = &spec.class {
        doc.set_attribute(node, "class", class)?;
    }
    for (name, value) in &spec.attrs {
        doc.set_attribute(node, name, value)?;
    }
    if let Some(text) = &spec.text {
        let text_node = doc.create_text(text);
        doc.append_child(node, text_node)?;
    }
    build_children(doc, node, &spec.children)?;
    Ok(node)
}

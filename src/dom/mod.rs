pub mod selector;
pub mod snapshot;

use anyhow::{bail, Result};
use selector::SelectorList;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

/// Document handle shared between the watch session, the scanner and
/// whatever feeds mutations in. Never hold the lock across an `.await`.
pub type SharedDocument = Arc<Mutex<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    ChildList {
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    CharacterData,
    Attributes {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub kind: MutationKind,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<NodeData>,
}

struct Observer {
    id: ObserverId,
    root: NodeId,
    sender: mpsc::UnboundedSender<MutationRecord>,
}

/// Arena-backed model of an externally rendered page.
///
/// A removed subtree stays alive (and can be re-attached) until it is
/// handed to [`Document::release`]. Released slots are reused; ids carry a
/// generation so a stale id never resolves to the node that took its slot.
pub struct Document {
    location: Url,
    nodes: Vec<Slot>,
    free: Vec<usize>,
    body: NodeId,
    observers: Vec<Observer>,
    next_observer_id: u64,
}

impl Document {
    pub fn new(location: Url) -> Self {
        let body = NodeData {
            kind: NodeKind::Element {
                tag: "body".to_string(),
                attributes: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
        };
        Self {
            location,
            nodes: vec![Slot {
                generation: 0,
                node: Some(body),
            }],
            free: Vec::new(),
            body: NodeId {
                index: 0,
                generation: 0,
            },
            observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    pub fn into_shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn host(&self) -> Option<&str> {
        self.location.host_str()
    }

    /// Single-page navigation: the location changes, the tree stays.
    pub fn navigate(&mut self, location: Url) {
        log::debug!("Navigating {} -> {}", self.location, location);
        self.location = location;
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push_node(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push_node(NodeKind::Text(text.to_string()))
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let data = NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.nodes[index];
            slot.node = Some(data);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        self.nodes.push(Slot {
            generation: 0,
            node: Some(data),
        });
        NodeId {
            index: self.nodes.len() - 1,
            generation: 0,
        }
    }

    fn get(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData> {
        match self.nodes.get_mut(id.index) {
            Some(Slot {
                generation,
                node: Some(node),
            }) if *generation == id.generation => Ok(node),
            _ => bail!("{id:?} is not a live node"),
        }
    }

    /// False once the node has been released.
    pub fn contains(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }

    /// Live nodes, attached or not.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Frees a detached subtree so its slots can be reused.
    pub fn release(&mut self, node: NodeId) -> Result<()> {
        if node == self.body {
            bail!("The body cannot be released");
        }
        if self.get_mut(node)?.parent.is_some() {
            bail!("{node:?} is still attached");
        }
        let mut doomed = self.descendants(node);
        doomed.push(node);
        for id in doomed {
            let slot = &mut self.nodes[id.index];
            slot.node = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
        Ok(())
    }

    pub fn kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.get(node).map(|n| &n.kind)
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match self.kind(node)? {
            NodeKind::Element { tag, .. } => Some(tag),
            NodeKind::Text(_) => None,
        }
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.tag(node).is_some()
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match self.kind(node)? {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|value| value.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let name = name.to_ascii_lowercase();
        match &mut self.get_mut(node)?.kind {
            NodeKind::Element { attributes, .. } => {
                match attributes.iter_mut().find(|(k, _)| *k == name) {
                    Some((_, existing)) => *existing = value.to_string(),
                    None => attributes.push((name.clone(), value.to_string())),
                }
            }
            NodeKind::Text(_) => bail!("Cannot set attribute '{name}' on a text node"),
        }
        self.notify(MutationRecord {
            target: node,
            kind: MutationKind::Attributes { name },
        });
        Ok(())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.get(node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.get(node).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn last_child(&self, node: NodeId) -> Option<NodeId> {
        self.children(node).last().copied()
    }

    /// True when `ancestor` is `node` or one of its ancestors.
    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.is_inclusive_ancestor(self.body, node)
    }

    /// Connected and not inside a `hidden` subtree.
    pub fn is_rendered(&self, node: NodeId) -> bool {
        if !self.is_connected(node) {
            return false;
        }
        let mut current = Some(node);
        while let Some(id) = current {
            if self.attribute(id, "hidden").is_some() {
                return false;
            }
            current = self.parent(id);
        }
        true
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.contains(child) {
            bail!("{child:?} is not a live node");
        }
        if !self.is_element(parent) {
            bail!("Cannot append to {parent:?}: not a live element");
        }
        if self.is_inclusive_ancestor(child, parent) {
            bail!("Appending {child:?} under {parent:?} would create a cycle");
        }
        if let Some(old_parent) = self.parent(child) {
            self.remove_child(old_parent, child)?;
        }
        self.get_mut(child)?.parent = Some(parent);
        self.get_mut(parent)?.children.push(child);
        self.notify(MutationRecord {
            target: parent,
            kind: MutationKind::ChildList {
                added: vec![child],
                removed: Vec::new(),
            },
        });
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let children = &mut self.get_mut(parent)?.children;
        let Some(position) = children.iter().position(|c| *c == child) else {
            bail!("{child:?} is not a child of {parent:?}");
        };
        children.remove(position);
        self.get_mut(child)?.parent = None;
        self.notify(MutationRecord {
            target: parent,
            kind: MutationKind::ChildList {
                added: Vec::new(),
                removed: vec![child],
            },
        });
        Ok(())
    }

    /// `textContent =` semantics: text nodes are rewritten in place,
    /// elements lose (and release) their children in favour of one text node.
    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<()> {
        if let NodeKind::Text(existing) = &mut self.get_mut(node)?.kind {
            *existing = text.to_string();
            self.notify(MutationRecord {
                target: node,
                kind: MutationKind::CharacterData,
            });
            return Ok(());
        }
        for child in self.children(node).to_vec() {
            self.remove_child(node, child)?;
            self.release(child)?;
        }
        let text_node = self.create_text(text);
        self.append_child(node, text_node)
    }

    pub fn text_content(&self, node: NodeId) -> String {
        self.text_content_filtered(node, |_, _| false)
    }

    /// Concatenated text of the subtree, skipping any subtree for which
    /// `skip` returns true.
    pub fn text_content_filtered<F>(&self, node: NodeId, skip: F) -> String
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        let mut out = String::new();
        self.collect_text(node, &skip, &mut out);
        out
    }

    fn collect_text<F>(&self, node: NodeId, skip: &F, out: &mut String)
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        if skip(self, node) {
            return;
        }
        let Some(data) = self.get(node) else {
            return;
        };
        match &data.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Element { .. } => {
                for child in &data.children {
                    self.collect_text(*child, skip, out);
                }
            }
        }
    }

    /// Pre-order descendants of `node`, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    pub fn query_selector_all(&self, scope: NodeId, selector: &SelectorList) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|id| selector.matches(self, *id))
            .collect()
    }

    pub fn query_selector(&self, scope: NodeId, selector: &SelectorList) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|id| selector.matches(self, *id))
    }

    /// Parses `selector` and runs [`Document::query_selector_all`].
    pub fn select(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let selector: SelectorList = selector.parse()?;
        Ok(self.query_selector_all(scope, &selector))
    }

    pub fn closest(&self, node: NodeId, selector: &SelectorList) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if selector.matches(self, id) {
                return Some(id);
            }
            current = self.parent(id);
        }
        None
    }

    /// Registers a subtree observer on `root`. Records for every child
    /// list, text and attribute change inside the subtree are delivered
    /// until [`Document::disconnect`] is called or the receiver is dropped.
    pub fn observe(
        &mut self,
        root: NodeId,
    ) -> (ObserverId, mpsc::UnboundedReceiver<MutationRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push(Observer { id, root, sender });
        log::debug!("Observer {:?} bound to {:?}", id, root);
        (id, receiver)
    }

    pub fn disconnect(&mut self, id: ObserverId) {
        self.observers.retain(|o| o.id != id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn notify(&mut self, record: MutationRecord) {
        if self.observers.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        for observer in &self.observers {
            if !self.is_inclusive_ancestor(observer.root, record.target) {
                continue;
            }
            if observer.sender.send(record.clone()).is_err() {
                closed.push(observer.id);
            }
        }
        if !closed.is_empty() {
            self.observers.retain(|o| !closed.contains(&o.id));
        }
    }

    /// Indented rendering of the connected tree, one node per line.
    pub fn outline(&self) -> String {
        let mut out = format!("# {}\n", self.location);
        self.outline_node(self.body, 0, &mut out);
        out
    }

    fn outline_node(&self, node: NodeId, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let Some(data) = self.get(node) else {
            return;
        };
        match &data.kind {
            NodeKind::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    out.push_str(&format!("{indent}\"{text}\"\n"));
                }
            }
            NodeKind::Element { tag, attributes } => {
                out.push_str(&indent);
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push_str(&format!(" {name}=\"{value}\""));
                }
                out.push_str(">\n");
                for child in &data.children {
                    self.outline_node(*child, depth + 1, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new(Url::parse("https://mail.google.com/mail/u/0/#inbox").unwrap())
    }

    #[test]
    fn test_append_and_text_content() {
        let mut doc = doc();
        let row = doc.create_element("TR");
        let cell = doc.create_element("td");
        let text = doc.create_text("Weekly report");
        doc.append_child(doc.body(), row).unwrap();
        doc.append_child(row, cell).unwrap();
        doc.append_child(cell, text).unwrap();

        assert_eq!(doc.tag(row), Some("tr"));
        assert_eq!(doc.text_content(row), "Weekly report");
        assert!(doc.is_connected(text));
    }

    #[test]
    fn test_append_rejects_cycles_and_text_parents() {
        let mut doc = doc();
        let outer = doc.create_element("div");
        let inner = doc.create_element("div");
        let text = doc.create_text("x");
        doc.append_child(outer, inner).unwrap();

        assert!(doc.append_child(inner, outer).is_err());
        assert!(doc.append_child(outer, outer).is_err());
        assert!(doc.append_child(text, inner).is_err());
    }

    #[test]
    fn test_reparenting_moves_the_node() {
        let mut doc = doc();
        let a = doc.create_element("div");
        let b = doc.create_element("div");
        let child = doc.create_element("span");
        doc.append_child(a, child).unwrap();
        doc.append_child(b, child).unwrap();

        assert!(doc.children(a).is_empty());
        assert_eq!(doc.children(b), &[child]);
        assert_eq!(doc.parent(child), Some(b));
    }

    #[test]
    fn test_hidden_subtree_is_not_rendered() {
        let mut doc = doc();
        let wrapper = doc.create_element("div");
        let item = doc.create_element("tr");
        doc.append_child(doc.body(), wrapper).unwrap();
        doc.append_child(wrapper, item).unwrap();
        assert!(doc.is_rendered(item));

        doc.set_attribute(wrapper, "hidden", "").unwrap();
        assert!(!doc.is_rendered(item));

        let detached = doc.create_element("tr");
        assert!(!doc.is_rendered(detached));
    }

    #[test]
    fn test_set_text_replaces_children() {
        let mut doc = doc();
        let span = doc.create_element("span");
        let old = doc.create_element("b");
        doc.append_child(span, old).unwrap();
        doc.set_text(span, "fresh").unwrap();

        assert_eq!(doc.children(span).len(), 1);
        assert_eq!(doc.text_content(span), "fresh");
        assert_eq!(doc.parent(old), None);
        assert!(!doc.contains(old));
        assert_eq!(doc.node_count(), 3);
    }

    #[test]
    fn test_release_frees_detached_subtree_only() {
        let mut doc = doc();
        let row = doc.create_element("tr");
        let cell = doc.create_element("td");
        doc.append_child(doc.body(), row).unwrap();
        doc.append_child(row, cell).unwrap();

        assert!(doc.release(row).is_err());
        assert!(doc.release(doc.body()).is_err());

        doc.remove_child(doc.body(), row).unwrap();
        doc.release(row).unwrap();
        assert!(!doc.contains(row));
        assert!(!doc.contains(cell));
        assert!(doc.release(row).is_err());

        // A reused slot is a different node to holders of the old id.
        let fresh = doc.create_element("div");
        assert_ne!(fresh, row);
        assert_ne!(fresh, cell);
        assert_eq!(doc.tag(row), None);
        assert!(doc.append_child(doc.body(), cell).is_err());
        assert!(!doc.is_connected(row));
        assert_eq!(doc.node_count(), 2);
    }

    #[test]
    fn test_observer_sees_subtree_mutations_only() {
        let mut doc = doc();
        let watched = doc.create_element("div");
        let other = doc.create_element("div");
        doc.append_child(doc.body(), watched).unwrap();
        doc.append_child(doc.body(), other).unwrap();

        let (_id, mut rx) = doc.observe(watched);
        let row = doc.create_element("tr");
        doc.append_child(watched, row).unwrap();
        doc.set_attribute(row, "class", "zA").unwrap();
        let ignored = doc.create_element("span");
        doc.append_child(other, ignored).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.target, watched);
        assert!(matches!(first.kind, MutationKind::ChildList { .. }));
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second.kind,
            MutationKind::Attributes {
                name: "class".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let mut doc = doc();
        let (id, rx) = doc.observe(doc.body());
        let (_keep, _rx2) = doc.observe(doc.body());
        drop(rx);
        let node = doc.create_element("div");
        doc.append_child(doc.body(), node).unwrap();
        assert_eq!(doc.observer_count(), 1);

        doc.disconnect(id);
        assert_eq!(doc.observer_count(), 1);
    }

    #[test]
    fn test_navigate_keeps_tree() {
        let mut doc = doc();
        let node = doc.create_element("div");
        doc.append_child(doc.body(), node).unwrap();
        doc.navigate(Url::parse("https://mail.google.com/mail/u/0/#sent").unwrap());

        assert_eq!(doc.location().fragment(), Some("sent"));
        assert!(doc.is_connected(node));
    }
}

use crate::categories::CategoryConfiguration;
use crate::dom::{Document, NodeId};
use crate::provider::ProviderKind;
use anyhow::Result;

/// Class carried by every marker this engine inserts.
pub const MARKER_CLASS: &str = "category-badge";

/// Attribute holding the category name on a marker.
pub const MARKER_CATEGORY_ATTR: &str = "data-category";

const MARKER_STYLE: &str = "color: #fff; margin-left: 8px; border-radius: 8px; \
    padding: 2px 8px; font-size: 12px; font-weight: bold";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationOutcome {
    Annotated(NodeId),
    AlreadyMarked,
    /// No subject region to host the marker.
    Skipped,
}

pub fn is_marker(doc: &Document, node: NodeId) -> bool {
    doc.tag(node) == Some("span") && doc.has_class(node, MARKER_CLASS)
}

/// True when `region` already hosts a marker as a direct child.
pub fn is_annotated(doc: &Document, region: NodeId) -> bool {
    doc.children(region).iter().any(|child| is_marker(doc, *child))
}

/// Attaches a category marker to `item`'s subject region, at most once.
///
/// Never fails: a missing subject region or a tree error skips the item.
pub fn annotate(
    doc: &mut Document,
    provider: ProviderKind,
    item: NodeId,
    category: &str,
    config: &CategoryConfiguration,
) -> AnnotationOutcome {
    let Some(region) = provider.subject_region(doc, item) else {
        log::debug!("No subject region on {item:?}, skipping annotation");
        return AnnotationOutcome::Skipped;
    };
    if is_annotated(doc, region) {
        return AnnotationOutcome::AlreadyMarked;
    }
    match insert_marker(doc, region, category, config.color_for(category)) {
        Ok(marker) => AnnotationOutcome::Annotated(marker),
        Err(e) => {
            log::warn!("Failed to annotate {item:?}: {e}");
            AnnotationOutcome::Skipped
        }
    }
}

fn insert_marker(
    doc: &mut Document,
    region: NodeId,
    category: &str,
    color: &str,
) -> Result<NodeId> {
    let marker = doc.create_element("span");
    doc.set_attribute(marker, "class", MARKER_CLASS)?;
    doc.set_attribute(marker, MARKER_CATEGORY_ATTR, category)?;
    doc.set_attribute(
        marker,
        "style",
        &format!("background: {color}; {MARKER_STYLE}"),
    )?;
    let label = doc.create_text(category);
    doc.append_child(marker, label)?;
    doc.append_child(region, marker)?;
    Ok(marker)
}

/// Category names of every marker currently in the document, in order.
pub fn markers(doc: &Document) -> Vec<(NodeId, String)> {
    doc.descendants(doc.body())
        .into_iter()
        .filter(|node| is_marker(doc, *node))
        .map(|node| {
            let category = doc
                .attribute(node, MARKER_CATEGORY_ATTR)
                .map(str::to_string)
                .unwrap_or_else(|| doc.text_content(node));
            (node, category)
        })
        .collect()
}

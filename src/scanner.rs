use crate::annotator::{annotate, AnnotationOutcome};
use crate::categories::ClassificationMode;
use crate::classifier::classify;
use crate::dom::{Document, NodeId, SharedDocument};
use crate::provider::{ExtractedFields, ProviderBinding, ProviderKind};
use crate::store::{read_scan_settings, ConfigStore, ScanSettings};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub item: NodeId,
    pub fields: ExtractedFields,
    pub category: String,
    pub outcome: AnnotationOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub provider: Option<ProviderKind>,
    pub mode: ClassificationMode,
    pub items: Vec<ItemResult>,
    pub annotated: usize,
    pub already_marked: usize,
    pub skipped: usize,
    /// Items per resolved category.
    pub tallies: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
}

impl ScanReport {
    pub fn summary(&self) -> String {
        let provider = self
            .provider
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        let tallies = self
            .tallies
            .iter()
            .map(|(category, count)| format!("{category}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "provider={provider} mode={} items={} annotated={} already_marked={} skipped={} [{tallies}]",
            self.mode,
            self.items.len(),
            self.annotated,
            self.already_marked,
            self.skipped
        )
    }
}

/// One pass of extract -> classify -> annotate over every visible item.
pub fn scan_document(
    doc: &mut Document,
    settings: &ScanSettings,
    providers: &[ProviderBinding],
) -> ScanReport {
    let started = Instant::now();
    let mut report = ScanReport {
        mode: settings.mode,
        ..Default::default()
    };

    let Some(provider) = ProviderKind::for_document(doc, providers) else {
        log::debug!("No provider for {}, nothing to scan", doc.location());
        return report;
    };
    report.provider = Some(provider);

    for item in provider.visible_items(doc) {
        let fields = provider.extract(doc, item);
        let category = classify(&fields, &settings.categories, settings.mode);
        let outcome = annotate(doc, provider, item, &category, &settings.categories);
        log::debug!(
            "{item:?} subject={:?} -> {category} ({outcome:?})",
            fields.subject
        );

        match outcome {
            AnnotationOutcome::Annotated(_) => report.annotated += 1,
            AnnotationOutcome::AlreadyMarked => report.already_marked += 1,
            AnnotationOutcome::Skipped => report.skipped += 1,
        }
        *report.tallies.entry(category.clone()).or_insert(0) += 1;
        report.items.push(ItemResult {
            item,
            fields,
            category,
            outcome,
        });
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    if report.annotated > 0 {
        log::info!("Scan complete: {}", report.summary());
    } else {
        log::debug!("Scan complete: {}", report.summary());
    }
    report
}

/// Binds a document to a settings store and runs scans on demand.
#[derive(Clone)]
pub struct Scanner {
    doc: SharedDocument,
    store: Arc<dyn ConfigStore>,
    providers: Vec<ProviderBinding>,
}

impl Scanner {
    pub fn new(
        doc: SharedDocument,
        store: Arc<dyn ConfigStore>,
        providers: Vec<ProviderBinding>,
    ) -> Self {
        Self {
            doc,
            store,
            providers,
        }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn providers(&self) -> &[ProviderBinding] {
        &self.providers
    }

    /// Reads settings fresh from the store, then scans synchronously.
    pub async fn scan(&self) -> ScanReport {
        let settings = read_scan_settings(self.store.as_ref()).await;
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        scan_document(&mut doc, &settings, &self.providers)
    }
}

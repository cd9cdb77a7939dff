use inbox_tagger::annotator::markers;
use inbox_tagger::config::WatcherConfig;
use inbox_tagger::dom::snapshot::Snapshot;
use inbox_tagger::dom::SharedDocument;
use inbox_tagger::provider::ProviderKind;
use inbox_tagger::scanner::{ScanReport, Scanner};
use inbox_tagger::settings;
use inbox_tagger::store::{ConfigStore, FileStore};
use inbox_tagger::watcher::{ScanTrigger, WatchSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const OUTLOOK_INBOX: &str = r#"
location: https://outlook.office.com/mail/inbox
body:
  - tag: div
    attrs: { role: listbox }
    children:
      - tag: div
        attrs: { role: option, data-convid: c1 }
        children:
          - { tag: span, class: OZZZK, text: "Dana" }
          - { tag: span, class: TtcXM, text: "Quarterly report" }
          - { tag: span, class: FqgPc, text: "numbers inside" }
      - tag: div
        attrs: { role: option, data-convid: c2 }
        children:
          - { tag: span, class: OZZZK, text: "Hiking Club" }
          - { tag: span, class: TtcXM, text: "Trail day on Saturday" }
          - { tag: span, class: FqgPc, text: "bring water" }
"#;

const OUTLOOK_INBOX_UPDATED: &str = r#"
location: https://outlook.office.com/mail/inbox
body:
  - tag: div
    attrs: { role: listbox }
    children:
      - tag: div
        attrs: { role: option, data-convid: c3 }
        children:
          - { tag: span, class: OZZZK, text: "Hiking Club" }
          - { tag: span, class: TtcXM, text: "Trail map for Sunday" }
          - { tag: span, class: FqgPc, text: "see attached" }
"#;

fn watcher_config() -> WatcherConfig {
    WatcherConfig {
        debounce_ms: 20,
        location_poll_ms: 25,
    }
}

async fn next_report(
    rx: &mut mpsc::UnboundedReceiver<(ScanTrigger, ScanReport)>,
    wanted: ScanTrigger,
) -> ScanReport {
    timeout(Duration::from_secs(5), async {
        loop {
            let (trigger, report) = rx.recv().await.expect("watch session ended early");
            if trigger == wanted {
                return report;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {wanted} scan within timeout"))
}

fn marker_categories(doc: &SharedDocument) -> Vec<String> {
    let doc = doc.lock().unwrap();
    markers(&doc).into_iter().map(|(_, category)| category).collect()
}

#[tokio::test]
async fn test_watch_session_follows_settings_and_page_updates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("store.json")));
    let doc = Snapshot::parse(OUTLOOK_INBOX)
        .unwrap()
        .to_document()
        .unwrap()
        .into_shared();

    let scanner = Scanner::new(doc.clone(), store.clone(), ProviderKind::default_bindings());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = WatchSession::new(scanner, watcher_config())
        .with_reports(tx)
        .start();

    let initial = next_report(&mut rx, ScanTrigger::Initial).await;
    assert_eq!(initial.provider, Some(ProviderKind::Outlook));
    assert_eq!(initial.annotated, 2);
    assert_eq!(marker_categories(&doc), vec!["Work", "General"]);

    // A settings edit rescans right away but never relabels marked items.
    settings::add_category(store.as_ref(), "Outdoors", Some("#4caf50"))
        .await
        .unwrap();
    settings::add_keyword(store.as_ref(), "Outdoors", "Trail")
        .await
        .unwrap();
    for _ in 0..2 {
        let rescan = next_report(&mut rx, ScanTrigger::ConfigChange).await;
        assert_eq!(rescan.annotated, 0);
    }
    assert_eq!(marker_categories(&doc), vec!["Work", "General"]);

    // The page re-renders its list; new items pick up the new category.
    {
        let mut doc = doc.lock().unwrap();
        Snapshot::parse(OUTLOOK_INBOX_UPDATED)
            .unwrap()
            .apply_to(&mut doc)
            .unwrap();
    }
    let update = loop {
        let report = next_report(&mut rx, ScanTrigger::Mutation).await;
        if report.annotated > 0 {
            break report;
        }
    };
    assert_eq!(update.items[0].category, "Outdoors");
    assert_eq!(marker_categories(&doc), vec!["Outdoors"]);

    handle.stop().await;
    assert_eq!(doc.lock().unwrap().observer_count(), 0);
}

#[tokio::test]
async fn test_watch_session_tracks_navigation_away_from_provider() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("store.json")));
    let doc = Snapshot::parse(OUTLOOK_INBOX)
        .unwrap()
        .to_document()
        .unwrap()
        .into_shared();

    let scanner = Scanner::new(doc.clone(), store, ProviderKind::default_bindings());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = WatchSession::new(scanner, watcher_config())
        .with_reports(tx)
        .start();
    next_report(&mut rx, ScanTrigger::Initial).await;

    doc.lock()
        .unwrap()
        .navigate(url::Url::parse("https://intranet.example.org/home").unwrap());
    let report = next_report(&mut rx, ScanTrigger::Navigation).await;
    assert_eq!(report.provider, None);
    assert!(report.items.is_empty());

    assert!(handle.stats().navigations() >= 1);
    handle.stop().await;
}

#[tokio::test]
async fn test_file_store_picks_up_external_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let store = Arc::new(FileStore::new(&path));
    assert!(store.refresh().await.unwrap().is_empty());

    let mut changes = store.subscribe();
    let poller = store.spawn_poller(Duration::from_millis(20));

    std::fs::write(&path, r#"{ "mode": "ml" }"#).unwrap();
    let change = timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no change published")
        .unwrap();
    assert!(change.affects_scan());

    let current = settings::show(store.as_ref()).await;
    assert_eq!(current.mode.as_str(), "ml");
    poller.abort();
}

use crate::config::WatcherConfig;
use crate::dom::{MutationRecord, NodeId, ObserverId, SharedDocument};
use crate::provider::{ProviderBinding, ProviderKind};
use crate::scanner::{ScanReport, Scanner};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

/// Why a scan ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    Initial,
    Mutation,
    ConfigChange,
    Navigation,
}

impl fmt::Display for ScanTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanTrigger::Initial => "initial",
            ScanTrigger::Mutation => "mutation",
            ScanTrigger::ConfigChange => "config-change",
            ScanTrigger::Navigation => "navigation",
        };
        f.write_str(name)
    }
}

/// Trailing-edge debounce: every event pushes the deadline out to
/// `now + delay`, and only an expired deadline fires.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn notify(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true (once) if the deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// Subtree observer on the current provider's list container, or on
/// `body` when that container is not (yet) in the tree.
struct RootBinding {
    observer: ObserverId,
    receiver: mpsc::UnboundedReceiver<MutationRecord>,
    root: NodeId,
    provider: Option<ProviderKind>,
    fallback: bool,
}

impl RootBinding {
    fn bind(doc: &SharedDocument, providers: &[ProviderBinding]) -> Self {
        let mut doc = doc.lock().unwrap_or_else(PoisonError::into_inner);
        let provider = ProviderKind::for_document(&doc, providers);
        let root = provider.and_then(|p| p.monitored_root(&doc));
        let fallback = root.is_none();
        let root = root.unwrap_or_else(|| doc.body());
        let (observer, receiver) = doc.observe(root);
        if fallback {
            log::info!(
                "No list container for {} ({}), observing the whole body",
                doc.location(),
                provider.map(|p| p.to_string()).unwrap_or_else(|| "unknown provider".to_string())
            );
        } else {
            log::debug!("Observing {root:?} for {}", doc.location());
        }
        Self {
            observer,
            receiver,
            root,
            provider,
            fallback,
        }
    }

    fn unbind(&self, doc: &SharedDocument) {
        let mut doc = doc.lock().unwrap_or_else(PoisonError::into_inner);
        doc.disconnect(self.observer);
    }

    /// True when the bound root left the tree, or a fallback binding could
    /// now observe the real container.
    fn is_stale(&self, doc: &SharedDocument) -> bool {
        let doc = doc.lock().unwrap_or_else(PoisonError::into_inner);
        if !doc.is_connected(self.root) {
            return true;
        }
        self.fallback
            && self
                .provider
                .and_then(|p| p.monitored_root(&doc))
                .is_some()
    }
}

#[derive(Debug, Default)]
pub struct WatchStats {
    scans: AtomicU64,
    navigations: AtomicU64,
    rebinds: AtomicU64,
}

impl WatchStats {
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn navigations(&self) -> u64 {
        self.navigations.load(Ordering::Relaxed)
    }

    pub fn rebinds(&self) -> u64 {
        self.rebinds.load(Ordering::Relaxed)
    }
}

/// Decides when to scan: once at start, after list mutations settle,
/// immediately on settings changes, and after in-page navigation.
pub struct WatchSession {
    scanner: Scanner,
    config: WatcherConfig,
    reports: Option<mpsc::UnboundedSender<(ScanTrigger, ScanReport)>>,
    stats: Arc<WatchStats>,
}

pub struct WatchHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    stats: Arc<WatchStats>,
}

impl WatchHandle {
    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the session and waits for it to release its observer.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            log::error!("Watch session ended abnormally: {e}");
        }
    }
}

impl WatchSession {
    pub fn new(scanner: Scanner, config: WatcherConfig) -> Self {
        Self {
            scanner,
            config,
            reports: None,
            stats: Arc::new(WatchStats::default()),
        }
    }

    /// Every completed scan is also sent here.
    pub fn with_reports(mut self, sink: mpsc::UnboundedSender<(ScanTrigger, ScanReport)>) -> Self {
        self.reports = Some(sink);
        self
    }

    pub fn start(self) -> WatchHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(shutdown_rx));
        WatchHandle {
            shutdown: Some(shutdown_tx),
            task,
            stats,
        }
    }

    async fn scan(&self, trigger: ScanTrigger) {
        let report = self.scanner.scan().await;
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        log::debug!("{trigger} scan: {}", report.summary());
        if let Some(sink) = &self.reports {
            let _ = sink.send((trigger, report));
        }
    }

    fn current_location(&self) -> Url {
        self.scanner
            .document()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .location()
            .clone()
    }

    fn rebind(&self, binding: &mut RootBinding) {
        binding.unbind(self.scanner.document());
        *binding = RootBinding::bind(self.scanner.document(), self.scanner.providers());
        self.stats.rebinds.fetch_add(1, Ordering::Relaxed);
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let doc = self.scanner.document().clone();
        let mut changes = self.scanner.store().subscribe();
        let mut changes_open = true;
        let mut binding = RootBinding::bind(&doc, self.scanner.providers());
        let mut last_location = self.current_location();
        let mut debouncer = Debouncer::new(self.config.debounce());

        let poll_every = self.config.location_poll();
        let mut poll = tokio::time::interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Watch session started (debounce {:?}, location poll {:?})",
            self.config.debounce(),
            poll_every
        );
        self.scan(ScanTrigger::Initial).await;

        loop {
            let deadline = debouncer.deadline();
            tokio::select! {
                _ = &mut shutdown => break,

                record = binding.receiver.recv() => match record {
                    Some(_) => {
                        // Collapse whatever else is already queued.
                        while binding.receiver.try_recv().is_ok() {}
                        debouncer.notify(Instant::now());
                    }
                    None => {
                        log::warn!("Document observer closed, rebinding");
                        self.rebind(&mut binding);
                    }
                },

                change = changes.recv(), if changes_open => match change {
                    Ok(set) if set.affects_scan() => self.scan(ScanTrigger::ConfigChange).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Missed {missed} settings notifications, re-scanning");
                        self.scan(ScanTrigger::ConfigChange).await;
                    }
                    Err(RecvError::Closed) => {
                        log::debug!("Settings store closed its change feed");
                        changes_open = false;
                    }
                },

                _ = poll.tick() => {
                    let location = self.current_location();
                    if location != last_location {
                        log::info!("Navigation detected: {last_location} -> {location}");
                        last_location = location;
                        self.stats.navigations.fetch_add(1, Ordering::Relaxed);
                        self.rebind(&mut binding);
                        debouncer.cancel();
                        self.scan(ScanTrigger::Navigation).await;
                    } else if binding.is_stale(&doc) {
                        log::debug!("Observed root changed, rebinding");
                        self.rebind(&mut binding);
                        self.scan(ScanTrigger::Mutation).await;
                    }
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    if debouncer.take_due(Instant::now()) {
                        self.scan(ScanTrigger::Mutation).await;
                    }
                },
            }
        }

        binding.unbind(&doc);
        log::info!(
            "Watch session stopped after {} scans",
            self.stats.scans()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::ClassificationMode;
    use crate::dom::snapshot::Snapshot;
    use crate::settings;
    use crate::store::{ConfigStore, MemoryStore};

    const INBOX: &str = r#"
location: https://mail.google.com/mail/u/0/#inbox
body:
  - tag: div
    attrs: { role: main }
    children:
      - tag: tr
        class: zA
        children:
          - { tag: span, class: bog, text: "Weekly report attached" }
"#;

    type Reports = mpsc::UnboundedReceiver<(ScanTrigger, ScanReport)>;

    fn start(
        snapshot: &str,
        store: Arc<dyn ConfigStore>,
    ) -> (SharedDocument, WatchHandle, Reports) {
        let doc = Snapshot::parse(snapshot)
            .unwrap()
            .to_document()
            .unwrap()
            .into_shared();
        let scanner = Scanner::new(doc.clone(), store, ProviderKind::default_bindings());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WatchSession::new(scanner, WatcherConfig::default())
            .with_reports(tx)
            .start();
        (doc, handle, rx)
    }

    fn drain(rx: &mut Reports) -> Vec<(ScanTrigger, ScanReport)> {
        let mut out = Vec::new();
        while let Ok(report) = rx.try_recv() {
            out.push(report);
        }
        out
    }

    fn triggers(reports: &[(ScanTrigger, ScanReport)]) -> Vec<ScanTrigger> {
        reports.iter().map(|(t, _)| *t).collect()
    }

    /// Appends a non-item node under the list container.
    fn poke(doc: &SharedDocument) {
        let mut doc = doc.lock().unwrap();
        let root = doc.select(doc.body(), "div[role=main]").unwrap()[0];
        let node = doc.create_element("div");
        doc.append_child(root, node).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[test]
    fn test_debouncer_resets_on_every_event() {
        let start = Instant::now();
        let delay = Duration::from_millis(300);
        let mut debouncer = Debouncer::new(delay);
        assert!(!debouncer.take_due(start));

        debouncer.notify(start);
        debouncer.notify(start + Duration::from_millis(200));
        assert!(!debouncer.take_due(start + Duration::from_millis(400)));
        assert!(debouncer.take_due(start + Duration::from_millis(500)));
        assert!(!debouncer.take_due(start + Duration::from_millis(600)));
        assert!(!debouncer.is_pending());

        debouncer.notify(start);
        debouncer.cancel();
        assert!(!debouncer.take_due(start + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_scan_and_follow_up_no_op() {
        let (_doc, handle, mut rx) = start(INBOX, Arc::new(MemoryStore::new()));
        tokio::time::sleep(Duration::from_millis(900)).await;

        let reports = drain(&mut rx);
        // The marker insertion is itself a mutation; the follow-up pass
        // finds everything marked and changes nothing.
        assert_eq!(
            triggers(&reports),
            vec![ScanTrigger::Initial, ScanTrigger::Mutation]
        );
        assert_eq!(reports[0].1.annotated, 1);
        assert_eq!(reports[1].1.annotated, 0);
        assert_eq!(reports[1].1.already_marked, 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_mutations_produces_one_scan() {
        let (doc, handle, mut rx) = start(INBOX, Arc::new(MemoryStore::new()));
        tokio::time::sleep(Duration::from_millis(900)).await;
        drain(&mut rx);

        for _ in 0..10 {
            poke(&doc);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(triggers(&drain(&mut rx)), vec![ScanTrigger::Mutation]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_mutations_each_produce_a_scan() {
        let (doc, handle, mut rx) = start(INBOX, Arc::new(MemoryStore::new()));
        tokio::time::sleep(Duration::from_millis(900)).await;
        drain(&mut rx);

        for _ in 0..3 {
            poke(&doc);
            tokio::time::sleep(Duration::from_millis(450)).await;
        }

        assert_eq!(
            triggers(&drain(&mut rx)),
            vec![ScanTrigger::Mutation; 3]
        );
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_scans_immediately() {
        let store = Arc::new(MemoryStore::new());
        let (_doc, handle, mut rx) = start(INBOX, store.clone());
        tokio::time::sleep(Duration::from_millis(900)).await;
        drain(&mut rx);

        let before = Instant::now();
        settings::set_mode(store.as_ref(), ClassificationMode::Heuristic)
            .await
            .unwrap();
        let (trigger, report) = rx.recv().await.unwrap();

        assert_eq!(trigger, ScanTrigger::ConfigChange);
        assert_eq!(report.mode, ClassificationMode::Heuristic);
        assert!(Instant::now() - before < Duration::from_millis(300));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_rebinds_and_rescans() {
        let unknown_host = INBOX.replace("mail.google.com", "intranet.example.org");
        let (doc, handle, mut rx) = start(&unknown_host, Arc::new(MemoryStore::new()));
        settle().await;

        let initial = drain(&mut rx);
        assert_eq!(triggers(&initial), vec![ScanTrigger::Initial]);
        assert_eq!(initial[0].1.provider, None);

        doc.lock()
            .unwrap()
            .navigate(Url::parse("https://mail.google.com/mail/u/0/#inbox").unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let reports = drain(&mut rx);
        assert_eq!(reports[0].0, ScanTrigger::Navigation);
        assert_eq!(reports[0].1.provider, Some(ProviderKind::Gmail));
        assert_eq!(reports[0].1.annotated, 1);
        assert_eq!(handle.stats().navigations(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_root_falls_back_to_body() {
        let snapshot = r#"
location: https://mail.google.com/mail/u/0/#inbox
body:
  - tag: table
"#;
        let (doc, handle, mut rx) = start(snapshot, Arc::new(MemoryStore::new()));
        settle().await;
        drain(&mut rx);

        {
            let mut doc = doc.lock().unwrap();
            let table = doc.select(doc.body(), "table").unwrap()[0];
            let row = doc.create_element("tr");
            doc.set_attribute(row, "class", "zA").unwrap();
            let subject = doc.create_element("span");
            doc.set_attribute(subject, "class", "bog").unwrap();
            doc.set_text(subject, "New project kickoff").unwrap();
            doc.append_child(row, subject).unwrap();
            doc.append_child(table, row).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        let reports = drain(&mut rx);
        assert_eq!(reports[0].0, ScanTrigger::Mutation);
        assert_eq!(reports[0].1.annotated, 1);
        assert_eq!(reports[0].1.items[0].category, "Work");
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_observer() {
        let (doc, handle, _rx) = start(INBOX, Arc::new(MemoryStore::new()));
        settle().await;
        assert_eq!(doc.lock().unwrap().observer_count(), 1);

        handle.stop().await;
        assert_eq!(doc.lock().unwrap().observer_count(), 0);
    }
}

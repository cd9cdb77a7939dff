use clap::{Arg, ArgMatches, Command};
use inbox_tagger::categories::ClassificationMode;
use inbox_tagger::classify;
use inbox_tagger::config::loader::{load_config_or_default, write_default_config};
use inbox_tagger::config::EngineConfig;
use inbox_tagger::dom::snapshot::Snapshot;
use inbox_tagger::dom::SharedDocument;
use inbox_tagger::provider::ExtractedFields;
use inbox_tagger::scanner::{scan_document, ScanReport, Scanner};
use inbox_tagger::settings;
use inbox_tagger::store::{read_scan_settings, ConfigStore, FileStore};
use inbox_tagger::watcher::{ScanTrigger, WatchSession};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn cli() -> Command {
    let snapshot_arg = Arg::new("snapshot")
        .value_name("SNAPSHOT")
        .help("Page snapshot (YAML or JSON)")
        .required(true);

    Command::new("inbox-tagger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tags webmail list items with user-defined categories")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Engine configuration file")
                .default_value("inbox-tagger.yaml")
                .global(true),
        )
        .arg(
            Arg::new("store")
                .short('s')
                .long("store")
                .value_name("FILE")
                .help("Settings store (overrides store.path from the configuration)")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write the default engine configuration and exit")
                .action(clap::ArgAction::Set),
        )
        .subcommand(
            Command::new("scan")
                .about("Classify and annotate a page snapshot once")
                .arg(snapshot_arg.clone())
                .arg(
                    Arg::new("outline")
                        .long("outline")
                        .help("Print the annotated document tree")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Keep a snapshot annotated while it and the settings change")
                .arg(snapshot_arg),
        )
        .subcommand(
            Command::new("classify")
                .about("Classify a single item")
                .arg(Arg::new("subject").long("subject").default_value(""))
                .arg(Arg::new("sender").long("sender").default_value(""))
                .arg(Arg::new("snippet").long("snippet").default_value(""))
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_name("MODE")
                        .help("keyword, scored or ml (defaults to the stored mode)"),
                ),
        )
        .subcommand(Command::new("show").about("Show the stored mode and categories"))
        .subcommand(
            Command::new("set-mode")
                .about("Set the classification mode")
                .arg(
                    Arg::new("mode")
                        .required(true)
                        .value_parser(["keyword", "scored", "ml"]),
                ),
        )
        .subcommand(
            Command::new("add-category")
                .about("Add an empty category")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("color").long("color").value_name("COLOR")),
        )
        .subcommand(
            Command::new("remove-category")
                .about("Remove a category")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("add-keyword")
                .about("Add a keyword to a category")
                .arg(Arg::new("category").required(true))
                .arg(Arg::new("keyword").required(true)),
        )
        .subcommand(
            Command::new("remove-keyword")
                .about("Remove a keyword from a category")
                .arg(Arg::new("category").required(true))
                .arg(Arg::new("keyword").required(true)),
        )
        .subcommand(
            Command::new("set-color")
                .about("Change a category's marker color")
                .arg(Arg::new("category").required(true))
                .arg(Arg::new("color").required(true)),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        match write_default_config(generate_path) {
            Ok(()) => println!("✅ Default configuration written to {generate_path}"),
            Err(e) => {
                eprintln!("❌ {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("inbox-tagger.yaml");
    let config = load_config_or_default(config_path);

    if !matches.get_flag("verbose") {
        if let Some(level) = config
            .logging
            .as_ref()
            .and_then(|l| l.level.parse::<LevelFilter>().ok())
        {
            // The logger filter is fixed at Info; a configured level can
            // only quiet it further.
            log::set_max_level(level.min(LevelFilter::Info));
        }
    }

    let store_path = matches
        .get_one::<String>("store")
        .cloned()
        .unwrap_or_else(|| config.store.path.clone());
    let store = Arc::new(FileStore::new(&store_path));

    if let Err(e) = run(&matches, &config, store).await {
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

async fn run(
    matches: &ArgMatches,
    config: &EngineConfig,
    store: Arc<FileStore>,
) -> anyhow::Result<()> {
    let store_ref: &dyn ConfigStore = store.as_ref();
    match matches.subcommand() {
        Some(("scan", sub)) => {
            let path = required(sub, "snapshot");
            let mut doc = Snapshot::load(path)?.to_document()?;
            let settings = read_scan_settings(store_ref).await;
            let report = scan_document(&mut doc, &settings, &config.providers);
            print_report(None, &report);
            if sub.get_flag("outline") {
                println!();
                print!("{}", doc.outline());
            }
        }
        Some(("watch", sub)) => {
            let path = PathBuf::from(required(sub, "snapshot"));
            run_watch(config, store.clone(), &path).await?;
        }
        Some(("classify", sub)) => {
            let fields = ExtractedFields {
                subject: required(sub, "subject").to_string(),
                sender: required(sub, "sender").to_string(),
                snippet: required(sub, "snippet").to_string(),
            };
            let stored = read_scan_settings(store_ref).await;
            let mode = match sub.get_one::<String>("mode") {
                Some(mode) => ClassificationMode::parse(mode)
                    .ok_or_else(|| anyhow::anyhow!("Unknown mode '{mode}'"))?,
                None => stored.mode,
            };
            println!("{}", classify(&fields, &stored.categories, mode));
        }
        Some(("show", _)) => {
            let current = settings::show(store_ref).await;
            println!("📋 Mode: {}", current.mode);
            println!("🏷️  Categories:");
            for category in current.categories.iter() {
                let keywords = if category.keywords.is_empty() {
                    "(catch-all)".to_string()
                } else {
                    category.keywords.join(", ")
                };
                println!("  • {:<16} {:<10} {}", category.name, category.color, keywords);
            }
        }
        Some(("set-mode", sub)) => {
            let value = required(sub, "mode");
            let mode = ClassificationMode::parse(value)
                .ok_or_else(|| anyhow::anyhow!("Unknown mode '{value}'"))?;
            settings::set_mode(store_ref, mode).await?;
            println!("✅ Mode set to {mode}");
        }
        Some(("add-category", sub)) => {
            let name = required(sub, "name");
            let color = sub.get_one::<String>("color").map(String::as_str);
            if settings::add_category(store_ref, name, color).await? {
                println!("✅ Added category '{name}'");
            } else {
                println!("ℹ️  Category '{name}' already exists");
            }
        }
        Some(("remove-category", sub)) => {
            let name = required(sub, "name");
            settings::remove_category(store_ref, name).await?;
            println!("✅ Removed category '{name}'");
        }
        Some(("add-keyword", sub)) => {
            let category = required(sub, "category");
            let keyword = required(sub, "keyword");
            if settings::add_keyword(store_ref, category, keyword).await? {
                println!("✅ Added '{keyword}' to {category}");
            } else {
                println!("ℹ️  {category} already has '{keyword}'");
            }
        }
        Some(("remove-keyword", sub)) => {
            let category = required(sub, "category");
            let keyword = required(sub, "keyword");
            if settings::remove_keyword(store_ref, category, keyword).await? {
                println!("✅ Removed '{keyword}' from {category}");
            } else {
                println!("ℹ️  {category} has no keyword '{keyword}'");
            }
        }
        Some(("set-color", sub)) => {
            let category = required(sub, "category");
            let color = required(sub, "color");
            settings::change_color(store_ref, category, color).await?;
            println!("✅ {category} is now {color}");
        }
        _ => {
            cli().print_help()?;
            println!();
        }
    }
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .unwrap_or_default()
}

fn print_report(trigger: Option<ScanTrigger>, report: &ScanReport) {
    match trigger {
        Some(trigger) => println!("🔎 {trigger} scan: {}", report.summary()),
        None => println!("🔎 {}", report.summary()),
    }
    for item in &report.items {
        let subject = if item.fields.subject.is_empty() {
            "(no subject)"
        } else {
            item.fields.subject.as_str()
        };
        println!("  [{}] {} | {}", item.category, subject, item.fields.sender);
    }
}

async fn run_watch(
    config: &EngineConfig,
    store: Arc<FileStore>,
    path: &Path,
) -> anyhow::Result<()> {
    let doc = Snapshot::load(path)?.to_document()?.into_shared();

    // Prime the change detector so only later edits count as changes.
    store.refresh().await?;
    let poller = store.spawn_poller(config.store.poll_interval());
    let feed = spawn_snapshot_feed(doc.clone(), path.to_path_buf(), config.store.poll_interval());

    let scanner = Scanner::new(doc, store.clone(), config.providers.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = WatchSession::new(scanner, config.watcher.clone())
        .with_reports(tx)
        .start();

    println!(
        "👀 Watching {} (store: {}), Ctrl-C to stop",
        path.display(),
        store.path().display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal");
                break;
            }
            report = rx.recv() => match report {
                Some((trigger, report)) => print_report(Some(trigger), &report),
                None => break,
            },
        }
    }

    feed.abort();
    poller.abort();
    let scans = handle.stats().scans();
    handle.stop().await;
    println!("✅ Stopped after {scans} scans");
    Ok(())
}

/// Re-applies the snapshot file to the live document whenever it changes,
/// standing in for the page re-rendering its list.
fn spawn_snapshot_feed(doc: SharedDocument, path: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_modified = modified(&path);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let current = modified(&path);
            if current == last_modified {
                continue;
            }
            last_modified = current;
            let snapshot = match Snapshot::load(&path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Ignoring snapshot update: {e:#}");
                    continue;
                }
            };
            let mut doc = match doc.lock() {
                Ok(doc) => doc,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = snapshot.apply_to(&mut doc) {
                log::warn!("Failed to apply snapshot update: {e:#}");
            } else {
                log::debug!("Applied snapshot update from {}", path.display());
            }
        }
    })
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub mod annotator;
pub mod categories;
pub mod classifier;
pub mod config;
pub mod dom;
pub mod provider;
pub mod scanner;
pub mod settings;
pub mod store;
pub mod watcher;

pub use categories::{CategoryConfiguration, CategoryDefinition, ClassificationMode};
pub use classifier::classify;
pub use config::EngineConfig;
pub use dom::{Document, SharedDocument};
pub use provider::{ExtractedFields, ProviderKind};
pub use scanner::{ScanReport, Scanner};
pub use store::{ConfigStore, FileStore, MemoryStore};
pub use watcher::{WatchHandle, WatchSession};

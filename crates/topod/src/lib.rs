pub mod cache;
pub mod config;
pub mod error;
pub mod processor;
pub mod render;
pub mod resource;
pub mod store;
pub mod sync;

pub use cache::{KeyValueCache, Lookup};
pub use config::{load_config, load_config_from_str, AgentConfig, Config};
pub use error::{ConfigError, ProcessError, Result, TopodError};
pub use processor::{process_once, IntervalProcessor, Processor, Watcher};
pub use resource::TemplateResource;
pub use store::{StoreClient, StoreError, StoreNode};
pub use sync::SyncOutcome;

//! Infrastructure layer - configuration, logging, persistence and the
//! concrete record-service / storage collaborators.

pub mod config;
pub mod logging;
pub mod memory_job_store;
pub mod record_client;
pub mod sqlite_job_store;
pub mod storage;

pub use config::{ConfigError, ImporterConfig, LoggingConfig};
pub use logging::init_logging;
pub use memory_job_store::MemoryJobStore;
pub use record_client::HttpRecordService;
pub use sqlite_job_store::SqliteJobStore;
pub use storage::LocalSourceStorage;

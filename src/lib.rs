//! Bulk Importer - bulk import orchestration engine
//!
//! Ingests an uploaded source file, splits it into independently processable
//! units, validates and normalizes each unit against per-job declarative
//! rules, and dispatches validated units to an external record-management
//! service under a bounded worker pool with pause/resume/cancel control,
//! durable per-unit state and atomic progress aggregation.

// Module declarations
pub mod domain;
pub mod import_engine;
pub mod application;
pub mod infrastructure;

// Re-export the service surface for easier access
pub use application::importer_service::{ImporterError, ImporterService};

//! Application layer - the importer service facade
//!
//! Ties the engine together behind the command interface (`start`, `pause`,
//! `resume`, `cancel`, `retry-failed`) and the progress/query surface.

pub mod importer_service;

pub use importer_service::{ImporterError, ImporterService};

// All generation functionality is in incident-report-core
// This CLI acts as a thin wrapper around the core library

// CLI-specific modules
pub mod chromium_locator;
pub mod field_search;

// Re-export core types for convenience
pub use incident_report_core::*;

// Re-export CLI utilities
pub use chromium_locator::ChromiumLocator;
pub use field_search::FieldSearch;

//! Feature extraction from raw log batches
//!
//! Entries are grouped by entity and dispatched to shape-specific feature
//! sets (WiFi, DNS, firewall) based on which fields they carry. Every entity
//! also gets the generic counts.

mod extractor;
mod shapes;

pub use extractor::{ExtractorConfig, FeatureExtractor, DEFAULT_ERROR_LEVELS};
pub use shapes::{names, DnsShape, FirewallShape, LogShape, ShapeAccumulator, WifiShape};

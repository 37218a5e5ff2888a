use crate::types::{Diagnostic, GeneratedReport, ReportMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version constants for cache invalidation
pub mod versions {
    pub const GENERATOR_VERSION: &str = "0.1.0";
    /// Bump when the built-in mapping table changes what lands in which field
    pub const MAPPING_VERSION: &str = "1.0.0";
    /// Bump when page copy or form rebuild changes the output bytes
    pub const ASSEMBLY_VERSION: &str = "1.0.0";
}

/// Cache key for one generated report (record + template + config → PDF)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReportCacheKey {
    pub record_hash: String,
    pub template_hash: String,
    pub config_hash: String,
    pub generator_version: String,
    pub mapping_version: String,
    pub assembly_version: String,
}

impl ReportCacheKey {
    pub fn new(record_hash: String, template_hash: String, config_hash: String) -> Self {
        Self {
            record_hash,
            template_hash,
            config_hash,
            generator_version: versions::GENERATOR_VERSION.to_string(),
            mapping_version: versions::MAPPING_VERSION.to_string(),
            assembly_version: versions::ASSEMBLY_VERSION.to_string(),
        }
    }

    /// Compute cache key hash for storage
    pub fn to_cache_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.record_hash);
        hasher.update(&self.template_hash);
        hasher.update(&self.config_hash);
        hasher.update(&self.generator_version);
        hasher.update(&self.mapping_version);
        hasher.update(&self.assembly_version);
        format!("{:x}", hasher.finalize())
    }
}

/// Everything about a cached report except its bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCacheValue {
    pub metadata: ReportMetadata,
    pub diagnostics: Vec<Diagnostic>,
    pub created_at: DateTime<Utc>,
    pub cache_version: String,
}

impl ReportCacheValue {
    pub fn new(report: &GeneratedReport) -> Self {
        Self {
            metadata: report.metadata.clone(),
            diagnostics: report.diagnostics.clone(),
            created_at: Utc::now(),
            cache_version: versions::GENERATOR_VERSION.to_string(),
        }
    }
}

/// A report read back from storage
#[derive(Debug, Clone)]
pub struct CachedReport {
    pub bytes: Vec<u8>,
    pub value: ReportCacheValue,
}

impl CachedReport {
    pub fn into_report(self) -> GeneratedReport {
        GeneratedReport {
            bytes: self.bytes,
            metadata: self.value.metadata,
            diagnostics: self.value.diagnostics,
        }
    }
}

use crate::cache::{CachedReport, ReportCacheKey, ReportCacheValue};
use crate::pdf_text::sha256_hex;
use crate::types::GeneratedReport;
use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;

/// Storage abstraction for generated reports
pub trait ReportStorage: Send + Sync {
    fn get_report(&self, cache_key: &ReportCacheKey) -> Result<Option<CachedReport>>;
    fn store_report(&self, cache_key: &ReportCacheKey, report: &GeneratedReport) -> Result<()>;
}

/// File-based storage: `<dir>/reports/<hash>.pdf` plus a JSON sidecar
pub struct FileStorage {
    cache_dir: String,
}

impl FileStorage {
    pub fn new(cache_dir: &str) -> Result<Self> {
        fs::create_dir_all(format!("{cache_dir}/reports"))?;
        Ok(Self {
            cache_dir: cache_dir.to_string(),
        })
    }

    fn pdf_path(&self, cache_key: &ReportCacheKey) -> String {
        format!("{}/reports/{}.pdf", self.cache_dir, cache_key.to_cache_hash())
    }

    fn meta_path(&self, cache_key: &ReportCacheKey) -> String {
        format!("{}/reports/{}.json", self.cache_dir, cache_key.to_cache_hash())
    }
}

impl ReportStorage for FileStorage {
    fn get_report(&self, cache_key: &ReportCacheKey) -> Result<Option<CachedReport>> {
        let pdf_path = self.pdf_path(cache_key);
        let meta_path = self.meta_path(cache_key);
        if !Path::new(&pdf_path).exists() || !Path::new(&meta_path).exists() {
            return Ok(None);
        }

        let json_str = fs::read_to_string(meta_path)?;
        let value: ReportCacheValue = serde_json::from_str(&json_str)
            .map_err(|e| anyhow!("Failed to deserialize cached report metadata: {}", e))?;
        let bytes = fs::read(pdf_path)?;

        // A partially written or foreign file is treated as a miss
        if sha256_hex(&bytes) != value.metadata.output_sha256 {
            log::warn!("⚠️  Cached report {} does not match its digest; ignoring", cache_key.to_cache_hash());
            return Ok(None);
        }
        Ok(Some(CachedReport { bytes, value }))
    }

    fn store_report(&self, cache_key: &ReportCacheKey, report: &GeneratedReport) -> Result<()> {
        let json_str = serde_json::to_string_pretty(&ReportCacheValue::new(report))
            .map_err(|e| anyhow!("Failed to serialize report metadata: {}", e))?;
        fs::write(self.pdf_path(cache_key), &report.bytes)?;
        fs::write(self.meta_path(cache_key), json_str)?;
        Ok(())
    }
}

/// Hash of the full template bytes
pub fn calculate_template_hash(template_bytes: &[u8]) -> String {
    sha256_hex(template_bytes)
}

/// Calculate hash for any serializable input (record or configuration)
pub fn calculate_json_hash<T: serde::Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value).map_err(|e| anyhow!("Failed to serialize value for hashing: {}", e))?;
    Ok(sha256_hex(json.as_bytes()))
}

/// No-op storage implementation that disables all caching
pub struct NoOpStorage;

impl Default for NoOpStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl NoOpStorage {
    pub fn new() -> Self {
        Self
    }
}

impl ReportStorage for NoOpStorage {
    fn get_report(&self, _cache_key: &ReportCacheKey) -> Result<Option<CachedReport>> {
        Ok(None) // Always cache miss
    }

    fn store_report(&self, _cache_key: &ReportCacheKey, _report: &GeneratedReport) -> Result<()> {
        Ok(()) // No-op
    }
}

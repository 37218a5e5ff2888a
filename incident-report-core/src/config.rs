use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_job_timeout_ms() -> u64 {
    60_000
}

fn default_page_timeout_ms() -> u64 {
    15_000
}

fn default_max_concurrent_renders() -> usize {
    4
}

fn default_max_text_length() -> usize {
    2000
}

fn default_date_format() -> String {
    "%d/%m/%Y".to_string()
}

fn default_engine() -> EngineKind {
    EngineKind::Auto
}

fn default_page_size() -> PageSize {
    PageSize::A4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Where appendix pages are spliced into the base template
    #[serde(default)]
    pub insertion_point: InsertionPoint,
    #[serde(default)]
    pub render: RenderConfig,
    /// Wall-clock budget for fill + render + assemble + validate
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub sanitize: SanitizeConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    /// Flate-compress streams in the assembled output
    #[serde(default = "default_true")]
    pub compress_output: bool,
    /// chrono format string used for date-typed text fields
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

/// Insertion point for the appendix block, resolved against the template page count
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode", content = "pages")]
pub enum InsertionPoint {
    /// Appendix follows base page `n` (1-indexed; 0 = before the first page)
    AfterPage(usize),
    /// Appendix precedes the last `m` base pages
    BeforeLastPages(usize),
}

impl Default for InsertionPoint {
    fn default() -> Self {
        // Declaration/signature page stays last
        InsertionPoint::BeforeLastPages(1)
    }
}

impl InsertionPoint {
    /// Number of base pages copied before the appendix block
    pub fn resolve(&self, page_count: usize) -> Option<usize> {
        match *self {
            InsertionPoint::AfterPage(n) if n <= page_count => Some(n),
            InsertionPoint::BeforeLastPages(m) if m <= page_count => Some(page_count - m),
            _ => None,
        }
    }

    pub fn requested(&self) -> usize {
        match *self {
            InsertionPoint::AfterPage(n) => n,
            InsertionPoint::BeforeLastPages(m) => m,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Chromium when `chromium_path` names a usable binary, otherwise builtin
    Auto,
    /// In-process text layout of title and body; the section HTML is not used
    Builtin,
    /// Headless Chromium rendering the section HTML; one browser shared by all
    /// jobs, one browser context per section
    Chromium,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PageSize {
    A4,
    Letter,
}

impl PageSize {
    /// Width and height in PDF points
    pub fn dimensions_pt(&self) -> (f32, f32) {
        match self {
            PageSize::A4 => (595.0, 842.0),
            PageSize::Letter => (612.0, 792.0),
        }
    }

    pub fn css_name(&self) -> &'static str {
        match self {
            PageSize::A4 => "A4",
            PageSize::Letter => "letter",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// `auto` by default: HTML through Chromium whenever a browser is available
    #[serde(default = "default_engine")]
    pub engine: EngineKind,
    /// Chromium binary; discovered by the caller when unset
    #[serde(default)]
    pub chromium_path: Option<String>,
    /// Hard timeout for one appendix page
    #[serde(default = "default_page_timeout_ms")]
    pub page_timeout_ms: u64,
    /// Upper bound on simultaneous render sessions across all jobs
    #[serde(default = "default_max_concurrent_renders")]
    pub max_concurrent_renders: usize,
    /// Replace failed pages with a "content unavailable" page instead of failing the job
    #[serde(default = "default_true")]
    pub fallback_on_failure: bool,
    #[serde(default = "default_page_size")]
    pub page_size: PageSize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            chromium_path: None,
            page_timeout_ms: default_page_timeout_ms(),
            max_concurrent_renders: default_max_concurrent_renders(),
            fallback_on_failure: true,
            page_size: PageSize::A4,
        }
    }
}

impl RenderConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    /// The engine `auto` stands for with the current `chromium_path`
    pub fn resolved_engine(&self) -> EngineKind {
        match self.engine {
            EngineKind::Auto => match self.chromium_path.as_deref() {
                Some(path) if std::path::Path::new(path).is_file() => EngineKind::Chromium,
                _ => EngineKind::Builtin,
            },
            kind => kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Fail startup when a mapped field is missing from the template
    #[serde(default = "default_true")]
    pub strict_validation: bool,
    /// Intended field name → actual template field name, merged over the built-in table
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    /// Cap on witness groups even if the template has more
    #[serde(default)]
    pub max_witness_slots: Option<usize>,
    /// Cap on other-vehicle groups even if the template has more
    #[serde(default)]
    pub max_vehicle_slots: Option<usize>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            strict_validation: true,
            overrides: BTreeMap::new(),
            max_witness_slots: None,
            max_vehicle_slots: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeConfig {
    #[serde(default = "default_true")]
    pub trim: bool,
    /// Applied when the field carries no /MaxLen of its own
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            trim: true,
            max_text_length: default_max_text_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Compare each parsed page's content digest against the assembly plan
    #[serde(default = "default_true")]
    pub check_page_digests: bool,
    /// Reject references to objects that do not exist
    #[serde(default = "default_true")]
    pub check_dangling_references: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            check_page_digests: true,
            check_dangling_references: true,
        }
    }
}

impl GeneratorConfig {
    /// Load config from file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {path}"))?;
        let config: GeneratorConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {path}"))?;
        Ok(config)
    }

    /// Load config with fallback to default
    pub fn load_with_fallback(path: Option<&str>) -> Self {
        match path {
            Some(p) => Self::load_from_file(p).unwrap_or_else(|e| {
                log::warn!("⚠️  Failed to load config from {}, using defaults: {:#}", p, e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            insertion_point: InsertionPoint::default(),
            render: RenderConfig::default(),
            job_timeout_ms: default_job_timeout_ms(),
            mapping: MappingConfig::default(),
            sanitize: SanitizeConfig::default(),
            guard: GuardConfig::default(),
            compress_output: true,
            date_format: default_date_format(),
        }
    }
}

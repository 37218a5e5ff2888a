use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReportError>;

/// Mapping table problems. Raised at startup, never per request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("mapped field '{field}' is not present in the template")]
    FieldMissing { field: String },

    #[error("{} mapped field(s) missing from the template: {}", fields.len(), fields.join(", "))]
    TemplateDrift { fields: Vec<String> },

    #[error("field '{field}' is targeted by more than one mapping")]
    DuplicateTarget { field: String },

    #[error("invalid source path '{path}': {reason}")]
    InvalidSourcePath { path: String, reason: String },

    #[error("exclusive group '{group}' is misconfigured: {reason}")]
    InvalidGroup { group: String, reason: String },

    #[error("field '{field}' expects {expected} but the template declares {actual}")]
    KindMismatch {
        field: String,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template could not be parsed: {0}")]
    Parse(String),

    #[error("template has no pages")]
    NoPages,

    #[error("template has no interactive form (AcroForm)")]
    NoAcroForm,

    #[error("insertion point {requested} is outside the template's {page_count} page(s)")]
    InsertionPoint { requested: usize, page_count: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("render engine '{engine}' is unavailable: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    #[error("render of section '{section}' failed: {reason}")]
    Failed { section: String, reason: String },

    #[error("render of section '{section}' exceeded {timeout_ms}ms")]
    Timeout { section: String, timeout_ms: u64 },

    #[error("render output for section '{section}' is not a usable PDF: {reason}")]
    InvalidOutput { section: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("appendix cannot follow base page {split} of a {page_count}-page document")]
    InsertionPoint { split: usize, page_count: usize },

    #[error("page {page_index} could not be copied: {reason}")]
    PageCopy { page_index: usize, reason: String },

    #[error("appendix page for section '{section}' could not be loaded: {reason}")]
    AppendixLoad { section: String, reason: String },

    #[error("assembled {actual} page(s), plan declared {expected}")]
    PageCountMismatch { expected: usize, actual: usize },

    #[error("form field '{field}' appears twice in the assembled document")]
    DuplicateField { field: String },

    #[error("assembled document could not be serialized: {0}")]
    Serialize(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorruptionError {
    #[error("output does not parse: {0}")]
    Unparseable(String),

    #[error("cross-reference data is invalid: {0}")]
    CrossReference(String),

    #[error("page tree is invalid at page {page_index:?}: {reason}")]
    PageTree {
        page_index: Option<usize>,
        reason: String,
    },

    #[error("expected {expected} page(s), parsed {actual}")]
    PageCount { expected: usize, actual: usize },

    #[error("page {page_index} does not match the assembly plan: {reason}")]
    PageOrder { page_index: usize, reason: String },

    #[error("object {object} references missing object {target}")]
    DanglingReference { object: String, target: String },

    #[error("form structure is invalid: {0}")]
    Form(String),
}

/// Fatal job failure surfaced to the caller. Non-fatal findings never end up
/// here; they travel as diagnostics alongside a successful report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("render timed out for section '{section}' after {timeout_ms}ms")]
    RenderTimeout { section: String, timeout_ms: u64 },

    #[error("render error: {0}")]
    Render(RenderError),

    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("corruption detected: {0}")]
    CorruptionDetected(#[from] CorruptionError),

    #[error("job exceeded its {budget_ms}ms budget during {stage}")]
    JobTimeout { stage: String, budget_ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReportError {
    /// Whether re-invoking generation with the same input may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReportError::RenderTimeout { .. }
                | ReportError::Render(_)
                | ReportError::Assembly(_)
                | ReportError::CorruptionDetected(_)
                | ReportError::JobTimeout { .. }
                | ReportError::Internal(_)
        )
    }
}

impl From<RenderError> for ReportError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Timeout {
                section,
                timeout_ms,
            } => ReportError::RenderTimeout {
                section,
                timeout_ms,
            },
            other => ReportError::Render(other),
        }
    }
}

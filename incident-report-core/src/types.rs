use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

/// Flat column → value record, as handed over by the data-access layer.
pub type FieldSet = BTreeMap<String, Value>;

// ===== INPUT RECORD =====
// One aggregated, already-resolved record per generation request.
// The core never performs further lookups against the backing store.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedIncidentRecord {
    /// Person, vehicle and insurance attributes of the reporting driver
    #[serde(default)]
    pub profile: FieldSet,
    /// Accident facts: scalars, checkbox flags and multi-select tag arrays
    #[serde(default)]
    pub incident: FieldSet,
    /// Third-party vehicles in the order they were captured
    #[serde(default)]
    pub other_vehicles: Vec<FieldSet>,
    #[serde(default)]
    pub witnesses: Vec<WitnessRecord>,
    #[serde(default)]
    pub documents: Vec<DocumentDescriptor>,
    #[serde(default)]
    pub narrative: Vec<NarrativeSection>,
}

impl AggregatedIncidentRecord {
    /// Slot each witness occupies. A witness carrying an index claims that
    /// slot; the rest fill the lowest free slots in list order. A later witness
    /// claiming a slot already taken is set aside as a conflict.
    pub fn witness_slots(&self) -> WitnessSlots<'_> {
        let mut slots = WitnessSlots::default();
        for (position, witness) in self.witnesses.iter().enumerate() {
            if let Some(index) = witness.index {
                let slot = index as usize;
                if slots.placed.contains_key(&slot) {
                    slots.conflicts.push(WitnessConflict { position, slot });
                } else {
                    slots.placed.insert(slot, &witness.fields);
                }
            }
        }

        let mut next_free = 0;
        for witness in self.witnesses.iter().filter(|w| w.index.is_none()) {
            while slots.placed.contains_key(&next_free) {
                next_free += 1;
            }
            slots.placed.insert(next_free, &witness.fields);
        }
        slots
    }

    /// First uploaded document of the given type, if any
    pub fn document_of_type(&self, document_type: &str) -> Option<&DocumentDescriptor> {
        self.documents
            .iter()
            .find(|doc| doc.document_type.eq_ignore_ascii_case(document_type))
    }
}

/// Witness placement by slot number
#[derive(Debug, Default)]
pub struct WitnessSlots<'a> {
    pub placed: BTreeMap<usize, &'a FieldSet>,
    pub conflicts: Vec<WitnessConflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WitnessConflict {
    /// Position in the record's witness list
    pub position: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WitnessRecord {
    /// Zero-based position; decides which numbered field group the witness lands in
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(flatten)]
    pub fields: FieldSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    /// Logical document type, e.g. "driving_license_picture"
    pub document_type: String,
    /// Location inside the object store
    pub storage_path: String,
    /// Short-lived retrieval URL, written into the form as a link
    #[serde(default)]
    pub signed_url: Option<String>,
    #[serde(default)]
    pub signed_url_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeKind {
    Transcription,
    AiSummary,
    LiabilityAssessment,
    ClosingStatement,
    Other,
}

impl NarrativeKind {
    pub fn default_title(&self) -> &'static str {
        match self {
            NarrativeKind::Transcription => "Personal Statement (Transcription)",
            NarrativeKind::AiSummary => "Incident Summary",
            NarrativeKind::LiabilityAssessment => "Liability Assessment",
            NarrativeKind::ClosingStatement => "Closing Statement",
            NarrativeKind::Other => "Additional Information",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeSection {
    pub kind: NarrativeKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: String,
}

impl NarrativeSection {
    pub fn new(kind: NarrativeKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: None,
            body: body.into(),
        }
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_title())
    }
}

// ===== COERCED VALUES =====

/// Value shape accepted by a form field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoercedValue {
    Text(String),
    Checkbox(bool),
}

impl CoercedValue {
    pub fn is_populated(&self) -> bool {
        match self {
            CoercedValue::Text(text) => !text.is_empty(),
            CoercedValue::Checkbox(checked) => *checked,
        }
    }
}

/// Flat target-field → value map produced by the coercion engine.
/// Keys are the actual template field names (overrides already applied).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueMap {
    values: BTreeMap<String, CoercedValue>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Returns false (and keeps the existing value) when the
    /// field was already set, so every field is visited exactly once.
    pub fn insert(&mut self, field: impl Into<String>, value: CoercedValue) -> bool {
        use std::collections::btree_map::Entry;
        match self.values.entry(field.into()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Overwrite an existing value (used by exclusive-group resolution)
    pub fn replace(&mut self, field: &str, value: CoercedValue) {
        if let Some(existing) = self.values.get_mut(field) {
            *existing = value;
        }
    }

    pub fn get(&self, field: &str) -> Option<&CoercedValue> {
        self.values.get(field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CoercedValue)> {
        self.values.iter()
    }

    pub fn populated_text_count(&self) -> usize {
        self.values
            .values()
            .filter(|v| matches!(v, CoercedValue::Text(t) if !t.is_empty()))
            .count()
    }

    pub fn checked_fields(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, v)| matches!(v, CoercedValue::Checkbox(true)))
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

// ===== DIAGNOSTICS =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MissingRequiredValue,
    UnparseableValue,
    UnknownTag,
    ExclusiveGroupViolation,
    SlotOverflow,
    DuplicateSlot,
    FieldNotFound,
    FieldTypeMismatch,
    ValueTruncated,
    RenderFallback,
    RenderOverflow,
    EmptySection,
    PageHintMismatch,
}

/// Non-fatal finding recorded during a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Field name, section title or group name the finding is about
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.kind, self.subject, self.message)
    }
}

/// Accumulates diagnostics for one job. Every entry is logged when recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: DiagnosticKind, subject: impl Into<String>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            kind,
            subject: subject.into(),
            message: message.into(),
        };
        log::warn!("⚠️  {}", diagnostic);
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

// ===== OUTPUT =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub job_id: JobId,
    pub page_count: usize,
    pub base_page_count: usize,
    pub appendix_page_count: usize,
    pub generated_at: DateTime<Utc>,
    pub template_sha256: String,
    pub output_sha256: String,
    pub timings: Vec<StageTiming>,
}

/// Successful generation result: validated bytes plus everything an operator
/// needs to audit data completeness.
#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub bytes: Vec<u8>,
    pub metadata: ReportMetadata,
    pub diagnostics: Vec<Diagnostic>,
}

impl GeneratedReport {
    pub fn page_count(&self) -> usize {
        self.metadata.page_count
    }
}

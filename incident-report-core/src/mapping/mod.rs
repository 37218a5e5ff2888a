//! Field Mapping Table
//!
//! Static registry that maps logical source columns of the aggregated record
//! onto form-field names of the base template.
//!
//! ```text
//! AggregatedIncidentRecord
//!     ↓  (SourcePath lookup)
//! FieldMapping[]  +  FieldNameOverrides
//!     ↓  (ValidatedMapping, checked once against the template at startup)
//! Coercion Engine → ValueMap
//! ```
//!
//! Targets are *intended* names. Known template irregularities (typos,
//! singular/plural slips) are resolved through [`FieldNameOverrides`], never by
//! fuzzy matching at runtime.

pub mod overrides;
pub mod table;
pub mod validate;

pub use overrides::FieldNameOverrides;
pub use table::FieldMappingTable;
pub use validate::{RequiredField, ValidatedMapping};

use crate::error::MappingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Location of a value inside the aggregated record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourcePath {
    Profile(String),
    Incident(String),
    /// Column of the n-th other vehicle; n is decided by slot expansion
    OtherVehicle(String),
    /// Column of the n-th witness; n is decided by slot expansion
    Witness(String),
    /// Signed URL of the first uploaded document of this type
    Document(String),
}

impl SourcePath {
    pub fn column(&self) -> &str {
        match self {
            SourcePath::Profile(c)
            | SourcePath::Incident(c)
            | SourcePath::OtherVehicle(c)
            | SourcePath::Witness(c)
            | SourcePath::Document(c) => c,
        }
    }

    /// Positional group this path repeats over, if any
    pub fn slot_group(&self) -> Option<SlotGroup> {
        match self {
            SourcePath::Witness(_) => Some(SlotGroup::Witness),
            SourcePath::OtherVehicle(_) => Some(SlotGroup::OtherVehicle),
            _ => None,
        }
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (table, column) = match self {
            SourcePath::Profile(c) => ("profile", c),
            SourcePath::Incident(c) => ("incident", c),
            SourcePath::OtherVehicle(c) => ("other_vehicle", c),
            SourcePath::Witness(c) => ("witness", c),
            SourcePath::Document(c) => ("document", c),
        };
        write!(f, "{table}.{column}")
    }
}

impl FromStr for SourcePath {
    type Err = MappingError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MappingError::InvalidSourcePath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let (table, column) = path
            .split_once('.')
            .ok_or_else(|| invalid("expected <table>.<column>"))?;
        if column.is_empty() || column.contains('.') {
            return Err(invalid("column must be a single non-empty segment"));
        }
        let column = column.to_string();
        match table {
            "profile" => Ok(SourcePath::Profile(column)),
            "incident" => Ok(SourcePath::Incident(column)),
            "other_vehicle" => Ok(SourcePath::OtherVehicle(column)),
            "witness" => Ok(SourcePath::Witness(column)),
            "document" => Ok(SourcePath::Document(column)),
            _ => Err(invalid("unknown table")),
        }
    }
}

impl TryFrom<String> for SourcePath {
    type Error = MappingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourcePath> for String {
    fn from(path: SourcePath) -> Self {
        path.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotGroup {
    Witness,
    OtherVehicle,
}

/// Field name for a positional slot: slot 0 keeps the base name, slot n uses `{base}_{n+1}`
pub fn slot_field_name(base: &str, slot: usize) -> String {
    if slot == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, slot + 1)
    }
}

/// Formatting applied to text-typed values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    Plain,
    /// ISO date or RFC 3339 timestamp, rendered with the configured date format
    Date,
    /// `HH:MM[:SS]` or RFC 3339 timestamp, rendered as `HH:MM`
    Time,
    /// Boolean-ish source rendered as "Yes"/"No"
    YesNo,
}

/// One tag of a multi-select source and the checkbox it drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagField {
    pub tag: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Text(TextFormat),
    BooleanCheckbox,
    /// Member of a group where at most one flag may be true. Lower precedence wins.
    ExclusiveGroupMember { group: String, precedence: u8 },
    /// Array of category tags expanded into one checkbox per known tag
    ArrayToBooleanSet(Vec<TagField>),
}

impl ValueKind {
    pub fn is_boolean(&self) -> bool {
        !matches!(self, ValueKind::Text(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: SourcePath,
    /// Intended target name; for tag sets a label only, the tag targets are the real fields
    pub target: String,
    pub kind: ValueKind,
    /// Template page the field is expected on (1-indexed)
    #[serde(default)]
    pub page_hint: Option<u32>,
    /// Missing values produce a data-quality diagnostic
    #[serde(default)]
    pub required: bool,
    /// Free-text field expected to hold line breaks
    #[serde(default)]
    pub multiline: bool,
}

impl FieldMapping {
    pub fn new(source: SourcePath, target: &str, kind: ValueKind) -> Self {
        Self {
            source,
            target: target.to_string(),
            kind,
            page_hint: None,
            required: false,
            multiline: false,
        }
    }

    pub fn on_page(mut self, page: u32) -> Self {
        self.page_hint = Some(page);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn multiline(mut self) -> Self {
        self.multiline = true;
        self
    }

    /// Intended template field names this entry writes (slot 0)
    pub fn target_fields(&self) -> Vec<&str> {
        match &self.kind {
            ValueKind::ArrayToBooleanSet(tags) => tags.iter().map(|t| t.target.as_str()).collect(),
            _ => vec![self.target.as_str()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_path_parse_and_display() {
        let path: SourcePath = "witness.name".parse().unwrap();
        assert_eq!(path, SourcePath::Witness("name".to_string()));
        assert_eq!(path.to_string(), "witness.name");
        assert_eq!(path.slot_group(), Some(SlotGroup::Witness));
    }

    #[test]
    fn test_source_path_rejects_bad_input() {
        assert!("name".parse::<SourcePath>().is_err());
        assert!("claims.name".parse::<SourcePath>().is_err());
        assert!("profile.".parse::<SourcePath>().is_err());
        assert!("profile.a.b".parse::<SourcePath>().is_err());
    }

    #[test]
    fn test_slot_field_name() {
        assert_eq!(slot_field_name("witness_name", 0), "witness_name");
        assert_eq!(slot_field_name("witness_name", 1), "witness_name_2");
        assert_eq!(slot_field_name("witness_name", 2), "witness_name_3");
    }
}

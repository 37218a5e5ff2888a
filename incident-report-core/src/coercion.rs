//! Type Coercion Engine
//!
//! Turns the raw record into a flat `field name → value` map shaped the way
//! each form field needs it. Never fails: missing data becomes an empty string
//! or an unchecked box, and anything questionable is reported as a diagnostic.

use crate::mapping::{FieldMapping, SlotGroup, SourcePath, TextFormat, ValidatedMapping, ValueKind};
use crate::types::{AggregatedIncidentRecord, CoercedValue, DiagnosticKind, Diagnostics, FieldSet, ValueMap};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

const TRUTHY: &[&str] = &["true", "yes", "y", "1", "on", "checked", "x"];
const FALSY: &[&str] = &["false", "no", "n", "0", "off", "unchecked", ""];

struct GroupMember {
    field: String,
    precedence: u8,
    checked: bool,
}

/// Per-call coercion state
pub struct Coercer<'a> {
    mapping: &'a ValidatedMapping,
    date_format: &'a str,
}

impl<'a> Coercer<'a> {
    pub fn new(mapping: &'a ValidatedMapping, date_format: &'a str) -> Self {
        Self { mapping, date_format }
    }

    pub fn coerce(&self, record: &AggregatedIncidentRecord, diagnostics: &mut Diagnostics) -> ValueMap {
        let mut values = ValueMap::new();
        let mut groups: BTreeMap<String, Vec<GroupMember>> = BTreeMap::new();

        let witness_slots = record.witness_slots();
        for conflict in &witness_slots.conflicts {
            diagnostics.record(
                DiagnosticKind::DuplicateSlot,
                "witness",
                format!(
                    "witness at position {} claims slot {} already taken; dropped",
                    conflict.position, conflict.slot
                ),
            );
        }
        let witnesses = witness_slots.placed;
        let vehicles: BTreeMap<usize, &FieldSet> = record.other_vehicles.iter().enumerate().collect();

        for entry in self.mapping.table().entries() {
            match entry.source.slot_group() {
                None => {
                    let raw = scalar_source(record, &entry.source);
                    self.coerce_entry(entry, 0, raw.as_ref(), &mut values, &mut groups, diagnostics);
                }
                Some(group) => {
                    let items = match group {
                        SlotGroup::Witness => &witnesses,
                        SlotGroup::OtherVehicle => &vehicles,
                    };
                    for slot in 0..self.mapping.slots(group) {
                        let raw = items.get(&slot).and_then(|fields| fields.get(entry.source.column())).cloned();
                        self.coerce_entry(entry, slot, raw.as_ref(), &mut values, &mut groups, diagnostics);
                    }
                }
            }
        }

        for group in [SlotGroup::Witness, SlotGroup::OtherVehicle] {
            let (items, label) = match group {
                SlotGroup::Witness => (&witnesses, "witness"),
                SlotGroup::OtherVehicle => (&vehicles, "other_vehicle"),
            };
            let slots = self.mapping.slots(group);
            let dropped = items.range(slots..).count();
            if dropped > 0 {
                diagnostics.record(
                    DiagnosticKind::SlotOverflow,
                    label,
                    format!(
                        "{} record(s) supplied, template holds {}; {} beyond the last slot dropped",
                        items.len(),
                        slots,
                        dropped
                    ),
                );
            }
        }

        resolve_exclusive_groups(groups, &mut values, diagnostics);
        values
    }

    fn coerce_entry(
        &self,
        entry: &FieldMapping,
        slot: usize,
        raw: Option<&Value>,
        values: &mut ValueMap,
        groups: &mut BTreeMap<String, Vec<GroupMember>>,
        diagnostics: &mut Diagnostics,
    ) {
        let primary = self.mapping.target_name(entry, &entry.target, slot);
        if entry.required && is_missing(raw) {
            diagnostics.record(
                DiagnosticKind::MissingRequiredValue,
                &primary,
                format!("no value for required source {}", entry.source),
            );
        }

        match &entry.kind {
            ValueKind::Text(format) => {
                let text = self.coerce_text(raw, *format, &primary, diagnostics);
                insert(values, primary, CoercedValue::Text(text));
            }
            ValueKind::BooleanCheckbox => {
                let checked = coerce_bool(raw, &primary, diagnostics);
                insert(values, primary, CoercedValue::Checkbox(checked));
            }
            ValueKind::ExclusiveGroupMember { group, precedence } => {
                let checked = coerce_bool(raw, &primary, diagnostics);
                groups.entry(group.clone()).or_default().push(GroupMember {
                    field: primary.clone(),
                    precedence: *precedence,
                    checked,
                });
                insert(values, primary, CoercedValue::Checkbox(checked));
            }
            ValueKind::ArrayToBooleanSet(tags) => {
                let present = collect_tags(raw);
                for tag in &present {
                    if !tags.iter().any(|t| &t.tag == tag) {
                        diagnostics.record(
                            DiagnosticKind::UnknownTag,
                            &entry.target,
                            format!("tag '{tag}' has no checkbox and was ignored"),
                        );
                    }
                }
                for tag in tags {
                    let field = self.mapping.target_name(entry, &tag.target, slot);
                    insert(values, field, CoercedValue::Checkbox(present.contains(&tag.tag)));
                }
            }
        }
    }

    fn coerce_text(&self, raw: Option<&Value>, format: TextFormat, field: &str, diagnostics: &mut Diagnostics) -> String {
        let Some(raw) = raw else {
            return String::new();
        };
        match format {
            TextFormat::Plain => plain_text(raw),
            TextFormat::YesNo => match raw {
                Value::Null => String::new(),
                other => {
                    if coerce_bool(Some(other), field, diagnostics) {
                        "Yes".to_string()
                    } else {
                        "No".to_string()
                    }
                }
            },
            TextFormat::Date => {
                let text = plain_text(raw);
                if text.trim().is_empty() {
                    return String::new();
                }
                match parse_date(text.trim()) {
                    Some(date) => format_date(date, self.date_format),
                    None => {
                        diagnostics.record(
                            DiagnosticKind::UnparseableValue,
                            field,
                            format!("'{text}' is not a date; written as-is"),
                        );
                        text
                    }
                }
            }
            TextFormat::Time => {
                let text = plain_text(raw);
                if text.trim().is_empty() {
                    return String::new();
                }
                match parse_time(text.trim()) {
                    Some(time) => time.format("%H:%M").to_string(),
                    None => {
                        diagnostics.record(
                            DiagnosticKind::UnparseableValue,
                            field,
                            format!("'{text}' is not a time; written as-is"),
                        );
                        text
                    }
                }
            }
        }
    }
}

/// Convenience wrapper over [`Coercer`]
pub fn coerce(
    record: &AggregatedIncidentRecord,
    mapping: &ValidatedMapping,
    date_format: &str,
    diagnostics: &mut Diagnostics,
) -> ValueMap {
    Coercer::new(mapping, date_format).coerce(record, diagnostics)
}

fn insert(values: &mut ValueMap, field: String, value: CoercedValue) {
    if !values.insert(field.clone(), value) {
        log::debug!("Field '{}' already has a value, keeping the first", field);
    }
}

fn scalar_source(record: &AggregatedIncidentRecord, source: &SourcePath) -> Option<Value> {
    match source {
        SourcePath::Profile(column) => record.profile.get(column).cloned(),
        SourcePath::Incident(column) => record.incident.get(column).cloned(),
        SourcePath::Document(document_type) => record
            .document_of_type(document_type)
            .and_then(|doc| doc.signed_url.clone())
            .map(Value::String),
        SourcePath::Witness(_) | SourcePath::OtherVehicle(_) => None,
    }
}

fn is_missing(raw: Option<&Value>) -> bool {
    match raw {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn plain_text(raw: &Value) -> String {
    match raw {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "Yes".to_string(),
        Value::Bool(false) => "No".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(plain_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => raw.to_string(),
    }
}

fn coerce_bool(raw: Option<&Value>, field: &str, diagnostics: &mut Diagnostics) -> bool {
    match raw {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => {
            let normalized = s.trim().to_ascii_lowercase();
            if TRUTHY.contains(&normalized.as_str()) {
                true
            } else if FALSY.contains(&normalized.as_str()) {
                false
            } else {
                diagnostics.record(
                    DiagnosticKind::UnparseableValue,
                    field,
                    format!("'{s}' is not a yes/no value; left unchecked"),
                );
                false
            }
        }
        Some(other) => {
            diagnostics.record(
                DiagnosticKind::UnparseableValue,
                field,
                format!("{other} is not a yes/no value; left unchecked"),
            );
            false
        }
    }
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

fn collect_tags(raw: Option<&Value>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    match raw {
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(s) = item {
                    tags.insert(normalize_tag(s));
                }
            }
        }
        Some(Value::String(s)) => {
            tags.extend(s.split(',').map(normalize_tag));
        }
        _ => {}
    }
    tags.remove("");
    tags
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").ok().map(|dt| dt.date()))
        .or_else(|| NaiveDate::parse_from_str(text, "%d/%m/%Y").ok())
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .ok()
        .or_else(|| NaiveTime::parse_from_str(text, "%H:%M").ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.time()))
}

fn format_date(date: NaiveDate, date_format: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", date.format(date_format)).is_err() {
        return date.format("%Y-%m-%d").to_string();
    }
    out
}

/// At most one checked member per group; the lowest precedence value wins
fn resolve_exclusive_groups(
    groups: BTreeMap<String, Vec<GroupMember>>,
    values: &mut ValueMap,
    diagnostics: &mut Diagnostics,
) {
    for (group, members) in groups {
        let checked: Vec<&GroupMember> = members.iter().filter(|m| m.checked).collect();
        if checked.len() < 2 {
            continue;
        }
        let Some(winner) = checked.iter().min_by_key(|m| m.precedence) else {
            continue;
        };
        for member in &checked {
            if member.field != winner.field {
                values.replace(&member.field, CoercedValue::Checkbox(false));
            }
        }
        diagnostics.record(
            DiagnosticKind::ExclusiveGroupViolation,
            &group,
            format!(
                "{} members checked ({}); kept '{}'",
                checked.len(),
                checked.iter().map(|m| m.field.as_str()).collect::<Vec<_>>().join(", "),
                winner.field
            ),
        );
    }
}

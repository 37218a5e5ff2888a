//! Base template inspection.
//!
//! Builds an index of the AcroForm field tree: fully-qualified field name,
//! field type, widget annotations and the pages they sit on. The index drives
//! startup validation of the mapping table, the form filler, and the CLI
//! field listing.

pub mod sample;

pub use sample::{sample_template, SampleField, SampleTemplateSpec};

use crate::error::TemplateError;
use crate::pdf_text::{object_text, resolve, sha256_hex};
use lopdf::{Dictionary, Document, Object, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

const FF_MULTILINE: i64 = 1 << 12;
const FF_RADIO: i64 = 1 << 15;
const FF_PUSHBUTTON: i64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Checkbox,
    Radio,
    PushButton,
    Choice,
    Signature,
    Unknown,
}

impl FieldKind {
    /// Whether a field of this kind can receive a value meant for `expected`
    pub fn accepts(&self, expected: FieldKind) -> bool {
        match (expected, self) {
            (_, FieldKind::Unknown) => true,
            (FieldKind::Text, FieldKind::Text | FieldKind::Choice) => true,
            (FieldKind::Checkbox, FieldKind::Checkbox) => true,
            (a, b) => a == *b,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Radio => "radio",
            FieldKind::PushButton => "push button",
            FieldKind::Choice => "choice",
            FieldKind::Signature => "signature",
            FieldKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    pub kind: FieldKind,
    /// 1-indexed pages carrying a widget of this field
    pub pages: Vec<u32>,
    pub max_len: Option<usize>,
    /// Appearance state name that means "checked" (usually `Yes`)
    pub on_state: Option<String>,
    pub multiline: bool,
    pub widget_count: usize,
}

/// A terminal field plus the objects that make it up
#[derive(Debug, Clone)]
pub(crate) struct IndexedField {
    pub info: TemplateField,
    pub field_id: ObjectId,
    pub widget_ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub page_count: usize,
    pub sha256: String,
    pub fields: BTreeMap<String, TemplateField>,
}

impl TemplateInfo {
    pub fn inspect(bytes: &[u8]) -> Result<Self, TemplateError> {
        let doc = Document::load_mem(bytes).map_err(|e| TemplateError::Parse(e.to_string()))?;
        let page_count = doc.get_pages().len();
        if page_count == 0 {
            return Err(TemplateError::NoPages);
        }

        let mut fields: BTreeMap<String, TemplateField> = BTreeMap::new();
        for indexed in index_form_fields(&doc)? {
            match fields.get_mut(&indexed.info.name) {
                Some(existing) => {
                    existing.pages.extend(indexed.info.pages);
                    existing.pages.sort_unstable();
                    existing.pages.dedup();
                    existing.widget_count += indexed.info.widget_count;
                }
                None => {
                    fields.insert(indexed.info.name.clone(), indexed.info);
                }
            }
        }

        log::debug!("Template has {} page(s) and {} field(s)", page_count, fields.len());

        Ok(Self {
            page_count,
            sha256: sha256_hex(bytes),
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&TemplateField> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

pub(crate) fn catalog(doc: &Document) -> Option<&Dictionary> {
    let root = doc.trailer.get(b"Root").ok()?;
    match resolve(doc, root)? {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

/// Object id of the AcroForm dictionary when it is an indirect object
pub(crate) fn acro_form_id(doc: &Document) -> Option<ObjectId> {
    match catalog(doc)?.get(b"AcroForm").ok()? {
        Object::Reference(id) => Some(*id),
        _ => None,
    }
}

pub(crate) fn acro_form(doc: &Document) -> Option<&Dictionary> {
    let form = catalog(doc)?.get(b"AcroForm").ok()?;
    match resolve(doc, form)? {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn dict_int(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key).ok()? {
        Object::Integer(value) => Some(*value),
        _ => None,
    }
}

fn dict_name(dict: &Dictionary, key: &[u8]) -> Option<Vec<u8>> {
    match dict.get(key).ok()? {
        Object::Name(name) => Some(name.clone()),
        _ => None,
    }
}

/// Reference array under `key`, following one level of indirection
pub(crate) fn reference_array(doc: &Document, dict: &Dictionary, key: &[u8]) -> Vec<ObjectId> {
    let Some(object) = dict.get(key).ok().and_then(|o| resolve(doc, o)) else {
        return Vec::new();
    };
    match object {
        Object::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Object::Reference(id) => Some(*id),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Default)]
struct Inherited {
    field_type: Option<Vec<u8>>,
    flags: i64,
    max_len: Option<i64>,
}

fn field_kind(field_type: Option<&[u8]>, flags: i64) -> FieldKind {
    match field_type {
        Some(b"Tx") => FieldKind::Text,
        Some(b"Btn") if flags & FF_PUSHBUTTON != 0 => FieldKind::PushButton,
        Some(b"Btn") if flags & FF_RADIO != 0 => FieldKind::Radio,
        Some(b"Btn") => FieldKind::Checkbox,
        Some(b"Ch") => FieldKind::Choice,
        Some(b"Sig") => FieldKind::Signature,
        _ => FieldKind::Unknown,
    }
}

/// First normal-appearance state other than `Off`
pub(crate) fn widget_on_state(doc: &Document, widget: &Dictionary) -> Option<String> {
    let appearance = resolve(doc, widget.get(b"AP").ok()?)?.as_dict().ok()?;
    let normal = resolve(doc, appearance.get(b"N").ok()?)?.as_dict().ok()?;
    normal
        .iter()
        .map(|(state, _)| String::from_utf8_lossy(state).into_owned())
        .find(|state| state != "Off")
}

/// Widget annotation id → 1-indexed page number
pub(crate) fn widget_pages(doc: &Document) -> HashMap<ObjectId, u32> {
    let mut pages = HashMap::new();
    for (number, page_id) in doc.get_pages() {
        let Ok(page) = doc.get_dictionary(page_id) else {
            continue;
        };
        for annot_id in reference_array(doc, page, b"Annots") {
            pages.entry(annot_id).or_insert(number);
        }
    }
    pages
}

/// Walk the AcroForm field tree and return every terminal field
pub(crate) fn index_form_fields(doc: &Document) -> Result<Vec<IndexedField>, TemplateError> {
    let form = acro_form(doc).ok_or(TemplateError::NoAcroForm)?;
    let roots = reference_array(doc, form, b"Fields");
    let page_of = widget_pages(doc);

    let mut indexed = Vec::new();
    let mut visited = HashSet::new();
    for root in roots {
        walk_field(doc, root, None, &Inherited::default(), &page_of, &mut visited, &mut indexed);
    }
    Ok(indexed)
}

fn walk_field(
    doc: &Document,
    id: ObjectId,
    parent_name: Option<&str>,
    inherited: &Inherited,
    page_of: &HashMap<ObjectId, u32>,
    visited: &mut HashSet<ObjectId>,
    out: &mut Vec<IndexedField>,
) {
    if !visited.insert(id) {
        return;
    }
    let Ok(dict) = doc.get_dictionary(id) else {
        return;
    };

    let partial = dict.get(b"T").ok().and_then(object_text);
    let name = match (parent_name, partial.as_deref()) {
        (Some(parent), Some(part)) => format!("{parent}.{part}"),
        (None, Some(part)) => part.to_string(),
        (Some(parent), None) => parent.to_string(),
        (None, None) => String::new(),
    };

    let inherited = Inherited {
        field_type: dict_name(dict, b"FT").or_else(|| inherited.field_type.clone()),
        flags: dict_int(dict, b"Ff").unwrap_or(inherited.flags),
        max_len: dict_int(dict, b"MaxLen").or(inherited.max_len),
    };

    let mut child_fields = Vec::new();
    let mut widget_ids = Vec::new();
    for kid in reference_array(doc, dict, b"Kids") {
        match doc.get_dictionary(kid) {
            Ok(kid_dict) if kid_dict.has(b"T") => child_fields.push(kid),
            Ok(_) => widget_ids.push(kid),
            Err(_) => {}
        }
    }
    let is_widget = matches!(dict_name(dict, b"Subtype").as_deref(), Some(b"Widget"));
    if child_fields.is_empty() && widget_ids.is_empty() && is_widget {
        widget_ids.push(id);
    }

    for child in child_fields.iter().copied() {
        walk_field(doc, child, Some(&name), &inherited, page_of, visited, out);
    }

    if name.is_empty() || (!child_fields.is_empty() && widget_ids.is_empty()) {
        return;
    }

    let kind = field_kind(inherited.field_type.as_deref(), inherited.flags);
    let mut pages: Vec<u32> = widget_ids.iter().filter_map(|w| page_of.get(w).copied()).collect();
    pages.sort_unstable();
    pages.dedup();
    let on_state = if matches!(kind, FieldKind::Checkbox | FieldKind::Radio) {
        widget_ids
            .iter()
            .filter_map(|w| doc.get_dictionary(*w).ok())
            .find_map(|w| widget_on_state(doc, w))
    } else {
        None
    };

    out.push(IndexedField {
        info: TemplateField {
            name,
            kind,
            pages,
            max_len: inherited.max_len.and_then(|len| usize::try_from(len).ok()),
            on_state,
            multiline: kind == FieldKind::Text && inherited.flags & FF_MULTILINE != 0,
            widget_count: widget_ids.len(),
        },
        field_id: id,
        widget_ids,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SampleTemplateSpec {
        SampleTemplateSpec {
            page_count: 2,
            fields: vec![
                SampleField::text("driver_first_name", vec![1]).with_max_len(20),
                SampleField::checkbox("police_attended", vec![2]),
                SampleField::text("claim_reference", vec![1, 2]),
                SampleField::text("witness_statement", vec![2]).multiline(),
            ],
        }
    }

    #[test]
    fn test_inspect_indexes_fields() {
        let bytes = sample_template(&spec()).unwrap();
        let info = TemplateInfo::inspect(&bytes).unwrap();

        assert_eq!(info.page_count, 2);
        assert_eq!(info.fields.len(), 4);

        let name = info.field("driver_first_name").unwrap();
        assert_eq!(name.kind, FieldKind::Text);
        assert_eq!(name.pages, vec![1]);
        assert_eq!(name.max_len, Some(20));

        let police = info.field("police_attended").unwrap();
        assert_eq!(police.kind, FieldKind::Checkbox);
        assert_eq!(police.on_state.as_deref(), Some("Yes"));

        let claim = info.field("claim_reference").unwrap();
        assert_eq!(claim.pages, vec![1, 2]);
        assert_eq!(claim.widget_count, 2);

        assert!(info.field("witness_statement").unwrap().multiline);
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(matches!(
            TemplateInfo::inspect(b"not a pdf"),
            Err(TemplateError::Parse(_))
        ));
    }

    #[test]
    fn test_field_kind_compatibility() {
        assert!(FieldKind::Choice.accepts(FieldKind::Text));
        assert!(FieldKind::Unknown.accepts(FieldKind::Checkbox));
        assert!(!FieldKind::Checkbox.accepts(FieldKind::Text));
        assert!(!FieldKind::Text.accepts(FieldKind::Checkbox));
    }
}

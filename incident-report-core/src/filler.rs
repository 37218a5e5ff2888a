//! Form Filler
//!
//! Applies a [`ValueMap`] to a freshly loaded copy of the base template and
//! marks the form with `NeedAppearances true` so viewers regenerate widget
//! appearances. Fields stay interactive; the document is never flattened.

use crate::config::SanitizeConfig;
use crate::error::TemplateError;
use crate::pdf_text::encode_text_string;
use crate::template::{acro_form_id, index_form_fields, widget_on_state, FieldKind, IndexedField};
use crate::types::{CoercedValue, DiagnosticKind, Diagnostics, ValueMap};
use lopdf::{Document, Object, ObjectId};
use std::collections::HashMap;

/// Filled, still interactive template. Produced once per job and handed to the
/// assembler, which only ever reads it.
#[derive(Debug)]
pub struct FilledDocument {
    document: Document,
    page_count: usize,
    filled_fields: usize,
}

impl FilledDocument {
    pub(crate) fn document(&self) -> &Document {
        &self.document
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Number of template fields that received a value
    pub fn filled_fields(&self) -> usize {
        self.filled_fields
    }

    /// Serialize a copy, for stage dumps
    pub fn to_bytes(&self) -> Result<Vec<u8>, TemplateError> {
        let mut copy = self.document.clone();
        let mut bytes = Vec::new();
        copy.save_to(&mut bytes)
            .map_err(|e| TemplateError::Parse(format!("filled document could not be written: {e}")))?;
        Ok(bytes)
    }
}

pub struct FormFiller<'a> {
    sanitize: &'a SanitizeConfig,
}

impl<'a> FormFiller<'a> {
    pub fn new(sanitize: &'a SanitizeConfig) -> Self {
        Self { sanitize }
    }

    pub fn fill(
        &self,
        template_bytes: &[u8],
        values: &ValueMap,
        diagnostics: &mut Diagnostics,
    ) -> Result<FilledDocument, TemplateError> {
        let mut document = Document::load_mem(template_bytes).map_err(|e| TemplateError::Parse(e.to_string()))?;
        let page_count = document.get_pages().len();
        if page_count == 0 {
            return Err(TemplateError::NoPages);
        }

        let mut by_name: HashMap<String, Vec<IndexedField>> = HashMap::new();
        for field in index_form_fields(&document)? {
            by_name.entry(field.info.name.clone()).or_default().push(field);
        }

        let mut filled_fields = 0;
        for (name, value) in values.iter() {
            let Some(targets) = by_name.get(name) else {
                diagnostics.record(DiagnosticKind::FieldNotFound, name, "field is not in the template; skipped");
                continue;
            };
            for target in targets {
                if self.apply(&mut document, target, value, diagnostics) {
                    filled_fields += 1;
                }
            }
        }

        mark_need_appearances(&mut document)?;
        log::debug!("Filled {} field(s) across {} page(s)", filled_fields, page_count);

        Ok(FilledDocument {
            document,
            page_count,
            filled_fields,
        })
    }

    /// Returns whether the field was written
    fn apply(
        &self,
        doc: &mut Document,
        field: &IndexedField,
        value: &CoercedValue,
        diagnostics: &mut Diagnostics,
    ) -> bool {
        let name = &field.info.name;
        match (field.info.kind, value) {
            (FieldKind::Text | FieldKind::Choice | FieldKind::Unknown, CoercedValue::Text(text)) => {
                self.write_text(doc, field, text, diagnostics)
            }
            (FieldKind::Checkbox | FieldKind::Radio, CoercedValue::Checkbox(checked)) => {
                write_checkbox(doc, field, *checked)
            }
            (FieldKind::Checkbox | FieldKind::Radio, CoercedValue::Text(text)) => {
                let checked = !text.trim().is_empty();
                diagnostics.record(
                    DiagnosticKind::FieldTypeMismatch,
                    name,
                    format!("text value written to a {} field as {}", field.info.kind, if checked { "checked" } else { "unchecked" }),
                );
                write_checkbox(doc, field, checked)
            }
            (FieldKind::Text | FieldKind::Choice | FieldKind::Unknown, CoercedValue::Checkbox(checked)) => {
                diagnostics.record(
                    DiagnosticKind::FieldTypeMismatch,
                    name,
                    format!("boolean value written to a {} field as text", field.info.kind),
                );
                let text = if *checked { "Yes" } else { "" };
                self.write_text(doc, field, text, diagnostics)
            }
            (kind, _) => {
                diagnostics.record(
                    DiagnosticKind::FieldTypeMismatch,
                    name,
                    format!("{kind} fields cannot be filled; skipped"),
                );
                false
            }
        }
    }

    fn write_text(&self, doc: &mut Document, field: &IndexedField, raw: &str, diagnostics: &mut Diagnostics) -> bool {
        let limit = field.info.max_len.unwrap_or(self.sanitize.max_text_length);
        let sanitized = sanitize_text(raw, field.info.multiline, self.sanitize.trim, limit);
        if sanitized.truncated {
            diagnostics.record(
                DiagnosticKind::ValueTruncated,
                &field.info.name,
                format!("value cut to {limit} character(s)"),
            );
        }

        let Ok(dict) = doc.get_dictionary_mut(field.field_id) else {
            return false;
        };
        dict.set("V", encode_text_string(&sanitized.text));

        // Stale appearances would show the template's blank value
        for widget_id in &field.widget_ids {
            if let Ok(widget) = doc.get_dictionary_mut(*widget_id) {
                widget.remove(b"AP");
            }
        }
        true
    }
}

fn write_checkbox(doc: &mut Document, field: &IndexedField, checked: bool) -> bool {
    let fallback_on = field.info.on_state.clone().unwrap_or_else(|| "Yes".to_string());

    let widget_states: Vec<(ObjectId, String)> = field
        .widget_ids
        .iter()
        .map(|id| {
            let on = doc
                .get_dictionary(*id)
                .ok()
                .and_then(|w| widget_on_state(doc, w))
                .unwrap_or_else(|| fallback_on.clone());
            (*id, if checked { on } else { "Off".to_string() })
        })
        .collect();

    for (widget_id, state) in &widget_states {
        if let Ok(widget) = doc.get_dictionary_mut(*widget_id) {
            widget.set("AS", Object::Name(state.as_bytes().to_vec()));
        }
    }

    let value = if checked { fallback_on } else { "Off".to_string() };
    match doc.get_dictionary_mut(field.field_id) {
        Ok(dict) => {
            dict.set("V", Object::Name(value.into_bytes()));
            true
        }
        Err(_) => false,
    }
}

fn mark_need_appearances(doc: &mut Document) -> Result<(), TemplateError> {
    if let Some(form_id) = acro_form_id(doc) {
        let form = doc.get_dictionary_mut(form_id).map_err(|_| TemplateError::NoAcroForm)?;
        form.set("NeedAppearances", true);
        return Ok(());
    }

    let root_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|_| TemplateError::NoAcroForm)?;
    let form = doc
        .get_dictionary_mut(root_id)
        .and_then(|catalog| catalog.get_mut(b"AcroForm"))
        .and_then(Object::as_dict_mut)
        .map_err(|_| TemplateError::NoAcroForm)?;
    form.set("NeedAppearances", true);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedText {
    pub text: String,
    pub truncated: bool,
}

/// Make a value safe for a single text field: strip control characters,
/// fold line breaks unless the field is multiline, cap the length.
pub fn sanitize_text(raw: &str, multiline: bool, trim: bool, max_chars: usize) -> SanitizedText {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut text: String = normalized
        .chars()
        .filter_map(|c| match c {
            '\n' if multiline => Some('\n'),
            '\n' | '\t' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    if trim {
        text = text.trim().to_string();
    }

    let truncated = text.chars().count() > max_chars;
    if truncated {
        text = text.chars().take(max_chars).collect();
        if trim {
            text = text.trim_end().to_string();
        }
    }
    SanitizedText { text, truncated }
}

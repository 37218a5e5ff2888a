//! Synthetic fillable template.
//!
//! Produces a form with one labelled widget per field, pre-baked appearance
//! streams and `NeedAppearances false`, shaped like a template exported from a
//! form designer. Tests use it in place of the production template; the CLI can
//! write one out as a starting point.

use super::FieldKind;
use crate::error::TemplateError;
use crate::mapping::RequiredField;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeMap;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const ROW_HEIGHT: f32 = 16.0;
const FIRST_ROW_Y: f32 = 770.0;
const ROWS_PER_COLUMN: usize = 44;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleField {
    pub name: String,
    pub kind: FieldKind,
    /// 1-indexed pages; one widget per page
    pub pages: Vec<u32>,
    pub max_len: Option<usize>,
    pub multiline: bool,
}

impl SampleField {
    pub fn text(name: &str, pages: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text,
            pages,
            max_len: None,
            multiline: false,
        }
    }

    pub fn checkbox(name: &str, pages: Vec<u32>) -> Self {
        Self {
            kind: FieldKind::Checkbox,
            ..Self::text(name, pages)
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn multiline(mut self) -> Self {
        self.multiline = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleTemplateSpec {
    pub page_count: u32,
    pub fields: Vec<SampleField>,
}

impl SampleTemplateSpec {
    /// One field per required name. Fields without a page hint get a widget on
    /// every page.
    pub fn from_required(required: &[RequiredField], page_count: u32) -> Self {
        let all_pages: Vec<u32> = (1..=page_count).collect();
        let fields = required
            .iter()
            .map(|field| {
                let pages = match field.page_hint {
                    Some(page) if page >= 1 && page <= page_count => vec![page],
                    _ => all_pages.clone(),
                };
                SampleField {
                    name: field.name.clone(),
                    kind: field.kind,
                    pages,
                    max_len: None,
                    multiline: field.multiline,
                }
            })
            .collect();
        Self { page_count, fields }
    }

    /// Template matching the built-in mapping: six pages, three witness groups,
    /// two other-vehicle groups.
    pub fn builtin() -> Self {
        use crate::mapping::{FieldMappingTable, FieldNameOverrides, ValidatedMapping};
        let required = ValidatedMapping::required_fields(
            &FieldMappingTable::builtin(),
            &FieldNameOverrides::builtin(),
            3,
            2,
        );
        Self::from_required(&required, 6)
    }

    pub fn without_field(mut self, name: &str) -> Self {
        self.fields.retain(|f| f.name != name);
        self
    }

    pub fn with_field(mut self, field: SampleField) -> Self {
        self.fields.push(field);
        self
    }
}

fn literal(text: &str) -> Object {
    Object::String(text.as_bytes().to_vec(), StringFormat::Literal)
}

fn rect(x1: f32, y1: f32, x2: f32, y2: f32) -> Object {
    Object::Array(vec![x1.into(), y1.into(), x2.into(), y2.into()])
}

fn appearance_stream(width: f32, height: f32, content: Vec<u8>) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => rect(0.0, 0.0, width, height),
        },
        content,
    )
}

fn encode_content(operations: Vec<Operation>) -> Result<Vec<u8>, TemplateError> {
    Content { operations }
        .encode()
        .map_err(|e| TemplateError::Parse(format!("content encoding failed: {e}")))
}

struct Placement {
    field: usize,
    x: f32,
    y: f32,
}

/// Build the template described by `spec`
pub fn sample_template(spec: &SampleTemplateSpec) -> Result<Vec<u8>, TemplateError> {
    if spec.page_count == 0 {
        return Err(TemplateError::NoPages);
    }

    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let page_ids: Vec<ObjectId> = (0..spec.page_count).map(|_| doc.new_object_id()).collect();

    // Row layout per page
    let mut placements: BTreeMap<u32, Vec<Placement>> = BTreeMap::new();
    for (index, field) in spec.fields.iter().enumerate() {
        for &page in &field.pages {
            if page == 0 || page > spec.page_count {
                continue;
            }
            let rows = placements.entry(page).or_default();
            let row = rows.len();
            let column = (row / ROWS_PER_COLUMN) as f32;
            rows.push(Placement {
                field: index,
                x: 40.0 + column * 280.0,
                y: FIRST_ROW_Y - (row % ROWS_PER_COLUMN) as f32 * ROW_HEIGHT,
            });
        }
    }

    let empty_text_ap = doc.add_object(appearance_stream(110.0, 12.0, b"/Tx BMC EMC".to_vec()));
    let checkbox_on_ap = doc.add_object(appearance_stream(
        10.0,
        10.0,
        b"0 g 2 2 6 6 re f".to_vec(),
    ));
    let checkbox_off_ap = doc.add_object(appearance_stream(10.0, 10.0, Vec::new()));

    let mut widgets_by_field: BTreeMap<usize, Vec<ObjectId>> = BTreeMap::new();
    let mut annots_by_page: BTreeMap<u32, Vec<Object>> = BTreeMap::new();

    for (page_number, rows) in &placements {
        let page_id = page_ids[(*page_number - 1) as usize];
        for placement in rows {
            let field = &spec.fields[placement.field];
            let widget_x = placement.x + 140.0;
            let mut widget = dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "F" => 4,
                "P" => Object::Reference(page_id),
            };
            match field.kind {
                FieldKind::Checkbox | FieldKind::Radio => {
                    widget.set(
                        "Rect",
                        rect(widget_x, placement.y - 2.0, widget_x + 10.0, placement.y + 8.0),
                    );
                    widget.set("AS", "Off");
                    widget.set(
                        "AP",
                        dictionary! {
                            "N" => dictionary! {
                                "Yes" => Object::Reference(checkbox_on_ap),
                                "Off" => Object::Reference(checkbox_off_ap),
                            },
                        },
                    );
                }
                _ => {
                    widget.set(
                        "Rect",
                        rect(widget_x, placement.y - 2.0, widget_x + 110.0, placement.y + 10.0),
                    );
                    widget.set("DA", literal("/Helv 8 Tf 0 g"));
                    widget.set("AP", dictionary! { "N" => Object::Reference(empty_text_ap) });
                }
            }
            let widget_id = doc.add_object(widget);
            widgets_by_field.entry(placement.field).or_default().push(widget_id);
            annots_by_page
                .entry(*page_number)
                .or_default()
                .push(Object::Reference(widget_id));
        }
    }

    // Field dictionaries: merged field/widget for single widgets, parent + kids otherwise
    let mut field_refs = Vec::new();
    for (index, widget_ids) in &widgets_by_field {
        let field = &spec.fields[*index];
        let mut field_dict = field_dictionary(field);
        if let [widget_id] = widget_ids.as_slice() {
            if let Ok(widget) = doc.get_dictionary_mut(*widget_id) {
                for (key, value) in field_dict.iter() {
                    widget.set(key.clone(), value.clone());
                }
            }
            field_refs.push(Object::Reference(*widget_id));
        } else {
            field_dict.set(
                "Kids",
                widget_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
            );
            let field_id = doc.add_object(field_dict);
            for widget_id in widget_ids {
                if let Ok(widget) = doc.get_dictionary_mut(*widget_id) {
                    widget.set("Parent", Object::Reference(field_id));
                }
            }
            field_refs.push(Object::Reference(field_id));
        }
    }

    for (offset, page_id) in page_ids.iter().enumerate() {
        let page_number = offset as u32 + 1;
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 14.into()]),
            Operation::new("Td", vec![40.into(), 800.into()]),
            Operation::new(
                "Tj",
                vec![literal(&format!(
                    "Car Incident Report - page {} of {}",
                    page_number, spec.page_count
                ))],
            ),
            Operation::new("ET", vec![]),
        ];
        for placement in placements.get(&page_number).into_iter().flatten() {
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 8.into()]),
                Operation::new("Td", vec![placement.x.into(), placement.y.into()]),
                Operation::new("Tj", vec![literal(&spec.fields[placement.field].name)]),
                Operation::new("ET", vec![]),
            ]);
        }
        let content_id = doc.add_object(Stream::new(dictionary! {}, encode_content(operations)?));

        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => rect(0.0, 0.0, PAGE_WIDTH, PAGE_HEIGHT),
            "Contents" => Object::Reference(content_id),
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => Object::Reference(font_id) },
            },
        };
        if let Some(annots) = annots_by_page.remove(&page_number) {
            page.set("Annots", annots);
        }
        doc.objects.insert(*page_id, Object::Dictionary(page));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
            "Count" => spec.page_count as i64,
        }),
    );

    let acro_form_id = doc.add_object(dictionary! {
        "Fields" => field_refs,
        "NeedAppearances" => false,
        "DA" => literal("/Helv 0 Tf 0 g"),
        "DR" => dictionary! {
            "Font" => dictionary! { "Helv" => Object::Reference(font_id) },
        },
    });
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
        "AcroForm" => Object::Reference(acro_form_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| TemplateError::Parse(format!("sample template could not be written: {e}")))?;
    Ok(bytes)
}

fn field_dictionary(field: &SampleField) -> Dictionary {
    let mut dict = dictionary! {
        "T" => literal(&field.name),
    };
    match field.kind {
        FieldKind::Checkbox => {
            dict.set("FT", "Btn");
            dict.set("V", "Off");
        }
        FieldKind::Radio => {
            dict.set("FT", "Btn");
            dict.set("Ff", 1i64 << 15);
            dict.set("V", "Off");
        }
        FieldKind::Choice => dict.set("FT", "Ch"),
        FieldKind::Signature => dict.set("FT", "Sig"),
        _ => {
            dict.set("FT", "Tx");
            if field.multiline {
                dict.set("Ff", 1i64 << 12);
            }
            if let Some(max_len) = field.max_len {
                dict.set("MaxLen", max_len as i64);
            }
        }
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateInfo;

    #[test]
    fn test_builtin_sample_covers_every_required_field() {
        let spec = SampleTemplateSpec::builtin();
        let bytes = sample_template(&spec).unwrap();
        let info = TemplateInfo::inspect(&bytes).unwrap();

        assert_eq!(info.page_count, 6);
        for field in &spec.fields {
            assert!(info.has_field(&field.name), "missing {}", field.name);
        }
        assert!(info.has_field("witness_name_3"));
        assert!(info.has_field("witness_phone_number_2"));
        assert!(info.has_field("other_driver_name_2"));
        assert!(!info.has_field("witness_name_4"));
        assert_eq!(info.field("claim_reference").unwrap().pages, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_pages_have_distinct_content() {
        let bytes = sample_template(&SampleTemplateSpec::builtin()).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        let digests: std::collections::HashSet<String> = doc
            .get_pages()
            .values()
            .map(|id| crate::pdf_text::page_content_digest(&doc, *id).unwrap())
            .collect();
        assert_eq!(digests.len(), 6);
    }
}

//! Eager page copy from one source document into the output document.
//!
//! One `PageCopier` is one copy operation: it owns the source → output object
//! id map for that operation and nothing else. Every object a copied page
//! reaches is resolved and written immediately, so the output never refers
//! back into a source.
//!
//! Structural objects (pages, page tree nodes, the catalog) are never pulled
//! in through references; a reference to one becomes `null` unless it is a
//! page already copied by the same operation. Widget annotations are only
//! copied through their page's `/Annots`, with field-level keys split off so
//! the form can be rebuilt by name.

use crate::pdf_text::object_text;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::{HashMap, HashSet};

const INHERITABLE_PAGE_KEYS: &[&[u8]] = &[b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Keys describing the field rather than the widget
const FIELD_KEYS: &[&[u8]] = &[
    b"T", b"TU", b"TM", b"FT", b"Ff", b"V", b"DV", b"MaxLen", b"Opt", b"TI", b"I", b"Kids", b"Parent",
];

/// Field keys a child inherits from its ancestors
const INHERITABLE_FIELD_KEYS: &[&[u8]] = &[b"FT", b"Ff", b"V", b"DV", b"MaxLen", b"Opt", b"DA", b"Q"];

/// A widget copied into the output together with its field identity
#[derive(Debug, Clone)]
pub(crate) struct CopiedWidget {
    pub field_name: String,
    /// Field-level attributes, already copied into the output
    pub attributes: Dictionary,
    pub widget_id: ObjectId,
}

#[derive(Debug, Clone)]
pub(crate) struct CopiedPage {
    pub page_id: ObjectId,
    pub widgets: Vec<CopiedWidget>,
}

pub(crate) struct PageCopier<'s> {
    source: &'s Document,
    id_map: HashMap<ObjectId, ObjectId>,
    /// Objects only reachable through dedicated paths
    restricted: HashSet<ObjectId>,
}

fn type_name(dict: &Dictionary) -> Option<&[u8]> {
    match dict.get(b"Type").ok()? {
        Object::Name(name) => Some(name.as_slice()),
        _ => None,
    }
}

fn is_widget(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == b"Widget")
}

impl<'s> PageCopier<'s> {
    pub fn new(source: &'s Document) -> Self {
        let mut restricted = HashSet::new();
        for (id, object) in source.objects.iter() {
            let dict = match object {
                Object::Dictionary(dict) => dict,
                _ => continue,
            };
            let structural = matches!(type_name(dict), Some(b"Page" | b"Pages" | b"Catalog"));
            if structural || is_widget(dict) {
                restricted.insert(*id);
            }
        }
        if let Ok(Object::Reference(root)) = source.trailer.get(b"Root") {
            restricted.insert(*root);
        }
        Self {
            source,
            id_map: HashMap::new(),
            restricted,
        }
    }

    /// Copy one page under `parent` in `out`
    pub fn copy_page(&mut self, out: &mut Document, page_id: ObjectId, parent: ObjectId) -> Result<CopiedPage, String> {
        let source = self.source;
        let page = source
            .get_dictionary(page_id)
            .map_err(|e| format!("page object {page_id:?} unreadable: {e}"))?;

        let new_page_id = out.new_object_id();
        self.id_map.insert(page_id, new_page_id);

        let mut copy = Dictionary::new();
        let mut widgets = Vec::new();
        for (key, value) in page.iter() {
            match key.as_slice() {
                b"Parent" => {}
                b"Annots" => {
                    let annots = self.copy_annotations(out, value, new_page_id, &mut widgets);
                    copy.set("Annots", annots);
                }
                _ => {
                    let value = self.copy_object(out, value);
                    copy.set(key.clone(), value);
                }
            }
        }

        for key in INHERITABLE_PAGE_KEYS {
            if copy.has(key) {
                continue;
            }
            if let Some(value) = inherited_page_attribute(source, page, key) {
                let value = self.copy_object(out, value);
                copy.set(key.to_vec(), value);
            }
        }
        if !copy.has(b"MediaBox") {
            return Err(format!("page object {page_id:?} has no MediaBox"));
        }

        copy.set("Type", "Page");
        copy.set("Parent", Object::Reference(parent));
        out.objects.insert(new_page_id, Object::Dictionary(copy));

        Ok(CopiedPage {
            page_id: new_page_id,
            widgets,
        })
    }

    /// Copy a free-standing object (e.g. form resources) within this operation
    pub fn copy_object(&mut self, out: &mut Document, object: &Object) -> Object {
        match object {
            Object::Reference(id) => self.copy_reference(out, *id),
            Object::Array(items) => Object::Array(items.iter().map(|item| self.copy_object(out, item)).collect()),
            Object::Dictionary(dict) => Object::Dictionary(self.copy_dictionary(out, dict)),
            Object::Stream(stream) => {
                let mut copy = stream.clone();
                copy.dict = self.copy_dictionary(out, &stream.dict);
                Object::Stream(copy)
            }
            other => other.clone(),
        }
    }

    fn copy_dictionary(&mut self, out: &mut Document, dict: &Dictionary) -> Dictionary {
        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            let value = self.copy_object(out, value);
            copy.set(key.clone(), value);
        }
        copy
    }

    fn copy_reference(&mut self, out: &mut Document, id: ObjectId) -> Object {
        if let Some(mapped) = self.id_map.get(&id) {
            return Object::Reference(*mapped);
        }
        if self.restricted.contains(&id) {
            return Object::Null;
        }
        let source = self.source;
        let Ok(object) = source.get_object(id) else {
            // Dangling in the source; never carry it over
            return Object::Null;
        };
        let new_id = out.new_object_id();
        self.id_map.insert(id, new_id);
        let copy = self.copy_object(out, object);
        out.objects.insert(new_id, copy);
        Object::Reference(new_id)
    }

    fn copy_annotations(
        &mut self,
        out: &mut Document,
        annots: &Object,
        new_page_id: ObjectId,
        widgets: &mut Vec<CopiedWidget>,
    ) -> Object {
        let source = self.source;
        let items = match annots {
            Object::Array(items) => items.as_slice(),
            Object::Reference(id) => match source.get_object(*id) {
                Ok(Object::Array(items)) => items.as_slice(),
                _ => &[],
            },
            _ => &[],
        };

        let mut copied = Vec::with_capacity(items.len());
        for item in items {
            let Object::Reference(annot_id) = item else {
                copied.push(self.copy_object(out, item));
                continue;
            };
            let Ok(annot) = source.get_dictionary(*annot_id) else {
                continue;
            };
            if !is_widget(annot) {
                copied.push(self.copy_reference(out, *annot_id));
                continue;
            }
            if let Some(mapped) = self.id_map.get(annot_id) {
                copied.push(Object::Reference(*mapped));
                continue;
            }

            let widget_id = out.new_object_id();
            self.id_map.insert(*annot_id, widget_id);

            let mut copy = Dictionary::new();
            for (key, value) in annot.iter() {
                if FIELD_KEYS.contains(&key.as_slice()) || key.as_slice() == b"P" {
                    continue;
                }
                let value = self.copy_object(out, value);
                copy.set(key.clone(), value);
            }
            copy.set("P", Object::Reference(new_page_id));
            out.objects.insert(widget_id, Object::Dictionary(copy));
            copied.push(Object::Reference(widget_id));

            if let Some((field_name, attributes)) = field_identity(source, *annot_id, annot) {
                let attributes = self.copy_dictionary(out, &attributes);
                widgets.push(CopiedWidget {
                    field_name,
                    attributes,
                    widget_id,
                });
            }
        }
        Object::Array(copied)
    }
}

fn inherited_page_attribute<'a>(source: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut visited = HashSet::new();
    let mut parent = match page.get(b"Parent") {
        Ok(Object::Reference(id)) => *id,
        _ => return None,
    };
    while visited.insert(parent) {
        let node = source.get_dictionary(parent).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        parent = match node.get(b"Parent") {
            Ok(Object::Reference(id)) => *id,
            _ => return None,
        };
    }
    None
}

/// Fully qualified field name of a widget plus its inherited field attributes.
/// `None` for widgets that belong to no named field.
fn field_identity(source: &Document, widget_id: ObjectId, widget: &Dictionary) -> Option<(String, Dictionary)> {
    let mut parts = Vec::new();
    let mut attributes = Dictionary::new();
    let mut visited = HashSet::new();
    let mut node_id = widget_id;
    let mut node = widget;

    loop {
        if !visited.insert(node_id) {
            break;
        }
        if let Some(part) = node.get(b"T").ok().and_then(object_text) {
            parts.push(part);
        }
        for key in INHERITABLE_FIELD_KEYS {
            if !attributes.has(key) {
                if let Ok(value) = node.get(key) {
                    attributes.set(key.to_vec(), value.clone());
                }
            }
        }
        if !attributes.has(b"TU") {
            if let Ok(value) = node.get(b"TU") {
                attributes.set("TU", value.clone());
            }
        }
        match node.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => match source.get_dictionary(*parent_id) {
                Ok(parent) => {
                    node_id = *parent_id;
                    node = parent;
                }
                Err(_) => break,
            },
            _ => break,
        }
    }

    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    Some((parts.join("."), attributes))
}

use super::copier::CopiedWidget;
use crate::error::AssemblyError;
use crate::pdf_text::encode_text_string;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;

/// A terminal field of the output form
#[derive(Debug)]
struct OutputField {
    name: String,
    attributes: Dictionary,
    widgets: Vec<ObjectId>,
}

/// Rebuilds the interactive form of the assembled document by qualified name.
///
/// Widgets of the same field arriving from different copy operations are
/// joined under one field, so a field never appears twice in the output.
#[derive(Debug, Default)]
pub(crate) struct FormBuilder {
    fields: Vec<OutputField>,
    index: HashMap<String, usize>,
}

fn field_type(attributes: &Dictionary) -> Option<&[u8]> {
    match attributes.get(b"FT").ok()? {
        Object::Name(name) => Some(name.as_slice()),
        _ => None,
    }
}

impl FormBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn register(&mut self, widget: CopiedWidget) -> Result<(), AssemblyError> {
        match self.index.get(&widget.field_name) {
            Some(&position) => {
                let field = &mut self.fields[position];
                if field_type(&field.attributes) != field_type(&widget.attributes) {
                    return Err(AssemblyError::DuplicateField {
                        field: widget.field_name,
                    });
                }
                if field.widgets.contains(&widget.widget_id) {
                    return Err(AssemblyError::DuplicateField {
                        field: widget.field_name,
                    });
                }
                field.widgets.push(widget.widget_id);
            }
            None => {
                self.index.insert(widget.field_name.clone(), self.fields.len());
                self.fields.push(OutputField {
                    name: widget.field_name,
                    attributes: widget.attributes,
                    widgets: vec![widget.widget_id],
                });
            }
        }
        Ok(())
    }

    /// Write the field hierarchy into `out` and return the root field references
    pub fn finish(self, out: &mut Document) -> Vec<Object> {
        let mut roots = Vec::new();
        // qualified prefix → (object id, kids)
        let mut nodes: HashMap<String, (ObjectId, Vec<Object>)> = HashMap::new();
        let mut node_order: Vec<String> = Vec::new();

        for field in self.fields {
            let (parent_path, partial) = match field.name.rsplit_once('.') {
                Some((parent, partial)) => (Some(parent.to_string()), partial.to_string()),
                None => (None, field.name.clone()),
            };
            let parent_id = parent_path
                .as_deref()
                .map(|path| ensure_node(out, &mut nodes, &mut node_order, &mut roots, path));

            let mut attributes = field.attributes;
            attributes.set("T", encode_text_string(&partial));
            if let Some(parent_id) = parent_id {
                attributes.set("Parent", Object::Reference(parent_id));
            }

            let field_ref = if field.widgets.len() == 1 {
                // Merged field/widget dictionary
                let widget_id = field.widgets[0];
                if let Ok(Object::Dictionary(widget)) = out.get_object_mut(widget_id) {
                    for (key, value) in attributes.iter() {
                        widget.set(key.clone(), value.clone());
                    }
                }
                widget_id
            } else {
                let field_id = out.new_object_id();
                let kids: Vec<Object> = field.widgets.iter().map(|id| Object::Reference(*id)).collect();
                for widget_id in &field.widgets {
                    if let Ok(Object::Dictionary(widget)) = out.get_object_mut(*widget_id) {
                        widget.set("Parent", Object::Reference(field_id));
                    }
                }
                attributes.set("Kids", Object::Array(kids));
                out.objects.insert(field_id, Object::Dictionary(attributes));
                field_id
            };

            match parent_path {
                Some(path) => {
                    if let Some((_, kids)) = nodes.get_mut(&path) {
                        kids.push(Object::Reference(field_ref));
                    }
                }
                None => roots.push(Object::Reference(field_ref)),
            }
        }

        for path in &node_order {
            let Some((node_id, kids)) = nodes.get(path) else {
                continue;
            };
            let (parent, partial) = match path.rsplit_once('.') {
                Some((parent, partial)) => (nodes.get(parent).map(|(id, _)| *id), partial),
                None => (None, path.as_str()),
            };
            let mut node = Dictionary::new();
            node.set("T", encode_text_string(partial));
            node.set("Kids", Object::Array(kids.clone()));
            if let Some(parent_id) = parent {
                node.set("Parent", Object::Reference(parent_id));
            }
            out.objects.insert(*node_id, Object::Dictionary(node));
        }

        roots
    }
}

/// Allocate the intermediate node for `path` (and its ancestors) once
fn ensure_node(
    out: &mut Document,
    nodes: &mut HashMap<String, (ObjectId, Vec<Object>)>,
    order: &mut Vec<String>,
    roots: &mut Vec<Object>,
    path: &str,
) -> ObjectId {
    if let Some((id, _)) = nodes.get(path) {
        return *id;
    }
    let id = out.new_object_id();
    nodes.insert(path.to_string(), (id, Vec::new()));
    order.push(path.to_string());
    match path.rsplit_once('.') {
        Some((parent, _)) => {
            ensure_node(out, nodes, order, roots, parent);
            if let Some((_, kids)) = nodes.get_mut(parent) {
                kids.push(Object::Reference(id));
            }
        }
        None => roots.push(Object::Reference(id)),
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf_text::object_text;

    fn widget(out: &mut Document, name: &str, field_type: &str) -> CopiedWidget {
        let widget_id = out.add_object(lopdf::dictionary! { "Subtype" => "Widget" });
        let mut attributes = Dictionary::new();
        attributes.set("FT", Object::Name(field_type.as_bytes().to_vec()));
        CopiedWidget {
            field_name: name.to_string(),
            attributes,
            widget_id,
        }
    }

    #[test]
    fn test_widgets_of_one_field_are_joined() {
        let mut out = Document::with_version("1.7");
        let mut form = FormBuilder::new();
        let first = widget(&mut out, "claim_reference", "Tx");
        let second = widget(&mut out, "claim_reference", "Tx");
        let single = widget(&mut out, "driver_first_name", "Tx");
        let single_id = single.widget_id;
        form.register(first).unwrap();
        form.register(second).unwrap();
        form.register(single).unwrap();
        assert_eq!(form.len(), 2);

        let roots = form.finish(&mut out);
        assert_eq!(roots.len(), 2);

        let Object::Reference(parent_id) = roots[0] else { panic!("expected reference") };
        let parent = out.get_dictionary(parent_id).unwrap();
        assert_eq!(object_text(parent.get(b"T").unwrap()).unwrap(), "claim_reference");
        assert_eq!(parent.get(b"Kids").unwrap().as_array().unwrap().len(), 2);

        let merged = out.get_dictionary(single_id).unwrap();
        assert_eq!(object_text(merged.get(b"T").unwrap()).unwrap(), "driver_first_name");
        assert!(merged.has(b"FT"));
    }

    #[test]
    fn test_conflicting_field_types_are_rejected() {
        let mut out = Document::with_version("1.7");
        let mut form = FormBuilder::new();
        form.register(widget(&mut out, "dashcam_available", "Tx")).unwrap();
        let err = form.register(widget(&mut out, "dashcam_available", "Btn")).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::DuplicateField {
                field: "dashcam_available".to_string()
            }
        );
    }

    #[test]
    fn test_qualified_names_become_a_hierarchy() {
        let mut out = Document::with_version("1.7");
        let mut form = FormBuilder::new();
        form.register(widget(&mut out, "witness.name", "Tx")).unwrap();
        form.register(widget(&mut out, "witness.phone", "Tx")).unwrap();

        let roots = form.finish(&mut out);
        assert_eq!(roots.len(), 1);
        let Object::Reference(node_id) = roots[0] else { panic!("expected reference") };
        let node = out.get_dictionary(node_id).unwrap();
        assert_eq!(object_text(node.get(b"T").unwrap()).unwrap(), "witness");
        assert_eq!(node.get(b"Kids").unwrap().as_array().unwrap().len(), 2);
    }
}

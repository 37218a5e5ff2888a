//! Corruption Guard
//!
//! Last gate before bytes leave the pipeline. Parses the assembled output cold,
//! from bytes only, and rejects it on any structural fault: a broken
//! cross-reference table or stream, an inconsistent page tree, a page count or page
//! order that differs from the assembly plan, references to objects that do
//! not exist, or widgets attached to the wrong page.

mod xref;

use crate::assembler::AssembledDocument;
use crate::config::GuardConfig;
use crate::error::CorruptionError;
use crate::pdf_text::page_content_digest;
use crate::template::{catalog, reference_array};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashSet;

/// Page trees deeper than this are treated as corrupt
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReport {
    pub page_count: usize,
    pub object_count: usize,
    pub xref_sections: usize,
    /// Cross-reference entries whose target was checked or counted
    pub xref_entries: usize,
    pub references_checked: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CorruptionGuard {
    config: GuardConfig,
}

fn tree_error(page_index: Option<usize>, reason: impl Into<String>) -> CorruptionError {
    CorruptionError::PageTree {
        page_index,
        reason: reason.into(),
    }
}

fn format_id(id: ObjectId) -> String {
    format!("{} {} R", id.0, id.1)
}

impl CorruptionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Validate an assembler result against its own plan
    pub fn validate_assembled(&self, assembled: &AssembledDocument) -> Result<GuardReport, CorruptionError> {
        self.validate(&assembled.bytes, assembled.page_count(), &assembled.page_digests)
    }

    /// Validate raw bytes. `page_digests` may be empty to skip the order check.
    pub fn validate(
        &self,
        bytes: &[u8],
        expected_page_count: usize,
        page_digests: &[String],
    ) -> Result<GuardReport, CorruptionError> {
        if !bytes.starts_with(b"%PDF-") {
            return Err(CorruptionError::Unparseable("missing %PDF- header".to_string()));
        }
        let xref = xref::check_cross_reference(bytes)?;
        let doc = Document::load_mem(bytes).map_err(|e| CorruptionError::Unparseable(e.to_string()))?;

        let pages = walk_page_tree(&doc)?;
        if pages.len() != expected_page_count {
            return Err(CorruptionError::PageCount {
                expected: expected_page_count,
                actual: pages.len(),
            });
        }

        if self.config.check_page_digests && !page_digests.is_empty() {
            check_page_order(&doc, &pages, page_digests)?;
        }

        let references_checked = if self.config.check_dangling_references {
            check_references(&doc)?
        } else {
            0
        };

        check_widget_pages(&doc, &pages)?;

        log::info!(
            "🛡️  Output passed validation: {} page(s), {} object(s), {} xref section(s)",
            pages.len(),
            doc.objects.len(),
            xref.sections
        );

        Ok(GuardReport {
            page_count: pages.len(),
            object_count: doc.objects.len(),
            xref_sections: xref.sections,
            xref_entries: xref.in_use_entries + xref.compressed_entries,
            references_checked,
        })
    }
}

/// Leaf pages in document order, checking every node on the way
fn walk_page_tree(doc: &Document) -> Result<Vec<ObjectId>, CorruptionError> {
    let root = catalog(doc).ok_or_else(|| tree_error(None, "document has no catalog"))?;
    let pages_id = match root.get(b"Pages") {
        Ok(Object::Reference(id)) => *id,
        _ => return Err(tree_error(None, "catalog has no /Pages reference")),
    };

    let mut visited = HashSet::new();
    let mut leaves = Vec::new();
    walk_node(doc, pages_id, None, 0, &mut visited, &mut leaves)?;
    Ok(leaves)
}

fn walk_node(
    doc: &Document,
    node_id: ObjectId,
    parent: Option<ObjectId>,
    depth: usize,
    visited: &mut HashSet<ObjectId>,
    leaves: &mut Vec<ObjectId>,
) -> Result<usize, CorruptionError> {
    let position = leaves.len() + 1;
    if depth > MAX_TREE_DEPTH {
        return Err(tree_error(Some(position), "page tree is too deep"));
    }
    if !visited.insert(node_id) {
        return Err(tree_error(
            Some(position),
            format!("object {} appears more than once in the page tree", format_id(node_id)),
        ));
    }
    let node = doc
        .get_dictionary(node_id)
        .map_err(|_| tree_error(Some(position), format!("node {} is missing", format_id(node_id))))?;

    if let Some(parent) = parent {
        match node.get(b"Parent") {
            Ok(Object::Reference(id)) if *id == parent => {}
            _ => {
                return Err(tree_error(
                    Some(position),
                    format!("node {} does not point back at its parent", format_id(node_id)),
                ))
            }
        }
    }

    match node_type(node) {
        Some(b"Page") => {
            leaves.push(node_id);
            Ok(1)
        }
        Some(b"Pages") => {
            let kids = match node.get(b"Kids") {
                Ok(Object::Array(kids)) => kids,
                _ => return Err(tree_error(Some(position), "page tree node has no /Kids array")),
            };
            let mut count = 0;
            for kid in kids {
                let Object::Reference(kid_id) = kid else {
                    return Err(tree_error(Some(leaves.len() + 1), "/Kids entry is not a reference"));
                };
                count += walk_node(doc, *kid_id, Some(node_id), depth + 1, visited, leaves)?;
            }
            match node.get(b"Count") {
                Ok(Object::Integer(declared)) if *declared == count as i64 => Ok(count),
                Ok(Object::Integer(declared)) => Err(tree_error(
                    None,
                    format!("node {} declares {declared} page(s) but holds {count}", format_id(node_id)),
                )),
                _ => Err(tree_error(None, format!("node {} has no /Count", format_id(node_id)))),
            }
        }
        _ => Err(tree_error(
            Some(position),
            format!("node {} is neither a page nor a page tree node", format_id(node_id)),
        )),
    }
}

fn node_type(dict: &Dictionary) -> Option<&[u8]> {
    match dict.get(b"Type").ok()? {
        Object::Name(name) => Some(name.as_slice()),
        _ => None,
    }
}

fn check_page_order(doc: &Document, pages: &[ObjectId], expected: &[String]) -> Result<(), CorruptionError> {
    if expected.len() != pages.len() {
        return Err(CorruptionError::PageCount {
            expected: expected.len(),
            actual: pages.len(),
        });
    }
    for (index, (page_id, digest)) in pages.iter().zip(expected).enumerate() {
        let actual = page_content_digest(doc, *page_id).map_err(|e| CorruptionError::PageOrder {
            page_index: index + 1,
            reason: format!("content unreadable: {e}"),
        })?;
        if &actual != digest {
            return Err(CorruptionError::PageOrder {
                page_index: index + 1,
                reason: "content differs from the planned page".to_string(),
            });
        }
    }
    Ok(())
}

fn collect_references(object: &Object, out: &mut Vec<ObjectId>) {
    match object {
        Object::Reference(id) => out.push(*id),
        Object::Array(items) => items.iter().for_each(|item| collect_references(item, out)),
        Object::Dictionary(dict) => dict.iter().for_each(|(_, value)| collect_references(value, out)),
        Object::Stream(stream) => stream.dict.iter().for_each(|(_, value)| collect_references(value, out)),
        _ => {}
    }
}

/// Every reference in every object and the trailer must resolve
fn check_references(doc: &Document) -> Result<usize, CorruptionError> {
    let mut checked = 0;
    let mut targets = Vec::new();
    for (id, object) in doc.objects.iter() {
        targets.clear();
        collect_references(object, &mut targets);
        checked += verify_targets(doc, || format_id(*id), &targets)?;
    }

    targets.clear();
    doc.trailer.iter().for_each(|(_, value)| collect_references(value, &mut targets));
    checked += verify_targets(doc, || "trailer".to_string(), &targets)?;
    Ok(checked)
}

fn verify_targets(doc: &Document, owner: impl Fn() -> String, targets: &[ObjectId]) -> Result<usize, CorruptionError> {
    for target in targets {
        if !doc.objects.contains_key(target) {
            return Err(CorruptionError::DanglingReference {
                object: owner(),
                target: format_id(*target),
            });
        }
    }
    Ok(targets.len())
}

/// Widgets must point at the page that lists them
fn check_widget_pages(doc: &Document, pages: &[ObjectId]) -> Result<(), CorruptionError> {
    for page_id in pages {
        let Ok(page) = doc.get_dictionary(*page_id) else {
            continue;
        };
        for annot_id in reference_array(doc, page, b"Annots") {
            let Ok(annot) = doc.get_dictionary(annot_id) else {
                continue;
            };
            let is_widget = matches!(annot.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == b"Widget");
            if !is_widget {
                continue;
            }
            match annot.get(b"P") {
                Ok(Object::Reference(target)) if target != page_id => {
                    return Err(CorruptionError::Form(format!(
                        "widget {} sits on page {} but points at {}",
                        format_id(annot_id),
                        format_id(*page_id),
                        format_id(*target)
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};

    struct Built {
        doc: Document,
        pages_id: ObjectId,
        page_ids: Vec<ObjectId>,
    }

    fn build(page_count: usize) -> Built {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let mut page_ids = Vec::new();
        for n in 0..page_count {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tj", vec![Object::string_literal(format!("page {n}"))]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(595), Object::Integer(842)],
                "Contents" => content_id,
            });
            page_ids.push(page_id);
        }
        Built {
            doc,
            pages_id,
            page_ids,
        }
    }

    fn finish(mut built: Built, kids: Vec<ObjectId>, count: i64) -> Vec<u8> {
        let kids: Vec<Object> = kids.into_iter().map(Object::Reference).collect();
        built.doc.objects.insert(
            built.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = built.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => built.pages_id,
        });
        built.doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        built.doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn valid(page_count: usize) -> (Vec<u8>, Vec<String>) {
        let built = build(page_count);
        let kids = built.page_ids.clone();
        let bytes = finish(built, kids, page_count as i64);
        let doc = Document::load_mem(&bytes).unwrap();
        let digests = doc
            .get_pages()
            .into_values()
            .map(|id| page_content_digest(&doc, id).unwrap())
            .collect();
        (bytes, digests)
    }

    #[test]
    fn test_valid_document_passes() {
        let (bytes, digests) = valid(3);
        let report = CorruptionGuard::default().validate(&bytes, 3, &digests).unwrap();
        assert_eq!(report.page_count, 3);
        assert!(report.references_checked > 0);
    }

    #[test]
    fn test_page_count_mismatch() {
        let (bytes, _) = valid(2);
        let err = CorruptionGuard::default().validate(&bytes, 3, &[]).unwrap_err();
        assert_eq!(err, CorruptionError::PageCount { expected: 3, actual: 2 });
    }

    #[test]
    fn test_reordered_pages_are_detected() {
        let (bytes, mut digests) = valid(3);
        digests.swap(1, 2);
        let err = CorruptionGuard::default().validate(&bytes, 3, &digests).unwrap_err();
        assert!(matches!(err, CorruptionError::PageOrder { page_index: 2, .. }));
    }

    #[test]
    fn test_page_object_used_twice() {
        let built = build(2);
        let first = built.page_ids[0];
        let bytes = finish(built, vec![first, first], 2);
        let err = CorruptionGuard::default().validate(&bytes, 2, &[]).unwrap_err();
        assert!(matches!(err, CorruptionError::PageTree { page_index: Some(2), .. }));
    }

    #[test]
    fn test_wrong_count_is_detected() {
        let built = build(2);
        let kids = built.page_ids.clone();
        let bytes = finish(built, kids, 5);
        let err = CorruptionGuard::default().validate(&bytes, 2, &[]).unwrap_err();
        assert!(matches!(err, CorruptionError::PageTree { .. }));
    }

    #[test]
    fn test_dangling_reference() {
        let mut built = build(1);
        let page_id = built.page_ids[0];
        if let Ok(Object::Dictionary(page)) = built.doc.get_object_mut(page_id) {
            page.set("Thumb", Object::Reference((9999, 0)));
        }
        let kids = built.page_ids.clone();
        let bytes = finish(built, kids, 1);
        let err = CorruptionGuard::default().validate(&bytes, 1, &[]).unwrap_err();
        assert!(matches!(err, CorruptionError::DanglingReference { ref target, .. } if target == "9999 0 R"));

        let lenient = CorruptionGuard::new(GuardConfig {
            check_dangling_references: false,
            ..GuardConfig::default()
        });
        assert!(lenient.validate(&bytes, 1, &[]).is_ok());
    }

    /// Start of the first row in the xref stream lopdf writes
    fn xref_stream_rows(bytes: &[u8]) -> usize {
        let marker = bytes.windows(9).rposition(|w| w == b"startxref").unwrap();
        let digits: String = bytes[marker + 9..]
            .iter()
            .map(|b| *b as char)
            .skip_while(|c| c.is_whitespace())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let xref_at: usize = digits.parse().unwrap();
        let stream = bytes[xref_at..].windows(7).position(|w| w == b"stream\n").unwrap();
        xref_at + stream + 7
    }

    #[test]
    fn test_broken_xref_offset() {
        let (mut bytes, _) = valid(1);
        let rows = xref_stream_rows(&bytes);
        // First row: object 1, type 1, 4-byte big-endian offset
        assert_eq!(bytes[rows], 1);
        let offset = u32::from_be_bytes(bytes[rows + 1..rows + 5].try_into().unwrap());
        bytes[rows + 1..rows + 5].copy_from_slice(&(offset + 3).to_be_bytes());

        let err = CorruptionGuard::default().validate(&bytes, 1, &[]).unwrap_err();
        assert!(matches!(err, CorruptionError::CrossReference(_)));
    }

    #[test]
    fn test_xref_stream_entries_are_counted() {
        let (bytes, digests) = valid(2);
        let report = CorruptionGuard::default().validate(&bytes, 2, &digests).unwrap();
        assert_eq!(report.xref_sections, 1);
        // Pages node, two pages with their contents, catalog and the xref stream
        assert_eq!(report.xref_entries, 7);
    }

    #[test]
    fn test_not_a_pdf() {
        let err = CorruptionGuard::default().validate(b"hello", 1, &[]).unwrap_err();
        assert!(matches!(err, CorruptionError::Unparseable(_)));
    }
}

//! Plain text page layout with the standard Helvetica fonts.
//!
//! Used by the builtin render engine and for fallback pages. Output depends
//! only on the input text, so identical sections give identical bytes.

use crate::config::PageSize;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};

const MARGIN: f32 = 56.0;
const TITLE_SIZE: f32 = 15.0;
const BODY_SIZE: f32 = 10.5;
const LEADING: f32 = 14.0;
const HEADER_SIZE: f32 = 8.0;

/// Approximate Helvetica advance width in 1/1000 em
fn glyph_width(c: char) -> u32 {
    match c {
        'i' | 'j' | 'l' | '\'' | '|' => 222,
        ' ' | '.' | ',' | ':' | ';' | '!' | 'f' | 't' | 'I' | '[' | ']' | '/' => 278,
        '(' | ')' | '-' | 'r' | '"' => 333,
        'm' | 'M' => 833,
        'w' | 'W' => 778,
        'A'..='Z' => 667,
        _ => 556,
    }
}

pub fn text_width(text: &str, font_size: f32) -> f32 {
    text.chars().map(glyph_width).sum::<u32>() as f32 * font_size / 1000.0
}

/// Greedy word wrap; words longer than a line are split
pub fn wrap_text(text: &str, font_size: f32, max_width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let candidate = if line.is_empty() {
                word.to_string()
            } else {
                format!("{line} {word}")
            };
            if text_width(&candidate, font_size) <= max_width {
                line = candidate;
                continue;
            }
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            let mut chunk = String::new();
            for c in word.chars() {
                chunk.push(c);
                if text_width(&chunk, font_size) > max_width {
                    chunk.pop();
                    lines.push(std::mem::take(&mut chunk));
                    chunk.push(c);
                }
            }
            line = chunk;
        }
        lines.push(line);
    }
    lines
}

fn win_ansi(text: &str) -> Object {
    let bytes = text
        .chars()
        .map(|c| match c as u32 {
            0x20..=0x7E | 0xA0..=0xFF => c as u32 as u8,
            _ => b'?',
        })
        .collect();
    Object::String(bytes, StringFormat::Literal)
}

fn show_text(font: &str, size: f32, x: f32, y: f32, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![font.into(), size.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new("Tj", vec![win_ansi(text)]),
        Operation::new("ET", vec![]),
    ]
}

/// Lay out a titled text document. Text that does not fit the first page
/// continues on further pages.
pub fn text_document(header: &str, title: &str, body: &str, page_size: PageSize) -> Result<Vec<u8>, lopdf::Error> {
    let (width, height) = page_size.dimensions_pt();
    let usable_width = width - 2.0 * MARGIN;
    let title_lines = wrap_text(title, TITLE_SIZE, usable_width);
    let body_lines = wrap_text(body, BODY_SIZE, usable_width);

    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();
    let regular = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => Object::Reference(regular),
            "F2" => Object::Reference(bold),
        },
    });

    let mut pages: Vec<Vec<Operation>> = Vec::new();
    let mut operations = show_text("F1", HEADER_SIZE, MARGIN, height - MARGIN / 2.0, header);
    let mut y = height - MARGIN;
    for line in &title_lines {
        y -= TITLE_SIZE + 4.0;
        operations.extend(show_text("F2", TITLE_SIZE, MARGIN, y, line));
    }
    y -= LEADING;

    for line in &body_lines {
        if y - LEADING < MARGIN {
            pages.push(std::mem::take(&mut operations));
            operations = show_text("F1", HEADER_SIZE, MARGIN, height - MARGIN / 2.0, header);
            y = height - MARGIN;
        }
        y -= LEADING;
        if !line.is_empty() {
            operations.extend(show_text("F1", BODY_SIZE, MARGIN, y, line));
        }
    }
    pages.push(operations);

    let mut kids: Vec<ObjectId> = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = doc.add_object(Stream::new(dictionary! {}, Content { operations }.encode()?));
        let page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => Object::Reference(content),
            "Resources" => Object::Reference(resources),
        });
        kids.push(page);
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
            "Count" => kids.len() as i64,
        }),
    );
    let catalog = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog));
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    Ok(bytes)
}

/// One-page stand-in for a section that could not be rendered
pub fn fallback_page(header: &str, title: &str, page_size: PageSize) -> Result<Vec<u8>, lopdf::Error> {
    let body = format!(
        "Content unavailable.\n\nThe section \"{title}\" could not be rendered when this report was generated. \
         The underlying text is retained with the incident record and can be supplied on request."
    );
    text_document(header, title, &body, page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_respects_width() {
        let text = "The other vehicle pulled out of the junction without indicating and struck the front passenger side.";
        let lines = wrap_text(text, BODY_SIZE, 200.0);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(text_width(line, BODY_SIZE) <= 200.0, "{line}");
        }
        assert_eq!(lines.join(" "), text);
    }

    #[test]
    fn test_wrap_splits_long_words() {
        let lines = wrap_text(&"x".repeat(200), BODY_SIZE, 100.0);
        assert!(lines.len() > 1);
        assert_eq!(lines.concat().len(), 200);
    }

    #[test]
    fn test_short_text_is_one_page() {
        let bytes = text_document("Appendix A", "Summary", "Short body.", PageSize::A4).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn test_long_text_spills_over() {
        let body = "Lorem ipsum dolor sit amet. ".repeat(600);
        let bytes = text_document("Appendix A", "Statement", &body, PageSize::A4).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert!(doc.get_pages().len() > 1);
    }

    #[test]
    fn test_fallback_page_is_deterministic() {
        let a = fallback_page("Appendix B", "Liability Assessment", PageSize::Letter).unwrap();
        let b = fallback_page("Appendix B", "Liability Assessment", PageSize::Letter).unwrap();
        assert_eq!(a, b);
        assert_eq!(Document::load_mem(&a).unwrap().get_pages().len(), 1);
    }
}

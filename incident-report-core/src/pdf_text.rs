//! Small PDF helpers shared by the filler, assembler and guard.

use lopdf::{Document, Object, ObjectId, StringFormat};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Encode a text string for a PDF string object.
///
/// Latin-1 representable text is written as a literal string, anything else
/// as UTF-16BE with a byte order mark.
pub fn encode_text_string(text: &str) -> Object {
    if text.chars().all(is_pdf_doc_char) {
        let bytes = text.chars().map(|c| c as u32 as u8).collect();
        Object::String(bytes, StringFormat::Literal)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

fn is_pdf_doc_char(c: char) -> bool {
    matches!(c as u32, 0x09 | 0x0A | 0x0D | 0x20..=0x7E | 0xA0..=0xFF)
}

pub fn decode_text_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

/// Text value of a string or name object
pub fn object_text(object: &Object) -> Option<String> {
    match object {
        Object::String(bytes, _) => Some(decode_text_string(bytes)),
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

/// Follow a single reference, returning the object itself otherwise
pub fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Digest of a page's decoded content streams, used to prove page order
pub fn page_content_digest(doc: &Document, page_id: ObjectId) -> Result<String, lopdf::Error> {
    let content = doc.get_page_content(page_id)?;
    Ok(sha256_hex(&content))
}

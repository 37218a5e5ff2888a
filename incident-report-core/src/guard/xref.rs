//! Raw cross-reference check, independent of the object parser.
//!
//! Follows `startxref` and every `/Prev` link. Classic tables and
//! cross-reference streams are both checked entry by entry: each in-use
//! offset must point at the matching `N G obj` header. Stream data is decoded
//! here (`/W`, `/Index`, FlateDecode, PNG predictors) rather than through lopdf.

use crate::error::CorruptionError;
use flate2::read::ZlibDecoder;
use std::collections::HashSet;
use std::io::Read;

/// Shortest classic entry a lenient writer produces (`nnnnnnnnnn ggggg n\n`)
const MIN_TABLE_ENTRY_LEN: u64 = 18;

/// Decoded stream data larger than this is treated as corrupt
const MAX_XREF_STREAM_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct XrefSummary {
    pub sections: usize,
    /// Offsets checked against their object header
    pub in_use_entries: usize,
    /// Objects stored inside object streams
    pub compressed_entries: usize,
    pub streams: usize,
}

fn invalid(reason: impl Into<String>) -> CorruptionError {
    CorruptionError::CrossReference(reason.into())
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n' | b'\x0C' | 0)
}

fn is_delimiter(byte: u8) -> bool {
    is_whitespace(byte) || matches!(byte, b'/' | b'[' | b']' | b'<' | b'>' | b'(' | b')' | b'{' | b'}' | b'%')
}

/// Minimal tokenizer over the raw bytes
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self {
            bytes,
            pos: pos.min(bytes.len()),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && is_whitespace(self.bytes[self.pos]) {
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Option<u64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()?.parse().ok()
    }

    fn keyword(&mut self, keyword: &[u8]) -> bool {
        self.skip_whitespace();
        if self.bytes[self.pos..].starts_with(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn entry_type(&mut self) -> Option<u8> {
        self.skip_whitespace();
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        matches!(byte, b'n' | b'f').then_some(byte)
    }

    fn name(&mut self) -> Option<&'a [u8]> {
        self.skip_whitespace();
        if self.bytes.get(self.pos) != Some(&b'/') {
            return None;
        }
        let start = self.pos + 1;
        let mut end = start;
        while end < self.bytes.len() && !is_delimiter(self.bytes[end]) {
            end += 1;
        }
        self.pos = end;
        Some(&self.bytes[start..end])
    }

    fn integer_array(&mut self) -> Option<Vec<u64>> {
        if !self.keyword(b"[") {
            return None;
        }
        let mut values = Vec::new();
        loop {
            if self.keyword(b"]") {
                return Some(values);
            }
            values.push(self.number()?);
        }
    }
}

pub(crate) fn check_cross_reference(bytes: &[u8]) -> Result<XrefSummary, CorruptionError> {
    let marker = find_last(bytes, b"startxref").ok_or_else(|| invalid("no startxref marker"))?;
    let mut cursor = Cursor::new(bytes, marker + b"startxref".len());
    let mut offset = cursor.number().ok_or_else(|| invalid("startxref has no offset"))?;

    let mut summary = XrefSummary::default();
    let mut visited = HashSet::new();
    loop {
        if offset >= bytes.len() as u64 {
            return Err(invalid(format!("cross-reference offset {offset} is past the end of the file")));
        }
        if !visited.insert(offset) {
            return Err(invalid(format!("cross-reference chain loops back to offset {offset}")));
        }

        let position = offset as usize;
        let mut cursor = Cursor::new(bytes, position);
        let previous = if cursor.keyword(b"xref") {
            check_table(bytes, &mut cursor, &mut summary)?
        } else if let Some(stream) = XrefStream::locate(bytes, position)? {
            summary.streams += 1;
            stream.check_entries(bytes, &mut summary)?
        } else {
            return Err(invalid(format!(
                "offset {offset} does not point at a cross-reference section"
            )));
        };
        summary.sections += 1;

        match previous {
            Some(prev) => offset = prev,
            None => break,
        }
    }
    Ok(summary)
}

/// Check one classic table; returns its `/Prev` offset
fn check_table(bytes: &[u8], cursor: &mut Cursor<'_>, summary: &mut XrefSummary) -> Result<Option<u64>, CorruptionError> {
    loop {
        if cursor.keyword(b"trailer") {
            break;
        }
        let header = |cursor: &Cursor<'_>| invalid(format!("malformed subsection header at byte {}", cursor.pos));
        let start = cursor.number().ok_or_else(|| header(cursor))?;
        let count = cursor.number().ok_or_else(|| header(cursor))?;
        let end = start.checked_add(count).ok_or_else(|| header(cursor))?;

        let remaining = (bytes.len() - cursor.pos) as u64;
        if count > remaining / MIN_TABLE_ENTRY_LEN {
            return Err(invalid(format!(
                "subsection of {count} entries at byte {} is longer than the file",
                cursor.pos
            )));
        }

        for number in start..end {
            let entry_offset = cursor.number();
            let generation = cursor.number();
            let kind = cursor.entry_type();
            let (Some(entry_offset), Some(generation), Some(kind)) = (entry_offset, generation, kind) else {
                return Err(invalid(format!("malformed entry for object {number}")));
            };
            if kind == b'n' {
                summary.in_use_entries += 1;
                check_object_header(bytes, number, generation, entry_offset)?;
            }
        }
    }

    let trailer_end = find(&bytes[cursor.pos..], b"startxref")
        .map(|end| cursor.pos + end)
        .unwrap_or(bytes.len());
    let trailer = &bytes[cursor.pos..trailer_end];
    match dictionary_key(trailer, b"Prev") {
        Some(at) => {
            let mut prev = Cursor::new(trailer, at);
            let offset = prev.number().ok_or_else(|| invalid("trailer /Prev is not an offset"))?;
            Ok(Some(offset))
        }
        None => Ok(None),
    }
}

fn check_object_header(bytes: &[u8], number: u64, generation: u64, offset: u64) -> Result<(), CorruptionError> {
    let mismatch = || {
        invalid(format!(
            "entry for object {number} {generation} points at byte {offset}, which is not its definition"
        ))
    };
    if offset >= bytes.len() as u64 {
        return Err(mismatch());
    }
    let mut cursor = Cursor::new(bytes, offset as usize);
    let found = (cursor.number(), cursor.number(), cursor.keyword(b"obj"));
    match found {
        (Some(n), Some(g), true) if n == number && g == generation => Ok(()),
        _ => Err(mismatch()),
    }
}

/// Position just past `/key` in a dictionary body, if the key is present
fn dictionary_key(dict: &[u8], key: &[u8]) -> Option<usize> {
    let mut needle = Vec::with_capacity(key.len() + 1);
    needle.push(b'/');
    needle.extend_from_slice(key);

    let mut from = 0;
    while let Some(at) = find(&dict[from..], &needle) {
        let end = from + at + needle.len();
        if dict.get(end).map_or(true, |byte| is_delimiter(*byte)) {
            return Some(end);
        }
        from = end;
    }
    None
}

/// A cross-reference stream located in the raw bytes
struct XrefStream<'a> {
    number: u64,
    dict: &'a [u8],
    data: &'a [u8],
}

impl<'a> XrefStream<'a> {
    /// `Ok(None)` when the offset holds something other than an XRef stream
    fn locate(bytes: &'a [u8], offset: usize) -> Result<Option<Self>, CorruptionError> {
        let mut cursor = Cursor::new(bytes, offset);
        let (Some(number), Some(_), true) = (cursor.number(), cursor.number(), cursor.keyword(b"obj")) else {
            return Ok(None);
        };
        let dict_start = cursor.pos;
        let Some(stream_at) = find(&bytes[dict_start..], b"stream").map(|at| dict_start + at) else {
            return Ok(None);
        };
        let dict = &bytes[dict_start..stream_at];
        let is_xref = dictionary_key(dict, b"Type")
            .and_then(|at| Cursor::new(dict, at).name())
            .is_some_and(|name| name == b"XRef");
        if !is_xref {
            return Ok(None);
        }

        let mut data_start = stream_at + b"stream".len();
        if bytes[data_start..].starts_with(b"\r\n") {
            data_start += 2;
        } else if bytes[data_start..].starts_with(b"\n") {
            data_start += 1;
        }

        let end = direct_length(dict)
            .and_then(|length| data_start.checked_add(length))
            .filter(|end| *end <= bytes.len())
            .or_else(|| {
                find(&bytes[data_start..], b"endstream").map(|at| {
                    let mut end = data_start + at;
                    while end > data_start && matches!(bytes[end - 1], b'\r' | b'\n') {
                        end -= 1;
                    }
                    end
                })
            })
            .ok_or_else(|| invalid(format!("cross-reference stream {number} has no end")))?;

        Ok(Some(Self {
            number,
            dict,
            data: &bytes[data_start..end],
        }))
    }

    fn integer(&self, key: &[u8]) -> Option<u64> {
        dictionary_key(self.dict, key).and_then(|at| Cursor::new(self.dict, at).number())
    }

    fn integers(&self, key: &[u8]) -> Option<Vec<u64>> {
        dictionary_key(self.dict, key).and_then(|at| Cursor::new(self.dict, at).integer_array())
    }

    fn filter(&self) -> Option<&'a [u8]> {
        let at = dictionary_key(self.dict, b"Filter")?;
        let mut cursor = Cursor::new(self.dict, at);
        if cursor.keyword(b"[") {
            return cursor.name();
        }
        cursor.name()
    }

    fn decoded(&self) -> Result<Vec<u8>, CorruptionError> {
        let raw = match self.filter() {
            None => self.data.to_vec(),
            Some(b"FlateDecode") => {
                let mut out = Vec::new();
                ZlibDecoder::new(self.data)
                    .take(MAX_XREF_STREAM_LEN as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| invalid(format!("cross-reference stream {} does not inflate: {e}", self.number)))?;
                out
            }
            Some(other) => {
                return Err(invalid(format!(
                    "cross-reference stream {} uses unsupported filter /{}",
                    self.number,
                    String::from_utf8_lossy(other)
                )))
            }
        };
        if raw.len() > MAX_XREF_STREAM_LEN {
            return Err(invalid(format!("cross-reference stream {} is too large", self.number)));
        }
        match self.integer(b"Predictor").unwrap_or(1) {
            1 => Ok(raw),
            10..=15 => {
                let columns = self.integer(b"Columns").unwrap_or(1) as usize;
                undo_png_predictor(&raw, columns)
                    .ok_or_else(|| invalid(format!("cross-reference stream {} has a broken predictor row", self.number)))
            }
            other => Err(invalid(format!(
                "cross-reference stream {} uses unsupported predictor {other}",
                self.number
            ))),
        }
    }

    /// Check every entry; returns the `/Prev` offset
    fn check_entries(&self, bytes: &[u8], summary: &mut XrefSummary) -> Result<Option<u64>, CorruptionError> {
        let widths = self
            .integers(b"W")
            .filter(|w| w.len() == 3 && w.iter().all(|n| *n <= 8))
            .ok_or_else(|| invalid(format!("cross-reference stream {} has no valid /W", self.number)))?;
        let size = self
            .integer(b"Size")
            .ok_or_else(|| invalid(format!("cross-reference stream {} has no /Size", self.number)))?;
        let index = self.integers(b"Index").unwrap_or_else(|| vec![0, size]);
        if index.len() % 2 != 0 {
            return Err(invalid(format!("cross-reference stream {} has an odd /Index", self.number)));
        }

        let data = self.decoded()?;
        let row_len = widths.iter().sum::<u64>() as usize;
        if row_len == 0 {
            return Err(invalid(format!("cross-reference stream {} has empty rows", self.number)));
        }
        let mut rows = data.chunks_exact(row_len);

        for pair in index.chunks_exact(2) {
            let (start, count) = (pair[0], pair[1]);
            let end = start
                .checked_add(count)
                .ok_or_else(|| invalid(format!("cross-reference stream {} has an overflowing /Index", self.number)))?;
            for number in start..end {
                let row = rows.next().ok_or_else(|| {
                    invalid(format!(
                        "cross-reference stream {} ends before the entry for object {number}",
                        self.number
                    ))
                })?;
                let (kind_bytes, rest) = row.split_at(widths[0] as usize);
                let (second, third) = rest.split_at(widths[1] as usize);
                // A zero-width type field defaults to in-use
                let kind = if kind_bytes.is_empty() { 1 } else { be_number(kind_bytes) };
                match kind {
                    0 => {}
                    1 => {
                        summary.in_use_entries += 1;
                        check_object_header(bytes, number, be_number(third), be_number(second))?;
                    }
                    2 => summary.compressed_entries += 1,
                    // Unknown types are references to the null object
                    _ => {}
                }
            }
        }

        Ok(self.integer(b"Prev"))
    }
}

fn direct_length(dict: &[u8]) -> Option<usize> {
    let at = dictionary_key(dict, b"Length")?;
    let mut cursor = Cursor::new(dict, at);
    let length = cursor.number()?;
    // `N G R` is an indirect length; the caller falls back to `endstream`
    let mut lookahead = Cursor::new(dict, cursor.pos);
    if lookahead.number().is_some() && lookahead.keyword(b"R") {
        return None;
    }
    usize::try_from(length).ok()
}

fn be_number(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Reverse PNG row filters for one byte per pixel
fn undo_png_predictor(data: &[u8], columns: usize) -> Option<Vec<u8>> {
    if columns == 0 {
        return None;
    }
    let stride = columns + 1;
    if data.len() % stride != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(data.len() / stride * columns);
    let mut previous = vec![0u8; columns];
    for row in data.chunks_exact(stride) {
        let (filter, encoded) = (row[0], &row[1..]);
        let mut current = vec![0u8; columns];
        for i in 0..columns {
            let left = if i > 0 { current[i - 1] } else { 0 };
            let up = previous[i];
            let up_left = if i > 0 { previous[i - 1] } else { 0 };
            let predicted = match filter {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((u16::from(left) + u16::from(up)) / 2) as u8,
                4 => paeth(left, up, up_left),
                _ => return None,
            };
            current[i] = encoded[i].wrapping_add(predicted);
        }
        out.extend_from_slice(&current);
        previous = current;
    }
    Some(out)
}

fn paeth(left: u8, up: u8, up_left: u8) -> u8 {
    let p = i16::from(left) + i16::from(up) - i16::from(up_left);
    let pa = (p - i16::from(left)).abs();
    let pb = (p - i16::from(up)).abs();
    let pc = (p - i16::from(up_left)).abs();
    if pa <= pb && pa <= pc {
        left
    } else if pb <= pc {
        up
    } else {
        up_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use lopdf::{dictionary, Document, Object};
    use std::io::Write;

    const TWO_OBJECTS: &str = "%PDF-1.7\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\n";

    fn with_table(body: &str, offsets: &[usize]) -> Vec<u8> {
        let mut out = body.to_string();
        let xref_at = out.len();
        out.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1));
        for offset in offsets {
            out.push_str(&format!("{offset:010} 00000 n \n"));
        }
        out.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            offsets.len() + 1
        ));
        out.into_bytes()
    }

    fn offsets() -> Vec<usize> {
        let first = TWO_OBJECTS.find("1 0 obj").unwrap();
        let second = TWO_OBJECTS.find("2 0 obj").unwrap();
        vec![first, second]
    }

    /// Two objects plus a compressed, PNG-Up predicted xref stream as object 3
    fn with_flate_stream(offsets: &[usize]) -> Vec<u8> {
        let mut out = TWO_OBJECTS.as_bytes().to_vec();
        let stream_at = out.len();
        let mut rows: Vec<[u8; 4]> = vec![[0, 0, 0, 255]];
        for offset in offsets.iter().copied().chain([stream_at]) {
            rows.push([1, (offset >> 8) as u8, offset as u8, 0]);
        }

        // PNG Up: every row stores the difference to the row above
        let mut predicted = Vec::new();
        let mut previous = [0u8; 4];
        for row in &rows {
            predicted.push(2);
            for i in 0..4 {
                predicted.push(row[i].wrapping_sub(previous[i]));
            }
            previous = *row;
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&predicted).unwrap();
        let data = encoder.finish().unwrap();

        out.extend_from_slice(
            format!(
                "3 0 obj\n<< /Type /XRef /Size 4 /W [1 2 1] /Root 1 0 R /Filter /FlateDecode /DecodeParms << /Columns 4 /Predictor 12 >> /Length {} >>\nstream\n",
                data.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(&data);
        out.extend_from_slice(format!("\nendstream\nendobj\nstartxref\n{stream_at}\n%%EOF\n").as_bytes());
        out
    }

    fn lopdf_output() -> Vec<u8> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.add_object(dictionary! { "Type" => "Pages", "Kids" => Vec::<Object>::new(), "Count" => 0 });
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_valid_table() {
        let summary = check_cross_reference(&with_table(TWO_OBJECTS, &offsets())).unwrap();
        assert_eq!(summary.sections, 1);
        assert_eq!(summary.in_use_entries, 2);
    }

    #[test]
    fn test_shifted_offset_is_rejected() {
        let mut offsets = offsets();
        offsets[1] += 2;
        let err = check_cross_reference(&with_table(TWO_OBJECTS, &offsets)).unwrap_err();
        assert!(matches!(err, CorruptionError::CrossReference(ref reason) if reason.contains("object 2 0")));
    }

    #[test]
    fn test_startxref_must_land_on_a_table() {
        let mut bytes = with_table(TWO_OBJECTS, &offsets());
        let marker = find_last(&bytes, b"startxref").unwrap();
        bytes.truncate(marker);
        bytes.extend_from_slice(b"startxref\n3\n%%EOF\n");
        assert!(check_cross_reference(&bytes).is_err());
    }

    #[test]
    fn test_missing_startxref() {
        assert!(check_cross_reference(TWO_OBJECTS.as_bytes()).is_err());
    }

    #[test]
    fn test_huge_subsection_header_is_rejected() {
        let mut bytes = TWO_OBJECTS.as_bytes().to_vec();
        let xref_at = bytes.len();
        bytes.extend_from_slice(b"xref\n18446744073709551615 2\n0000000000 65535 f \n");
        bytes.extend_from_slice(format!("trailer\n<< /Size 3 >>\nstartxref\n{xref_at}\n%%EOF\n").as_bytes());
        assert!(matches!(check_cross_reference(&bytes), Err(CorruptionError::CrossReference(_))));

        let mut bytes = TWO_OBJECTS.as_bytes().to_vec();
        let xref_at = bytes.len();
        bytes.extend_from_slice(b"xref\n0 4000000000\n0000000000 65535 f \n");
        bytes.extend_from_slice(format!("trailer\n<< /Size 3 >>\nstartxref\n{xref_at}\n%%EOF\n").as_bytes());
        assert!(matches!(
            check_cross_reference(&bytes),
            Err(CorruptionError::CrossReference(ref reason)) if reason.contains("longer than the file")
        ));
    }

    #[test]
    fn test_lopdf_stream_entries_are_checked() {
        let summary = check_cross_reference(&lopdf_output()).unwrap();
        assert_eq!(summary.streams, 1);
        // Pages, catalog and the stream itself
        assert_eq!(summary.in_use_entries, 3);
    }

    #[test]
    fn test_flate_predicted_stream() {
        let summary = check_cross_reference(&with_flate_stream(&offsets())).unwrap();
        assert_eq!(summary.streams, 1);
        assert_eq!(summary.in_use_entries, 3);

        let mut shifted = offsets();
        shifted[0] += 1;
        let err = check_cross_reference(&with_flate_stream(&shifted)).unwrap_err();
        assert!(matches!(err, CorruptionError::CrossReference(ref reason) if reason.contains("object 1 0")));
    }
}

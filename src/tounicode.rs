//! ToUnicode CMap parsing for CID-encoded label text
//!
//! Carrier label generators often embed subset Type0 fonts whose strings are
//! two-byte glyph ids. The font's ToUnicode CMap is the only way back to the
//! tracking number's characters.

use lopdf::{Dictionary, Document, Object};
use std::collections::HashMap;

/// A parsed ToUnicode CMap mapping CIDs to Unicode strings
#[derive(Debug, Default, Clone)]
pub struct ToUnicodeCMap {
    /// Direct character mappings (CID -> Unicode string)
    pub char_map: HashMap<u16, String>,
    /// Range mappings (start_cid, end_cid, base codepoint)
    pub ranges: Vec<(u16, u16, u32)>,
}

impl ToUnicodeCMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a CMap from its decompressed content
    pub fn parse(content: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(content);
        let mut cmap = ToUnicodeCMap::new();

        for section in sections(&text, "beginbfchar", "endbfchar") {
            cmap.parse_bfchar_section(section);
        }
        for section in sections(&text, "beginbfrange", "endbfrange") {
            cmap.parse_bfrange_section(section);
        }

        if cmap.char_map.is_empty() && cmap.ranges.is_empty() {
            None
        } else {
            Some(cmap)
        }
    }

    /// `<src> <dst>` pairs
    fn parse_bfchar_section(&mut self, section: &str) {
        let tokens = tokenize(section);
        for pair in tokens.chunks_exact(2) {
            if let (Token::Hex(src), Token::Hex(dst)) = (&pair[0], &pair[1]) {
                if let (Some(src), Some(dst)) = (parse_hex_u16(src), hex_to_unicode_string(dst)) {
                    self.char_map.insert(src, dst);
                }
            }
        }
    }

    /// `<start> <end> <base>` or `<start> <end> [<dst> ...]` triplets
    fn parse_bfrange_section(&mut self, section: &str) {
        let tokens = tokenize(section);
        let mut i = 0;
        while i + 2 < tokens.len() {
            let (Token::Hex(start), Token::Hex(end)) = (&tokens[i], &tokens[i + 1]) else {
                i += 1;
                continue;
            };
            let (Some(start), Some(end)) = (parse_hex_u16(start), parse_hex_u16(end)) else {
                i += 3;
                continue;
            };

            match &tokens[i + 2] {
                Token::Hex(base) => {
                    if let Some(base) = parse_hex_u32(base) {
                        self.ranges.push((start, end, base));
                    }
                }
                Token::Array(items) => {
                    for (offset, dst) in items.iter().enumerate() {
                        let Some(cid) = start.checked_add(offset as u16) else {
                            break;
                        };
                        if cid > end {
                            break;
                        }
                        if let Some(dst) = hex_to_unicode_string(dst) {
                            self.char_map.insert(cid, dst);
                        }
                    }
                }
            }
            i += 3;
        }
    }

    /// Look up a CID and return the Unicode string
    pub fn lookup(&self, cid: u16) -> Option<String> {
        if let Some(s) = self.char_map.get(&cid) {
            return Some(s.clone());
        }

        self.ranges
            .iter()
            .find(|&&(start, end, _)| cid >= start && cid <= end)
            .and_then(|&(start, _, base)| base.checked_add(u32::from(cid - start)))
            .and_then(char::from_u32)
            .map(|c| c.to_string())
    }

    /// Decode a byte slice of two-byte CIDs to a Unicode string
    pub fn decode_cids(&self, bytes: &[u8]) -> String {
        let mut result = String::new();

        for chunk in bytes.chunks_exact(2) {
            let cid = u16::from_be_bytes([chunk[0], chunk[1]]);
            if let Some(s) = self.lookup(cid) {
                result.push_str(&s);
            } else if let Some(c) = char::from_u32(u32::from(cid)) {
                result.push(c);
            }
        }

        result
    }
}

/// Load the ToUnicode CMap referenced by a font dictionary, if any
pub fn cmap_for_font(doc: &Document, font: &Dictionary) -> Option<ToUnicodeCMap> {
    let stream = match font.get(b"ToUnicode").ok()? {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_stream().ok()?,
        Object::Stream(stream) => stream,
        _ => return None,
    };

    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());
    ToUnicodeCMap::parse(&content)
}

/// CMaps for every font on a page, keyed by resource name
pub fn page_cmaps(
    doc: &Document,
    fonts: &std::collections::BTreeMap<Vec<u8>, &Dictionary>,
) -> HashMap<Vec<u8>, ToUnicodeCMap> {
    fonts
        .iter()
        .filter_map(|(name, font)| cmap_for_font(doc, font).map(|cmap| (name.clone(), cmap)))
        .collect()
}

#[derive(Debug)]
enum Token<'a> {
    Hex(&'a str),
    Array(Vec<&'a str>),
}

/// Split CMap section text into hex strings and arrays of hex strings
fn tokenize(section: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = section;

    while let Some(pos) = rest.find(['<', '[']) {
        let opener = rest.as_bytes()[pos];
        rest = &rest[pos + 1..];

        if opener == b'<' {
            let Some(end) = rest.find('>') else { break };
            tokens.push(Token::Hex(&rest[..end]));
            rest = &rest[end + 1..];
        } else {
            let Some(end) = rest.find(']') else { break };
            let items = rest[..end]
                .split(['<', '>'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            tokens.push(Token::Array(items));
            rest = &rest[end + 1..];
        }
    }

    tokens
}

fn sections<'a>(text: &'a str, begin: &'a str, end: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let mut pos = 0;
    std::iter::from_fn(move || {
        let start = pos + text[pos..].find(begin)? + begin.len();
        let stop = start + text[start..].find(end)?;
        pos = stop + end.len();
        Some(&text[start..stop])
    })
}

fn parse_hex_u16(hex: &str) -> Option<u16> {
    u16::from_str_radix(hex.trim(), 16).ok()
}

fn parse_hex_u32(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex.trim(), 16).ok()
}

/// Convert a UTF-16BE hex string (including surrogate pairs) to a String
fn hex_to_unicode_string(hex: &str) -> Option<String> {
    let hex: String = hex.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let units: Vec<u16> = (0..hex.len() / 4)
        .filter_map(|i| u16::from_str_radix(&hex[i * 4..i * 4 + 4], 16).ok())
        .collect();

    let result = String::from_utf16_lossy(&units);
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

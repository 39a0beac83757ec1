//! Text-layer extraction per page using lopdf
//!
//! Only the strings shown by text operators matter for matching, so positions
//! and fonts sizes are not tracked. Strings are decoded through the font's
//! encoding, with the ToUnicode CMap taking precedence for composite fonts.
//! Form XObjects painted with `Do` are read in place, with their own fonts.

use crate::document::{form_resources, form_xobject, page_resources, resolve, MAX_FORM_DEPTH};
use crate::tounicode::{page_cmaps, ToUnicodeCMap};
use crate::WaybillError;
use log::debug;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::{BTreeMap, HashMap, HashSet};

type FontMap<'a> = BTreeMap<Vec<u8>, &'a Dictionary>;

/// Extract the text of every page from a memory buffer, in page order
pub fn page_texts_mem(buffer: &[u8]) -> Result<Vec<String>, WaybillError> {
    let doc = Document::load_mem(buffer)?;
    doc.get_pages()
        .into_values()
        .map(|page_id| page_text(&doc, page_id))
        .collect()
}

/// Extract the text shown on a single page.
///
/// Each text-showing operator contributes one line, in content stream order.
pub fn page_text(doc: &Document, page_id: ObjectId) -> Result<String, WaybillError> {
    let fonts = doc.get_page_fonts(page_id).unwrap_or_default();
    let content_data = doc
        .get_page_content(page_id)
        .map_err(|e| WaybillError::Parse(e.to_string()))?;

    let mut lines: Vec<String> = Vec::new();
    let mut visited = HashSet::new();
    collect_lines(
        doc,
        &content_data,
        &fonts,
        page_resources(doc, page_id),
        0,
        &mut visited,
        &mut lines,
    )?;

    lines.retain(|l| !l.trim().is_empty());
    Ok(lines.join("\n"))
}

/// Append the strings a content stream shows, descending into painted forms
fn collect_lines<'a>(
    doc: &'a Document,
    content_data: &[u8],
    fonts: &FontMap<'a>,
    resources: Option<&'a Dictionary>,
    depth: usize,
    visited: &mut HashSet<ObjectId>,
    lines: &mut Vec<String>,
) -> Result<(), WaybillError> {
    let content = Content::decode(content_data).map_err(|e| WaybillError::Parse(e.to_string()))?;
    let cmaps = page_cmaps(doc, fonts);
    let decoder = OperandDecoder {
        doc,
        fonts,
        cmaps: &cmaps,
    };
    let mut current_font: Vec<u8> = Vec::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "Tf" => {
                if let Some(Ok(name)) = op.operands.first().map(Object::as_name) {
                    current_font = name.to_vec();
                }
            }
            "Tj" | "'" => {
                if let Some(text) = op
                    .operands
                    .first()
                    .and_then(|o| decoder.decode(o, &current_font))
                {
                    lines.push(text);
                }
            }
            "\"" => {
                if let Some(text) = op
                    .operands
                    .get(2)
                    .and_then(|o| decoder.decode(o, &current_font))
                {
                    lines.push(text);
                }
            }
            "TJ" => {
                if let Some(Ok(array)) = op.operands.first().map(Object::as_array) {
                    let combined: String = array
                        .iter()
                        .filter_map(|item| decoder.decode(item, &current_font))
                        .collect();
                    lines.push(combined);
                }
            }
            "Do" if depth < MAX_FORM_DEPTH => {
                let (Some(resources), Some(Ok(name))) =
                    (resources, op.operands.first().map(Object::as_name))
                else {
                    continue;
                };
                let Some((form_id, form)) = form_xobject(doc, resources, name) else {
                    continue;
                };
                if !visited.insert(form_id) {
                    continue;
                }

                let inner = form_resources(doc, form, Some(resources));
                let mut form_fonts = fonts.clone();
                if let Some(inner) = inner {
                    form_fonts.extend(resource_fonts(doc, inner));
                }
                let data = form
                    .decompressed_content()
                    .unwrap_or_else(|_| form.content.clone());
                // A broken form loses its own text, not the page's
                if let Err(e) = collect_lines(
                    doc,
                    &data,
                    &form_fonts,
                    inner,
                    depth + 1,
                    visited,
                    lines,
                ) {
                    debug!("skipping form {} {}: {e}", form_id.0, form_id.1);
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// The Font entry of a resource dictionary, by resource name
fn resource_fonts<'a>(doc: &'a Document, resources: &'a Dictionary) -> FontMap<'a> {
    let Some(fonts) = resources
        .get(b"Font")
        .ok()
        .and_then(|f| resolve(doc, f).as_dict().ok())
    else {
        return FontMap::new();
    };
    fonts
        .iter()
        .filter_map(|(name, font)| {
            resolve(doc, font)
                .as_dict()
                .ok()
                .map(|font| (name.clone(), font))
        })
        .collect()
}

struct OperandDecoder<'a> {
    doc: &'a Document,
    fonts: &'a BTreeMap<Vec<u8>, &'a Dictionary>,
    cmaps: &'a HashMap<Vec<u8>, ToUnicodeCMap>,
}

impl OperandDecoder<'_> {
    /// Decode a string operand, returning None for non-string operands
    fn decode(&self, obj: &Object, font_name: &[u8]) -> Option<String> {
        let Object::String(bytes, _) = obj else {
            return None;
        };

        let font = self.fonts.get(font_name);

        // Composite fonts use two-byte codes that only the CMap can map back
        if let (Some(font), Some(cmap)) = (font, self.cmaps.get(font_name)) {
            if is_composite_font(font) {
                return Some(cmap.decode_cids(bytes));
            }
        }

        if let Some(font) = font {
            if let Ok(encoding) = font.get_font_encoding(self.doc) {
                if let Ok(text) = Document::decode_text(&encoding, bytes) {
                    return Some(text);
                }
            }
        }

        if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
            let utf16: Vec<u16> = bytes[2..]
                .chunks_exact(2)
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                .collect();
            return Some(String::from_utf16_lossy(&utf16));
        }

        // Latin-1
        Some(bytes.iter().map(|&b| b as char).collect())
    }
}

fn is_composite_font(font: &Dictionary) -> bool {
    font.get(b"Subtype")
        .and_then(Object::as_name)
        .map(|name| name == b"Type0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::Operation;
    use lopdf::{dictionary, Stream};

    fn single_page_doc(operations: Vec<Operation>, font: Dictionary) -> (Document, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(font);
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        (doc, page_id)
    }

    fn helvetica() -> Dictionary {
        dictionary! { "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Helvetica" }
    }

    #[test]
    fn test_tj_and_tj_array() {
        let (doc, page_id) = single_page_doc(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Tj", vec![Object::string_literal("Tracking: TH-0001")]),
                Operation::new(
                    "TJ",
                    vec![Object::Array(vec![
                        Object::string_literal("KE"),
                        Object::Integer(-120),
                        Object::string_literal("X9"),
                    ])],
                ),
                Operation::new("ET", vec![]),
            ],
            helvetica(),
        );

        let text = page_text(&doc, page_id).unwrap();
        assert_eq!(text, "Tracking: TH-0001\nKEX9");
    }

    #[test]
    fn test_composite_font_uses_cmap() {
        let mut doc_font = dictionary! {
            "Type" => "Font",
            "Subtype" => "Type0",
            "BaseFont" => "ABCDEF+Sarabun",
            "Encoding" => "Identity-H",
        };
        let cmap = Stream::new(
            dictionary! {},
            b"3 beginbfchar <0001> <0054> <0002> <0048> <0003> <0031> endbfchar".to_vec(),
        );
        doc_font.set("ToUnicode", Object::Stream(cmap));

        let (doc, page_id) = single_page_doc(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(
                        vec![0x00, 0x01, 0x00, 0x02, 0x00, 0x03],
                        lopdf::StringFormat::Hexadecimal,
                    )],
                ),
                Operation::new("ET", vec![]),
            ],
            doc_font,
        );

        assert_eq!(page_text(&doc, page_id).unwrap(), "TH1");
    }

    #[test]
    fn test_image_only_page_has_no_text() {
        let (doc, page_id) = single_page_doc(
            vec![
                Operation::new("q", vec![]),
                Operation::new("Do", vec!["Im1".into()]),
                Operation::new("Q", vec![]),
            ],
            helvetica(),
        );
        assert_eq!(page_text(&doc, page_id).unwrap(), "");
    }

    /// A page whose only content paints `Fm0`, a form showing `form_content`
    /// with font F2. The form may paint itself through its own resources.
    fn form_page_doc(form_content: &str) -> (Document, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let form_id = doc.new_object_id();
        let font_id = doc.add_object(helvetica());
        doc.objects.insert(
            form_id,
            Object::Stream(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "BBox" => vec![0.into(), 0.into(), 200.into(), 100.into()],
                    "Resources" => dictionary! {
                        "Font" => dictionary! { "F2" => font_id },
                        "XObject" => dictionary! { "Fm0" => form_id },
                    },
                },
                form_content.as_bytes().to_vec(),
            )),
        );
        let content_id = doc.add_object(Stream::new(dictionary! {}, b"q /Fm0 Do Q".to_vec()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => dictionary! { "Fm0" => form_id } },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        (doc, page_id)
    }

    #[test]
    fn test_text_inside_form_xobject() {
        let (doc, page_id) = form_page_doc("BT /F2 12 Tf 10 50 Td (Tracking TH0001) Tj ET");
        assert_eq!(page_text(&doc, page_id).unwrap(), "Tracking TH0001");
    }

    #[test]
    fn test_form_painting_itself_is_read_once() {
        let (doc, page_id) = form_page_doc("BT /F2 12 Tf (KEX9) Tj ET /Fm0 Do");
        assert_eq!(page_text(&doc, page_id).unwrap(), "KEX9");
    }

    #[test]
    fn test_broken_form_keeps_page_text() {
        let (doc, page_id) = form_page_doc("BT /F2 12 Tf (unterminated Tj ET");
        assert!(page_text(&doc, page_id).is_ok());
    }

    #[test]
    fn test_page_texts_mem_rejects_garbage() {
        assert!(page_texts_mem(b"%PDF-1.4 truncated").is_err());
    }
}

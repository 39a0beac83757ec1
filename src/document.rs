//! Source documents and cheap page classification
//!
//! Documents are loaded from memory once per run. Each page is classified by
//! sampling its content streams for text operators (Tj/TJ/'/") so that pure
//! image scans skip text extraction and go straight to OCR. Form XObjects
//! painted with `Do` count as part of the page.

use crate::WaybillError;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Inheritable page attributes can sit this many levels up the page tree
const MAX_TREE_DEPTH: usize = 32;
/// Form XObjects nested deeper than this are not opened
pub(crate) const MAX_FORM_DEPTH: usize = 8;

/// A caller-supplied PDF buffer with a display name for logs and events
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SourceInput {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// How a document's pages carry their text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Every page has text operators
    TextLayer,
    /// No page has text operators (scanned labels)
    ImageOnly,
    /// Some pages have text operators
    Mixed,
}

/// A loaded PDF with its pages in natural order
#[derive(Debug)]
pub struct SourceDocument {
    name: String,
    doc: Document,
    pages: Vec<ObjectId>,
    page_has_text: Vec<bool>,
    /// The bytes the document was parsed from, if it came from a buffer
    source: Option<Vec<u8>>,
    /// On-disk copy for external renderers, written on first use
    spool: OnceCell<NamedTempFile>,
}

impl SourceDocument {
    /// Parse a PDF from memory.
    ///
    /// Encrypted documents and documents without pages are rejected; callers
    /// treat either as a per-file failure.
    pub fn load(name: impl Into<String>, buffer: &[u8]) -> Result<Self, WaybillError> {
        let doc = Document::load_mem(buffer)?;
        if doc.is_encrypted() {
            return Err(WaybillError::Encrypted);
        }
        let mut loaded = Self::from_document(name, doc)?;
        loaded.source = Some(buffer.to_vec());
        Ok(loaded)
    }

    /// Wrap an already parsed document
    pub fn from_document(name: impl Into<String>, doc: Document) -> Result<Self, WaybillError> {
        // get_pages is keyed by 1-based page number, so values come out in order
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(WaybillError::InvalidStructure);
        }

        let page_has_text = pages
            .iter()
            .map(|&page_id| count_page_text_operators(&doc, page_id) > 0)
            .collect();

        Ok(Self {
            name: name.into(),
            doc,
            pages,
            page_has_text,
            source: None,
            spool: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Object id of the page at a zero-based index
    pub fn page_id(&self, page_index: usize) -> Option<ObjectId> {
        self.pages.get(page_index).copied()
    }

    /// Whether the page's content streams show any text
    pub fn page_has_text(&self, page_index: usize) -> bool {
        self.page_has_text.get(page_index).copied().unwrap_or(false)
    }

    pub fn kind(&self) -> DocumentKind {
        let with_text = self.page_has_text.iter().filter(|&&t| t).count();
        if with_text == self.page_has_text.len() {
            DocumentKind::TextLayer
        } else if with_text == 0 {
            DocumentKind::ImageOnly
        } else {
            DocumentKind::Mixed
        }
    }

    pub fn lopdf(&self) -> &Document {
        &self.doc
    }

    /// Path of a PDF file holding this document.
    ///
    /// The file is written on first call and removed when the document is
    /// dropped. Documents parsed from a buffer are spooled byte for byte;
    /// others are serialized.
    pub fn spooled_path(&self) -> Result<&Path, WaybillError> {
        let file = self.spool.get_or_try_init(|| -> Result<_, WaybillError> {
            let mut file = tempfile::Builder::new()
                .prefix("waybill-src-")
                .suffix(".pdf")
                .tempfile()?;
            match &self.source {
                Some(bytes) => file.write_all(bytes)?,
                None => self.doc.clone().save_to(&mut file)?,
            }
            file.flush()?;
            Ok(file)
        })?;
        Ok(file.path())
    }
}

/// Parse every input in parallel, keeping input order.
///
/// Each slot holds either the loaded document or the reason it failed, so one
/// bad file never hides the others.
pub fn load_all(inputs: &[SourceInput]) -> Vec<Result<SourceDocument, WaybillError>> {
    inputs
        .par_iter()
        .map(|input| SourceDocument::load(input.name.clone(), &input.bytes))
        .collect()
}

/// Count text operators across a page's content streams.
///
/// Forms painted by the page are only opened when the page's own streams
/// show no text.
fn count_page_text_operators(doc: &Document, page_id: ObjectId) -> u32 {
    let mut text_ops = 0u32;
    let mut content = Vec::new();

    for content_id in doc.get_page_contents(page_id) {
        if let Ok(Object::Stream(stream)) = doc.get_object(content_id) {
            let data = stream_bytes(stream);
            text_ops += scan_content_for_text_operators(&data);
            content.extend_from_slice(&data);
            content.push(b'\n');
        }
    }

    if text_ops == 0 {
        let mut visited = HashSet::new();
        text_ops = count_form_text_operators(
            doc,
            &content,
            page_resources(doc, page_id),
            0,
            &mut visited,
        );
    }

    text_ops
}

/// Text operators inside the forms a content stream paints, recursively
fn count_form_text_operators(
    doc: &Document,
    content: &[u8],
    resources: Option<&Dictionary>,
    depth: usize,
    visited: &mut HashSet<ObjectId>,
) -> u32 {
    let Some(resources) = resources else {
        return 0;
    };
    if depth >= MAX_FORM_DEPTH {
        return 0;
    }

    let mut text_ops = 0u32;
    for name in xobject_calls(content) {
        let Some((form_id, form)) = form_xobject(doc, resources, &name) else {
            continue;
        };
        if !visited.insert(form_id) {
            continue;
        }
        let data = stream_bytes(form);
        text_ops += scan_content_for_text_operators(&data);
        text_ops += count_form_text_operators(
            doc,
            &data,
            form_resources(doc, form, Some(resources)),
            depth + 1,
            visited,
        );
    }
    text_ops
}

fn stream_bytes(stream: &Stream) -> Vec<u8> {
    stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone())
}

/// Names painted with `Do`, in content order
pub(crate) fn xobject_calls(content: &[u8]) -> Vec<Vec<u8>> {
    if !content.windows(2).any(|w| w == b"Do") {
        return Vec::new();
    }
    let Ok(content) = Content::decode(content) else {
        return Vec::new();
    };
    content
        .operations
        .iter()
        .filter(|op| op.operator == "Do")
        .filter_map(|op| op.operands.first()?.as_name().ok().map(<[u8]>::to_vec))
        .collect()
}

/// Look up a page attribute, following the inheritance chain
pub(crate) fn inherited_attribute<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

/// The page's resource dictionary, inherited or its own
pub(crate) fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    resolve(doc, inherited_attribute(doc, page_id, b"Resources")?)
        .as_dict()
        .ok()
}

/// A named XObject stream from a resource dictionary
pub(crate) fn named_xobject<'a>(
    doc: &'a Document,
    resources: &'a Dictionary,
    name: &[u8],
) -> Option<(Option<ObjectId>, &'a Stream)> {
    let xobjects = resolve(doc, resources.get(b"XObject").ok()?).as_dict().ok()?;
    let entry = xobjects.get(name).ok()?;
    let id = entry.as_reference().ok();
    Some((id, resolve(doc, entry).as_stream().ok()?))
}

/// A named Form XObject. Forms are always indirect objects, so the id is
/// what guards against a form painting itself.
pub(crate) fn form_xobject<'a>(
    doc: &'a Document,
    resources: &'a Dictionary,
    name: &[u8],
) -> Option<(ObjectId, &'a Stream)> {
    let (id, stream) = named_xobject(doc, resources, name)?;
    let is_form = stream
        .dict
        .get(b"Subtype")
        .and_then(Object::as_name)
        .is_ok_and(|subtype| subtype == b"Form");
    if is_form {
        Some((id?, stream))
    } else {
        None
    }
}

/// Resources a form paints with: its own, else those of whatever painted it
pub(crate) fn form_resources<'a>(
    doc: &'a Document,
    form: &'a Stream,
    outer: Option<&'a Dictionary>,
) -> Option<&'a Dictionary> {
    form.dict
        .get(b"Resources")
        .ok()
        .and_then(|r| resolve(doc, r).as_dict().ok())
        .or(outer)
}

/// Fast scan of content stream bytes for text-showing operators
///
/// Looks for `Tj`, `TJ`, `'` and `"` in operator position (preceded by
/// whitespace or a closing string/array delimiter, followed by whitespace or
/// end of stream).
fn scan_content_for_text_operators(content: &[u8]) -> u32 {
    let mut text_ops = 0u32;
    let ends_operator =
        |i: usize| i >= content.len() || content[i].is_ascii_whitespace();

    let mut i = 0;
    while i < content.len() {
        let b = content[i];

        if b == b'T' && i + 1 < content.len() {
            let next = content[i + 1];
            if (next == b'j' || next == b'J') && ends_operator(i + 2) {
                text_ops += 1;
            }
        }

        if (b == b'\'' || b == b'"') && ends_operator(i + 1) {
            let prev = if i > 0 { content[i - 1] } else { b' ' };
            if prev == b')' || prev == b'>' || prev.is_ascii_whitespace() {
                text_ops += 1;
            }
        }

        i += 1;
    }

    text_ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    #[test]
    fn test_scan_content_operators() {
        let content = b"BT /F1 12 Tf 100 700 Td (Hello World) Tj ET";
        assert_eq!(scan_content_for_text_operators(content), 1);

        let content2 = b"BT /F1 12 Tf 100 700 Td [(H) 10 (ello)] TJ ET";
        assert_eq!(scan_content_for_text_operators(content2), 1);

        let content3 = b"q 100 0 0 100 50 700 cm /Img1 Do Q";
        assert_eq!(scan_content_for_text_operators(content3), 0);

        let content4 = b"BT 14 TL (one) ' (two) '\nET";
        assert_eq!(scan_content_for_text_operators(content4), 2);
    }

    /// One page painting form `Fm0`, which shows `form_content`
    fn form_page(form_content: &[u8]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let form_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => vec![0.into(), 0.into(), 100.into(), 100.into()],
            },
            form_content.to_vec(),
        ));
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
                "MediaBox" => vec![0.into(), 0.into(), 100.into(), 100.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    #[test]
    fn test_text_in_form_counts_as_page_text() {
        let doc = SourceDocument::from_document("form.pdf", form_page(b"BT (TH0001) Tj ET"))
            .unwrap();
        assert!(doc.page_has_text(0));
        assert_eq!(doc.kind(), DocumentKind::TextLayer);

        let doc = SourceDocument::from_document("form.pdf", form_page(b"0 0 10 10 re f")).unwrap();
        assert!(!doc.page_has_text(0));
    }

    #[test]
    fn test_xobject_calls() {
        assert_eq!(xobject_calls(b"q /Fm0 Do Q q /Im1 Do Q"), vec![b"Fm0".to_vec(), b"Im1".to_vec()]);
        assert!(xobject_calls(b"BT (Do) Tj ET").is_empty());
    }

    #[test]
    fn test_spooled_copy_matches_source() {
        let mut bytes = Vec::new();
        form_page(b"BT (TH0001) Tj ET").save_to(&mut bytes).unwrap();
        let doc = SourceDocument::load("form.pdf", &bytes).unwrap();

        let path = doc.spooled_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(doc.spooled_path().unwrap(), path.as_path());
        drop(doc);
        assert!(!path.exists());

        let built = SourceDocument::from_document("built.pdf", form_page(b"")).unwrap();
        let reloaded = Document::load(built.spooled_path().unwrap()).unwrap();
        assert_eq!(reloaded.get_pages().len(), 1);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(SourceDocument::load("junk.pdf", b"not a pdf at all").is_err());
    }

    #[test]
    fn test_load_all_keeps_order() {
        let inputs = vec![
            SourceInput::new("a.pdf", b"junk".to_vec()),
            SourceInput::new("b.pdf", Vec::new()),
        ];
        let loaded = load_all(&inputs);
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|r| r.is_err()));
    }
}

//! Merged document assembly
//!
//! Pages are copied object by object into a fresh document. Streams keep their
//! original (still encoded) bytes, so page content is never re-rendered.
//! Objects shared between pages of the same source are copied once.

use crate::document::inherited_attribute;
use crate::WaybillError;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;

/// Page attributes that may be inherited from the page tree
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Builds one output document from pages of several sources
pub struct PageAssembler {
    out: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
    /// (source index, source object id) -> output object id
    imported: HashMap<(usize, ObjectId), ObjectId>,
}

impl Default for PageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAssembler {
    pub fn new() -> Self {
        let mut out = Document::with_version("1.7");
        let pages_id = out.new_object_id();
        Self {
            out,
            pages_id,
            kids: Vec::new(),
            imported: HashMap::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Append a copy of `page_id` from `source` as the next output page.
    ///
    /// `source_index` identifies the source so objects shared by several of
    /// its pages are copied once. The same page may be appended more than
    /// once; each append produces its own page object.
    pub fn append_page(
        &mut self,
        source_index: usize,
        source: &Document,
        page_id: ObjectId,
    ) -> Result<(), WaybillError> {
        let mut page = source
            .get_dictionary(page_id)
            .map_err(|e| WaybillError::Parse(format!("page {page_id:?}: {e}")))?
            .clone();

        page.remove(b"Parent");
        for key in INHERITABLE {
            if !page.has(key) {
                if let Some(value) = inherited_attribute(source, page_id, key) {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }

        // References back to this page (annotation /P entries) resolve to the copy
        let new_page_id = self.out.new_object_id();
        let previous = self.imported.insert((source_index, page_id), new_page_id);

        let mut copied = self.import_dictionary(source_index, source, &page);
        copied.set("Parent", self.pages_id);
        self.out.objects.insert(new_page_id, Object::Dictionary(copied));

        match previous {
            Some(id) => self.imported.insert((source_index, page_id), id),
            None => self.imported.remove(&(source_index, page_id)),
        };

        self.kids.push(Object::Reference(new_page_id));
        Ok(())
    }

    /// Close the page tree and serialize the document
    pub fn finish(mut self) -> Result<Vec<u8>, WaybillError> {
        let count = self.kids.len() as i64;
        self.out.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.out.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.out.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        self.out.save_to(&mut buffer)?;
        Ok(buffer)
    }

    fn import_reference(&mut self, source_index: usize, source: &Document, id: ObjectId) -> Object {
        if let Some(&new_id) = self.imported.get(&(source_index, id)) {
            return Object::Reference(new_id);
        }

        let Ok(object) = source.get_object(id) else {
            return Object::Null;
        };
        // Other pages and the source page tree stay behind
        if is_page_tree_node(object) {
            return Object::Null;
        }

        // Reserve first so reference cycles terminate
        let new_id = self.out.new_object_id();
        self.imported.insert((source_index, id), new_id);
        let copied = self.import_object(source_index, source, object);
        self.out.objects.insert(new_id, copied);
        Object::Reference(new_id)
    }

    fn import_object(&mut self, source_index: usize, source: &Document, object: &Object) -> Object {
        match object {
            Object::Reference(id) => self.import_reference(source_index, source, *id),
            Object::Array(items) => Object::Array(
                items
                    .iter()
                    .map(|item| self.import_object(source_index, source, item))
                    .collect(),
            ),
            Object::Dictionary(dict) => {
                Object::Dictionary(self.import_dictionary(source_index, source, dict))
            }
            Object::Stream(stream) => {
                let mut copy = stream.clone();
                copy.dict = self.import_dictionary(source_index, source, &stream.dict);
                Object::Stream(copy)
            }
            other => other.clone(),
        }
    }

    fn import_dictionary(
        &mut self,
        source_index: usize,
        source: &Document,
        dict: &Dictionary,
    ) -> Dictionary {
        let mut copy = Dictionary::new();
        for (key, value) in dict.iter() {
            copy.set(key.clone(), self.import_object(source_index, source, value));
        }
        copy
    }
}

fn is_page_tree_node(object: &Object) -> bool {
    let Ok(dict) = object.as_dict() else {
        return false;
    };
    matches!(
        dict.get(b"Type").and_then(Object::as_name),
        Ok(b"Page") | Ok(b"Pages") | Ok(b"Catalog")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::page_texts_mem;
    use lopdf::content::{Content, Operation};
    use lopdf::Stream;

    /// A document whose pages show the given strings, sharing one font and
    /// inheriting Resources and MediaBox from the page tree
    fn text_doc(texts: &[&str]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 18.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 288.into(), 432.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    fn page_ids(doc: &Document) -> Vec<ObjectId> {
        doc.get_pages().into_values().collect()
    }

    #[test]
    fn test_pages_copied_in_append_order() {
        let a = text_doc(&["A1", "A2"]);
        let b = text_doc(&["B1"]);

        let mut assembler = PageAssembler::new();
        assembler.append_page(1, &b, page_ids(&b)[0]).unwrap();
        assembler.append_page(0, &a, page_ids(&a)[1]).unwrap();
        assembler.append_page(0, &a, page_ids(&a)[0]).unwrap();
        assert_eq!(assembler.page_count(), 3);

        let merged = assembler.finish().unwrap();
        assert_eq!(page_texts_mem(&merged).unwrap(), vec!["B1", "A2", "A1"]);
    }

    #[test]
    fn test_inherited_attributes_materialized() {
        let a = text_doc(&["A1"]);
        let mut assembler = PageAssembler::new();
        assembler.append_page(0, &a, page_ids(&a)[0]).unwrap();
        let merged = Document::load_mem(&assembler.finish().unwrap()).unwrap();

        let page_id = page_ids(&merged)[0];
        let page = merged.get_dictionary(page_id).unwrap();
        assert!(page.has(b"Resources"));
        assert!(page.has(b"MediaBox"));
        assert!(!page.has(b"Rotate"));
    }

    #[test]
    fn test_shared_objects_copied_once() {
        let a = text_doc(&["A1", "A2", "A3"]);
        let mut assembler = PageAssembler::new();
        for page_id in page_ids(&a) {
            assembler.append_page(0, &a, page_id).unwrap();
        }
        let merged = Document::load_mem(&assembler.finish().unwrap()).unwrap();

        let fonts = merged
            .objects
            .values()
            .filter(|o| {
                o.as_dict()
                    .and_then(|d| d.get(b"Type"))
                    .and_then(Object::as_name)
                    .map(|n| n == b"Font")
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(fonts, 1);
    }

    #[test]
    fn test_same_page_twice_gets_two_page_objects() {
        let a = text_doc(&["A1"]);
        let mut assembler = PageAssembler::new();
        let page_id = page_ids(&a)[0];
        assembler.append_page(0, &a, page_id).unwrap();
        assembler.append_page(0, &a, page_id).unwrap();

        let merged = Document::load_mem(&assembler.finish().unwrap()).unwrap();
        let ids = page_ids(&merged);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_content_stream_bytes_preserved() {
        let a = text_doc(&["A1"]);
        let source_page = page_ids(&a)[0];
        let original = a.get_page_content(source_page).unwrap();

        let mut assembler = PageAssembler::new();
        assembler.append_page(0, &a, source_page).unwrap();
        let merged = Document::load_mem(&assembler.finish().unwrap()).unwrap();
        let copied = merged.get_page_content(page_ids(&merged)[0]).unwrap();
        assert_eq!(original, copied);
    }

    #[test]
    fn test_missing_page_is_an_error() {
        let a = text_doc(&["A1"]);
        let mut assembler = PageAssembler::new();
        assert!(assembler.append_page(0, &a, (9999, 0)).is_err());
    }
}

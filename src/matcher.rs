//! Page matching: the mapping table and the per-page resolution steps
//!
//! A page is resolved in up to three steps, stopping at the first hit:
//! 1. text layer, compared in canonical space
//! 2. OCR of the top band of the rendered page, compared in tolerant space
//! 3. OCR of the whole rendered page, compared in tolerant space

use crate::config::MatchConfig;
use crate::document::SourceDocument;
use crate::extractor::page_text;
use crate::keys::{canonicalize, TargetSet};
use crate::ocr::OcrEngine;
use crate::raster::{crop_top, PageRasterizer};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;

/// A page inside the run's document list (both indices zero-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageLocation {
    pub document_index: usize,
    pub page_index: usize,
}

impl PageLocation {
    pub fn new(document_index: usize, page_index: usize) -> Self {
        Self {
            document_index,
            page_index,
        }
    }
}

impl fmt::Display for PageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file {} page {}",
            self.document_index + 1,
            self.page_index + 1
        )
    }
}

/// Which step resolved a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMethod {
    TextLayer,
    CroppedOcr,
    FullPageOcr,
    Unresolved,
}

impl fmt::Display for ResolveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolveMethod::TextLayer => "text-layer",
            ResolveMethod::CroppedOcr => "cropped-ocr",
            ResolveMethod::FullPageOcr => "full-ocr",
            ResolveMethod::Unresolved => "unresolved",
        };
        f.write_str(name)
    }
}

/// Outcome of resolving one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResolution {
    pub method: ResolveMethod,
    /// Indices into the run's [`TargetSet`] found on the page
    pub targets: Vec<usize>,
    /// Why the page ended unresolved, when a step failed
    pub failure: Option<String>,
}

impl PageResolution {
    fn found(method: ResolveMethod, targets: Vec<usize>) -> Self {
        Self {
            method,
            targets,
            failure: None,
        }
    }

    fn unresolved(failure: Option<String>) -> Self {
        Self {
            method: ResolveMethod::Unresolved,
            targets: Vec::new(),
            failure,
        }
    }
}

/// Canonical key -> page, first match wins
#[derive(Debug, Default, Clone)]
pub struct MatchTable {
    records: HashMap<String, PageLocation>,
}

impl MatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `location` unless the key is already bound.
    ///
    /// Returns whether the binding happened. An existing binding is never
    /// replaced, so the earliest page in scan order wins.
    pub fn record(&mut self, key: &str, location: PageLocation) -> bool {
        if self.records.contains_key(key) {
            return false;
        }
        self.records.insert(key.to_string(), location);
        true
    }

    pub fn get(&self, key: &str) -> Option<PageLocation> {
        self.records.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runs the resolution steps for single pages
pub struct PageResolver<'a, R> {
    targets: &'a TargetSet,
    config: &'a MatchConfig,
    rasterizer: &'a R,
}

impl<'a, R: PageRasterizer> PageResolver<'a, R> {
    pub fn new(targets: &'a TargetSet, config: &'a MatchConfig, rasterizer: &'a R) -> Self {
        Self {
            targets,
            config,
            rasterizer,
        }
    }

    /// Step 1: targets whose canonical key appears in the page's text layer.
    ///
    /// Pages without text operators and pages whose content cannot be decoded
    /// yield nothing.
    pub fn text_layer(&self, document: &SourceDocument, page_index: usize) -> Vec<usize> {
        if !document.page_has_text(page_index) {
            return Vec::new();
        }
        let Some(page_id) = document.page_id(page_index) else {
            return Vec::new();
        };

        match page_text(document.lopdf(), page_id) {
            Ok(text) => self.targets.exact_hits(&canonicalize(&text)),
            Err(e) => {
                debug!(
                    "{} page {}: text layer unreadable: {e}",
                    document.name(),
                    page_index + 1
                );
                Vec::new()
            }
        }
    }

    /// Steps 2 and 3: render, OCR the top band, then the full page.
    ///
    /// Render and recognition failures end the page as unresolved.
    pub fn ocr<E: OcrEngine>(
        &self,
        document: &SourceDocument,
        page_index: usize,
        engine: &mut E,
    ) -> PageResolution {
        let bitmap = match self
            .rasterizer
            .render(document, page_index, self.config.render_scale)
        {
            Ok(bitmap) => bitmap,
            Err(e) => {
                debug!(
                    "{} page {}: cannot rasterize: {e}",
                    document.name(),
                    page_index + 1
                );
                return PageResolution::unresolved(Some(e.to_string()));
            }
        };

        let band = crop_top(&bitmap, self.config.crop_top_percent);
        match self.recognize(engine, &band) {
            Ok(hits) if !hits.is_empty() => {
                return PageResolution::found(ResolveMethod::CroppedOcr, hits)
            }
            Ok(_) => {}
            Err(reason) => {
                warn!(
                    "{} page {}: OCR failed: {reason}",
                    document.name(),
                    page_index + 1
                );
                return PageResolution::unresolved(Some(reason));
            }
        }

        if !self.config.full_page_fallback {
            return PageResolution::unresolved(None);
        }

        match self.recognize(engine, &bitmap) {
            Ok(hits) if !hits.is_empty() => PageResolution::found(ResolveMethod::FullPageOcr, hits),
            Ok(_) => PageResolution::unresolved(None),
            Err(reason) => {
                warn!(
                    "{} page {}: full-page OCR failed: {reason}",
                    document.name(),
                    page_index + 1
                );
                PageResolution::unresolved(Some(reason))
            }
        }
    }

    fn recognize<E: OcrEngine>(
        &self,
        engine: &mut E,
        bitmap: &image::GrayImage,
    ) -> Result<Vec<usize>, String> {
        let text = engine.recognize(bitmap).map_err(|e| e.to_string())?;
        let tolerant = self.config.confusions.apply(&canonicalize(&text));
        Ok(self.targets.tolerant_hits(&tolerant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_first_match_wins() {
        let mut table = MatchTable::new();
        let first = PageLocation::new(0, 3);
        let second = PageLocation::new(1, 0);

        assert!(table.record("TH0001", first));
        assert!(!table.record("TH0001", second));
        assert_eq!(table.get("TH0001"), Some(first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_record_distinct_keys() {
        let mut table = MatchTable::new();
        assert!(table.is_empty());
        assert!(table.record("TH0001", PageLocation::new(0, 0)));
        assert!(table.record("TH0002", PageLocation::new(0, 0)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("TH0003"), None);
    }

    #[test]
    fn test_location_display_is_one_based() {
        assert_eq!(PageLocation::new(0, 4).to_string(), "file 1 page 5");
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ResolveMethod::TextLayer.to_string(), "text-layer");
        assert_eq!(ResolveMethod::CroppedOcr.to_string(), "cropped-ocr");
        assert_eq!(ResolveMethod::FullPageOcr.to_string(), "full-ocr");
        assert_eq!(ResolveMethod::Unresolved.to_string(), "unresolved");
    }
}

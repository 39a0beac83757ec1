//! Waybill page matching and reassembly using lopdf
//!
//! This crate provides:
//! - Tracking-number canonicalization with OCR-tolerant comparison keys
//! - Per-page identifier lookup from the text layer, falling back to OCR of
//!   the rendered page (top band first, then the whole page)
//! - A merged PDF with one page per matched identifier, in identifier order
//! - A run report with unmatched identifiers, skipped files and page anomalies
//!
//! ```no_run
//! use waybill_matcher::{CancelToken, MatchConfig, ProgressEvent, SourceInput, WaybillMerger};
//!
//! let inputs = vec![SourceInput::new("labels.pdf", std::fs::read("labels.pdf")?)];
//! let merger = WaybillMerger::new(MatchConfig::default());
//! let outcome = merger.run(
//!     &["TH0001", "KEX-9"],
//!     inputs,
//!     &mut |event: &ProgressEvent| println!("{event:?}"),
//!     &CancelToken::new(),
//! )?;
//! if let Some(pdf) = outcome.merged {
//!     std::fs::write("merged.pdf", pdf)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod assembler;
pub mod config;
pub mod document;
pub mod extractor;
pub mod keys;
pub mod matcher;
pub mod ocr;
pub mod pipeline;
pub mod raster;
pub mod report;
pub mod tounicode;

pub use assembler::PageAssembler;
pub use config::MatchConfig;
pub use document::{DocumentKind, SourceDocument, SourceInput};
pub use extractor::{page_text, page_texts_mem};
pub use keys::{canonicalize, ConfusionTable, Target, TargetSet};
pub use matcher::{MatchTable, PageLocation, ResolveMethod};
pub use ocr::{OcrEngine, OcrError, OcrProvider, TesseractCli};
pub use pipeline::{CancelToken, MergeJob, MergeOutcome, WaybillMerger};
pub use raster::{EmbeddedImageRasterizer, PageRasterizer, PdftoppmRasterizer, RasterError};
pub use report::{ProgressEvent, ProgressSink, RunReport, UNMATCHED_CSV_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum WaybillError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parsing error: {0}")]
    Parse(String),
    #[error("PDF is encrypted")]
    Encrypted,
    #[error("Invalid PDF structure")]
    InvalidStructure,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid tracking identifiers: {0}")]
    InvalidTargets(String),
    #[error("OCR engine failed to start: {0}")]
    OcrInit(String),
    #[error("Run cancelled")]
    Cancelled,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl From<lopdf::Error> for WaybillError {
    fn from(e: lopdf::Error) -> Self {
        WaybillError::Parse(e.to_string())
    }
}

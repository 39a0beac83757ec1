//! The merge run: scan every page, bind identifiers, assemble the output
//!
//! A run is one sequential fold over (file, page) pairs followed by one
//! assembly pass in identifier order. Input documents are parsed in parallel
//! up front; everything after that happens on the calling thread.

use crate::assembler::PageAssembler;
use crate::config::MatchConfig;
use crate::document::{load_all, SourceDocument, SourceInput};
use crate::keys::TargetSet;
use crate::matcher::{MatchTable, PageLocation, PageResolution, PageResolver, ResolveMethod};
use crate::ocr::{OcrProvider, TesseractCli};
use crate::raster::{PageRasterizer, PdftoppmRasterizer};
use crate::report::{FileFailure, PageAnomaly, ProgressEvent, ProgressSink, RunReport};
use crate::WaybillError;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Cooperative cancellation flag shared between a run and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), WaybillError> {
        if self.is_cancelled() {
            Err(WaybillError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of a completed run
#[derive(Debug)]
pub struct MergeOutcome {
    /// Matched pages in identifier order; `None` when nothing matched
    pub merged: Option<Vec<u8>>,
    pub page_count: usize,
    pub report: RunReport,
}

/// Matches tracking identifiers to pages and merges the pages in order
pub struct WaybillMerger<R = PdftoppmRasterizer, P = TesseractCli> {
    config: MatchConfig,
    rasterizer: R,
    ocr: P,
}

impl WaybillMerger {
    /// A merger using the `pdftoppm` and `tesseract` binaries on PATH
    pub fn new(config: MatchConfig) -> Self {
        Self::with_backends(config, PdftoppmRasterizer::default(), TesseractCli::default())
    }
}

impl<R: PageRasterizer, P: OcrProvider> WaybillMerger<R, P> {
    pub fn with_backends(config: MatchConfig, rasterizer: R, ocr: P) -> Self {
        Self {
            config,
            rasterizer,
            ocr,
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Run one merge.
    ///
    /// `identifiers` fixes the output order. Files that cannot be read are
    /// reported and skipped. The OCR engine is started only if some page has
    /// no matching text layer, and is released before this returns.
    pub fn run<S, K>(
        &self,
        identifiers: &[S],
        inputs: Vec<SourceInput>,
        sink: &mut K,
        cancel: &CancelToken,
    ) -> Result<MergeOutcome, WaybillError>
    where
        S: AsRef<str>,
        K: ProgressSink + ?Sized,
    {
        self.config.validate()?;
        let targets = TargetSet::new(identifiers, &self.config.confusions)
            .map_err(WaybillError::InvalidTargets)?;
        cancel.check()?;

        info!(
            "matching {} identifiers across {} files",
            targets.len(),
            inputs.len()
        );
        let names: Vec<String> = inputs.iter().map(|input| input.name.clone()).collect();
        let documents = load_all(&inputs);
        drop(inputs);

        let mut ctx = RunContext {
            targets: &targets,
            resolver: PageResolver::new(&targets, &self.config, &self.rasterizer),
            provider: &self.ocr,
            engine: None,
            table: MatchTable::new(),
            report: RunReport::new(targets.len()),
            sink,
        };
        ctx.report.push_line(format!(
            "Matching {} identifiers across {} files",
            targets.len(),
            documents.len()
        ));

        ctx.scan(&documents, &names, cancel)?;
        // Scanning is over; stop the engine before assembly
        ctx.engine = None;

        let assembler = ctx.assemble(&documents, self.config.batch_size, cancel)?;
        ctx.finish(assembler)
    }
}

/// Per-run state: the mapping table, the report and the lazily started engine
struct RunContext<'a, R, P: OcrProvider, K: ?Sized> {
    targets: &'a TargetSet,
    resolver: PageResolver<'a, R>,
    provider: &'a P,
    engine: Option<P::Engine>,
    table: MatchTable,
    report: RunReport,
    sink: &'a mut K,
}

impl<R, P, K> RunContext<'_, R, P, K>
where
    R: PageRasterizer,
    P: OcrProvider,
    K: ProgressSink + ?Sized,
{
    fn emit(&mut self, event: ProgressEvent) {
        self.sink.on_event(&event);
    }

    fn all_matched(&self) -> bool {
        self.table.len() == self.targets.len()
    }

    fn scan(
        &mut self,
        documents: &[Result<SourceDocument, WaybillError>],
        names: &[String],
        cancel: &CancelToken,
    ) -> Result<(), WaybillError> {
        for (index, loaded) in documents.iter().enumerate() {
            cancel.check()?;

            let doc = match loaded {
                Ok(doc) => doc,
                Err(e) => {
                    let name = names.get(index).cloned().unwrap_or_default();
                    self.file_failed(index, name, e.to_string());
                    continue;
                }
            };

            if self.all_matched() {
                self.report.skipped_pages += doc.page_count();
                continue;
            }

            self.report.processed_files += 1;
            info!(
                "{}: {} pages ({:?})",
                doc.name(),
                doc.page_count(),
                doc.kind()
            );
            self.report.push_line(format!(
                "Reading file {} ({}), {} pages",
                index + 1,
                doc.name(),
                doc.page_count()
            ));
            self.emit(ProgressEvent::FileStarted {
                index,
                name: doc.name().to_string(),
                page_count: doc.page_count(),
                kind: doc.kind(),
            });

            for page_index in 0..doc.page_count() {
                cancel.check()?;
                if self.all_matched() {
                    self.report.skipped_pages += doc.page_count() - page_index;
                    break;
                }
                self.resolve_page(doc, PageLocation::new(index, page_index))?;
                // Pages can take seconds under OCR; let the owner's threads run
                std::thread::yield_now();
            }
        }

        if self.report.skipped_pages > 0 {
            info!(
                "every identifier matched, skipped {} remaining pages",
                self.report.skipped_pages
            );
            self.report.push_line(format!(
                "All identifiers found, skipped {} remaining pages",
                self.report.skipped_pages
            ));
        }
        Ok(())
    }

    fn file_failed(&mut self, index: usize, name: String, reason: String) {
        warn!("skipping {name}: {reason}");
        self.report
            .push_line(format!("Skipped file {} ({name}): {reason}", index + 1));
        self.report.failed_files.push(FileFailure {
            index,
            name: name.clone(),
            reason: reason.clone(),
        });
        self.emit(ProgressEvent::FileFailed {
            index,
            name,
            reason,
        });
    }

    fn resolve_page(
        &mut self,
        doc: &SourceDocument,
        location: PageLocation,
    ) -> Result<(), WaybillError> {
        let page_index = location.page_index;
        let text_hits = self.resolver.text_layer(doc, page_index);

        let resolution = if text_hits.is_empty() {
            if self.engine.is_none() {
                let engine = self
                    .provider
                    .acquire()
                    .map_err(|e| WaybillError::OcrInit(e.to_string()))?;
                info!("OCR engine started for {} page {}", doc.name(), page_index + 1);
                self.engine = Some(engine);
            }
            match self.engine.as_mut() {
                Some(engine) => self.resolver.ocr(doc, page_index, engine),
                None => return Err(WaybillError::OcrInit("engine not started".to_string())),
            }
        } else {
            PageResolution {
                method: ResolveMethod::TextLayer,
                targets: text_hits,
                failure: None,
            }
        };

        self.record_resolution(doc, location, resolution);
        Ok(())
    }

    fn record_resolution(
        &mut self,
        doc: &SourceDocument,
        location: PageLocation,
        resolution: PageResolution,
    ) {
        let page_label = format!("{} page {}", doc.name(), location.page_index + 1);
        self.report.count_method(resolution.method);

        let targets = self.targets;
        let mut found = Vec::with_capacity(resolution.targets.len());
        let mut bound = Vec::new();
        for target in resolution.targets.iter().filter_map(|&i| targets.get(i)) {
            found.push(target.identifier.clone());
            if self.table.record(&target.canonical, location) {
                bound.push(target.identifier.clone());
            } else {
                debug!(
                    "{page_label}: {} already matched on an earlier page",
                    target.identifier
                );
            }
        }

        match (&resolution.failure, found.is_empty()) {
            (Some(reason), _) => self
                .report
                .push_line(format!("{page_label}: no identifier read ({reason})")),
            (None, true) => {
                debug!("{page_label}: no identifier found");
                self.report
                    .push_line(format!("{page_label}: no identifier found"));
            }
            (None, false) => {
                debug!("{page_label}: {} via {}", found.join(", "), resolution.method);
                self.report.push_line(format!(
                    "{page_label}: {} ({})",
                    found.join(", "),
                    resolution.method
                ));
            }
        }

        if found.len() > 1 {
            warn!("{page_label} carries {} identifiers", found.len());
            self.report.anomalies.push(PageAnomaly {
                location,
                identifiers: found,
            });
        }

        self.emit(ProgressEvent::PageResolved {
            location,
            method: resolution.method,
            identifiers: bound,
        });
    }

    fn assemble(
        &mut self,
        documents: &[Result<SourceDocument, WaybillError>],
        batch_size: usize,
        cancel: &CancelToken,
    ) -> Result<PageAssembler, WaybillError> {
        let targets = self.targets;
        let total = targets.len();
        let mut assembler = PageAssembler::new();
        let mut unmatched = Vec::new();
        self.report
            .push_line(format!("Assembling {total} identifiers"));

        for (processed, target) in targets.iter().enumerate() {
            cancel.check()?;

            let copied = match self.table.get(&target.canonical) {
                Some(location) => match copy_page(&mut assembler, documents, location) {
                    Ok(()) => true,
                    Err(e) => {
                        // The identifier falls back to unmatched
                        warn!("cannot copy {location} for {}: {e}", target.identifier);
                        self.report
                            .push_line(format!("{}: page copy failed ({e})", target.identifier));
                        false
                    }
                },
                None => false,
            };
            if !copied {
                unmatched.push(target.identifier.clone());
            }

            let processed = processed + 1;
            if processed % batch_size == 0 || processed == total {
                self.emit(ProgressEvent::AssemblyProgress { processed, total });
                std::thread::yield_now();
            }
        }

        self.report.unmatched = unmatched;
        self.report.matched_count = assembler.page_count();
        Ok(assembler)
    }

    fn finish(mut self, assembler: PageAssembler) -> Result<MergeOutcome, WaybillError> {
        let page_count = assembler.page_count();
        let merged = if page_count > 0 {
            Some(assembler.finish()?)
        } else {
            None
        };

        let matched = self.report.matched_count;
        let total = self.report.total_targets;
        let unmatched = self.report.unmatched.len();
        info!("matched {matched} of {total} identifiers, {unmatched} unmatched");
        self.report
            .push_line(format!("Matched {matched}/{total} identifiers"));
        self.emit(ProgressEvent::RunComplete {
            matched,
            total,
            unmatched,
        });

        Ok(MergeOutcome {
            merged,
            page_count,
            report: self.report,
        })
    }
}

fn copy_page(
    assembler: &mut PageAssembler,
    documents: &[Result<SourceDocument, WaybillError>],
    location: PageLocation,
) -> Result<(), WaybillError> {
    let Some(Ok(doc)) = documents.get(location.document_index) else {
        return Err(WaybillError::InvalidStructure);
    };
    let page_id = doc
        .page_id(location.page_index)
        .ok_or(WaybillError::InvalidStructure)?;
    assembler.append_page(location.document_index, doc.lopdf(), page_id)
}

/// A merge running on its own thread.
///
/// Progress events arrive on [`MergeJob::events`]; the outcome comes from
/// [`MergeJob::join`].
pub struct MergeJob {
    events: Receiver<ProgressEvent>,
    cancel: CancelToken,
    handle: JoinHandle<Result<MergeOutcome, WaybillError>>,
}

impl MergeJob {
    pub fn spawn<R, P>(
        merger: WaybillMerger<R, P>,
        identifiers: Vec<String>,
        inputs: Vec<SourceInput>,
    ) -> Result<Self, WaybillError>
    where
        R: PageRasterizer + Send + 'static,
        P: OcrProvider + Send + 'static,
    {
        let (mut sender, events) = mpsc::channel();
        let cancel = CancelToken::new();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("waybill-merge".to_string())
            .spawn(move || merger.run(&identifiers, inputs, &mut sender, &token))?;

        Ok(Self {
            events,
            cancel,
            handle,
        })
    }

    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end
    pub fn join(self) -> Result<MergeOutcome, WaybillError> {
        self.handle
            .join()
            .map_err(|_| WaybillError::Worker("merge thread panicked".to_string()))?
    }
}

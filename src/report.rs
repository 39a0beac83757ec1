//! Progress events and the run report

use crate::document::DocumentKind;
use crate::matcher::{PageLocation, ResolveMethod};
use crate::WaybillError;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::mpsc::Sender;

/// Header of the unmatched-identifier CSV ("tracking numbers not found")
pub const UNMATCHED_CSV_HEADER: &str = "เลขพัสดุที่ไม่พบ";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Something that happened during a run, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    FileStarted {
        index: usize,
        name: String,
        page_count: usize,
        kind: DocumentKind,
    },
    FileFailed {
        index: usize,
        name: String,
        reason: String,
    },
    PageResolved {
        location: PageLocation,
        method: ResolveMethod,
        /// Identifiers newly bound to this page
        identifiers: Vec<String>,
    },
    AssemblyProgress {
        processed: usize,
        total: usize,
    },
    RunComplete {
        matched: usize,
        total: usize,
        unmatched: usize,
    },
}

/// Receives progress events from a running pipeline
pub trait ProgressSink {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F: FnMut(&ProgressEvent)> ProgressSink for F {
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for Sender<ProgressEvent> {
    fn on_event(&mut self, event: &ProgressEvent) {
        // The receiver may have gone away; the run still completes
        let _ = self.send(event.clone());
    }
}

/// A file that could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub index: usize,
    pub name: String,
    pub reason: String,
}

/// A page that carried more than one target identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAnomaly {
    pub location: PageLocation,
    pub identifiers: Vec<String>,
}

/// Everything a caller needs to know about a finished run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Human-readable progress lines; the last one summarizes the counts
    pub log: Vec<String>,
    pub processed_files: usize,
    pub matched_count: usize,
    pub total_targets: usize,
    /// Identifiers with no page, in input order
    pub unmatched: Vec<String>,
    pub failed_files: Vec<FileFailure>,
    pub anomalies: Vec<PageAnomaly>,
    /// Pages per resolution method, keyed by method name
    pub method_counts: BTreeMap<String, usize>,
    /// Pages not examined because every target was already matched
    pub skipped_pages: usize,
}

impl RunReport {
    pub fn new(total_targets: usize) -> Self {
        Self {
            total_targets,
            ..Self::default()
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    pub(crate) fn count_method(&mut self, method: ResolveMethod) {
        *self.method_counts.entry(method.to_string()).or_insert(0) += 1;
    }

    /// Pages resolved by `method` so far
    pub fn method_count(&self, method: ResolveMethod) -> usize {
        self.method_counts
            .get(&method.to_string())
            .copied()
            .unwrap_or(0)
    }

    pub fn all_matched(&self) -> bool {
        self.unmatched.is_empty() && self.matched_count == self.total_targets
    }

    /// Write the unmatched identifiers as a one-column CSV with a UTF-8 BOM
    pub fn write_unmatched_csv<W: Write>(&self, mut out: W) -> Result<(), WaybillError> {
        out.write_all(UTF8_BOM)?;
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(out);
        writer.write_record([UNMATCHED_CSV_HEADER])?;
        for identifier in &self.unmatched {
            writer.write_record([identifier.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn unmatched_csv(&self) -> Result<Vec<u8>, WaybillError> {
        let mut buffer = Vec::new();
        self.write_unmatched_csv(&mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn report_with_unmatched(unmatched: &[&str]) -> RunReport {
        let mut report = RunReport::new(unmatched.len() + 1);
        report.matched_count = 1;
        report.unmatched = unmatched.iter().map(|s| s.to_string()).collect();
        report
    }

    #[test]
    fn test_unmatched_csv_bytes() {
        let report = report_with_unmatched(&["TH9999", "KEX-12"]);
        let csv = report.unmatched_csv().unwrap();

        let mut expected = UTF8_BOM.to_vec();
        expected.extend_from_slice("เลขพัสดุที่ไม่พบ\nTH9999\nKEX-12\n".as_bytes());
        assert_eq!(csv, expected);
    }

    #[test]
    fn test_unmatched_csv_quotes_when_needed() {
        let report = report_with_unmatched(&["TH,1", "say \"hi\""]);
        let csv = report.unmatched_csv().unwrap();
        let text = String::from_utf8(csv[UTF8_BOM.len()..].to_vec()).unwrap();
        assert_eq!(text, "เลขพัสดุที่ไม่พบ\n\"TH,1\"\n\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn test_empty_unmatched_csv_has_header_only() {
        let report = RunReport::new(0);
        let csv = report.unmatched_csv().unwrap();
        assert!(csv.starts_with(UTF8_BOM));
        assert!(csv.ends_with("เลขพัสดุที่ไม่พบ\n".as_bytes()));
    }

    #[test]
    fn test_unmatched_csv_to_file() {
        let report = report_with_unmatched(&["TH9999"]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        report.write_unmatched_csv(file.as_file_mut()).unwrap();

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(written, report.unmatched_csv().unwrap());
    }

    #[test]
    fn test_method_counts() {
        let mut report = RunReport::new(3);
        report.count_method(ResolveMethod::TextLayer);
        report.count_method(ResolveMethod::TextLayer);
        report.count_method(ResolveMethod::Unresolved);
        assert_eq!(report.method_count(ResolveMethod::TextLayer), 2);
        assert_eq!(report.method_count(ResolveMethod::Unresolved), 1);
        assert_eq!(report.method_count(ResolveMethod::FullPageOcr), 0);
    }

    #[test]
    fn test_all_matched() {
        let mut report = RunReport::new(2);
        report.matched_count = 2;
        assert!(report.all_matched());
        report.matched_count = 1;
        report.unmatched.push("TH2".into());
        assert!(!report.all_matched());
    }

    #[test]
    fn test_closure_and_channel_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |event: &ProgressEvent| seen.push(event.clone());
            sink.on_event(&ProgressEvent::AssemblyProgress {
                processed: 1,
                total: 2,
            });
        }
        assert_eq!(seen.len(), 1);

        let (mut tx, rx) = mpsc::channel();
        tx.on_event(&ProgressEvent::RunComplete {
            matched: 1,
            total: 1,
            unmatched: 0,
        });
        drop(tx);
        let events: Vec<ProgressEvent> = rx.iter().collect();
        assert_eq!(
            events,
            vec![ProgressEvent::RunComplete {
                matched: 1,
                total: 1,
                unmatched: 0
            }]
        );
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (mut tx, rx) = mpsc::channel::<ProgressEvent>();
        drop(rx);
        tx.on_event(&ProgressEvent::AssemblyProgress {
            processed: 0,
            total: 0,
        });
    }
}

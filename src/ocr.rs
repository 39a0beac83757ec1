//! Optical character recognition seam
//!
//! An [`OcrProvider`] hands out one [`OcrEngine`] per run. Engines are costly
//! to start, so the pipeline acquires at most one and drops it when the run
//! ends, whichever way it ends. Recognition is restricted to [`OCR_CHARSET`].

use image::GrayImage;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Characters a tracking number can contain after canonicalization
pub const OCR_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static TESSERACT_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^tesseract\s+v?(\d+)\.(\d+)").expect("valid version regex"));

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),
    #[error("OCR engine failed: {0}")]
    Engine(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started recognition engine
pub trait OcrEngine {
    /// Recognize text in a grayscale bitmap
    fn recognize(&mut self, image: &GrayImage) -> Result<String, OcrError>;
}

/// Starts recognition engines
pub trait OcrProvider {
    type Engine: OcrEngine;

    fn acquire(&self) -> Result<Self::Engine, OcrError>;
}

/// Runs the `tesseract` command-line tool
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    language: String,
    page_segmentation_mode: u8,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: "eng".to_string(),
            // a single uniform block of text
            page_segmentation_mode: 6,
        }
    }
}

impl TesseractCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_page_segmentation_mode(mut self, psm: u8) -> Self {
        self.page_segmentation_mode = psm;
        self
    }
}

impl OcrProvider for TesseractCli {
    type Engine = TesseractSession;

    fn acquire(&self) -> Result<TesseractSession, OcrError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OcrError::Unavailable(format!("{} not found", self.binary.display()))
                } else {
                    OcrError::Io(e)
                }
            })?;

        // Older releases print the banner on stderr
        let banner = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let version = parse_tesseract_version(&banner).ok_or_else(|| {
            OcrError::Unavailable(format!(
                "{} did not report a tesseract version",
                self.binary.display()
            ))
        })?;
        if version.0 < 4 {
            return Err(OcrError::Unavailable(format!(
                "tesseract {}.{} is too old, 4.0 or newer is required",
                version.0, version.1
            )));
        }

        let scratch = tempfile::Builder::new().prefix("waybill-ocr-").tempdir()?;
        debug!(
            "tesseract {}.{} ready, scratch dir {}",
            version.0,
            version.1,
            scratch.path().display()
        );

        Ok(TesseractSession {
            binary: self.binary.clone(),
            language: self.language.clone(),
            page_segmentation_mode: self.page_segmentation_mode,
            scratch,
            images_written: 0,
        })
    }
}

/// A tesseract engine bound to a scratch directory.
///
/// The directory and any bitmaps left in it are removed on drop.
#[derive(Debug)]
pub struct TesseractSession {
    binary: PathBuf,
    language: String,
    page_segmentation_mode: u8,
    scratch: TempDir,
    images_written: u64,
}

impl TesseractSession {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

impl OcrEngine for TesseractSession {
    fn recognize(&mut self, image: &GrayImage) -> Result<String, OcrError> {
        self.images_written += 1;
        let path = self
            .scratch
            .path()
            .join(format!("page-{}.png", self.images_written));
        image
            .save(&path)
            .map_err(|e| OcrError::Engine(format!("cannot write bitmap: {e}")))?;

        let output = Command::new(&self.binary)
            .arg(&path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--psm")
            .arg(self.page_segmentation_mode.to_string())
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={OCR_CHARSET}"))
            .output();
        let _ = std::fs::remove_file(&path);
        let output = output?;

        if !output.status.success() {
            return Err(OcrError::Engine(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Major and minor version from `tesseract --version` output
fn parse_tesseract_version(banner: &str) -> Option<(u32, u32)> {
    let caps = TESSERACT_VERSION.captures(banner)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tesseract_version() {
        let banner = "tesseract 5.3.0\n leptonica-1.82.0\n  libgif 5.2.1\n";
        assert_eq!(parse_tesseract_version(banner), Some((5, 3)));
        assert_eq!(parse_tesseract_version("tesseract v4.1.1-rc2"), Some((4, 1)));
        assert_eq!(parse_tesseract_version("bash: tesseract: not found"), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let provider = TesseractCli::new().with_binary("/nonexistent/waybill-tesseract");
        assert!(matches!(provider.acquire(), Err(OcrError::Unavailable(_))));
    }

    #[test]
    fn test_charset_is_uppercase_alphanumeric() {
        assert_eq!(OCR_CHARSET.len(), 36);
        assert!(OCR_CHARSET
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    /// Needs a tesseract binary on PATH.
    /// Run with: cargo test test_tesseract_session -- --ignored
    #[test]
    #[ignore]
    fn test_tesseract_session_cleans_up() {
        let mut session = TesseractCli::new().acquire().unwrap();
        let scratch = session.scratch_dir().to_path_buf();
        let blank = GrayImage::from_pixel(200, 60, image::Luma([255]));
        let text = session.recognize(&blank).unwrap();
        assert!(text.trim().is_empty());
        drop(session);
        assert!(!scratch.exists());
    }
}

//! Run configuration for waybill matching

use crate::keys::ConfusionTable;
use crate::WaybillError;

/// Allowed range for [`MatchConfig::crop_top_percent`]
pub const CROP_TOP_RANGE: (u8, u8) = (5, 60);
/// Allowed range for [`MatchConfig::batch_size`]
pub const BATCH_SIZE_RANGE: (usize, usize) = (5, 100);
/// Upper bound for [`MatchConfig::render_scale`]
pub const MAX_RENDER_SCALE: f32 = 8.0;

/// Configuration for one matching run
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Height of the top band sent to cropped OCR, as a percentage of the
    /// rendered page height (default: 25)
    pub crop_top_percent: u8,
    /// Identifiers per assembly progress event (default: 25)
    pub batch_size: usize,
    /// Pixels per PDF point when rasterizing a page (default: 2.0)
    pub render_scale: f32,
    /// Retry OCR over the whole page when the top band has no match
    pub full_page_fallback: bool,
    /// Substitutions applied before OCR comparisons
    pub confusions: ConfusionTable,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            crop_top_percent: 25,
            batch_size: 25,
            render_scale: 2.0,
            full_page_fallback: true,
            confusions: ConfusionTable::default(),
        }
    }
}

impl MatchConfig {
    /// Reject out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<(), WaybillError> {
        let (crop_min, crop_max) = CROP_TOP_RANGE;
        if !(crop_min..=crop_max).contains(&self.crop_top_percent) {
            return Err(WaybillError::InvalidConfig(format!(
                "crop_top_percent {} outside {crop_min}..={crop_max}",
                self.crop_top_percent
            )));
        }

        let (batch_min, batch_max) = BATCH_SIZE_RANGE;
        if !(batch_min..=batch_max).contains(&self.batch_size) {
            return Err(WaybillError::InvalidConfig(format!(
                "batch_size {} outside {batch_min}..={batch_max}",
                self.batch_size
            )));
        }

        if !(self.render_scale > 0.0 && self.render_scale <= MAX_RENDER_SCALE) {
            return Err(WaybillError::InvalidConfig(format!(
                "render_scale {} outside (0, {MAX_RENDER_SCALE}]",
                self.render_scale
            )));
        }

        self.confusions
            .validate()
            .map_err(WaybillError::InvalidConfig)
    }
}

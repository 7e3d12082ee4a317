use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::store::StreamQuality;

/// Named stream presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 4] = [
        QualityPreset::Low,
        QualityPreset::Medium,
        QualityPreset::High,
        QualityPreset::Ultra,
    ];

    /// Concrete stream parameters for the preset
    pub fn parameters(&self) -> StreamQuality {
        let (width, height, quality_level) = match self {
            QualityPreset::Low => (320, 240, 40),
            QualityPreset::Medium => (640, 480, 60),
            QualityPreset::High => (1280, 720, 75),
            QualityPreset::Ultra => (1920, 1080, 90),
        };
        StreamQuality {
            width,
            height,
            quality_level,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Ultra => "ultra",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityPreset::ALL
            .iter()
            .copied()
            .find(|preset| preset.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown quality preset '{}'", s))
    }
}

/// Decides whether a quality selection has to be pushed to the camera.
///
/// Holds the last value that was actually applied; the caller performs the
/// write and confirms it with [`QualityNegotiator::mark_applied`].
#[derive(Debug, Clone)]
pub struct QualityNegotiator {
    selected: QualityPreset,
    last_applied: Option<StreamQuality>,
}

impl QualityNegotiator {
    pub fn new(initial: QualityPreset) -> Self {
        Self {
            selected: initial,
            last_applied: None,
        }
    }

    pub fn selected(&self) -> QualityPreset {
        self.selected
    }

    pub fn last_applied(&self) -> Option<StreamQuality> {
        self.last_applied
    }

    /// Select a preset. Returns the parameters to write, or `None` when they
    /// equal the last applied value and `force` is not set.
    pub fn select(&mut self, preset: QualityPreset, force: bool) -> Option<StreamQuality> {
        self.selected = preset;
        self.pending(force)
    }

    /// Parameters of the current selection that still need writing
    pub fn pending(&self, force: bool) -> Option<StreamQuality> {
        let wanted = self.selected.parameters();
        if !force && self.last_applied == Some(wanted) {
            debug!("Quality {} already applied, skipping", self.selected);
            return None;
        }
        Some(wanted)
    }

    pub fn mark_applied(&mut self, quality: StreamQuality) {
        self.last_applied = Some(quality);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table() {
        let medium = QualityPreset::Medium.parameters();
        assert_eq!((medium.width, medium.height), (640, 480));
        assert_eq!("HIGH".parse::<QualityPreset>(), Ok(QualityPreset::High));
        assert!("potato".parse::<QualityPreset>().is_err());
    }

    #[test]
    fn test_same_preset_written_once() {
        let mut negotiator = QualityNegotiator::new(QualityPreset::Medium);
        let mut writes = 0;

        for _ in 0..2 {
            if let Some(quality) = negotiator.select(QualityPreset::High, false) {
                writes += 1;
                negotiator.mark_applied(quality);
            }
        }

        assert_eq!(writes, 1);
    }

    #[test]
    fn test_force_reapplies() {
        let mut negotiator = QualityNegotiator::new(QualityPreset::Low);
        let quality = negotiator.select(QualityPreset::Low, false).unwrap();
        negotiator.mark_applied(quality);

        assert!(negotiator.pending(false).is_none());
        assert_eq!(negotiator.pending(true), Some(quality));
    }

    #[test]
    fn test_failed_write_is_retried_next_time() {
        let mut negotiator = QualityNegotiator::new(QualityPreset::Low);
        assert!(negotiator.select(QualityPreset::Ultra, false).is_some());
        // Not confirmed, so still pending
        assert!(negotiator.select(QualityPreset::Ultra, false).is_some());
    }
}

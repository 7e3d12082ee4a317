use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::Millis;

/// Every named slot of the shared state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Slot {
    LiveEnabled,
    LiveQuality,
    LiveSession,
    CameraTelemetry,
    CaptureResult,
    LiveFrame,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::LiveEnabled,
        Slot::LiveQuality,
        Slot::LiveSession,
        Slot::CameraTelemetry,
        Slot::CaptureResult,
        Slot::LiveFrame,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Slot::LiveEnabled => "liveEnabled",
            Slot::LiveQuality => "liveQuality",
            Slot::LiveSession => "liveSession",
            Slot::CameraTelemetry => "cameraTelemetry",
            Slot::CaptureResult => "captureResult",
            Slot::LiveFrame => "liveFrame",
        }
    }

    pub fn from_name(name: &str) -> Option<Slot> {
        Slot::ALL.iter().copied().find(|slot| slot.name() == name)
    }

    /// Slots a client may write through the polling endpoints. Telemetry,
    /// frames and capture results belong to the camera side.
    pub fn client_writable(&self) -> bool {
        matches!(
            self,
            Slot::LiveEnabled | Slot::LiveQuality | Slot::LiveSession
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A flat-text schema bound to one slot. Parsing is the only place slot
/// content is interpreted; anything unparsable is treated as absent.
pub trait SlotSchema: Sized {
    const SLOT: Slot;

    fn parse(raw: &str) -> Option<Self>;

    fn render(&self) -> String;
}

/// A slot value together with the time it was last written
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub modified_at: Millis,
}

/// `liveEnabled`: "on" | "off"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveEnabled(pub bool);

impl SlotSchema for LiveEnabled {
    const SLOT: Slot = Slot::LiveEnabled;

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "on" => Some(LiveEnabled(true)),
            "off" => Some(LiveEnabled(false)),
            _ => None,
        }
    }

    fn render(&self) -> String {
        let value = if self.0 { "on" } else { "off" };
        value.to_string()
    }
}

/// `liveQuality`: "<width> <height> <qualityLevel>"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuality {
    pub width: u32,
    pub height: u32,
    pub quality_level: u8,
}

impl SlotSchema for StreamQuality {
    const SLOT: Slot = Slot::LiveQuality;

    fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.split_whitespace();
        let width = fields.next()?.parse().ok()?;
        let height = fields.next()?.parse().ok()?;
        let quality_level = fields.next()?.parse().ok()?;
        if fields.next().is_some() || width == 0 || height == 0 {
            return None;
        }
        Some(StreamQuality {
            width,
            height,
            quality_level,
        })
    }

    fn render(&self) -> String {
        format!("{} {} {}", self.width, self.height, self.quality_level)
    }
}

/// `liveSession`: "<timestampMs>:<sessionId>"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStamp {
    pub timestamp_ms: Millis,
    pub session_id: String,
}

impl SlotSchema for SessionStamp {
    const SLOT: Slot = Slot::LiveSession;

    fn parse(raw: &str) -> Option<Self> {
        let (timestamp, session_id) = raw.trim().split_once(':')?;
        let timestamp_ms = timestamp.parse().ok()?;
        if session_id.is_empty() {
            return None;
        }
        Some(SessionStamp {
            timestamp_ms,
            session_id: session_id.to_string(),
        })
    }

    fn render(&self) -> String {
        format!("{}:{}", self.timestamp_ms, self.session_id)
    }
}

/// `cameraTelemetry`: "<memory>,<temperature>,<latencyOrLoad>,<signalOrDisk>".
/// Freshness is the slot's modification time, not a field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraTelemetry {
    pub memory: f64,
    pub temperature: f64,
    pub latency_or_load: f64,
    pub signal_or_disk: f64,
}

impl SlotSchema for CameraTelemetry {
    const SLOT: Slot = Slot::CameraTelemetry;

    fn parse(raw: &str) -> Option<Self> {
        let fields: Vec<f64> = raw
            .trim()
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match fields.as_slice() {
            [memory, temperature, latency_or_load, signal_or_disk] => Some(CameraTelemetry {
                memory: *memory,
                temperature: *temperature,
                latency_or_load: *latency_or_load,
                signal_or_disk: *signal_or_disk,
            }),
            _ => None,
        }
    }

    fn render(&self) -> String {
        format!(
            "{},{},{},{}",
            self.memory, self.temperature, self.latency_or_load, self.signal_or_disk
        )
    }
}

/// `captureResult`: "<completedAtMs>,<durationMs>,<resultRef>" for a stored
/// capture, "<completedAtMs>,<durationMs>,,<details>" for a failed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResultRecord {
    pub completed_at_ms: Millis,
    pub duration_ms: u64,
    pub result_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl CaptureResultRecord {
    pub fn stored(completed_at_ms: Millis, duration_ms: u64, result_ref: impl Into<String>) -> Self {
        Self {
            completed_at_ms,
            duration_ms,
            result_ref: result_ref.into(),
            failure: None,
        }
    }

    pub fn failed(completed_at_ms: Millis, duration_ms: u64, details: impl Into<String>) -> Self {
        Self {
            completed_at_ms,
            duration_ms,
            result_ref: String::new(),
            failure: Some(details.into()),
        }
    }
}

impl SlotSchema for CaptureResultRecord {
    const SLOT: Slot = Slot::CaptureResult;

    fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.trim().splitn(3, ',');
        let completed_at_ms = fields.next()?.parse().ok()?;
        let duration_ms = fields.next()?.parse().ok()?;
        let rest = fields.next()?;
        match rest.strip_prefix(',') {
            Some(details) => Some(Self::failed(completed_at_ms, duration_ms, details)),
            None if rest.is_empty() => None,
            None => Some(Self::stored(completed_at_ms, duration_ms, rest)),
        }
    }

    fn render(&self) -> String {
        match &self.failure {
            Some(details) => format!(
                "{},{},,{}",
                self.completed_at_ms,
                self.duration_ms,
                details.replace('\n', " ")
            ),
            None => format!(
                "{},{},{}",
                self.completed_at_ms, self.duration_ms, self.result_ref
            ),
        }
    }
}

/// `liveFrame`: monotonically increasing id of the latest live frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStamp {
    pub frame_id: u64,
}

impl SlotSchema for FrameStamp {
    const SLOT: Slot = Slot::LiveFrame;

    fn parse(raw: &str) -> Option<Self> {
        raw.trim()
            .parse()
            .ok()
            .map(|frame_id| FrameStamp { frame_id })
    }

    fn render(&self) -> String {
        self.frame_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_names_resolve() {
        for slot in Slot::ALL {
            assert_eq!(Slot::from_name(slot.name()), Some(slot));
        }
        assert_eq!(Slot::from_name("adminToken"), None);
        assert!(!Slot::CameraTelemetry.client_writable());
        assert!(Slot::LiveSession.client_writable());
    }

    #[test]
    fn test_live_enabled_rejects_garbage() {
        assert_eq!(LiveEnabled::parse("on\n"), Some(LiveEnabled(true)));
        assert_eq!(LiveEnabled::parse("off"), Some(LiveEnabled(false)));
        assert_eq!(LiveEnabled::parse("yes"), None);
    }

    #[test]
    fn test_quality_requires_three_fields() {
        assert_eq!(
            StreamQuality::parse("640 480 60"),
            Some(StreamQuality {
                width: 640,
                height: 480,
                quality_level: 60
            })
        );
        assert_eq!(StreamQuality::parse("640 480"), None);
        assert_eq!(StreamQuality::parse("640 480 60 1"), None);
        assert_eq!(StreamQuality::parse("0 480 60"), None);
    }

    #[test]
    fn test_session_stamp_parsing() {
        let stamp = SessionStamp::parse("1000:A1").unwrap();
        assert_eq!(stamp.timestamp_ms, 1000);
        assert_eq!(stamp.session_id, "A1");
        assert_eq!(stamp.render(), "1000:A1");

        assert_eq!(SessionStamp::parse("1000:"), None);
        assert_eq!(SessionStamp::parse("abc:A1"), None);
        assert_eq!(SessionStamp::parse(""), None);
    }

    #[test]
    fn test_telemetry_parsing() {
        let telemetry = CameraTelemetry::parse("45.5,61.2,120,-67").unwrap();
        assert_eq!(telemetry.memory, 45.5);
        assert_eq!(telemetry.signal_or_disk, -67.0);

        assert_eq!(CameraTelemetry::parse("1,2,3"), None);
        assert_eq!(CameraTelemetry::parse("1,2,x,4"), None);
    }

    #[test]
    fn test_capture_result_keeps_commas_in_reference() {
        let record = CaptureResultRecord::parse("2000,1500,captures/a,b.jpg").unwrap();
        assert_eq!(record.completed_at_ms, 2000);
        assert_eq!(record.duration_ms, 1500);
        assert_eq!(record.result_ref, "captures/a,b.jpg");
        assert!(record.failure.is_none());
    }

    #[test]
    fn test_failed_capture_result_keeps_details() {
        let record = CaptureResultRecord::failed(2000, 40, "exit status 1: lens cap on");
        assert_eq!(record.render(), "2000,40,,exit status 1: lens cap on");

        let parsed = CaptureResultRecord::parse(&record.render()).unwrap();
        assert_eq!(parsed.failure.as_deref(), Some("exit status 1: lens cap on"));
        assert!(parsed.result_ref.is_empty());
        assert_eq!(CaptureResultRecord::parse("2000,40,"), None);
    }
}

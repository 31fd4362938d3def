use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Tolerance applied to boundary smoothing, filler fit, and cooldown fuzzing.
pub const SLACK_MS: i64 = 9_900;

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub group_title: String,
    /// Epoch ms anchor of the lineup. Fixed at channel creation.
    pub start_time_ms: i64,
    /// Total ms of all lineup items; the lineup loops modulo this.
    pub duration_ms: i64,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub watermark: Option<Watermark>,
    #[serde(default)]
    pub offline: OfflineSettings,
    #[serde(default)]
    pub transcoding: Option<TranscodingOverrides>,
    /// Hidden from guides and M3U listings.
    #[serde(default)]
    pub stealth: bool,
    #[serde(default)]
    pub filler_collections: Vec<FillerCollection>,
    #[serde(default = "default_filler_repeat_cooldown_ms")]
    pub filler_repeat_cooldown_ms: i64,
    #[serde(default)]
    pub disable_filler_overlay: bool,
}

fn default_filler_repeat_cooldown_ms() -> i64 {
    30 * 60 * 1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineSettings {
    #[serde(default)]
    pub mode: OfflineMode,
    /// Still picture shown during offline slots (pic mode).
    #[serde(default)]
    pub picture: Option<String>,
    /// Soundtrack looped under offline slots.
    #[serde(default)]
    pub soundtrack: Option<String>,
    /// Static fallback clips used when the filler lottery comes up empty (clip mode).
    #[serde(default)]
    pub fallback: Vec<Program>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineMode {
    Clip,
    #[default]
    Pic,
}

/// Per-channel overrides layered over the global `[ffmpeg]` settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodingOverrides {
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub video_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub video_buffer_kb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// Percent of the output width.
    #[serde(default = "default_watermark_width")]
    pub width_percent: f64,
    #[serde(default)]
    pub vertical_margin_percent: f64,
    #[serde(default)]
    pub horizontal_margin_percent: f64,
    #[serde(default)]
    pub position: WatermarkPosition,
    /// Seconds the mark stays visible; 0 means forever.
    #[serde(default)]
    pub duration_secs: u32,
    #[serde(default)]
    pub fixed_size: bool,
    #[serde(default)]
    pub animated: bool,
}

fn default_watermark_width() -> f64 {
    6.25
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

/// Identity of a program across sources. Unique over the whole catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramKey {
    pub source_type: String,
    pub external_source_id: String,
    pub external_key: String,
}

impl ProgramKey {
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source_type, self.external_source_id, self.external_key
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramKind {
    Movie,
    Episode,
    Track,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub key: ProgramKey,
    pub kind: ProgramKind,
    pub duration_ms: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Container stats reported by the media source for this file.
    #[serde(default)]
    pub probe: Option<ProbeStats>,
}

impl Program {
    pub fn display_title(&self) -> String {
        match (&self.title, self.season, self.episode) {
            (Some(t), Some(s), Some(e)) => format!("{t} S{s:02}E{e:02}"),
            (Some(t), _, _) => t.clone(),
            _ => self.key.external_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Progressive,
    Interlaced,
}

/// Width/height/aspect/codec stats for a backing file, as probed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeStats {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_sar")]
    pub sar_num: u32,
    #[serde(default = "default_sar")]
    pub sar_den: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub video_codec: String,
    #[serde(default)]
    pub audio_codec: String,
    #[serde(default)]
    pub audio_index: Option<u32>,
    #[serde(default)]
    pub audio_only: bool,
}

fn default_sar() -> u32 {
    1
}

fn default_fps() -> f64 {
    25.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LineupItem {
    Content { program_id: Uuid, duration_ms: i64 },
    Redirect { channel_id: Uuid, duration_ms: i64 },
    Offline { duration_ms: i64 },
}

impl LineupItem {
    pub fn duration_ms(&self) -> i64 {
        match self {
            LineupItem::Content { duration_ms, .. }
            | LineupItem::Redirect { duration_ms, .. }
            | LineupItem::Offline { duration_ms } => *duration_ms,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, LineupItem::Offline { .. })
    }
}

/// A filler show referenced by a channel, weighted, with a per-channel cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillerCollection {
    pub show_id: Uuid,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub cooldown_ms: i64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillerShow {
    pub id: Uuid,
    pub name: String,
    pub clips: Vec<Program>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Program,
    Commercial,
    Offline,
    Loading,
    Error,
}

/// What a client actually receives for one lineup slot: the resolved source,
/// the seek point, and how long to play from this join.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub kind: StreamKind,
    pub title: String,
    pub source: Option<String>,
    /// Seek into the source before playback starts.
    pub start_ms: i64,
    /// How long this join plays before the concat loop reopens the stream.
    pub stream_duration_ms: i64,
    /// How much of the logical program elapsed before this join.
    pub beginning_offset_ms: i64,
    /// Full duration of the underlying program or slot.
    pub duration_ms: i64,
    pub probe: Option<ProbeStats>,
    pub error: Option<String>,
}

pub const LOADING_ITEM_MS: i64 = 40;

impl StreamItem {
    pub fn offline(duration_ms: i64) -> Self {
        StreamItem {
            kind: StreamKind::Offline,
            title: "Offline".to_string(),
            source: None,
            start_ms: 0,
            stream_duration_ms: duration_ms,
            beginning_offset_ms: 0,
            duration_ms,
            probe: None,
            error: None,
        }
    }

    pub fn offline_with_error(duration_ms: i64, message: impl Into<String>) -> Self {
        StreamItem {
            kind: StreamKind::Error,
            title: "Error".to_string(),
            error: Some(message.into()),
            ..StreamItem::offline(duration_ms)
        }
    }

    /// 40 ms black splice that stabilises the first concat transition.
    pub fn loading() -> Self {
        StreamItem {
            kind: StreamKind::Loading,
            title: "Loading".to_string(),
            ..StreamItem::offline(LOADING_ITEM_MS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineup_item_tags_round_trip() {
        let json = r#"{"type":"offline","duration_ms":5000}"#;
        let item: LineupItem = serde_json::from_str(json).unwrap();
        assert_eq!(item, LineupItem::Offline { duration_ms: 5000 });

        let redirect = LineupItem::Redirect {
            channel_id: Uuid::nil(),
            duration_ms: 60_000,
        };
        let text = serde_json::to_string(&redirect).unwrap();
        assert!(text.contains(r#""type":"redirect""#));
        assert_eq!(serde_json::from_str::<LineupItem>(&text).unwrap(), redirect);
    }

    #[test]
    fn program_cache_key_is_the_source_triple() {
        let key = ProgramKey {
            source_type: "plex".into(),
            external_source_id: "server-1".into(),
            external_key: "/library/metadata/42".into(),
        };
        assert_eq!(key.cache_key(), "plex|server-1|/library/metadata/42");
    }

    #[test]
    fn display_title_includes_episode_numbers() {
        let program = Program {
            id: Uuid::nil(),
            key: ProgramKey {
                source_type: "plex".into(),
                external_source_id: "s".into(),
                external_key: "k".into(),
            },
            kind: ProgramKind::Episode,
            duration_ms: 1,
            title: Some("Show".into()),
            season: Some(2),
            episode: Some(7),
            year: None,
            rating: None,
            icon: None,
            summary: None,
            file_path: None,
            probe: None,
        };
        assert_eq!(program.display_title(), "Show S02E07");
    }
}

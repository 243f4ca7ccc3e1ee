//! Pipeline output types embedded in the manifest.
//!
//! These are the durable shapes of what the stage transducers produce: the
//! video script, the multi-region SEO package, short-form hooks, the matched
//! voice profile and the audio collaborator's slot state. Validation of
//! LLM-produced JSON into these shapes lives here so every caller reports
//! the same issue codes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::validate::{check_unknown_keys, IssueCode, IssueList};

/// Maximum number of short-form hooks retained per project.
pub const MAX_SHORT_HOOKS: usize = 5;

/// Maximum accepted script title length.
pub const MAX_TITLE_CHARS: usize = 120;

/// Maximum accepted voiceover length per segment.
pub const MAX_VOICEOVER_CHARS: usize = 1200;

/// The closed set of visual directions a script segment may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualHint {
    /// Presenter on camera.
    TalkingHead,
    /// Screen recording or UI capture.
    ScreenCapture,
    /// Licensed stock footage.
    StockFootage,
    /// Motion graphics or animation.
    Animation,
    /// Full-frame text card.
    TextOverlay,
}

impl VisualHint {
    /// All accepted wire names, in schema order.
    pub const NAMES: &'static [&'static str] = &[
        "talking_head",
        "screen_capture",
        "stock_footage",
        "animation",
        "text_overlay",
    ];

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "talking_head" => Some(Self::TalkingHead),
            "screen_capture" => Some(Self::ScreenCapture),
            "stock_footage" => Some(Self::StockFootage),
            "animation" => Some(Self::Animation),
            "text_overlay" => Some(Self::TextOverlay),
            _ => None,
        }
    }
}

/// One timed segment of a video script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    /// Position in the video, `HH:MM`.
    pub timestamp: String,
    /// Narration text for the segment.
    pub voiceover: String,
    /// Visual direction for the renderer.
    pub visual_hint: VisualHint,
    /// Expected segment length in seconds; always positive.
    pub estimated_duration_seconds: f64,
}

/// A validated video script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Video title.
    pub title: String,
    /// Ordered segments.
    pub segments: Vec<ScriptSegment>,
}

impl Script {
    /// Total estimated duration across segments, in seconds.
    #[must_use]
    pub fn estimated_duration_seconds(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.estimated_duration_seconds)
            .sum()
    }
}

/// Region-specific SEO metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSeo {
    /// Localised title.
    pub title: String,
    /// Localised description.
    pub description: String,
    /// Ranked tag list.
    pub tags: Vec<String>,
    /// Keywords woven into the metadata, trend-ranked first.
    pub keywords: Vec<String>,
}

/// Multi-region SEO package keyed by region code (`us`, `tw`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeoPackage {
    /// Per-region metadata.
    pub regions: BTreeMap<String, RegionSeo>,
    /// Trend keywords that informed the package.
    #[serde(default)]
    pub trend_keywords: Vec<String>,
}

/// A short-form hook clip candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortHook {
    /// Source position in the script, `HH:MM`.
    pub timestamp: String,
    /// The hook line itself.
    pub hook_text: String,
    /// The emotional trigger the hook leans on.
    pub emotional_trigger: String,
    /// Generated call to action.
    pub call_to_action: String,
}

/// A matched narration voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Provider voice identifier.
    pub voice_id: String,
    /// Language the voice narrates.
    pub language: Language,
    /// Delivery style label.
    pub style: String,
}

/// Readiness of one audio language slot, maintained by the audio
/// collaborator and polled by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSlotStatus {
    /// Narration not yet produced.
    Pending,
    /// Narration file present and ready.
    Ready,
}

/// Audio collaborator state for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioState {
    /// Slot status per configured language.
    pub slots: BTreeMap<String, AudioSlotStatus>,
}

impl AudioState {
    /// Returns true when every configured slot reports ready.
    ///
    /// An empty slot map is not ready: it means the collaborator has not
    /// been configured yet.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        !self.slots.is_empty() && self.slots.values().all(|s| *s == AudioSlotStatus::Ready)
    }
}

/// Detected document language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// English.
    En,
    /// Chinese.
    Zh,
}

impl Language {
    /// Wire name of the language code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Zh => "zh",
        }
    }
}

/// Accumulated pipeline outputs for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentEngine {
    /// Validated video script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Script>,
    /// Multi-region SEO package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seo: Option<SeoPackage>,
    /// Short-form hook candidates, at most [`MAX_SHORT_HOOKS`].
    #[serde(default)]
    pub shorts: Vec<ShortHook>,
    /// Matched narration voice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_profile: Option<VoiceProfile>,
    /// Audio collaborator slot state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioState>,
}

/// Returns true for a well-formed `HH:MM` position.
#[must_use]
pub fn is_valid_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
    if !digits.iter().all(u8::is_ascii_digit) {
        return false;
    }
    let minutes = (bytes[3] - b'0') * 10 + (bytes[4] - b'0');
    minutes < 60
}

/// Validates an LLM-produced JSON value into a [`Script`].
///
/// The first issue is returned as a validation error carrying the issue
/// code that drives the degrade decision; segments are checked in order so
/// paths point at the earliest offender.
pub fn parse_script(value: &serde_json::Value) -> Result<Script> {
    let mut list = IssueList::new();
    check_unknown_keys(&mut list, "script", value, &["title", "segments"]);

    let title = match value.get("title").and_then(serde_json::Value::as_str) {
        Some(t) if t.trim().is_empty() => {
            list.push(IssueCode::TooSmall, "script.title", "title is empty");
            String::new()
        }
        Some(t) if t.chars().count() > MAX_TITLE_CHARS => {
            list.push(
                IssueCode::TooBig,
                "script.title",
                format!("title exceeds {MAX_TITLE_CHARS} characters"),
            );
            t.to_string()
        }
        Some(t) => t.to_string(),
        None => {
            list.push(IssueCode::InvalidType, "script.title", "expected a string");
            String::new()
        }
    };

    let mut segments = Vec::new();
    match value.get("segments").and_then(serde_json::Value::as_array) {
        None => list.push(
            IssueCode::InvalidType,
            "script.segments",
            "expected an array",
        ),
        Some(raw) if raw.is_empty() => list.push(
            IssueCode::TooSmall,
            "script.segments",
            "at least one segment is required",
        ),
        Some(raw) => {
            for (i, seg) in raw.iter().enumerate() {
                if let Some(parsed) = parse_segment(&mut list, i, seg) {
                    segments.push(parsed);
                }
            }
        }
    }

    list.finish()?;
    Ok(Script { title, segments })
}

fn parse_segment(
    list: &mut IssueList,
    index: usize,
    value: &serde_json::Value,
) -> Option<ScriptSegment> {
    let base = format!("script.segments[{index}]");
    check_unknown_keys(
        list,
        &base,
        value,
        &[
            "timestamp",
            "voiceover",
            "visual_hint",
            "estimated_duration_seconds",
        ],
    );

    let timestamp = match value.get("timestamp").and_then(serde_json::Value::as_str) {
        Some(t) if is_valid_timestamp(t) => t.to_string(),
        Some(t) => {
            list.push(
                IssueCode::InvalidString,
                format!("{base}.timestamp"),
                format!("'{t}' is not an HH:MM timestamp"),
            );
            return None;
        }
        None => {
            list.push(
                IssueCode::InvalidType,
                format!("{base}.timestamp"),
                "expected a string",
            );
            return None;
        }
    };

    let voiceover = match value.get("voiceover").and_then(serde_json::Value::as_str) {
        Some(v) if v.chars().count() > MAX_VOICEOVER_CHARS => {
            list.push(
                IssueCode::TooBig,
                format!("{base}.voiceover"),
                format!("voiceover exceeds {MAX_VOICEOVER_CHARS} characters"),
            );
            return None;
        }
        Some(v) => v.to_string(),
        None => {
            list.push(
                IssueCode::InvalidType,
                format!("{base}.voiceover"),
                "expected a string",
            );
            return None;
        }
    };

    let visual_hint = match value.get("visual_hint").and_then(serde_json::Value::as_str) {
        Some(h) => match VisualHint::from_wire(h) {
            Some(hint) => hint,
            None => {
                list.push(
                    IssueCode::InvalidEnumValue,
                    format!("{base}.visual_hint"),
                    format!("'{h}' is not one of {:?}", VisualHint::NAMES),
                );
                return None;
            }
        },
        None => {
            list.push(
                IssueCode::InvalidType,
                format!("{base}.visual_hint"),
                "expected a string",
            );
            return None;
        }
    };

    let duration = value
        .get("estimated_duration_seconds")
        .and_then(serde_json::Value::as_f64);
    let estimated_duration_seconds = match duration {
        Some(d) if d > 0.0 => d,
        Some(d) => {
            list.push(
                IssueCode::TooSmall,
                format!("{base}.estimated_duration_seconds"),
                format!("duration must be positive, got {d}"),
            );
            return None;
        }
        None => {
            list.push(
                IssueCode::InvalidType,
                format!("{base}.estimated_duration_seconds"),
                "expected a number",
            );
            return None;
        }
    };

    Some(ScriptSegment {
        timestamp,
        voiceover,
        visual_hint,
        estimated_duration_seconds,
    })
}

//! Stage transducers: prompts and output shaping.
//!
//! Pure transformations between LLM fabric output and the manifest's
//! content types. Every LLM-produced JSON document is validated through
//! the core issue validator before it is accepted; prompts live here so
//! schema and prompt stay side by side.

use vellum_core::content::{
    Language, RegionSeo, Script, SeoPackage, ShortHook, VisualHint, VoiceProfile, MAX_SHORT_HOOKS,
};
use vellum_core::error::{Error, Result};
use vellum_core::manifest::InputSource;
use vellum_core::validate::{check_unknown_keys, IssueCode, IssueList};

/// Regions every SEO package must cover.
pub const SEO_REGIONS: &[&str] = &["us", "tw"];

/// Emotional triggers accepted on short hooks.
pub const EMOTIONAL_TRIGGERS: &[&str] =
    &["curiosity", "surprise", "urgency", "joy", "controversy"];

/// Parses fabric output as a JSON document.
///
/// # Errors
///
/// Unparseable text is a validation failure at the given root path, coded
/// `invalid_type` so it is eligible for degradation.
pub fn parse_llm_json(text: &str, root: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| Error::Validation {
        code: IssueCode::InvalidType,
        path: root.to_string(),
        message: format!("response is not valid JSON: {e}"),
    })
}

/// Prompt for the script generation stage.
#[must_use]
pub fn script_prompt(input: &InputSource) -> String {
    let language_rule = match input.language {
        Language::Zh => "Write the voiceover in Traditional Chinese.",
        Language::En => "Write the voiceover in English.",
    };
    format!(
        "You are a video script writer. Turn the document below into a video \
         script. Return JSON only: {{\"title\": string, \"segments\": \
         [{{\"timestamp\": \"HH:MM\", \"voiceover\": string, \"visual_hint\": \
         one of {hints:?}, \"estimated_duration_seconds\": positive number}}]}}. \
         {language_rule}\n\nDocument ({words} words):\n{content}",
        hints = VisualHint::NAMES,
        words = input.word_count,
        content = input.content,
    )
}

/// Prompt for the SEO generation stage.
#[must_use]
pub fn seo_prompt(script: &Script, trend_keywords: &[String]) -> String {
    format!(
        "Generate SEO metadata for a video titled {title:?}. Return JSON only: \
         {{\"regions\": {{\"us\": {{\"title\": string, \"description\": string, \
         \"tags\": [string], \"keywords\": [string]}}, \"tw\": {{...}}}}}}. \
         Weave in these trending keywords where natural: {keywords:?}.",
        title = script.title,
        keywords = trend_keywords,
    )
}

/// Prompt for the shorts extraction stage.
#[must_use]
pub fn shorts_prompt(script: &Script) -> String {
    let outline: Vec<String> = script
        .segments
        .iter()
        .map(|s| format!("[{}] {}", s.timestamp, s.voiceover))
        .collect();
    format!(
        "Pick at most {MAX_SHORT_HOOKS} short-form hook moments from this \
         script. Return JSON only: {{\"hooks\": [{{\"timestamp\": \"HH:MM\", \
         \"hook_text\": string, \"emotional_trigger\": one of \
         {EMOTIONAL_TRIGGERS:?}, \"call_to_action\": string}}]}}.\n\n{}",
        outline.join("\n"),
    )
}

/// Validates an SEO JSON document into a [`SeoPackage`].
///
/// # Errors
///
/// The first schema issue as a validation error.
pub fn parse_seo(value: &serde_json::Value, trend_keywords: &[String]) -> Result<SeoPackage> {
    let mut list = IssueList::new();
    check_unknown_keys(&mut list, "seo", value, &["regions"]);

    let mut package = SeoPackage {
        trend_keywords: trend_keywords.to_vec(),
        ..SeoPackage::default()
    };

    match value.get("regions").and_then(serde_json::Value::as_object) {
        None => list.push(IssueCode::InvalidType, "seo.regions", "expected an object"),
        Some(regions) => {
            for region in SEO_REGIONS {
                match regions.get(*region) {
                    None => list.push(
                        IssueCode::MissingField,
                        format!("seo.regions.{region}"),
                        format!("region '{region}' is required"),
                    ),
                    Some(raw) => {
                        if let Some(parsed) = parse_region(&mut list, region, raw) {
                            package.regions.insert((*region).to_string(), parsed);
                        }
                    }
                }
            }
        }
    }

    list.finish()?;
    Ok(package)
}

fn parse_region(
    list: &mut IssueList,
    region: &str,
    value: &serde_json::Value,
) -> Option<RegionSeo> {
    let base = format!("seo.regions.{region}");
    let string_field = |list: &mut IssueList, field: &str| -> Option<String> {
        match value.get(field).and_then(serde_json::Value::as_str) {
            Some(s) if !s.trim().is_empty() => Some(s.to_string()),
            Some(_) => {
                list.push(
                    IssueCode::TooSmall,
                    format!("{base}.{field}"),
                    format!("{field} is empty"),
                );
                None
            }
            None => {
                list.push(
                    IssueCode::InvalidType,
                    format!("{base}.{field}"),
                    "expected a string",
                );
                None
            }
        }
    };
    let string_list = |list: &mut IssueList, field: &str| -> Vec<String> {
        match value.get(field).and_then(serde_json::Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            None => {
                list.push(
                    IssueCode::InvalidType,
                    format!("{base}.{field}"),
                    "expected an array of strings",
                );
                Vec::new()
            }
        }
    };

    let title = string_field(list, "title")?;
    let description = string_field(list, "description")?;
    let tags = string_list(list, "tags");
    let keywords = string_list(list, "keywords");
    Some(RegionSeo {
        title,
        description,
        tags,
        keywords,
    })
}

/// Validates a shorts JSON document into at most [`MAX_SHORT_HOOKS`] hooks.
///
/// A missing call to action is generated from the hook text rather than
/// rejected; an unknown emotional trigger is a validation failure.
///
/// # Errors
///
/// The first schema issue as a validation error.
pub fn parse_shorts(value: &serde_json::Value) -> Result<Vec<ShortHook>> {
    let mut list = IssueList::new();
    check_unknown_keys(&mut list, "shorts", value, &["hooks"]);

    let mut hooks = Vec::new();
    match value.get("hooks").and_then(serde_json::Value::as_array) {
        None => list.push(IssueCode::InvalidType, "shorts.hooks", "expected an array"),
        Some(raw) => {
            for (i, hook) in raw.iter().take(MAX_SHORT_HOOKS).enumerate() {
                let base = format!("shorts.hooks[{i}]");
                let timestamp = hook
                    .get("timestamp")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if !vellum_core::content::is_valid_timestamp(timestamp) {
                    list.push(
                        IssueCode::InvalidString,
                        format!("{base}.timestamp"),
                        format!("'{timestamp}' is not an HH:MM timestamp"),
                    );
                    continue;
                }
                let Some(hook_text) = hook
                    .get("hook_text")
                    .and_then(serde_json::Value::as_str)
                    .filter(|t| !t.trim().is_empty())
                else {
                    list.push(
                        IssueCode::InvalidType,
                        format!("{base}.hook_text"),
                        "expected a non-empty string",
                    );
                    continue;
                };
                let trigger = hook
                    .get("emotional_trigger")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if !EMOTIONAL_TRIGGERS.contains(&trigger) {
                    list.push(
                        IssueCode::InvalidEnumValue,
                        format!("{base}.emotional_trigger"),
                        format!("'{trigger}' is not one of {EMOTIONAL_TRIGGERS:?}"),
                    );
                    continue;
                }
                let call_to_action = hook
                    .get("call_to_action")
                    .and_then(serde_json::Value::as_str)
                    .map_or_else(|| generate_cta(hook_text), str::to_string);

                hooks.push(ShortHook {
                    timestamp: timestamp.to_string(),
                    hook_text: hook_text.to_string(),
                    emotional_trigger: trigger.to_string(),
                    call_to_action,
                });
            }
        }
    }

    list.finish()?;
    Ok(hooks)
}

/// Generates a fallback call to action from the hook line.
fn generate_cta(hook_text: &str) -> String {
    let teaser: String = hook_text.chars().take(40).collect();
    format!("Watch the full breakdown: {teaser}...")
}

/// Pure voice profile lookup by document language.
#[must_use]
pub fn match_voice(language: Language) -> VoiceProfile {
    match language {
        Language::En => VoiceProfile {
            voice_id: "en-US-Neural2-D".to_string(),
            language,
            style: "narration".to_string(),
        },
        Language::Zh => VoiceProfile {
            voice_id: "cmn-TW-Wavenet-A".to_string(),
            language,
            style: "narration".to_string(),
        },
    }
}

/// Renders a narration markdown document for the audio collaborator.
#[must_use]
pub fn narration_markdown(script: &Script, language: &str) -> String {
    let mut out = format!("# {} ({language})\n\n", script.title);
    for segment in &script.segments {
        out.push_str(&format!("## {}\n\n{}\n\n", segment.timestamp, segment.voiceover));
    }
    out
}

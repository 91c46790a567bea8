//! Text-to-speech tool. Synthesised audio is queued per user and delivered
//! by the pipeline after the streaming loop completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::services::Services;

use super::{Tool, ToolError};

pub const MAX_TTS_TEXT_LENGTH: usize = 2000;

const DEFAULT_HOST: &str = "eastus.tts.speech.microsoft.com";
const HOST_SUFFIX: &str = ".tts.speech.microsoft.com";
const DEFAULT_OUTPUT_FORMAT: &str = "ogg-24khz-16bit-mono-opus";
const VOICE_LIST_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone)]
pub struct VoiceJob {
    pub audio: Vec<u8>,
    pub filename: String,
    pub caption: Option<String>,
}

pub struct TtsTool {
    services: Arc<Services>,
    client: reqwest::Client,
    api_key: Option<String>,
    default_endpoint: String,
    default_voice: String,
    default_style: String,
    pending: Mutex<HashMap<i64, Vec<VoiceJob>>>,
    voice_cache: tokio::sync::Mutex<Option<(Instant, Vec<Value>)>>,
}

impl TtsTool {
    pub fn new(
        services: Arc<Services>,
        api_key: Option<String>,
        default_endpoint: String,
        default_voice: String,
        default_style: String,
    ) -> Self {
        Self {
            services,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(45))
                .build()
                .unwrap_or_default(),
            api_key,
            default_endpoint,
            default_voice,
            default_style,
            pending: Mutex::new(HashMap::new()),
            voice_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Drain this user's queued voice messages, ordered by enqueue time.
    pub fn drain_pending(&self, user_id: i64) -> Vec<VoiceJob> {
        self.pending.lock().expect("tts queue lock poisoned").remove(&user_id).unwrap_or_default()
    }

    fn enqueue(&self, user_id: i64, job: VoiceJob) {
        self.pending
            .lock()
            .expect("tts queue lock poisoned")
            .entry(user_id)
            .or_default()
            .push(job);
    }

    fn resolve_host(&self, user_endpoint: &str) -> String {
        let configured = normalize_endpoint(user_endpoint);
        if !configured.is_empty() {
            return configured;
        }
        let fallback = normalize_endpoint(&self.default_endpoint);
        if fallback.is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            fallback
        }
    }

    async fn synthesize(
        &self,
        host: &str,
        ssml: String,
        output_format: &str,
    ) -> Result<Vec<u8>, ToolError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ToolError::TtsFailed("TTS_API_KEY not configured".to_string()))?;
        let resp = self
            .client
            .post(format!("https://{host}/cognitiveservices/v1"))
            .header("Ocp-Apim-Subscription-Key", key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", output_format)
            .body(ssml)
            .send()
            .await
            .map_err(|e| ToolError::TtsFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolError::TtsFailed(format!("synthesis HTTP {}", resp.status())));
        }
        Ok(resp.bytes().await.map_err(|e| ToolError::TtsFailed(e.to_string()))?.to_vec())
    }

    async fn voice_list(&self, host: &str) -> Option<Vec<Value>> {
        let mut cache = self.voice_cache.lock().await;
        if let Some((fetched, voices)) = cache.as_ref() {
            if fetched.elapsed() < VOICE_LIST_TTL {
                return Some(voices.clone());
            }
        }
        let key = self.api_key.as_ref()?;
        let resp = self
            .client
            .get(format!("https://{host}/cognitiveservices/voices/list"))
            .header("Ocp-Apim-Subscription-Key", key)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            warn!("voice list request failed: HTTP {}", resp.status());
            return None;
        }
        let voices: Vec<Value> = resp.json().await.ok()?;
        *cache = Some((Instant::now(), voices.clone()));
        Some(voices)
    }

    async fn speak(&self, user_id: i64, arguments: &Value) -> String {
        let text = arguments["text"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            return "TTS failed: empty text.".to_string();
        }
        if text.chars().count() > MAX_TTS_TEXT_LENGTH {
            return format!(
                "TTS failed: text too long ({} chars). Limit is {MAX_TTS_TEXT_LENGTH} chars.",
                text.chars().count()
            );
        }

        let settings = self.services.get_user_settings(user_id);

        // User settings win over tool-call arguments; both fall back to the
        // environment defaults.
        let configured_voice = settings.tts_voice.trim().to_string();
        let requested_voice = arguments["voice_name"].as_str().unwrap_or("").trim().to_string();
        let mut voice_name = if !configured_voice.is_empty() {
            configured_voice
        } else if !requested_voice.is_empty() {
            requested_voice.clone()
        } else {
            self.default_voice.clone()
        };

        let configured_style = settings.tts_style.trim().to_lowercase();
        let requested_style = arguments["style"].as_str().unwrap_or("").trim().to_lowercase();
        let mut style = if !configured_style.is_empty() {
            configured_style
        } else if !requested_style.is_empty() {
            requested_style
        } else {
            self.default_style.clone()
        };
        if style.is_empty() {
            style = "general".to_string();
        }

        let host = self.resolve_host(&settings.tts_endpoint);

        // Validate the voice against the live list, falling back when gone.
        let mut fallback_note = String::new();
        if let Some(voices) = self.voice_list(&host).await {
            let short_names: Vec<&str> =
                voices.iter().filter_map(|v| v["ShortName"].as_str()).collect();
            if !short_names.is_empty() && !short_names.contains(&voice_name.as_str()) {
                let mut fallback = self.default_voice.clone();
                if !short_names.contains(&fallback.as_str())
                    && short_names.contains(&requested_voice.as_str())
                {
                    fallback = requested_voice.clone();
                }
                fallback_note =
                    format!(" Requested voice '{voice_name}' not found, fallback to '{fallback}'.");
                voice_name = fallback;
            }
        }

        let rate = normalize_percent(&arg_string(&arguments["rate"]), "0");
        let pitch = normalize_percent(&arg_string(&arguments["pitch"]), "0");
        let output_format = arguments["output_format"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_OUTPUT_FORMAT)
            .to_string();

        let ssml = build_ssml(&text, &voice_name, &rate, &pitch, &style);
        let audio = match self.synthesize(&host, ssml, &output_format).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(user_id, "tts_speak failed: {e}");
                return e.to_string();
            }
        };

        let extension = guess_audio_extension(&output_format);
        let chars = text.chars().count();
        self.enqueue(
            user_id,
            VoiceJob {
                audio,
                filename: format!("tts.{extension}"),
                caption: Some(format!("🎤 {voice_name} ({style})")),
            },
        );

        format!(
            "Voice generated and queued for delivery. voice={voice_name}, style={style}, \
             endpoint={host}, chars={chars}.{fallback_note}"
        )
    }

    async fn list_voices(&self, user_id: i64, arguments: &Value) -> String {
        let locale = arguments["locale"].as_str().unwrap_or("").trim().to_lowercase();
        let limit = arguments["limit"].as_u64().map(|n| n as usize).unwrap_or(20).clamp(1, 50);

        let settings = self.services.get_user_settings(user_id);
        let host = self.resolve_host(&settings.tts_endpoint);
        let Some(voices) = self.voice_list(&host).await else {
            return "Failed to fetch voice list.".to_string();
        };

        let filtered: Vec<&Value> = voices
            .iter()
            .filter(|v| {
                locale.is_empty()
                    || v["Locale"].as_str().map(|l| l.to_lowercase()) == Some(locale.clone())
            })
            .collect();
        if filtered.is_empty() {
            return format!("No voices found for locale: {locale}");
        }

        let shown = &filtered[..filtered.len().min(limit)];
        let lines: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let styles = v["StyleList"]
                    .as_array()
                    .map(|list| {
                        list.iter().filter_map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    })
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "general".to_string());
                format!(
                    "{}. {} | locale={} | gender={} | styles={styles}",
                    i + 1,
                    v["ShortName"].as_str().unwrap_or("unknown"),
                    v["Locale"].as_str().unwrap_or("unknown"),
                    v["Gender"].as_str().unwrap_or("unknown"),
                )
            })
            .collect();
        format!("Available voices ({}/{}):\n{}", shown.len(), filtered.len(), lines.join("\n"))
    }
}

#[async_trait]
impl Tool for TtsTool {
    fn name(&self) -> &'static str {
        "tts"
    }

    fn definitions(&self) -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "function": {
                    "name": "tts_speak",
                    "description": "Convert text to speech and send as a voice message. \
                        Supports optional voice and speaking style.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "text": { "type": "string", "description": "Text content that should be spoken" },
                            "voice_name": {
                                "type": "string",
                                "description": "Optional voice name, e.g. zh-CN-XiaoxiaoMultilingualNeural"
                            },
                            "style": {
                                "type": "string",
                                "description": "Optional style, e.g. general/chat/assistant/cheerful/sad"
                            },
                            "rate": { "type": "string", "description": "Optional speaking rate percentage, e.g. -10, 0, 15" },
                            "pitch": { "type": "string", "description": "Optional pitch percentage, e.g. -5, 0, 8" },
                            "output_format": {
                                "type": "string",
                                "description": "Optional output format",
                                "enum": ["ogg-24khz-16bit-mono-opus", "audio-24khz-48kbitrate-mono-mp3"],
                                "default": "ogg-24khz-16bit-mono-opus"
                            }
                        },
                        "required": ["text"]
                    }
                }
            }),
            json!({
                "type": "function",
                "function": {
                    "name": "tts_list_voices",
                    "description": "List available TTS voices and styles.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "locale": { "type": "string", "description": "Optional locale filter, e.g. zh-CN, en-US" },
                            "limit": { "type": "integer", "description": "Maximum voices to return (default 20, max 50)", "default": 20 }
                        },
                        "required": []
                    }
                }
            }),
        ]
    }

    async fn execute(&self, user_id: i64, tool_name: &str, arguments: &Value) -> Option<String> {
        match tool_name {
            "tts_speak" => Some(self.speak(user_id, arguments).await),
            "tts_list_voices" => Some(self.list_voices(user_id, arguments).await),
            other => Some(format!("Unknown tts tool: {other}")),
        }
    }

    fn instruction(&self) -> &'static str {
        "\n\nYou have TTS tools to generate voice messages.\n\
         - Use tts_speak when user asks for spoken/voice output.\n\
         - Prefer /set voice and /set style as defaults.\n\
         - Do not set voice_name/style arguments unless user explicitly requests a temporary override.\n\
         - Keep spoken text concise and natural.\n\
         - Use tts_list_voices when user asks what voices are available."
    }
}

/// Models sometimes pass prosody values as numbers instead of strings.
fn arg_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Accept a region alias ("southeastasia") or a full host, with or without a
/// scheme prefix.
fn normalize_endpoint(value: &str) -> String {
    let mut text = value.trim().to_lowercase();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.to_string();
        }
    }
    let text = text.trim_matches(['/', ' ']).to_string();
    if text.is_empty() {
        return text;
    }
    if !text.contains('.') {
        return format!("{text}{HOST_SUFFIX}");
    }
    text
}

fn normalize_percent(value: &str, default: &str) -> String {
    let text = value.trim().trim_end_matches('%').trim();
    if text.is_empty() {
        return default.to_string();
    }
    match text.parse::<f64>() {
        Ok(number) if number.fract() == 0.0 => format!("{}", number as i64),
        Ok(number) => format!("{number:.2}").trim_end_matches('0').trim_end_matches('.').to_string(),
        Err(_) => default.to_string(),
    }
}

fn build_ssml(text: &str, voice_name: &str, rate: &str, pitch: &str, style: &str) -> String {
    let safe_text = text
        .trim()
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        r#"<speak xmlns="http://www.w3.org/2001/10/synthesis" xmlns:mstts="http://www.w3.org/2001/mstts" version="1.0" xml:lang="zh-CN"><voice name="{voice_name}"><mstts:express-as style="{style}" styledegree="1.0" role="default"><prosody rate="{rate}%" pitch="{pitch}%">{safe_text}</prosody></mstts:express-as></voice></speak>"#
    )
}

fn guess_audio_extension(output_format: &str) -> &'static str {
    let target = output_format.to_lowercase();
    if target.contains("opus") || target.contains("ogg") {
        "ogg"
    } else if target.contains("wav") {
        "wav"
    } else {
        "mp3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_region_alias_expands_to_host() {
        assert_eq!(normalize_endpoint("southeastasia"), "southeastasia.tts.speech.microsoft.com");
        assert_eq!(normalize_endpoint("https://custom.example.com/"), "custom.example.com");
        assert_eq!(normalize_endpoint(""), "");
    }

    #[test]
    fn percent_values_normalize() {
        assert_eq!(normalize_percent("10%", "0"), "10");
        assert_eq!(normalize_percent("-5", "0"), "-5");
        assert_eq!(normalize_percent("1.50", "0"), "1.5");
        assert_eq!(normalize_percent("junk", "0"), "0");
        assert_eq!(normalize_percent("", "0"), "0");
    }

    #[test]
    fn ssml_escapes_text() {
        let ssml = build_ssml("a < b & c", "voice", "0", "0", "general");
        assert!(ssml.contains("a &lt; b &amp; c"));
    }

    #[test]
    fn audio_extension_follows_format() {
        assert_eq!(guess_audio_extension("ogg-24khz-16bit-mono-opus"), "ogg");
        assert_eq!(guess_audio_extension("audio-24khz-48kbitrate-mono-mp3"), "mp3");
    }
}

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use facttrace_contracts::chat::{
    ChatMessage, ChatTranscript, CHAT_FAILURE_TEXT, CHAT_GREETING, EMPTY_REPLY_TEXT,
};
use facttrace_contracts::events::EventWriter;
use facttrace_contracts::models::ModelSelector;
use facttrace_contracts::report::ForensicReport;
use facttrace_contracts::sources::{
    collect_supporting_sources, dedupe_grounding, reconcile_sources, GroundingSource,
    ReconciledSource, DEFAULT_GROUNDING_TITLE,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_MEDIA_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_THINKING_BUDGET: u32 = 32768;

const VISION_CAPABILITY: &str = "vision";
const REQUEST_TIMEOUT_S: f64 = 120.0;
const TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;

const ANALYSIS_USER_INSTRUCTION: &str = "Perform a deep visual search (Lens style) and news analysis. Return forensic JSON. Detect Language: English or Bengali.";
const CHAT_SEED_INSTRUCTION: &str = "Analyze this media and provide a forensic report.";
const DEFAULT_CLAIM_INSTRUCTION: &str = "No specific claim provided. Analyze for authenticity.";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("media is {size} bytes, over the 20 MiB ceiling")]
    TooLarge { size: u64 },
    #[error("unsupported media type '{media_type}'; expected image/* or video/*")]
    UnsupportedType { media_type: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("model returned no analysis text")]
    EmptyOutput,
    #[error("model returned an unreadable report structure: {raw}")]
    MalformedJson { raw: String },
}

/// Media exactly as the user supplied it. Bytes pass through untouched; the
/// only gatekeeping is the size ceiling and the image/video type check, both
/// applied before any network interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    bytes: Vec<u8>,
    media_type: String,
}

impl MediaPayload {
    pub fn from_bytes(bytes: Vec<u8>, media_type: impl Into<String>) -> Result<Self, EncodeError> {
        let media_type = media_type.into();
        if !(media_type.starts_with("image/") || media_type.starts_with("video/")) {
            return Err(EncodeError::UnsupportedType { media_type });
        }
        if bytes.len() as u64 > MAX_MEDIA_BYTES {
            return Err(EncodeError::TooLarge {
                size: bytes.len() as u64,
            });
        }
        Ok(Self { bytes, media_type })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn is_video(&self) -> bool {
        self.media_type.starts_with("video/")
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.media_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

/// Reads a user-selected file into a payload. The size check runs against
/// file metadata so an oversized file is rejected without being read.
pub fn encode_media_file(path: &Path) -> Result<MediaPayload> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if metadata.len() > MAX_MEDIA_BYTES {
        return Err(EncodeError::TooLarge {
            size: metadata.len(),
        }
        .into());
    }
    let media_type = media_type_for_path(path).ok_or_else(|| EncodeError::UnsupportedType {
        media_type: path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("unknown")
            .to_string(),
    })?;
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(MediaPayload::from_bytes(bytes, media_type)?)
}

pub fn media_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        _ => None,
    }
}

/// Everything the oracle needs for one analysis round trip. Pure data; the
/// builder performs no I/O.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub payload: Arc<MediaPayload>,
    pub claim: String,
    pub model: String,
    pub thinking_budget: u32,
}

impl AnalysisRequest {
    pub fn new(payload: Arc<MediaPayload>, claim: &str, model: &str) -> Self {
        Self {
            payload,
            claim: claim.trim().to_string(),
            model: model.to_string(),
            thinking_budget: DEFAULT_THINKING_BUDGET,
        }
    }

    pub fn system_instruction(&self) -> String {
        build_system_instruction(&self.claim)
    }
}

pub fn analysis_user_instruction() -> &'static str {
    ANALYSIS_USER_INSTRUCTION
}

const SYSTEM_PREAMBLE: &str = r#"You are "FactTrace," an elite digital forensics engine.
Your mission is to verify media authenticity by performing a "Google Lens" style visual analysis and a deep "Google Search" for news and social context.

LANGUAGE OPERATING SYSTEM (BILINGUAL CORE):
* **Primary Languages:** Bengali (Bangla) & English.
* **Auto-Detection:** Instantly identify the language of the USER CLAIM or text content within the media.
* **Response Rule:**
   - If the user asks/inputs in **English**, the report text values MUST be in **English**.
   - If the user asks/inputs in **Bangla**, the report text values MUST be in **Bangla**.
   - **Exception:** Keep JSON Keys (e.g., "visualEvidence", "geospatialHistory") and Enum values (e.g., "RED", "GREEN", "YELLOW", "Exact Match", "Image") in ENGLISH. Only translate the human-readable descriptions, summaries, and status.
* **Cross-Language Analysis:** If a rumor is found in English databases (e.g., Snopes) but the user asks in Bangla, you must *translate and contextualize* the findings into Bangla."#;

const SYSTEM_PROTOCOL: &str = r#"OPERATIONAL PROTOCOL:
1. **VISUAL CROSS-REFERENCING (Google Lens Simulation):**
   - Use the 'googleSearch' tool to find *exact* visual matches of the uploaded media.
   - Identify if this specific image/video has appeared before (Reverse Image Search logic).
   - Look for the *original* source (high-res, uncropped).
   - Identify visually similar images or earlier versions and their sources.

2. **NEWS & FACT-CHECK SEARCH:**
   - Search for recent news articles that feature this specific image/video.
   - Verify if reputable news organizations have already debunked or verified this content.

3. **SOCIAL MEDIA RECON:**
   - Specifically search for this media on X (Twitter), Facebook, Instagram, YouTube, TikTok, and Reddit.
   - Identify the earliest instance or "Patient Zero" post.

4. **GEOSPATIAL & AI ANALYSIS:**
   - Verify location claims against visual evidence (maps, street view data).
   - Detect synthetic patterns (AI generation artifacts).

5. **GEOSPATIAL HISTORY CHECK:**
   - **Core Task:** Verify location claim by comparing "Present Reality" vs. "Historical Data".
   - **Action:** Identify coordinates/landmarks. Compare current satellite/street view data against historical knowledge or archives.
   - **Look for:** New buildings, demolished structures, changes in road layout, or tree growth.
   - **Logic:** If the user claims video is from "Today", but the video shows a building demolished 2 years ago, the claim is FALSE.
   - **Output:** Provide a comparative analysis in the 'geospatialHistory' JSON field.

OUTPUT FORMAT:
You MUST return ONLY the raw JSON object. No markdown blocks (```), no preambles.

CRITICAL - URL HANDLING:
* **DO NOT HALLUCINATE URLS.**
* Use ONLY URLs that are provided by the 'googleSearch' tool output.
* If you cannot find a specific direct link for a section (like 'similarImages'), **you MUST provide a Google Search Query URL** instead (e.g., "https://www.google.com/search?q=description+of+image").
* Broken links destroy trust. Better to link to a Google Search result than a 404 page.

JSON STRUCTURE:
{
  "verdictColor": "RED" | "YELLOW" | "GREEN",
  "status": "Short status in Target Language (e.g., 'Fake News Detected' or 'মিথ্যা তথ্য শনাক্ত')",
  "visualEvidence": {
    "originTrace": "First known appearance date/platform (in Target Language)",
    "visualMatch": "Is this a known viral image? (Yes/No + Context in Target Language)",
    "similarImages": [
      {
        "url": "Source Page URL OR Google Search Query URL (MUST BE VALID)",
        "description": "Brief description of the similar image (in Target Language)",
        "source": "Source website name (e.g., Pinterest, News Site)"
      }
    ],
    "supportingSources": [ { "title": "Source Title", "url": "URL" } ]
  },
  "locationAnalysis": {
    "claimedVsActual": "Does it match the claimed location? (in Target Language)",
    "clues": ["Landmarks", "Weather", "Street Signs" (in Target Language)],
    "estimatedCoordinates": "Lat/Long or Specific Area",
    "estimatedDate": "Est. Date (in Target Language)",
    "geospatialHistory": {
      "currentView": "Description of present reality (e.g., 2024/2025 state) (in Target Language)",
      "currentUrl": "Link to Google Maps or current image if available",
      "historicalView": "Description of historical state (e.g., 1-5 years ago) (in Target Language)",
      "historicalUrl": "Link to archive if available",
      "analysis": "Comparative analysis of differences (in Target Language)",
      "verdict": "Location Verified / Location Mismatch (in Target Language)"
    },
    "supportingSources": [ { "title": "Map/News Source", "url": "URL" } ]
  },
  "aiCheck": {
    "verdict": "Real" | "AI-Generated" | "Edited" | "Inconclusive" (Keep English Enum),
    "forensicNote": "Technical analysis of pixels/frames (in Target Language)",
    "supportingSources": [ { "title": "Tool/Reference", "url": "URL" } ]
  },
  "detailedSearch": {
    "queries": ["Exact Google Search queries used"],
    "relatedTopics": ["News Topics", "Events" (in Target Language)],
    "mediaMatches": [
       {
         "type": "Exact Match" | "Similar" | "Related" (Keep English Enum),
         "mediaType": "Image" | "Video" | "Article" (Keep English Enum),
         "description": "Headline or description of the finding (in Target Language)",
         "source": "News Outlet or Website Name",
         "imageUrl": "Direct URL to thumbnail if available"
       }
    ],
    "socialAnalysis": [
      {
        "platform": "Facebook" | "X" | "Instagram" | "YouTube" | "TikTok" | "Reddit" | "Other" (Keep English Enum),
        "url": "Direct Link to Post OR Google Search Query URL",
        "author": "User/Channel Name",
        "date": "Post Date",
        "contentSnippet": "What they said (in Target Language)",
        "imageUrl": "Post thumbnail URL (if found)"
      }
    ],
    "supportingSources": [ { "title": "Fact Check/News Link", "url": "URL" } ]
  },
  "journalistSummary": "Synthesized conclusion based on search results (in Target Language)."
}"#;

const CHAT_SYSTEM_INSTRUCTION: &str = r#"You are "FactTrace," an expert digital forensics assistant.

LANGUAGE OPERATING SYSTEM (BILINGUAL CORE):
- **Primary Languages:** Bengali (Bangla) & English.
- **Rule:** Respond in the SAME language as the user's last message.
- **Cross-Language:** If you find evidence in English but the user asks in Bangla, translate the essence to Bangla.

Your goal is to answer FOLLOW-UP questions about the forensic report.
- If the user asks for "more articles", use the 'googleSearch' tool to find them.
- If the user asks about a specific visual detail, use your vision capabilities.
- Provide direct links where possible."#;

/// Fixes the full analysis contract: persona, bilingual policy, operational
/// protocol, raw-JSON output rule, and the no-hallucinated-URLs rule. An
/// empty claim substitutes the default "analyze for authenticity" context.
pub fn build_system_instruction(claim: &str) -> String {
    let claim_text = {
        let trimmed = claim.trim();
        if trimmed.is_empty() {
            DEFAULT_CLAIM_INSTRUCTION
        } else {
            trimmed
        }
    };
    format!("{SYSTEM_PREAMBLE}\n\nUSER CLAIM (Context): \"{claim_text}\"\n\n{SYSTEM_PROTOCOL}")
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub grounding: Vec<GroundingSource>,
}

/// The generative model is a non-deterministic black box. Everything the
/// engine needs from it fits behind this trait, so tests substitute mocks
/// and offline runs use the dryrun oracle.
pub trait ForensicModel: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, request: &AnalysisRequest) -> Result<ModelReply>;
    fn converse(&self, model: &str, system_instruction: &str, contents: &[Value])
        -> Result<String>;
}

#[derive(Default)]
pub struct OracleRegistry {
    oracles: BTreeMap<String, Box<dyn ForensicModel>>,
}

impl OracleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: ForensicModel + 'static>(&mut self, oracle: M) {
        self.oracles
            .insert(oracle.name().to_string(), Box::new(oracle));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ForensicModel> {
        self.oracles.get(name).map(|oracle| oracle.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.oracles.keys().cloned().collect()
    }
}

pub fn default_oracle_registry() -> OracleRegistry {
    let mut oracles = OracleRegistry::new();
    oracles.register(DryrunModel);
    oracles.register(GeminiModel::new());
    oracles
}

/// Offline stand-in: a deterministic verified-GREEN report with synthetic
/// grounding, so the whole pipeline can run without credentials.
pub struct DryrunModel;

impl DryrunModel {
    fn report_text(claim: &str) -> String {
        let claim_text = if claim.trim().is_empty() {
            "the uploaded media".to_string()
        } else {
            format!("\"{}\"", claim.trim())
        };
        json!({
            "verdictColor": "GREEN",
            "status": "Verified",
            "visualEvidence": {
                "originTrace": "First indexed 2024-03-12 on a wire agency feed",
                "visualMatch": "Yes, matches previously published agency photography",
                "similarImages": [
                    {
                        "url": "https://www.google.com/search?q=wire+agency+photo",
                        "description": "Uncropped original from the agency archive",
                        "source": "Wire Agency"
                    }
                ],
                "supportingSources": [
                    { "title": "Agency archive entry", "url": "https://archive.example/wire/123" }
                ]
            },
            "locationAnalysis": {
                "claimedVsActual": "Consistent with the claimed location",
                "clues": ["Signage", "Rooflines", "Street layout"],
                "estimatedCoordinates": "23.8103, 90.4125",
                "estimatedDate": "Spring 2024",
                "geospatialHistory": {
                    "currentView": "Skyline matches current satellite imagery",
                    "currentUrl": "https://maps.example/current",
                    "historicalView": "No structural changes in the last two years",
                    "historicalUrl": null,
                    "analysis": "Present and historical views agree",
                    "verdict": "Location Verified"
                },
                "supportingSources": [
                    { "title": "Satellite comparison", "url": "https://maps.example/compare" }
                ]
            },
            "aiCheck": {
                "verdict": "Real",
                "forensicNote": "No synthesis artifacts in edges or lighting",
                "supportingSources": []
            },
            "detailedSearch": {
                "queries": ["wire agency photo skyline"],
                "relatedTopics": ["Agency photography"],
                "mediaMatches": [
                    {
                        "type": "Exact Match",
                        "mediaType": "Image",
                        "description": "Original publication",
                        "source": "Wire Agency",
                        "imageUrl": null
                    }
                ],
                "socialAnalysis": [],
                "supportingSources": [
                    { "title": "Original publication", "url": "https://news.example/original" }
                ]
            },
            "journalistSummary": format!("Analysis of {claim_text} found consistent provenance across search results.")
        })
        .to_string()
    }
}

impl ForensicModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<ModelReply> {
        Ok(ModelReply {
            text: Self::report_text(&request.claim),
            grounding: vec![
                GroundingSource {
                    title: "Agency archive entry".to_string(),
                    uri: "https://archive.example/wire/123".to_string(),
                },
                GroundingSource {
                    title: "Satellite comparison".to_string(),
                    uri: "https://maps.example/compare".to_string(),
                },
            ],
        })
    }

    fn converse(
        &self,
        _model: &str,
        _system_instruction: &str,
        contents: &[Value],
    ) -> Result<String> {
        let question = contents
            .last()
            .and_then(|turn| turn.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.last())
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(format!(
            "Offline analyst: the original report already covers \"{question}\"; no live search is available in dryrun mode."
        ))
    }
}

pub struct GeminiModel {
    api_base: String,
    http: HttpClient,
}

impl GeminiModel {
    pub fn new() -> Self {
        Self {
            api_base: env::var("FACTTRACE_API_BASE")
                .or_else(|_| env::var("GEMINI_API_BASE"))
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        for attempt in 0..=TRANSPORT_RETRIES {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= TRANSPORT_RETRIES {
                        return Err(err);
                    }
                    let delay_s = RETRY_BACKOFF_S * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        unreachable!("Gemini transport retry loop should always return a response or error")
    }

    fn extract_text(payload: &Value) -> String {
        let parts = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut text = String::new();
        for part in parts {
            if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                text.push_str(chunk);
            }
        }
        text
    }

    fn extract_grounding(payload: &Value) -> Vec<GroundingSource> {
        let chunks = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("groundingMetadata"))
            .and_then(|metadata| metadata.get("groundingChunks"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut sources = Vec::new();
        for chunk in chunks {
            let Some(web) = chunk.get("web").and_then(Value::as_object) else {
                continue;
            };
            let uri = web
                .get("uri")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if uri.is_empty() {
                continue;
            }
            let title = web
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_GROUNDING_TITLE);
            sources.push(GroundingSource {
                title: title.to_string(),
                uri: uri.to_string(),
            });
        }
        sources
    }
}

impl Default for GeminiModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForensicModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<ModelReply> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    request.payload.inline_part(),
                    { "text": ANALYSIS_USER_INSTRUCTION },
                ],
            }],
            "systemInstruction": {
                "parts": [{ "text": request.system_instruction() }],
            },
            "tools": [{ "googleSearch": {} }],
            "generationConfig": {
                "thinkingConfig": { "thinkingBudget": request.thinking_budget },
            },
        });

        let response = self.post_with_transport_retries(&endpoint, &api_key, &payload)?;
        let body = response_json_or_error("Gemini", response)?;
        Ok(ModelReply {
            text: Self::extract_text(&body),
            grounding: Self::extract_grounding(&body),
        })
    }

    fn converse(
        &self,
        model: &str,
        system_instruction: &str,
        contents: &[Value],
    ) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(model);
        let payload = json!({
            "contents": contents,
            "systemInstruction": {
                "parts": [{ "text": system_instruction }],
            },
            "tools": [{ "googleSearch": {} }],
        });

        let response = self.post_with_transport_retries(&endpoint, &api_key, &payload)?;
        let body = response_json_or_error("Gemini", response)?;
        Ok(Self::extract_text(&body))
    }
}

/// Pulls the report JSON out of whatever the model wrapped it in. Each
/// strategy is a cheap, non-destructive extraction; they run in order and
/// the first candidate that deserializes wins.
fn extraction_candidates(raw: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    if let (Some(first), Some(last)) = (raw.find('{'), raw.rfind('}')) {
        if last > first {
            candidates.push(raw[first..=last].to_string());
        }
    }

    let stripped = strip_code_fences(raw);
    if !stripped.is_empty() && !candidates.iter().any(|existing| existing == &stripped) {
        candidates.push(stripped);
    }

    candidates
}

fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

pub fn parse_report(raw: &str) -> Result<ForensicReport> {
    if raw.trim().is_empty() {
        return Err(ParseError::EmptyOutput.into());
    }
    for candidate in extraction_candidates(raw) {
        if let Ok(report) = serde_json::from_str::<ForensicReport>(&candidate) {
            return Ok(report);
        }
    }
    Err(ParseError::MalformedJson {
        raw: truncate_text(raw, 2048),
    }
    .into())
}

/// Follow-up conversation anchored to one analysis. The wire history is
/// seeded with the original media plus the serialized report, so later turns
/// reference the same evidence without re-uploading anything.
pub struct ChatSession {
    model: String,
    payload: Arc<MediaPayload>,
    wire_history: Vec<Value>,
    transcript: ChatTranscript,
    in_flight: bool,
}

impl ChatSession {
    pub fn open(
        payload: Arc<MediaPayload>,
        report: &ForensicReport,
        model: impl Into<String>,
    ) -> Result<Self> {
        let report_json =
            serde_json::to_string(report).context("failed serializing report for chat seed")?;
        let wire_history = vec![
            json!({
                "role": "user",
                "parts": [
                    payload.inline_part(),
                    { "text": CHAT_SEED_INSTRUCTION },
                ],
            }),
            json!({
                "role": "model",
                "parts": [{ "text": report_json }],
            }),
        ];
        let mut transcript = ChatTranscript::new();
        transcript.push_model(CHAT_GREETING);
        Ok(Self {
            model: model.into(),
            payload,
            wire_history,
            transcript,
            in_flight: false,
        })
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        self.transcript.messages()
    }

    pub fn wire_history(&self) -> &[Value] {
        &self.wire_history
    }

    pub fn payload(&self) -> &Arc<MediaPayload> {
        &self.payload
    }

    /// One blocking exchange: appends exactly one user message and one model
    /// message to the transcript. A failed exchange degrades to the fixed
    /// failure text instead of propagating, so the conversation stays
    /// navigable; the failed turn contributes no wire turns, keeping the
    /// history strictly user/model alternating.
    pub fn send(&mut self, oracle: &dyn ForensicModel, text: &str) -> Result<&ChatMessage> {
        if self.in_flight {
            bail!("a chat exchange is already in flight for this session");
        }
        let text = text.trim();
        if text.is_empty() {
            bail!("cannot send an empty chat message");
        }

        self.in_flight = true;
        self.transcript.push_user(text);
        let user_turn = json!({
            "role": "user",
            "parts": [{ "text": text }],
        });
        let mut contents = self.wire_history.clone();
        contents.push(user_turn.clone());
        let outcome = oracle.converse(&self.model, CHAT_SYSTEM_INSTRUCTION, &contents);
        self.in_flight = false;

        match outcome {
            Ok(reply) => {
                let reply_text = if reply.trim().is_empty() {
                    EMPTY_REPLY_TEXT.to_string()
                } else {
                    reply
                };
                self.wire_history.push(user_turn);
                self.wire_history.push(json!({
                    "role": "model",
                    "parts": [{ "text": reply_text.clone() }],
                }));
                Ok(self.transcript.push_model(reply_text))
            }
            Err(_) => Ok(self.transcript.push_model(CHAT_FAILURE_TEXT)),
        }
    }
}

/// Environment-scoped credential state, modeled as an injected capability so
/// the engine is testable without a real selection handshake.
pub trait CredentialGate: Send + Sync {
    fn is_ready(&self) -> bool;
    fn select(&mut self) -> Result<()>;
}

/// Reads the same environment keys the Gemini transport uses.
pub struct EnvCredentialGate;

impl CredentialGate for EnvCredentialGate {
    fn is_ready(&self) -> bool {
        GeminiModel::api_key().is_some()
    }

    fn select(&mut self) -> Result<()> {
        // Selection happens outside the process (environment/keychain); the
        // orchestrator re-checks is_ready afterward.
        Ok(())
    }
}

pub struct StaticCredentialGate {
    ready: bool,
}

impl StaticCredentialGate {
    pub fn ready() -> Self {
        Self { ready: true }
    }

    pub fn unavailable() -> Self {
        Self { ready: false }
    }
}

impl CredentialGate for StaticCredentialGate {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn select(&mut self) -> Result<()> {
        Ok(())
    }
}

/// User-facing failure classification. The UI layer consumes this, never the
/// raw error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    TooLarge,
    AuthRequired,
    Unreadable,
    Transient,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooLarge => "too_large",
            Self::AuthRequired => "auth_required",
            Self::Unreadable => "unreadable",
            Self::Transient => "transient",
        }
    }

    pub fn is_retryable_as_is(&self) -> bool {
        matches!(self, Self::Unreadable | Self::Transient)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{category}: {message}")]
pub struct AnalysisFailure {
    pub category: FailureCategory,
    pub message: String,
}

pub fn classify_failure(err: &anyhow::Error) -> FailureCategory {
    if err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<EncodeError>(),
            Some(EncodeError::TooLarge { .. })
        )
    }) {
        return FailureCategory::TooLarge;
    }
    if err
        .chain()
        .any(|cause| cause.downcast_ref::<ParseError>().is_some())
    {
        return FailureCategory::Unreadable;
    }
    let text = error_chain_text(err, 512);
    if text.contains("403") || text.contains("PERMISSION_DENIED") {
        return FailureCategory::AuthRequired;
    }
    FailureCategory::Transient
}

/// One completed analysis: the payload, the parsed report with its attached
/// citation-of-record, the reconciled source list, and an optional follow-up
/// chat. Nothing here survives a reset.
pub struct AnalysisSession {
    pub session_id: String,
    pub claim: String,
    pub model: String,
    pub provider: String,
    pub report: ForensicReport,
    pub verified_sources: Vec<ReconciledSource>,
    payload: Arc<MediaPayload>,
    chat: Option<ChatSession>,
}

impl AnalysisSession {
    pub fn payload(&self) -> &Arc<MediaPayload> {
        &self.payload
    }

    pub fn chat(&self) -> Option<&ChatSession> {
        self.chat.as_ref()
    }
}

pub struct SessionOrchestrator {
    oracles: OracleRegistry,
    credentials: Box<dyn CredentialGate>,
    selector: ModelSelector,
    requested_model: Option<String>,
    events: EventWriter,
    authenticated: bool,
    busy: bool,
    session: Option<AnalysisSession>,
}

impl SessionOrchestrator {
    pub fn new(
        oracles: OracleRegistry,
        credentials: Box<dyn CredentialGate>,
        requested_model: Option<String>,
        events_path: impl Into<PathBuf>,
    ) -> Self {
        let authenticated = credentials.is_ready();
        let events = EventWriter::new(events_path.into(), Uuid::new_v4().to_string());
        Self {
            oracles,
            credentials,
            selector: ModelSelector::new(None),
            requested_model,
            events,
            authenticated,
            busy: false,
            session: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Runs the credential selection handshake, then verifies the credential
    /// actually became visible before flipping the authenticated flag.
    pub fn authenticate(&mut self) -> Result<()> {
        self.credentials.select()?;
        if !self.credentials.is_ready() {
            bail!("credential selection completed but no active credential is visible");
        }
        self.authenticated = true;
        Ok(())
    }

    pub fn active_session(&self) -> Option<&AnalysisSession> {
        self.session.as_ref()
    }

    pub fn active_report(&self) -> Option<&ForensicReport> {
        self.session.as_ref().map(|session| &session.report)
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// The single entry point the UI submits through. Any failure inside the
    /// pipeline is classified before it reaches the caller; the raw error
    /// text survives only in the event log and the failure message.
    pub fn submit_analysis(
        &mut self,
        file: &Path,
        claim: &str,
    ) -> Result<&ForensicReport, AnalysisFailure> {
        if self.busy {
            return Err(AnalysisFailure {
                category: FailureCategory::Transient,
                message: "an analysis is already in flight".to_string(),
            });
        }
        if !self.authenticated {
            return Err(AnalysisFailure {
                category: FailureCategory::AuthRequired,
                message: "no active credential; authenticate and retry".to_string(),
            });
        }

        self.busy = true;
        let outcome = self.run_analysis(file, claim);
        self.busy = false;

        match outcome {
            Ok(session) => {
                self.session = Some(session);
                Ok(&self.session.as_ref().expect("session just stored").report)
            }
            Err(err) => {
                let category = classify_failure(&err);
                if category == FailureCategory::AuthRequired {
                    self.authenticated = false;
                }
                let message = error_chain_text(&err, 512);
                let _ = self.events.emit(
                    "analysis_failed",
                    map_object(json!({
                        "category": category.as_str(),
                        "message": message,
                    })),
                );
                Err(AnalysisFailure { category, message })
            }
        }
    }

    fn run_analysis(&mut self, file: &Path, claim: &str) -> Result<AnalysisSession> {
        let session_id = Uuid::new_v4().to_string();
        let payload = Arc::new(encode_media_file(file)?);
        self.events.emit(
            "media_encoded",
            map_object(json!({
                "analysis_id": session_id,
                "media_type": payload.media_type(),
                "bytes": payload.bytes().len(),
                "fingerprint": payload.fingerprint(),
            })),
        )?;

        let selection = self
            .selector
            .select(self.requested_model.as_deref(), VISION_CAPABILITY)
            .map_err(anyhow::Error::msg)?;
        let oracle = self
            .oracles
            .get(&selection.model.provider)
            .with_context(|| {
                format!(
                    "no oracle registered for provider '{}'",
                    selection.model.provider
                )
            })?;

        let request = AnalysisRequest::new(Arc::clone(&payload), claim, &selection.model.name);
        self.events.emit(
            "analysis_started",
            map_object(json!({
                "analysis_id": session_id,
                "model": selection.model.name,
                "provider": selection.model.provider,
                "fallback_reason": selection.fallback_reason,
                "claim_chars": request.claim.chars().count(),
            })),
        )?;

        let started = Instant::now();
        let reply = oracle.analyze(&request)?;
        self.events.emit(
            "model_reply",
            map_object(json!({
                "analysis_id": session_id,
                "latency_s": started.elapsed().as_secs_f64(),
                "text_chars": reply.text.chars().count(),
                "grounding_count": reply.grounding.len(),
            })),
        )?;

        let mut report = parse_report(&reply.text)?;
        self.events.emit(
            "report_parsed",
            map_object(json!({
                "analysis_id": session_id,
                "verdict": report.verdict_color,
            })),
        )?;

        report.sources = dedupe_grounding(&reply.grounding);
        let verified_sources =
            reconcile_sources(&reply.grounding, &collect_supporting_sources(&report));
        self.events.emit(
            "sources_reconciled",
            map_object(json!({
                "analysis_id": session_id,
                "verified": verified_sources.iter().filter(|s| s.is_verified).count(),
                "unverified": verified_sources.iter().filter(|s| !s.is_verified).count(),
                "citation_of_record": report.sources.len(),
            })),
        )?;

        Ok(AnalysisSession {
            session_id,
            claim: request.claim.clone(),
            model: selection.model.name,
            provider: selection.model.provider,
            report,
            verified_sources,
            payload,
            chat: None,
        })
    }

    /// Opens the follow-up session over the active analysis. The chat takes
    /// shared ownership of the media payload; opening twice is a no-op.
    pub fn open_chat(&mut self) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .context("no completed analysis to discuss")?;
        if session.chat.is_some() {
            return Ok(());
        }
        let analysis_id = session.session_id.clone();
        let chat = ChatSession::open(
            Arc::clone(&session.payload),
            &session.report,
            session.model.clone(),
        )?;
        session.chat = Some(chat);
        self.events.emit(
            "chat_opened",
            map_object(json!({
                "analysis_id": analysis_id,
            })),
        )?;
        Ok(())
    }

    pub fn send_chat_message(&mut self, text: &str) -> Result<&ChatMessage> {
        let session = self
            .session
            .as_mut()
            .context("no completed analysis to discuss")?;
        let analysis_id = session.session_id.clone();
        let oracle = self
            .oracles
            .get(&session.provider)
            .with_context(|| format!("no oracle registered for provider '{}'", session.provider))?;
        let chat = session
            .chat
            .as_mut()
            .context("chat session is not open; call open_chat first")?;

        let message = chat.send(oracle, text)?;
        let failed = message.text == CHAT_FAILURE_TEXT;
        let reply_chars = message.text.chars().count();
        let event_type = if failed { "chat_turn_failed" } else { "chat_turn" };
        self.events.emit(
            event_type,
            map_object(json!({
                "analysis_id": analysis_id,
                "reply_chars": reply_chars,
            })),
        )?;
        self.session
            .as_ref()
            .and_then(|session| session.chat.as_ref())
            .and_then(|chat| chat.transcript().last())
            .context("chat transcript is missing the reply just appended")
    }

    /// Discards all per-session state. In-flight work cannot be cancelled;
    /// results arriving for a discarded session are simply dropped.
    pub fn reset_session(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            self.events.emit(
                "session_reset",
                map_object(json!({
                    "analysis_id": session.session_id,
                })),
            )?;
        }
        Ok(())
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

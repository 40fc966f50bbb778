use serde::{Deserialize, Deserializer, Serialize};

use crate::sources::{GroundingSource, SourceLink};

/// Top-level authenticity verdict. Tokens stay English on the wire even when
/// the report body is rendered in Bengali.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictColor {
    #[serde(rename = "RED")]
    Red,
    #[serde(rename = "YELLOW")]
    Yellow,
    #[serde(rename = "GREEN")]
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AiVerdict {
    Real,
    #[serde(rename = "AI-Generated")]
    AiGenerated,
    Edited,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    #[serde(rename = "Exact Match")]
    ExactMatch,
    Similar,
    Related,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMediaKind {
    Image,
    Video,
    Article,
}

/// Social platforms the recon protocol searches. Anything the model emits
/// outside the known set folds into `Other` instead of failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocialPlatform {
    Facebook,
    X,
    Instagram,
    YouTube,
    TikTok,
    Reddit,
    Other,
}

impl<'de> Deserialize<'de> for SocialPlatform {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim() {
            "Facebook" => Self::Facebook,
            "X" | "Twitter" | "X (Twitter)" => Self::X,
            "Instagram" => Self::Instagram,
            "YouTube" => Self::YouTube,
            "TikTok" => Self::TikTok,
            "Reddit" => Self::Reddit,
            _ => Self::Other,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarImage {
    pub url: Option<String>,
    pub description: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualEvidence {
    pub origin_trace: String,
    pub visual_match: String,
    #[serde(default)]
    pub similar_images: Vec<SimilarImage>,
    #[serde(default)]
    pub supporting_sources: Vec<SourceLink>,
}

/// Present-vs-historical comparison for the claimed location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoComparison {
    pub current_view: String,
    pub current_url: Option<String>,
    pub historical_view: String,
    pub historical_url: Option<String>,
    pub analysis: String,
    pub verdict: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationAnalysis {
    pub claimed_vs_actual: String,
    #[serde(default)]
    pub clues: Vec<String>,
    pub estimated_coordinates: Option<String>,
    pub estimated_date: Option<String>,
    pub geospatial_history: Option<GeoComparison>,
    #[serde(default)]
    pub supporting_sources: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCheck {
    pub verdict: AiVerdict,
    pub forensic_note: String,
    #[serde(default)]
    pub supporting_sources: Vec<SourceLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMatch {
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub media_type: MatchMediaKind,
    pub description: String,
    pub source: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialMediaHit {
    pub platform: SocialPlatform,
    pub url: String,
    pub author: String,
    pub date: String,
    pub content_snippet: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedSearch {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub related_topics: Vec<String>,
    #[serde(default)]
    pub media_matches: Vec<MediaMatch>,
    #[serde(default)]
    pub social_analysis: Vec<SocialMediaHit>,
    #[serde(default)]
    pub supporting_sources: Vec<SourceLink>,
}

/// Canonical forensic report. The model emits everything except `sources`,
/// which the engine computes from grounding metadata and attaches afterward;
/// a `sources` value in the model body is overwritten during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicReport {
    pub verdict_color: VerdictColor,
    pub status: String,
    pub visual_evidence: VisualEvidence,
    pub location_analysis: LocationAnalysis,
    pub ai_check: AiCheck,
    pub detailed_search: DetailedSearch,
    pub journalist_summary: String,
    #[serde(default)]
    pub sources: Vec<GroundingSource>,
}

/// Placeholder report shown before any analysis has run.
pub fn pending_report() -> ForensicReport {
    ForensicReport {
        verdict_color: VerdictColor::Yellow,
        status: "Analysis Pending".to_string(),
        visual_evidence: VisualEvidence {
            origin_trace: "N/A".to_string(),
            visual_match: "N/A".to_string(),
            similar_images: Vec::new(),
            supporting_sources: Vec::new(),
        },
        location_analysis: LocationAnalysis {
            claimed_vs_actual: "N/A".to_string(),
            clues: Vec::new(),
            estimated_coordinates: Some("N/A".to_string()),
            estimated_date: Some("N/A".to_string()),
            geospatial_history: None,
            supporting_sources: Vec::new(),
        },
        ai_check: AiCheck {
            verdict: AiVerdict::Inconclusive,
            forensic_note: "Waiting for media input.".to_string(),
            supporting_sources: Vec::new(),
        },
        detailed_search: DetailedSearch {
            queries: Vec::new(),
            related_topics: Vec::new(),
            media_matches: Vec::new(),
            social_analysis: Vec::new(),
            supporting_sources: Vec::new(),
        },
        journalist_summary: "Upload an image or video to begin the forensic analysis.".to_string(),
        sources: Vec::new(),
    }
}

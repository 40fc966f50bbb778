use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::report::ForensicReport;

pub const DEFAULT_GROUNDING_TITLE: &str = "Verified Source Link";

/// Citation the model asserts inline in a report section. Unverifiable: the
/// model may have copied it from search results or invented it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    pub title: String,
    pub url: String,
}

/// Citation from the provider's grounding side channel. These are the only
/// entries trusted enough for the top-level citation-of-record list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledSource {
    pub title: String,
    pub url: String,
    pub is_verified: bool,
}

/// Merges grounding citations with model-asserted ones into the single
/// "Verified Search Sources" list: verified entries first, then unverified,
/// deduplicated by URL with the first occurrence winning. A URL present in
/// both channels therefore always surfaces as verified.
pub fn reconcile_sources(
    grounding: &[GroundingSource],
    model_asserted: &[SourceLink],
) -> Vec<ReconciledSource> {
    let mut merged: Vec<ReconciledSource> = Vec::new();
    let mut push_unique = |candidate: ReconciledSource| {
        if candidate.url.trim().is_empty() {
            return;
        }
        if merged.iter().any(|existing| existing.url == candidate.url) {
            return;
        }
        merged.push(candidate);
    };

    for source in grounding {
        push_unique(ReconciledSource {
            title: grounding_title(source),
            url: source.uri.clone(),
            is_verified: true,
        });
    }
    for link in model_asserted {
        push_unique(ReconciledSource {
            title: link.title.clone(),
            url: link.url.clone(),
            is_verified: false,
        });
    }
    merged
}

/// Dedupes the grounding channel for the report's top-level `sources` field.
/// Keyed on URI with last-write-wins for the title, first-seen position for
/// ordering (JS `Map` semantics, which the rendering layer was built against).
pub fn dedupe_grounding(grounding: &[GroundingSource]) -> Vec<GroundingSource> {
    let mut by_uri: IndexMap<String, GroundingSource> = IndexMap::new();
    for source in grounding {
        if source.uri.trim().is_empty() {
            continue;
        }
        let mut entry = source.clone();
        entry.title = grounding_title(source);
        by_uri.insert(entry.uri.clone(), entry);
    }
    by_uri.into_values().collect()
}

/// Gathers the per-section model citations in schema order.
pub fn collect_supporting_sources(report: &ForensicReport) -> Vec<SourceLink> {
    let mut links = Vec::new();
    links.extend(report.visual_evidence.supporting_sources.iter().cloned());
    links.extend(report.location_analysis.supporting_sources.iter().cloned());
    links.extend(report.ai_check.supporting_sources.iter().cloned());
    links.extend(report.detailed_search.supporting_sources.iter().cloned());
    links
}

fn grounding_title(source: &GroundingSource) -> String {
    let trimmed = source.title.trim();
    if trimmed.is_empty() {
        return DEFAULT_GROUNDING_TITLE.to_string();
    }
    trimmed.to_string()
}

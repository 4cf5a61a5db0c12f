#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_FILE_NAME: &str = "confidence_metrics.json";
pub const DEFAULT_PIPELINE_VERSION: &str = "rfdiffusion-proteinmpnn-colabfold-v1.0";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredDesign {
    pub file: String,
    pub confidence_score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_designs_generated: usize,
    pub best_confidence_score: f64,
    pub average_confidence_score: f64,
}

impl ResultsSummary {
    /// `None` for an empty candidate set.
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let average = scores.iter().sum::<f64>() / scores.len() as f64;
        Some(Self {
            total_designs_generated: scores.len(),
            best_confidence_score: best,
            average_confidence_score: average,
        })
    }
}

/// Document persisted next to the result artifacts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultManifest {
    pub job_id: String,
    pub input_name: String,
    pub processing_timestamp: String,
    pub pipeline_version: String,
    pub pipeline_steps: BTreeMap<String, String>,
    pub results_summary: ResultsSummary,
    pub final_designs: Vec<ScoredDesign>,
    /// Every scored candidate, ranked; unaffected by the final designs cap.
    #[serde(default)]
    pub all_confidence_scores: Vec<ScoredDesign>,
}

/// Embedded `result_summary` of a COMPLETED job record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResultSummary {
    pub results_summary: ResultsSummary,
    pub final_designs: Vec<ScoredDesign>,
    pub manifest_key: String,
}

impl JobResultSummary {
    pub fn from_manifest(manifest: &ResultManifest, manifest_key: impl Into<String>) -> Self {
        Self {
            results_summary: manifest.results_summary.clone(),
            final_designs: manifest.final_designs.clone(),
            manifest_key: manifest_key.into(),
        }
    }
}

/// Orders designs by descending score; equal scores fall back to file name.
pub fn rank_designs(designs: &mut [ScoredDesign]) {
    designs.sort_by(|a, b| {
        b.confidence_score
            .total_cmp(&a.confidence_score)
            .then_with(|| a.file.cmp(&b.file))
    });
}

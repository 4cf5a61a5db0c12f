#![forbid(unsafe_code)]

use crate::clock::ts_ms_to_rfc3339;
use crate::object_store::{ObjectStore, ObjectStoreError};
use bf_core::manifest::{
    MANIFEST_FILE_NAME, ResultManifest, ResultsSummary, ScoredDesign, rank_designs,
};
use bf_core::{JobId, StageId};
use std::collections::{BTreeMap, BTreeSet};

const CANDIDATE_EXTENSION: &str = ".pdb";

#[derive(Debug)]
pub enum ManifestError {
    NoCandidates { searched: Vec<String> },
    MissingScore { file: String },
    InvalidScore { file: String, raw: String },
    Store(ObjectStoreError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidates { searched } => {
                write!(f, "no candidate designs under {}", searched.join(", "))
            }
            Self::MissingScore { file } => write!(f, "{file}: no CONFIDENCE remark"),
            Self::InvalidScore { file, raw } => {
                write!(f, "{file}: confidence score {raw:?} is not a finite number")
            }
            Self::Store(err) => write!(f, "object store: {err}"),
            Self::Encode(err) => write!(f, "encode manifest: {err}"),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ObjectStoreError> for ManifestError {
    fn from(value: ObjectStoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Clone, Debug)]
pub struct BuiltManifest {
    pub manifest: ResultManifest,
    pub manifest_key: String,
}

/// What the builder needs to know about the job it summarizes.
#[derive(Clone, Copy, Debug)]
pub struct ManifestJob<'a> {
    pub job_id: &'a JobId,
    pub input_name: &'a str,
    pub output_prefix: &'a str,
}

pub struct ManifestBuilder<'a> {
    store: &'a dyn ObjectStore,
    pipeline_version: &'a str,
    stage_count: u8,
    final_designs_limit: Option<usize>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        pipeline_version: &'a str,
        stage_count: u8,
        final_designs_limit: Option<usize>,
    ) -> Self {
        Self {
            store,
            pipeline_version,
            stage_count,
            final_designs_limit,
        }
    }

    /// Scores every candidate under `output_references` (or the job's output
    /// prefix when none are given) and writes the manifest beside them.
    pub fn build(
        &self,
        job: ManifestJob<'_>,
        output_references: &[String],
        now_ms: i64,
    ) -> Result<BuiltManifest, ManifestError> {
        let searched: Vec<String> = if output_references.is_empty() {
            vec![job.output_prefix.to_string()]
        } else {
            output_references.to_vec()
        };

        let candidates = self.collect_candidates(&searched)?;
        if candidates.is_empty() {
            return Err(ManifestError::NoCandidates { searched });
        }

        let mut designs = Vec::with_capacity(candidates.len());
        for key in &candidates {
            let bytes = self.store.get(key)?;
            let text = String::from_utf8_lossy(&bytes);
            let file = file_name(key).to_string();
            let confidence_score = parse_confidence(&text, &file)?;
            designs.push(ScoredDesign {
                file,
                confidence_score,
            });
        }

        let scores: Vec<f64> = designs.iter().map(|d| d.confidence_score).collect();
        let results_summary = ResultsSummary::from_scores(&scores).ok_or_else(|| {
            ManifestError::NoCandidates {
                searched: searched.clone(),
            }
        })?;
        rank_designs(&mut designs);
        let all_confidence_scores = designs.clone();
        if let Some(limit) = self.final_designs_limit {
            designs.truncate(limit);
        }

        let pipeline_steps: BTreeMap<String, String> = StageId::sequence(self.stage_count)
            .map(|stage| (stage.label(), "completed".to_string()))
            .collect();

        let manifest = ResultManifest {
            job_id: job.job_id.as_str().to_string(),
            input_name: job.input_name.to_string(),
            processing_timestamp: ts_ms_to_rfc3339(now_ms),
            pipeline_version: self.pipeline_version.to_string(),
            pipeline_steps,
            results_summary,
            final_designs: designs,
            all_confidence_scores,
        };

        let manifest_key = format!("{}{MANIFEST_FILE_NAME}", job.output_prefix);
        let body = serde_json::to_vec_pretty(&manifest).map_err(ManifestError::Encode)?;
        self.store.put(&manifest_key, &body)?;

        tracing::info!(
            job_id = %job.job_id,
            manifest_key = %manifest_key,
            designs = manifest.results_summary.total_designs_generated,
            best = manifest.results_summary.best_confidence_score,
            "result manifest written"
        );
        Ok(BuiltManifest {
            manifest,
            manifest_key,
        })
    }

    fn collect_candidates(&self, references: &[String]) -> Result<Vec<String>, ManifestError> {
        let mut keys = BTreeSet::new();
        for reference in references {
            let reference = reference.trim();
            if reference.is_empty() {
                continue;
            }
            if is_candidate(reference) {
                keys.insert(reference.to_string());
                continue;
            }
            let prefix = if reference.ends_with('/') {
                reference.to_string()
            } else {
                format!("{reference}/")
            };
            keys.extend(
                self.store
                    .list(&prefix)?
                    .into_iter()
                    .filter(|k| is_candidate(k)),
            );
        }
        Ok(keys.into_iter().collect())
    }
}

fn is_candidate(key: &str) -> bool {
    let name = file_name(key);
    name.len() > CANDIDATE_EXTENSION.len()
        && name
            .to_ascii_lowercase()
            .ends_with(CANDIDATE_EXTENSION)
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Reads the score from the first `REMARK` line carrying a `CONFIDENCE` token.
pub fn parse_confidence(text: &str, file: &str) -> Result<f64, ManifestError> {
    for line in text.lines() {
        if !line.starts_with("REMARK") || !line.contains("CONFIDENCE") {
            continue;
        }
        let mut tokens = line.split_whitespace();
        if tokens.by_ref().any(|t| t == "CONFIDENCE") {
            let Some(raw) = tokens.next() else {
                return Err(ManifestError::MissingScore {
                    file: file.to_string(),
                });
            };
            return match raw.parse::<f64>() {
                Ok(score) if score.is_finite() => Ok(score),
                _ => Err(ManifestError::InvalidScore {
                    file: file.to_string(),
                    raw: raw.to_string(),
                }),
            };
        }
    }
    Err(ManifestError::MissingScore {
        file: file.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use bf_core::StorageKey;
    use bf_core::manifest::DEFAULT_PIPELINE_VERSION;

    fn pdb(score: &str) -> Vec<u8> {
        format!("HEADER    DESIGN\nREMARK 250 CONFIDENCE {score}\nATOM      1  N   MET A   1\n")
            .into_bytes()
    }

    fn job_id() -> JobId {
        JobId::derive(&StorageKey::try_new("targets/abc.pdb").expect("key"))
    }

    #[test]
    fn confidence_is_read_from_remark_line() {
        assert_eq!(parse_confidence("REMARK 1 CONFIDENCE 0.75 plddt", "a.pdb").expect("score"), 0.75);
        assert!(matches!(
            parse_confidence("ATOM 1 CONFIDENCE 0.5\n", "a.pdb"),
            Err(ManifestError::MissingScore { .. })
        ));
        assert!(matches!(
            parse_confidence("REMARK CONFIDENCE high\n", "a.pdb"),
            Err(ManifestError::InvalidScore { .. })
        ));
        assert!(matches!(
            parse_confidence("REMARK CONFIDENCE NaN\n", "a.pdb"),
            Err(ManifestError::InvalidScore { .. })
        ));
        assert!(matches!(
            parse_confidence("REMARK CONFIDENCE\n", "a.pdb"),
            Err(ManifestError::MissingScore { .. })
        ));
    }

    #[test]
    fn builds_ranked_summary_and_writes_manifest() {
        let store = MemoryObjectStore::new();
        let job_id = job_id();
        let prefix = format!("results/{job_id}/");
        store.put(&format!("{prefix}stage3/design_a.pdb"), &pdb("0.87")).expect("put");
        store.put(&format!("{prefix}stage3/design_b.pdb"), &pdb("0.65")).expect("put");
        store.put(&format!("{prefix}stage3/design_c.pdb"), &pdb("0.91")).expect("put");
        store.put(&format!("{prefix}stage3/log.txt"), b"not a design").expect("put");

        let builder = ManifestBuilder::new(&store, DEFAULT_PIPELINE_VERSION, 3, None);
        let built = builder
            .build(
                ManifestJob {
                    job_id: &job_id,
                    input_name: "abc",
                    output_prefix: &prefix,
                },
                &[format!("{prefix}stage3")],
                1_700_000_000_000,
            )
            .expect("build");

        let summary = &built.manifest.results_summary;
        assert_eq!(summary.total_designs_generated, 3);
        assert_eq!(summary.best_confidence_score, 0.91);
        assert!((summary.average_confidence_score - 0.81).abs() < 1e-9);
        let order: Vec<f64> = built
            .manifest
            .final_designs
            .iter()
            .map(|d| d.confidence_score)
            .collect();
        assert_eq!(order, vec![0.91, 0.87, 0.65]);
        assert_eq!(built.manifest.final_designs[0].file, "design_c.pdb");
        assert_eq!(built.manifest.all_confidence_scores, built.manifest.final_designs);
        assert_eq!(built.manifest.pipeline_steps.len(), 3);
        assert_eq!(built.manifest.pipeline_steps["STAGE_1"], "completed");
        assert_eq!(built.manifest.processing_timestamp, "2023-11-14T22:13:20Z");

        assert_eq!(built.manifest_key, format!("{prefix}confidence_metrics.json"));
        let stored: ResultManifest =
            serde_json::from_slice(&store.get(&built.manifest_key).expect("manifest"))
                .expect("decode");
        assert_eq!(stored, built.manifest);
    }

    #[test]
    fn limit_truncates_designs_but_not_statistics() {
        let store = MemoryObjectStore::new();
        let job_id = job_id();
        let prefix = format!("results/{job_id}/");
        for (name, score) in [("x.pdb", "0.2"), ("y.pdb", "0.4"), ("z.pdb", "0.9")] {
            store.put(&format!("{prefix}{name}"), &pdb(score)).expect("put");
        }
        let builder = ManifestBuilder::new(&store, "v-test", 3, Some(1));
        let built = builder
            .build(
                ManifestJob {
                    job_id: &job_id,
                    input_name: "abc",
                    output_prefix: &prefix,
                },
                &[],
                0,
            )
            .expect("build");
        assert_eq!(built.manifest.final_designs.len(), 1);
        assert_eq!(built.manifest.final_designs[0].file, "z.pdb");
        assert_eq!(built.manifest.results_summary.total_designs_generated, 3);
        let all: Vec<&str> = built
            .manifest
            .all_confidence_scores
            .iter()
            .map(|d| d.file.as_str())
            .collect();
        assert_eq!(all, vec!["z.pdb", "y.pdb", "x.pdb"]);
        assert_eq!(built.manifest.pipeline_version, "v-test");
    }

    #[test]
    fn empty_outputs_and_unscored_candidates_fail() {
        let store = MemoryObjectStore::new();
        let job_id = job_id();
        let prefix = format!("results/{job_id}/");
        let builder = ManifestBuilder::new(&store, DEFAULT_PIPELINE_VERSION, 3, None);
        let job = ManifestJob {
            job_id: &job_id,
            input_name: "abc",
            output_prefix: &prefix,
        };

        assert!(matches!(
            builder.build(job, &[], 0),
            Err(ManifestError::NoCandidates { .. })
        ));

        store.put(&format!("{prefix}bare.pdb"), b"ATOM 1\n").expect("put");
        assert!(matches!(
            builder.build(job, &[], 0),
            Err(ManifestError::MissingScore { .. })
        ));
        assert!(store.list(&format!("{prefix}confidence")).expect("list").is_empty());
    }
}

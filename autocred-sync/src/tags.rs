//! Tag directory: pipeline stage → external platform tag resolution
//!
//! Built once from the stage_tag_mappings table. Pipeline tags are mutually
//! exclusive (one per lead); business tags are persistent and independent —
//! the reconciliation engine never touches them. Stage lookup is
//! case-sensitive; tag-name comparison everywhere downstream is
//! case-insensitive and trimmed.

use autocred_common::config::ExpectedTag;
use autocred_common::Result;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Tag classification on the external platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Mutually exclusive stage marker; exactly one per lead
    Pipeline,
    /// Persistent, independent marker; never removed by the engine
    Business,
}

/// One active stage → tag mapping row
#[derive(Debug, Clone)]
pub struct StageTagMapping {
    pub stage: String,
    pub tag: String,
    pub kind: TagKind,
    /// When set, re-entering this stage must re-fire the platform automation
    /// even if the tag is already present (remove-wait-readd cycle).
    pub force_retrigger: bool,
}

/// Canonical form for tag-name comparison: trimmed and case-folded.
/// Operations against the platform still use the original-cased name.
pub fn normalize_tag(name: &str) -> String {
    name.trim().to_lowercase()
}

/// In-memory directory of active stage → tag mappings
pub struct TagDirectory {
    mappings: Vec<StageTagMapping>,
    /// Index of the active pipeline mapping per stage
    pipeline_by_stage: HashMap<String, usize>,
    /// Normalized names of every pipeline tag
    pipeline_names: HashSet<String>,
    /// Normalized names of every business tag
    business_names: HashSet<String>,
}

impl TagDirectory {
    pub fn new(mappings: Vec<StageTagMapping>) -> Self {
        let mut pipeline_by_stage = HashMap::new();
        let mut pipeline_names = HashSet::new();
        let mut business_names = HashSet::new();

        for (idx, mapping) in mappings.iter().enumerate() {
            match mapping.kind {
                TagKind::Pipeline => {
                    pipeline_by_stage.insert(mapping.stage.clone(), idx);
                    pipeline_names.insert(normalize_tag(&mapping.tag));
                }
                TagKind::Business => {
                    business_names.insert(normalize_tag(&mapping.tag));
                }
            }
        }

        Self {
            mappings,
            pipeline_by_stage,
            pipeline_names,
            business_names,
        }
    }

    /// Load the directory from the database
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let mappings = crate::db::mappings::list_active_mappings(pool).await?;
        info!(count = mappings.len(), "Tag directory loaded");
        Ok(Self::new(mappings))
    }

    /// Resolve the active pipeline mapping for a stage. None means the stage
    /// has no mapping — callers skip reconciliation and log a warning; this is
    /// not an error.
    pub fn resolve(&self, stage: &str) -> Option<&StageTagMapping> {
        self.pipeline_by_stage
            .get(stage)
            .map(|&idx| &self.mappings[idx])
    }

    /// All pipeline tag names, as configured
    pub fn pipeline_tags(&self) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|m| m.kind == TagKind::Pipeline)
            .map(|m| m.tag.as_str())
            .collect()
    }

    /// All business tag names, as configured
    pub fn business_tags(&self) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|m| m.kind == TagKind::Business)
            .map(|m| m.tag.as_str())
            .collect()
    }

    /// Is this live tag name one of the configured pipeline tags?
    /// Case-insensitive, trimmed.
    pub fn is_pipeline_tag(&self, name: &str) -> bool {
        self.pipeline_names.contains(&normalize_tag(name))
    }

    /// Is this live tag name one of the configured business tags?
    pub fn is_business_tag(&self, name: &str) -> bool {
        self.business_names.contains(&normalize_tag(name))
    }

    /// Defensive check of operator expectations for known-critical stages.
    /// Mismatches are logged loudly, never auto-corrected: a wrong mapping is
    /// a configuration problem requiring a human fix.
    pub fn verify(&self, expected: &[ExpectedTag]) {
        for exp in expected {
            match self.resolve(&exp.stage) {
                Some(mapping) if normalize_tag(&mapping.tag) == normalize_tag(&exp.tag) => {}
                Some(mapping) => {
                    warn!(
                        stage = %exp.stage,
                        configured = %mapping.tag,
                        expected = %exp.tag,
                        "Stage mapping differs from expected tag; automations may not fire"
                    );
                }
                None => {
                    warn!(
                        stage = %exp.stage,
                        expected = %exp.tag,
                        "No active pipeline mapping for expected stage"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> TagDirectory {
        TagDirectory::new(vec![
            StageTagMapping {
                stage: "CONSULTANDO_CREDITO".to_string(),
                tag: "lead-consultando".to_string(),
                kind: TagKind::Pipeline,
                force_retrigger: false,
            },
            StageTagMapping {
                stage: "PREAPROBADO".to_string(),
                tag: "credito-preaprobado".to_string(),
                kind: TagKind::Pipeline,
                force_retrigger: true,
            },
            StageTagMapping {
                stage: "ATENCION".to_string(),
                tag: "atencion-humana".to_string(),
                kind: TagKind::Business,
                force_retrigger: false,
            },
        ])
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let dir = directory();
        let first = dir.resolve("PREAPROBADO").map(|m| m.tag.clone());
        let second = dir.resolve("PREAPROBADO").map(|m| m.tag.clone());
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("credito-preaprobado"));
    }

    #[test]
    fn test_stage_lookup_is_case_sensitive() {
        let dir = directory();
        assert!(dir.resolve("preaprobado").is_none());
        assert!(dir.resolve("PREAPROBADO").is_some());
    }

    #[test]
    fn test_unmapped_stage_is_none_not_error() {
        let dir = directory();
        assert!(dir.resolve("ENTREGADO").is_none());
    }

    #[test]
    fn test_classification_case_insensitive() {
        let dir = directory();
        assert!(dir.is_pipeline_tag("Credito-Preaprobado"));
        assert!(dir.is_pipeline_tag("  lead-consultando  "));
        assert!(!dir.is_pipeline_tag("atencion-humana"));
        assert!(dir.is_business_tag("Atencion-Humana"));
    }

    #[test]
    fn test_pipeline_and_business_listing() {
        let dir = directory();
        let pipeline = dir.pipeline_tags();
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.contains(&"lead-consultando"));
        assert_eq!(dir.business_tags(), vec!["atencion-humana"]);
    }

    #[test]
    fn test_business_mapping_never_resolves_as_stage() {
        // ATENCION maps a business tag only; stage resolution is pipeline-only
        let dir = directory();
        assert!(dir.resolve("ATENCION").is_none());
    }
}

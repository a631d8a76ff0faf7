use crate::core::types::{AuthenticityReport, CardMetadata, FeatureEnvelope};
use crate::knowledge::base::KnowledgeBase;
use std::sync::Arc;
use tracing::debug;

const MIN_BORDER_SYMMETRY: f64 = 0.7;
const MAX_FONT_SIZE_VARIANCE: f64 = 0.35;
const MIN_TREATED_HOLO_VARIANCE: f64 = 0.3;
const BLUR_FLOOR: f64 = 0.25;

/// Scores physical-plausibility signals against what the identified card
/// claims to be. Purely local: no network, no retries, no failure mode
/// beyond "low score with flags". Counterfeits tend to miss on border
/// centering, print consistency, foil treatment, or era-consistent
/// copyright text, so each mismatch deducts from a perfect 1.0.
pub struct AuthenticityVerifier {
    kb: Arc<KnowledgeBase>,
}

impl AuthenticityVerifier {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }

    pub fn verify(&self, features: &FeatureEnvelope, metadata: &CardMetadata) -> AuthenticityReport {
        let mut score: f64 = 1.0;
        let mut flags: Vec<String> = Vec::new();
        let mut notes: Vec<String> = Vec::new();

        // A blurry photo makes every other signal unreliable. Cap the score
        // instead of deducting so we never accuse based on a bad photo.
        let blurry = features.quality.blur_score < BLUR_FLOOR;
        if blurry {
            flags.push("image too blurry for reliable checks".to_string());
            notes.push(format!(
                "blur score {:.2} below {:.2}, capping score",
                features.quality.blur_score, BLUR_FLOOR
            ));
        }

        let symmetry = features.borders.symmetry_score;
        if symmetry > 0.0 && symmetry < MIN_BORDER_SYMMETRY {
            score -= 0.25;
            flags.push(format!("asymmetric borders (symmetry {symmetry:.2})"));
        } else if symmetry > 0.0 {
            notes.push(format!("border symmetry {symmetry:.2} within tolerance"));
        }

        let variance = features.font_metrics.font_size_variance;
        if variance > MAX_FONT_SIZE_VARIANCE {
            score -= 0.2;
            flags.push(format!("inconsistent print sizing (variance {variance:.2})"));
        }

        if let Some(rarity) = metadata.rarity.value() {
            if KnowledgeBase::treated_finish(Some(rarity), "")
                && features.holo_variance < MIN_TREATED_HOLO_VARIANCE
            {
                score -= 0.3;
                flags.push(format!(
                    "rarity '{}' expects a treated finish but holo variance is {:.2}",
                    rarity, features.holo_variance
                ));
            }
        }

        if let Some(flag) = self.copyright_mismatch(metadata) {
            score -= 0.3;
            flags.push(flag);
        }

        if blurry {
            score = score.min(0.5);
        }
        let score = score.clamp(0.0, 1.0);

        let rationale = if flags.is_empty() {
            if notes.is_empty() {
                "no physical inconsistencies detected".to_string()
            } else {
                notes.join("; ")
            }
        } else {
            flags.join("; ")
        };

        debug!("authenticity score {:.2}, {} flag(s)", score, flags.len());
        AuthenticityReport {
            score,
            flags,
            rationale,
        }
    }

    /// The copyright run on the card should not predate the set it claims
    /// to come from. A later year is fine (reprints), an earlier one is not.
    fn copyright_mismatch(&self, metadata: &CardMetadata) -> Option<String> {
        let run = metadata.copyright_run.value()?;
        let (first, last) = KnowledgeBase::copyright_years(run)?;
        let printed = last.unwrap_or(first);
        let set_name = metadata.set.value()?;
        let release = self.kb.set_release_year(set_name)?;
        if printed < release {
            Some(format!(
                "copyright run ends {printed} but set '{set_name}' released {release}"
            ))
        } else {
            None
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ----------- Vision / feature extraction -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockKind {
    Line,
    Word,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub confidence: f64, // 0.0 to 1.0
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBox,
    #[serde(rename = "type")]
    pub kind: BlockKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageLabel {
    pub name: String,
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BorderMetrics {
    #[serde(rename = "topRatio")]
    pub top_ratio: f64,
    #[serde(rename = "bottomRatio")]
    pub bottom_ratio: f64,
    #[serde(rename = "leftRatio")]
    pub left_ratio: f64,
    #[serde(rename = "rightRatio")]
    pub right_ratio: f64,
    #[serde(rename = "symmetryScore")]
    pub symmetry_score: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FontMetrics {
    pub kerning: Vec<f64>,
    pub alignment: f64,
    #[serde(rename = "fontSizeVariance")]
    pub font_size_variance: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(rename = "blurScore")]
    pub blur_score: f64,
    #[serde(rename = "glareDetected")]
    pub glare_detected: bool,
    pub brightness: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub format: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

/// Everything the vision stage could read out of one image. Built once,
/// never mutated afterwards; every downstream stage consumes the same envelope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeatureEnvelope {
    pub ocr: Vec<OcrBlock>,
    pub labels: Vec<ImageLabel>,
    pub borders: BorderMetrics,
    #[serde(rename = "holoVariance")]
    pub holo_variance: f64, // 0.0 to 1.0
    #[serde(rename = "fontMetrics")]
    pub font_metrics: FontMetrics,
    pub quality: QualityMetrics,
    #[serde(rename = "imageMeta")]
    pub image_meta: ImageMeta,
}

impl FeatureEnvelope {
    /// Envelope for an image we could not analyze: empty OCR, zeroed metrics.
    /// Downstream stages still run, just in degraded mode.
    pub fn degraded(image_meta: ImageMeta) -> Self {
        Self {
            image_meta,
            ..Default::default()
        }
    }

    /// Highest OCR line on the card, where the name usually lives.
    pub fn topmost_block(&self) -> Option<&OcrBlock> {
        let lines = self.ocr.iter().filter(|b| b.kind == BlockKind::Line);
        let cmp = |a: &&OcrBlock, b: &&OcrBlock| {
            a.bounding_box
                .top
                .partial_cmp(&b.bounding_box.top)
                .unwrap_or(std::cmp::Ordering::Equal)
        };
        lines
            .min_by(cmp)
            .or_else(|| self.ocr.iter().min_by(cmp))
    }

    /// All OCR line text joined, for regex sweeps over the whole card.
    pub fn full_text(&self) -> String {
        self.ocr
            .iter()
            .filter(|b| b.kind == BlockKind::Line)
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ----------- Extracted card metadata -----------------

/// Atomic unit of every extracted field. Confidence and rationale are
/// mandatory even when the value is null.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldResult<T> {
    pub value: Option<T>,
    pub confidence: f64, // 0.0 to 1.0
    pub rationale: String,
}

impl<T> FieldResult<T> {
    pub fn found(value: T, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }

    pub fn missing(rationale: impl Into<String>) -> Self {
        Self {
            value: None,
            confidence: 0.0,
            rationale: rationale.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate<T> {
    pub value: T,
    pub confidence: f64,
}

/// Used for fields where the answer is structurally ambiguous (set name):
/// a best value plus the ranked alternatives it was chosen from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiCandidateResult<T> {
    pub value: Option<T>,
    /// Sorted by confidence, descending.
    pub candidates: Vec<Candidate<T>>,
    pub rationale: String,
}

impl<T> MultiCandidateResult<T> {
    pub fn missing(rationale: impl Into<String>) -> Self {
        Self {
            value: None,
            candidates: Vec::new(),
            rationale: rationale.into(),
        }
    }

    pub fn top_confidence(&self) -> f64 {
        self.candidates.first().map(|c| c.confidence).unwrap_or(0.0)
    }
}

/// Every extracted field is one of these two shapes. Consumers must handle
/// both explicitly; there is no "plain optional" escape hatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "camelCase")]
pub enum Field<T> {
    Single(FieldResult<T>),
    MultiCandidate(MultiCandidateResult<T>),
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Single(f) => f.value.as_ref(),
            Field::MultiCandidate(m) => m.value.as_ref(),
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Field::Single(f) => f.confidence,
            Field::MultiCandidate(m) => {
                if m.value.is_some() {
                    m.top_confidence()
                } else {
                    0.0
                }
            }
        }
    }

    pub fn rationale(&self) -> &str {
        match self {
            Field::Single(f) => &f.rationale,
            Field::MultiCandidate(m) => &m.rationale,
        }
    }
}

/// Structured identification of one card. Invariant: all seven fields are
/// always present, even on total failure (null value, zero confidence,
/// explanatory rationale) so consumers never special-case a missing field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardMetadata {
    pub name: Field<String>,
    pub rarity: Field<String>,
    pub set: Field<String>,
    #[serde(rename = "setSymbol")]
    pub set_symbol: Field<String>,
    #[serde(rename = "collectorNumber")]
    pub collector_number: Field<String>,
    #[serde(rename = "copyrightRun")]
    pub copyright_run: Field<String>,
    pub illustrator: Field<String>,
    #[serde(rename = "overallConfidence")]
    pub overall_confidence: f64,
    #[serde(rename = "reasoningTrail")]
    pub reasoning_trail: String,
    #[serde(rename = "verifiedByAI")]
    pub verified_by_ai: bool,
}

impl CardMetadata {
    /// All-null metadata with a shared rationale. Used when there is nothing
    /// to reason over (zero OCR blocks) or when every path has failed.
    pub fn empty(rationale: &str) -> Self {
        Self {
            name: Field::Single(FieldResult::missing(rationale)),
            rarity: Field::Single(FieldResult::missing(rationale)),
            set: Field::MultiCandidate(MultiCandidateResult::missing(rationale)),
            set_symbol: Field::Single(FieldResult::missing(rationale)),
            collector_number: Field::Single(FieldResult::missing(rationale)),
            copyright_run: Field::Single(FieldResult::missing(rationale)),
            illustrator: Field::Single(FieldResult::missing(rationale)),
            overall_confidence: 0.0,
            reasoning_trail: rationale.to_string(),
            verified_by_ai: false,
        }
    }

    /// Weighted average over per-field confidences. Name, set, and rarity
    /// carry more weight because they drive pricing and resolution.
    pub fn weighted_overall(&self) -> f64 {
        let weighted = [
            (&self.name, 0.30),
            (&self.set, 0.20),
            (&self.rarity, 0.20),
            (&self.collector_number, 0.12),
            (&self.set_symbol, 0.06),
            (&self.copyright_run, 0.06),
            (&self.illustrator, 0.06),
        ];
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        let sum: f64 = weighted.iter().map(|(f, w)| f.confidence() * w).sum();
        (sum / total).clamp(0.0, 1.0)
    }
}

// ----------- Set resolution -----------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogCard {
    pub name: String,
    #[serde(rename = "setName")]
    pub set_name: String,
    #[serde(rename = "setSeries")]
    pub set_series: String,
    #[serde(rename = "releaseDate")]
    pub release_date: Option<NaiveDate>,
    pub number: String,
    pub rarity: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetMatch {
    #[serde(rename = "setName")]
    pub set_name: String,
    #[serde(rename = "setSeries")]
    pub set_series: String,
    #[serde(rename = "collectorNumber")]
    pub collector_number: String,
    pub rarity: Option<String>,
    /// 1.0 exact number match, 0.85 numerator-only match, 0.5 recency fallback.
    pub confidence: f64,
    #[serde(rename = "matchReason")]
    pub match_reason: String,
}

// ----------- Pricing -----------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PriceQuery {
    #[serde(rename = "cardName")]
    pub card_name: String,
    pub set: Option<String>,
    pub number: Option<String>,
    pub rarity: Option<String>,
    pub condition: Option<String>,
    #[serde(rename = "windowDays")]
    pub window_days: u32,
}

/// One comparable sale, normalized across sources.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawComp {
    pub source: String,
    pub price: Decimal,
    pub currency: String,
    #[serde(rename = "soldDate")]
    pub sold_date: Option<DateTime<Utc>>,
    pub condition: Option<String>,
    #[serde(rename = "listingUrl")]
    pub listing_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Valuation {
    #[serde(rename = "valueLow")]
    pub value_low: Decimal,
    #[serde(rename = "valueMedian")]
    pub value_median: Decimal,
    #[serde(rename = "valueHigh")]
    pub value_high: Decimal,
    #[serde(rename = "compsCount")]
    pub comps_count: usize,
    pub sources: Vec<String>,
    pub confidence: f64,
}

impl Valuation {
    /// Zero-confidence valuation: the orchestrator tried and found nothing.
    /// Callers decide whether to surface an "insufficient data" state.
    pub fn insufficient() -> Self {
        Self {
            value_low: Decimal::ZERO,
            value_median: Decimal::ZERO,
            value_high: Decimal::ZERO,
            comps_count: 0,
            sources: Vec::new(),
            confidence: 0.0,
        }
    }
}

// ----------- Authenticity -----------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticityReport {
    pub score: f64, // 0.0 to 1.0
    pub flags: Vec<String>,
    pub rationale: String,
}

// ----------- Caller hints -----------------

/// Optional caller-supplied context threaded into the reasoning prompt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Hints {
    #[serde(rename = "expectedName")]
    pub expected_name: Option<String>,
    #[serde(rename = "expectedSet")]
    pub expected_set: Option<String>,
}

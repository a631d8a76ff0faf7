use crate::config::config::ReasoningCfg;
use crate::core::error::PipelineError;
use crate::core::types::{
    Candidate, CardMetadata, FeatureEnvelope, Field, FieldResult, Hints, MultiCandidateResult,
};
use crate::knowledge::base::KnowledgeBase;
use crate::matching::fuzzy::FuzzyMatcher;
use crate::reasoning::llm::{LlmCapability, LlmOptions};
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are an expert at identifying collectible trading cards from OCR \
text and image metrics. You always answer with strictly valid JSON matching the requested \
schema, with a confidence between 0.0 and 1.0 and a short rationale for every field. Use null \
for any value you cannot determine; never omit a field.";

// ----------- Strict response schema -----------------

#[derive(Debug, Deserialize)]
struct RawExtraction {
    name: RawField,
    rarity: RawField,
    set: RawSetField,
    #[serde(rename = "setSymbol")]
    set_symbol: RawField,
    #[serde(rename = "collectorNumber")]
    collector_number: RawField,
    #[serde(rename = "copyrightRun")]
    copyright_run: RawField,
    illustrator: RawField,
}

#[derive(Debug, Deserialize)]
struct RawField {
    value: Option<String>,
    confidence: f64,
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawSetField {
    value: Option<String>,
    #[serde(default)]
    candidates: Vec<RawCandidate>,
    confidence: f64,
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    value: String,
    confidence: f64,
}

impl RawExtraction {
    fn validate(&self) -> Result<(), PipelineError> {
        let confidences = [
            ("name", self.name.confidence),
            ("rarity", self.rarity.confidence),
            ("set", self.set.confidence),
            ("setSymbol", self.set_symbol.confidence),
            ("collectorNumber", self.collector_number.confidence),
            ("copyrightRun", self.copyright_run.confidence),
            ("illustrator", self.illustrator.confidence),
        ];
        for (field, c) in confidences {
            if !(0.0..=1.0).contains(&c) {
                return Err(PipelineError::Malformed(format!(
                    "{field} confidence {c} outside [0,1]"
                )));
            }
        }
        for cand in &self.set.candidates {
            if !(0.0..=1.0).contains(&cand.confidence) {
                return Err(PipelineError::Malformed(format!(
                    "set candidate confidence {} outside [0,1]",
                    cand.confidence
                )));
            }
        }
        Ok(())
    }
}

/// Resolves ambiguous OCR text into structured card metadata via an LLM
/// inference capability, with a heuristic fallback when inference fails.
/// Never errors: every path ends in a complete CardMetadata.
pub struct OcrReasoningService {
    llm: Arc<dyn LlmCapability>,
    kb: Arc<KnowledgeBase>,
    matcher: FuzzyMatcher,
    cfg: ReasoningCfg,
}

impl OcrReasoningService {
    pub fn new(llm: Arc<dyn LlmCapability>, kb: Arc<KnowledgeBase>, cfg: ReasoningCfg) -> Self {
        let matcher = FuzzyMatcher::new(cfg.fuzzy_threshold);
        Self {
            llm,
            kb,
            matcher,
            cfg,
        }
    }

    pub async fn infer(&self, envelope: &FeatureEnvelope, hints: &Hints) -> CardMetadata {
        // Cost avoidance: nothing to reason over, skip inference entirely.
        if envelope.ocr.is_empty() {
            return CardMetadata::empty("no OCR text detected; inference skipped");
        }

        let user_prompt = self.build_prompt(envelope, hints);
        let opts = LlmOptions {
            max_tokens: self.cfg.max_tokens,
            temperature: self.cfg.temperature,
        };

        let attempt = self
            .cfg
            .retry
            .run("ocr reasoning", || {
                let prompt = user_prompt.clone();
                async move {
                    let reply = self.llm.generate(SYSTEM_PROMPT, &prompt, opts).await?;
                    let parsed = parse_extraction(&reply.text)?;
                    Ok((parsed, reply.usage))
                }
            })
            .await;

        match attempt {
            Ok((raw, usage)) => {
                info!(
                    "reasoning ok: prompt_tokens={} completion_tokens={}",
                    usage.prompt_tokens, usage.completion_tokens
                );
                self.to_metadata(raw, usage.prompt_tokens + usage.completion_tokens, envelope)
            }
            Err(e) => {
                warn!("reasoning exhausted retries, falling back: {:#}", e);
                self.fallback(envelope, &format!("{e:#}"))
            }
        }
    }

    /// Group OCR blocks into vertical bands so the model sees which text sits
    /// where a name vs. a copyright run would be printed.
    fn build_prompt(&self, envelope: &FeatureEnvelope, hints: &Hints) -> String {
        let mut top = Vec::new();
        let mut middle = Vec::new();
        let mut bottom = Vec::new();
        for block in envelope.ocr.iter().filter(|b| !b.text.trim().is_empty()) {
            let line = format!("  [conf {:.2}] {}", block.confidence, block.text.trim());
            match block.bounding_box.top {
                t if t < 0.33 => top.push(line),
                t if t < 0.66 => middle.push(line),
                _ => bottom.push(line),
            }
        }

        let mut prompt = String::new();
        prompt.push_str("Identify this trading card from its OCR text and image metrics.\n\n");
        prompt.push_str("OCR text by vertical position (card names print at the top, copyright and collector numbers at the bottom):\n");
        prompt.push_str(&format!("TOP THIRD:\n{}\n", section(&top)));
        prompt.push_str(&format!("MIDDLE THIRD:\n{}\n", section(&middle)));
        prompt.push_str(&format!("BOTTOM THIRD:\n{}\n", section(&bottom)));

        prompt.push_str(&format!(
            "\nImage metrics: holographicVariance={:.2} (above 0.6 suggests a holo/treated finish), \
             borderSymmetry={:.2}, blurScore={:.2}, glare={}.\n",
            envelope.holo_variance,
            envelope.borders.symmetry_score,
            envelope.quality.blur_score,
            envelope.quality.glare_detected
        ));

        if !envelope.labels.is_empty() {
            let labels: Vec<String> = envelope
                .labels
                .iter()
                .map(|l| format!("{} ({:.2})", l.name, l.confidence))
                .collect();
            prompt.push_str(&format!("Detected labels: {}.\n", labels.join(", ")));
        }

        if let Some(name) = &hints.expected_name {
            prompt.push_str(&format!("The uploader believes the card is: {name}.\n"));
        }
        if let Some(set) = &hints.expected_set {
            prompt.push_str(&format!("The uploader believes the set is: {set}.\n"));
        }

        prompt.push_str(
            "\nRespond with JSON only, exactly this schema:\n\
             {\n\
             \"name\": {\"value\": string|null, \"confidence\": number, \"rationale\": string},\n\
             \"rarity\": {\"value\": string|null, \"confidence\": number, \"rationale\": string},\n\
             \"set\": {\"value\": string|null, \"confidence\": number, \"candidates\": [{\"value\": string, \"confidence\": number}], \"rationale\": string},\n\
             \"setSymbol\": {\"value\": string|null, \"confidence\": number, \"rationale\": string},\n\
             \"collectorNumber\": {\"value\": string|null, \"confidence\": number, \"rationale\": string},\n\
             \"copyrightRun\": {\"value\": string|null, \"confidence\": number, \"rationale\": string},\n\
             \"illustrator\": {\"value\": string|null, \"confidence\": number, \"rationale\": string}\n\
             }\n",
        );
        prompt
    }

    fn to_metadata(
        &self,
        raw: RawExtraction,
        total_tokens: u32,
        envelope: &FeatureEnvelope,
    ) -> CardMetadata {
        let name = single(raw.name);
        let mut rarity = single(raw.rarity);
        let set = self.set_field(raw.set);
        let set_symbol = single(raw.set_symbol);
        let mut collector_number = single(raw.collector_number);
        let copyright_run = single(raw.copyright_run);
        let mut illustrator = single(raw.illustrator);

        // Heuristic backstops for fields the model left empty but the raw
        // text or pixel metrics still support.
        let full_text = envelope.full_text();
        if collector_number.value().is_none() {
            if let Some((num, total)) = KnowledgeBase::find_collector_number(&full_text) {
                collector_number = Field::Single(FieldResult::found(
                    format!("{num}/{total}"),
                    0.6,
                    "pattern match over raw OCR text",
                ));
            }
        }
        if rarity.value().is_none() {
            if let Some(label) = self.kb.rarity_from_text(&full_text) {
                rarity = Field::Single(FieldResult::found(
                    label.to_string(),
                    0.7,
                    "printed rarity text matched a known pattern",
                ));
            } else if envelope.holo_variance >= 0.6 {
                rarity = Field::Single(FieldResult::found(
                    "Holo Rare".to_string(),
                    0.5,
                    format!(
                        "no printed rarity found; holographic variance {:.2} implies a treated finish",
                        envelope.holo_variance
                    ),
                ));
            }
        }
        if illustrator.value().is_none() {
            if let Some(credit) = KnowledgeBase::find_illustrator(&full_text) {
                illustrator = Field::Single(FieldResult::found(
                    credit,
                    0.7,
                    "Illus. credit found in raw OCR text",
                ));
            }
        }

        let mut metadata = CardMetadata {
            name,
            rarity,
            set,
            set_symbol,
            collector_number,
            copyright_run,
            illustrator,
            overall_confidence: 0.0,
            reasoning_trail: String::new(),
            verified_by_ai: true,
        };
        metadata.overall_confidence = metadata.weighted_overall();
        metadata.reasoning_trail = trail(&metadata, total_tokens);
        metadata
    }

    /// Correct the model's set guesses against the known-set dictionary and
    /// keep the candidate list sorted by confidence.
    fn set_field(&self, raw: RawSetField) -> Field<String> {
        let canonicalize = |value: String| -> String {
            let names: Vec<&str> = self.kb.known_set_names().collect();
            match self.matcher.best_match(&value, names) {
                Some(m) => m.value.to_string(),
                None => value,
            }
        };

        let mut candidates: Vec<Candidate<String>> = raw
            .candidates
            .into_iter()
            .map(|c| Candidate {
                value: canonicalize(c.value),
                confidence: c.confidence,
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let value = raw.value.map(canonicalize).or_else(|| {
            candidates
                .first()
                .filter(|c| c.confidence >= raw.confidence.max(0.3))
                .map(|c| c.value.clone())
        });

        // value must appear in the candidate list so consumers see one ranking
        if let Some(v) = &value {
            if !candidates.iter().any(|c| &c.value == v) {
                candidates.insert(
                    0,
                    Candidate {
                        value: v.clone(),
                        confidence: raw.confidence.clamp(0.0, 1.0),
                    },
                );
            }
        }

        Field::MultiCandidate(MultiCandidateResult {
            value,
            candidates,
            rationale: raw.rationale,
        })
    }

    /// Heuristic fallback when inference is exhausted: topmost OCR block
    /// becomes the name at a discounted confidence, everything else null.
    /// Guarantees there is always some name to price against.
    fn fallback(&self, envelope: &FeatureEnvelope, reason: &str) -> CardMetadata {
        let rationale = "inference unavailable; field not heuristically recoverable";
        let mut metadata = CardMetadata::empty(rationale);

        let name_conf = match envelope.topmost_block() {
            Some(block) => {
                let discounted = block.confidence * self.cfg.fallback_name_discount;
                metadata.name = Field::Single(FieldResult::found(
                    block.text.trim().to_string(),
                    discounted,
                    "topmost OCR block taken as the card name (inference fallback)",
                ));
                discounted
            }
            None => 0.0,
        };

        metadata.overall_confidence =
            (name_conf * self.cfg.fallback_overall_discount).clamp(0.0, 1.0);
        metadata.verified_by_ai = false;
        metadata.reasoning_trail = format!(
            "fallback extraction after inference failure: {reason}. Name lifted from topmost OCR \
             block at x{:.2} discount; overall discounted x{:.2}.",
            self.cfg.fallback_name_discount, self.cfg.fallback_overall_discount
        );
        metadata
    }
}

fn section(lines: &[String]) -> String {
    if lines.is_empty() {
        "  (none)".to_string()
    } else {
        lines.join("\n")
    }
}

fn single(raw: RawField) -> Field<String> {
    Field::Single(match raw.value {
        Some(v) if !v.trim().is_empty() => {
            FieldResult::found(v.trim().to_string(), raw.confidence, raw.rationale)
        }
        _ => FieldResult {
            value: None,
            confidence: 0.0,
            rationale: raw.rationale,
        },
    })
}

fn trail(metadata: &CardMetadata, total_tokens: u32) -> String {
    let fields = [
        ("name", &metadata.name),
        ("rarity", &metadata.rarity),
        ("set", &metadata.set),
        ("setSymbol", &metadata.set_symbol),
        ("collectorNumber", &metadata.collector_number),
        ("copyrightRun", &metadata.copyright_run),
        ("illustrator", &metadata.illustrator),
    ];
    let mut out = String::from("AI extraction");
    out.push_str(&format!(" ({total_tokens} tokens):"));
    for (label, field) in fields {
        out.push_str(&format!(
            "\n- {label} [{:.2}]: {}",
            field.confidence(),
            field.rationale()
        ));
    }
    out
}

/// Pull the first JSON object out of a model reply, tolerating markdown
/// fencing and prose around it. Schema violations become Malformed errors;
/// partially valid data never leaks out.
fn parse_extraction(text: &str) -> Result<RawExtraction> {
    let start = text
        .find('{')
        .ok_or_else(|| PipelineError::Malformed("no JSON object in reply".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| PipelineError::Malformed("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(PipelineError::Malformed("unterminated JSON object".to_string()).into());
    }

    let raw: RawExtraction = serde_json::from_str(&text[start..=end])
        .map_err(|e| PipelineError::Malformed(format!("schema violation: {e}")))?;
    raw.validate()?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BlockKind, BoundingBox, OcrBlock};
    use crate::reasoning::llm::{LlmReply, TokenUsage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeLlm {
        replies: Vec<String>,
        calls: AtomicU32,
    }

    impl FakeLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: replies.into_iter().map(String::from).collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmCapability for FakeLlm {
        async fn generate(&self, _system: &str, _user: &str, _opts: LlmOptions) -> Result<LlmReply> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = self
                .replies
                .get(i.min(self.replies.len().saturating_sub(1)))
                .cloned()
                .unwrap_or_default();
            Ok(LlmReply {
                text,
                usage: TokenUsage {
                    prompt_tokens: 200,
                    completion_tokens: 80,
                },
            })
        }
    }

    fn block(text: &str, top: f64, confidence: f64) -> OcrBlock {
        OcrBlock {
            text: text.to_string(),
            confidence,
            bounding_box: BoundingBox {
                left: 0.1,
                top,
                width: 0.6,
                height: 0.05,
            },
            kind: BlockKind::Line,
        }
    }

    fn envelope() -> FeatureEnvelope {
        let mut env = FeatureEnvelope::default();
        env.ocr = vec![
            block("Charizard VMAX", 0.04, 0.97),
            block("\u{a9} 2022 Pok\u{e9}mon", 0.93, 0.88),
            block("018/195", 0.95, 0.91),
        ];
        env.holo_variance = 0.85;
        env
    }

    fn good_reply() -> &'static str {
        r#"```json
{
  "name": {"value": "Charizard VMAX", "confidence": 0.95, "rationale": "top line, clean OCR"},
  "rarity": {"value": "Holo Rare", "confidence": 0.7, "rationale": "high holo variance"},
  "set": {"value": "lost origin", "confidence": 0.6, "candidates": [{"value": "lost origin", "confidence": 0.6}, {"value": "Silver Tempest", "confidence": 0.3}], "rationale": "number range fits"},
  "setSymbol": {"value": null, "confidence": 0.0, "rationale": "symbol not visible in OCR"},
  "collectorNumber": {"value": "018/195", "confidence": 0.9, "rationale": "bottom line matches collector format"},
  "copyrightRun": {"value": "© 2022 Pokémon", "confidence": 0.85, "rationale": "bottom third"},
  "illustrator": {"value": null, "confidence": 0.0, "rationale": "no Illus. credit detected"}
}
```"#
    }

    fn service(llm: Arc<FakeLlm>) -> OcrReasoningService {
        OcrReasoningService::new(
            llm,
            Arc::new(KnowledgeBase::default()),
            ReasoningCfg::default(),
        )
    }

    #[tokio::test]
    async fn zero_ocr_blocks_skip_inference() {
        let llm = Arc::new(FakeLlm::new(vec![good_reply()]));
        let svc = service(llm.clone());
        let metadata = svc.infer(&FeatureEnvelope::default(), &Hints::default()).await;

        assert!(metadata.name.value().is_none());
        assert_eq!(metadata.overall_confidence, 0.0);
        assert!(!metadata.reasoning_trail.is_empty());
        // no inference call was made
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fenced_json_parses_and_sets_are_canonicalized() {
        let svc = service(Arc::new(FakeLlm::new(vec![good_reply()])));
        let metadata = svc.infer(&envelope(), &Hints::default()).await;

        assert_eq!(metadata.name.value().unwrap(), "Charizard VMAX");
        assert!(metadata.verified_by_ai);
        assert!(metadata.overall_confidence > 0.5);
        // "lost origin" corrected to the dictionary spelling
        assert_eq!(metadata.set.value().unwrap(), "Lost Origin");
        match &metadata.set {
            Field::MultiCandidate(m) => {
                assert!(m.candidates.len() >= 2);
                assert!(m.candidates[0].confidence >= m.candidates[1].confidence);
            }
            Field::Single(_) => panic!("set must be multi-candidate"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_replies_fall_back_with_discounts() {
        let svc = service(Arc::new(FakeLlm::new(vec!["the card looks valuable"])));
        let env = envelope();
        let metadata = svc.infer(&env, &Hints::default()).await;

        assert!(!metadata.verified_by_ai);
        assert_eq!(metadata.name.value().unwrap(), "Charizard VMAX");
        let expected_name_conf = 0.97 * 0.7;
        assert!((metadata.name.confidence() - expected_name_conf).abs() < 1e-9);
        assert!((metadata.overall_confidence - expected_name_conf * 0.5).abs() < 1e-9);
        assert!(metadata.reasoning_trail.contains("fallback"));
        // all seven fields still present with rationales
        assert!(!metadata.rarity.rationale().is_empty());
        assert!(!metadata.illustrator.rationale().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_confidence_is_below_success_confidence() {
        let env = envelope();
        let ok = service(Arc::new(FakeLlm::new(vec![good_reply()])))
            .infer(&env, &Hints::default())
            .await;
        let degraded = service(Arc::new(FakeLlm::new(vec!["nonsense"])))
            .infer(&env, &Hints::default())
            .await;
        assert!(degraded.overall_confidence < ok.overall_confidence);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_confidence_is_rejected_as_malformed() {
        let bad = r#"{"name": {"value": "X", "confidence": 3.0, "rationale": "r"},
            "rarity": {"value": null, "confidence": 0, "rationale": "r"},
            "set": {"value": null, "confidence": 0, "candidates": [], "rationale": "r"},
            "setSymbol": {"value": null, "confidence": 0, "rationale": "r"},
            "collectorNumber": {"value": null, "confidence": 0, "rationale": "r"},
            "copyrightRun": {"value": null, "confidence": 0, "rationale": "r"},
            "illustrator": {"value": null, "confidence": 0, "rationale": "r"}}"#;
        let svc = service(Arc::new(FakeLlm::new(vec![bad])));
        let metadata = svc.infer(&envelope(), &Hints::default()).await;
        // rejected every attempt, so we land on the fallback path
        assert!(!metadata.verified_by_ai);
    }

    #[tokio::test]
    async fn missing_collector_number_recovered_by_pattern_sweep() {
        let reply = r#"{"name": {"value": "Charizard VMAX", "confidence": 0.95, "rationale": "top"},
            "rarity": {"value": null, "confidence": 0, "rationale": "none printed"},
            "set": {"value": null, "confidence": 0, "candidates": [], "rationale": "unknown"},
            "setSymbol": {"value": null, "confidence": 0, "rationale": "none"},
            "collectorNumber": {"value": null, "confidence": 0, "rationale": "unsure"},
            "copyrightRun": {"value": null, "confidence": 0, "rationale": "none"},
            "illustrator": {"value": null, "confidence": 0, "rationale": "none"}}"#;
        let svc = service(Arc::new(FakeLlm::new(vec![reply])));
        let metadata = svc.infer(&envelope(), &Hints::default()).await;
        assert_eq!(metadata.collector_number.value().unwrap(), "018/195");
        // holo variance backstop kicked in for rarity
        assert_eq!(metadata.rarity.value().unwrap(), "Holo Rare");
    }

    #[tokio::test]
    async fn printed_rarity_and_illustrator_recovered_from_raw_text() {
        let reply = r#"{"name": {"value": "Umbreon VMAX", "confidence": 0.95, "rationale": "top"},
            "rarity": {"value": null, "confidence": 0, "rationale": "unsure"},
            "set": {"value": null, "confidence": 0, "candidates": [], "rationale": "unknown"},
            "setSymbol": {"value": null, "confidence": 0, "rationale": "none"},
            "collectorNumber": {"value": "215/203", "confidence": 0.9, "rationale": "bottom"},
            "copyrightRun": {"value": null, "confidence": 0, "rationale": "none"},
            "illustrator": {"value": null, "confidence": 0, "rationale": "unsure"}}"#;
        let mut env = FeatureEnvelope::default();
        env.ocr = vec![
            block("Umbreon VMAX", 0.04, 0.97),
            block("Secret Rare 215/203", 0.9, 0.9),
            block("Illus. Keiichiro Ito", 0.95, 0.88),
        ];
        env.holo_variance = 0.1; // flat photo, so only the printed text can recover rarity

        let svc = service(Arc::new(FakeLlm::new(vec![reply])));
        let metadata = svc.infer(&env, &Hints::default()).await;

        assert_eq!(metadata.rarity.value().unwrap(), "Secret Rare");
        assert_eq!(metadata.illustrator.value().unwrap(), "Keiichiro Ito");
        // a model-provided value is never overridden by the backstop
        assert_eq!(metadata.collector_number.value().unwrap(), "215/203");
    }

    #[test]
    fn parse_rejects_prose() {
        assert!(parse_extraction("no json here").is_err());
    }
}

use crate::authenticity::checker::AuthenticityVerifier;
use crate::catalog::resolver::SetResolver;
use crate::config::config::WorkflowCfg;
use crate::core::types::{
    AuthenticityReport, CardMetadata, FeatureEnvelope, Hints, PriceQuery, SetMatch, Valuation,
};
use crate::pricing::orchestrator::PricingOrchestrator;
use crate::reasoning::service::OcrReasoningService;
use crate::vision::extractor::FeatureExtractionService;
use crate::workflow::store::WorkflowStore;
use crate::workflow::types::{
    IdentifyOutcome, Stage, StageRecord, WorkflowExecution, WorkflowStatus,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Sequences the pipeline: extract, reason, then set resolution, pricing
/// and authenticity in parallel, then aggregate. Each stage result is
/// persisted as it settles so `resume` can pick up a crashed execution
/// from the last completed stage.
///
/// Only feature extraction can fail the whole run (no image means nothing
/// downstream can work). The three parallel branches are independent: one
/// timing out degrades the result to PARTIAL without blocking the others.
pub struct WorkflowCoordinator {
    extractor: Arc<FeatureExtractionService>,
    reasoner: Arc<OcrReasoningService>,
    resolver: Arc<SetResolver>,
    pricing: Arc<PricingOrchestrator>,
    authenticity: Arc<AuthenticityVerifier>,
    store: Arc<dyn WorkflowStore>,
    cfg: WorkflowCfg,
    pricing_window_days: u32,
}

impl WorkflowCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<FeatureExtractionService>,
        reasoner: Arc<OcrReasoningService>,
        resolver: Arc<SetResolver>,
        pricing: Arc<PricingOrchestrator>,
        authenticity: Arc<AuthenticityVerifier>,
        store: Arc<dyn WorkflowStore>,
        cfg: WorkflowCfg,
        pricing_window_days: u32,
    ) -> Self {
        Self {
            extractor,
            reasoner,
            resolver,
            pricing,
            authenticity,
            store,
            cfg,
            pricing_window_days,
        }
    }

    /// Single entry point: run the full pipeline for one image.
    pub async fn identify(&self, image_ref: &str, hints: Hints) -> Result<IdentifyOutcome> {
        let execution = WorkflowExecution::new(
            Uuid::new_v4().to_string(),
            image_ref.to_string(),
            hints,
        );
        self.store.create(execution.clone()).await?;
        let span = info_span!("identify", execution = %execution.id);
        self.drive(execution).instrument(span).await
    }

    /// Continue a crashed execution, skipping stages that already completed.
    pub async fn resume(&self, execution_id: &str) -> Result<IdentifyOutcome> {
        let execution = self
            .store
            .load(execution_id)
            .await?
            .with_context(|| format!("unknown execution '{execution_id}'"))?;
        let span = info_span!("resume", execution = %execution.id);
        self.drive(execution).instrument(span).await
    }

    async fn drive(&self, execution: WorkflowExecution) -> Result<IdentifyOutcome> {
        let features = match self.extracting(&execution).await? {
            Some(features) => features,
            None => return self.fail(&execution).await,
        };
        let metadata = self.reasoning(&execution, &features).await?;

        let card_name = metadata.name.value().cloned().unwrap_or_default();
        let collector_number = metadata.collector_number.value().cloned();
        let query = PriceQuery {
            card_name: card_name.clone(),
            set: metadata.set.value().cloned(),
            number: collector_number.clone(),
            rarity: metadata.rarity.value().cloned(),
            condition: None,
            window_days: self.pricing_window_days,
        };

        // Independent branches: each has its own timeout budget and records
        // its own stage result; a failed one never blocks the other two.
        let (resolve, pricing, authenticity) = tokio::join!(
            self.resolving_set(&execution, &card_name, collector_number.as_deref()),
            self.pricing_branch(&execution, &query),
            self.authenticity_branch(&execution, &features, &metadata),
        );
        let (set_match, resolve_ok) = resolve?;
        let (valuation, pricing_ok) = pricing?;
        let (report, authenticity_ok) = authenticity?;

        let status = if resolve_ok && pricing_ok && authenticity_ok {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Partial
        };
        let summary = serde_json::json!({
            "resolved": set_match.is_some(),
            "priced": valuation.is_some(),
            "verified": report.is_some(),
        });
        self.store
            .record_stage(
                &execution.id,
                StageRecord::succeeded(Stage::Aggregating, format!("{status:?}"), &summary),
            )
            .await?;
        self.store.finish(&execution.id, status).await?;
        info!("execution finished with status {:?}", status);

        Ok(IdentifyOutcome {
            execution_id: execution.id.clone(),
            status,
            card_metadata: metadata,
            set_match,
            valuation,
            authenticity: report,
        })
    }

    /// Returns None when extraction failed fatally.
    async fn extracting(&self, execution: &WorkflowExecution) -> Result<Option<FeatureEnvelope>> {
        if let Some(prior) = execution.completed_payload::<FeatureEnvelope>(Stage::Extracting) {
            info!("skipping extraction, stage already completed");
            return Ok(Some(prior));
        }
        match self.extractor.extract(&execution.image_ref).await {
            Ok(features) => {
                let detail = format!("{} OCR block(s)", features.ocr.len());
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::succeeded(Stage::Extracting, detail, &features),
                    )
                    .await?;
                Ok(Some(features))
            }
            Err(e) => {
                warn!("feature extraction failed fatally: {:#}", e);
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::failed(Stage::Extracting, format!("{e:#}")),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    async fn reasoning(
        &self,
        execution: &WorkflowExecution,
        features: &FeatureEnvelope,
    ) -> Result<CardMetadata> {
        if let Some(prior) = execution.completed_payload::<CardMetadata>(Stage::Reasoning) {
            info!("skipping reasoning, stage already completed");
            return Ok(prior);
        }
        let metadata = self.reasoner.infer(features, &execution.hints).await;
        let detail = format!("overall confidence {:.2}", metadata.overall_confidence);
        self.store
            .record_stage(
                &execution.id,
                StageRecord::succeeded(Stage::Reasoning, detail, &metadata),
            )
            .await?;
        Ok(metadata)
    }

    async fn resolving_set(
        &self,
        execution: &WorkflowExecution,
        card_name: &str,
        collector_number: Option<&str>,
    ) -> Result<(Option<SetMatch>, bool)> {
        if let Some(prior) = execution.completed_payload::<Option<SetMatch>>(Stage::ResolvingSet) {
            info!("skipping set resolution, stage already completed");
            return Ok((prior, true));
        }
        match timeout(
            self.cfg.resolve_timeout,
            self.resolver.resolve(card_name, collector_number),
        )
        .await
        {
            Ok(found) => {
                let detail = match &found {
                    Some(m) => format!("matched '{}' ({:.2})", m.set_name, m.confidence),
                    None => "no catalog match".to_string(),
                };
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::succeeded(Stage::ResolvingSet, detail, &found),
                    )
                    .await?;
                Ok((found, true))
            }
            Err(_) => {
                warn!(
                    "set resolution exceeded {:?}, degrading",
                    self.cfg.resolve_timeout
                );
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::failed(Stage::ResolvingSet, "timed out"),
                    )
                    .await?;
                Ok((None, false))
            }
        }
    }

    async fn pricing_branch(
        &self,
        execution: &WorkflowExecution,
        query: &PriceQuery,
    ) -> Result<(Option<Valuation>, bool)> {
        if let Some(prior) = execution.completed_payload::<Valuation>(Stage::Pricing) {
            info!("skipping pricing, stage already completed");
            return Ok((Some(prior), true));
        }
        match timeout(self.cfg.pricing_timeout, self.pricing.value(query)).await {
            Ok(valuation) => {
                let detail = format!("{} comp(s)", valuation.comps_count);
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::succeeded(Stage::Pricing, detail, &valuation),
                    )
                    .await?;
                Ok((Some(valuation), true))
            }
            Err(_) => {
                warn!("pricing exceeded {:?}, degrading", self.cfg.pricing_timeout);
                self.store
                    .record_stage(&execution.id, StageRecord::failed(Stage::Pricing, "timed out"))
                    .await?;
                Ok((None, false))
            }
        }
    }

    async fn authenticity_branch(
        &self,
        execution: &WorkflowExecution,
        features: &FeatureEnvelope,
        metadata: &CardMetadata,
    ) -> Result<(Option<AuthenticityReport>, bool)> {
        if let Some(prior) =
            execution.completed_payload::<AuthenticityReport>(Stage::VerifyingAuthenticity)
        {
            info!("skipping authenticity, stage already completed");
            return Ok((Some(prior), true));
        }
        let attempt = timeout(self.cfg.authenticity_timeout, async {
            let report = self.authenticity.verify(features, metadata);
            let detail = format!("score {:.2}, {} flag(s)", report.score, report.flags.len());
            self.store
                .record_stage(
                    &execution.id,
                    StageRecord::succeeded(Stage::VerifyingAuthenticity, detail, &report),
                )
                .await?;
            Ok::<_, anyhow::Error>(report)
        })
        .await;
        match attempt {
            Ok(report) => Ok((Some(report?), true)),
            Err(_) => {
                warn!(
                    "authenticity exceeded {:?}, degrading",
                    self.cfg.authenticity_timeout
                );
                self.store
                    .record_stage(
                        &execution.id,
                        StageRecord::failed(Stage::VerifyingAuthenticity, "timed out"),
                    )
                    .await?;
                Ok((None, false))
            }
        }
    }

    async fn fail(&self, execution: &WorkflowExecution) -> Result<IdentifyOutcome> {
        self.store
            .finish(&execution.id, WorkflowStatus::Failed)
            .await?;
        Ok(IdentifyOutcome {
            execution_id: execution.id.clone(),
            status: WorkflowStatus::Failed,
            card_metadata: CardMetadata::empty("feature extraction failed"),
            set_match: None,
            valuation: None,
            authenticity: None,
        })
    }
}

use anyhow::{Context, Result, bail};
use cardmind::authenticity::checker::AuthenticityVerifier;
use cardmind::catalog::http::TcgCatalogClient;
use cardmind::catalog::resolver::SetResolver;
use cardmind::config::config::AppCfg;
use cardmind::core::types::Hints;
use cardmind::knowledge::base::KnowledgeBase;
use cardmind::pricing::cache::MemoryKvStore;
use cardmind::pricing::orchestrator::{PricingOrchestrator, build_sources};
use cardmind::reasoning::llm::OpenAiCompatClient;
use cardmind::reasoning::service::OcrReasoningService;
use cardmind::vision::capability::LocalObjectStore;
use cardmind::vision::extractor::FeatureExtractionService;
use cardmind::vision::http::HttpVisionClient;
use cardmind::workflow::coordinator::WorkflowCoordinator;
use cardmind::workflow::store::MemoryWorkflowStore;
use reqwest::Client;
use std::sync::Arc;
use tracing::info;

fn usage() -> ! {
    eprintln!("usage: cardmind identify <image-path> [expected-name] [expected-set]");
    eprintln!("       cardmind resume <execution-id>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let cfg = AppCfg::load("config.yml")?;

    info!("Initializing Client");
    let client = Client::builder()
        .user_agent(cfg.http.user_agent.clone())
        .pool_idle_timeout(cfg.http.pool_idle_timeout)
        .pool_max_idle_per_host(cfg.http.pool_max_idle_per_host)
        .tcp_keepalive(cfg.http.tcp_keep_alive)
        .timeout(cfg.http.timeout)
        .build()
        .context("building http client")?;

    info!("Building pipeline");
    let kb = Arc::new(KnowledgeBase::default());
    let extractor = Arc::new(FeatureExtractionService::new(
        Arc::new(LocalObjectStore),
        Arc::new(HttpVisionClient::new(cfg.vision.clone(), client.clone())),
    ));
    let reasoner = Arc::new(OcrReasoningService::new(
        Arc::new(OpenAiCompatClient::new(cfg.llm.clone(), client.clone())),
        kb.clone(),
        cfg.reasoning.clone(),
    ));
    let resolver = Arc::new(SetResolver::new(
        Arc::new(TcgCatalogClient::new(cfg.catalog.clone(), client.clone())),
        cfg.catalog.request_timeout,
    ));
    let pricing = Arc::new(PricingOrchestrator::new(
        build_sources(&cfg.pricing.sources, client.clone()),
        Arc::new(MemoryKvStore::new(cfg.pricing.cache_capacity)),
        cfg.pricing.cache_ttl,
    ));
    let coordinator = WorkflowCoordinator::new(
        extractor,
        reasoner,
        resolver,
        pricing,
        Arc::new(AuthenticityVerifier::new(kb)),
        Arc::new(MemoryWorkflowStore::new()),
        cfg.workflow.clone(),
        cfg.pricing.window_days,
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.first().map(String::as_str) {
        Some("identify") => {
            let image_ref = args.get(1).unwrap_or_else(|| usage());
            let hints = Hints {
                expected_name: args.get(2).cloned(),
                expected_set: args.get(3).cloned(),
            };
            coordinator.identify(image_ref, hints).await?
        }
        Some("resume") => {
            let execution_id = args.get(1).unwrap_or_else(|| usage());
            coordinator.resume(execution_id).await?
        }
        Some(other) => bail!("unknown command '{other}'"),
        None => usage(),
    };

    info!(
        "execution {} finished with status {:?}",
        outcome.execution_id, outcome.status
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

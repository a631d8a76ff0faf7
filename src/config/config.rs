use crate::core::retry::RetryPolicy;
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub llm: LlmCfg,
    #[serde(default)]
    pub vision: VisionCfg,
    #[serde(default)]
    pub catalog: CatalogCfg,
    #[serde(default)]
    pub pricing: PricingCfg,
    #[serde(default)]
    pub reasoning: ReasoningCfg,
    #[serde(default)]
    pub workflow: WorkflowCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpCfg {
    #[serde(rename = "userAgent", default = "default_ua")]
    pub user_agent: String,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(
        rename = "poolIdleTimeout",
        with = "humantime_serde",
        default = "default_pool_idle"
    )]
    pub pool_idle_timeout: Duration,
    #[serde(
        rename = "tcpKeepAlive",
        with = "humantime_serde",
        default = "default_keepalive"
    )]
    pub tcp_keep_alive: Duration,
    #[serde(rename = "poolMaxIdlePerHost", default = "default_pool")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            user_agent: default_ua(),
            timeout: default_timeout(),
            pool_idle_timeout: default_pool_idle(),
            tcp_keep_alive: default_keepalive(),
            pool_max_idle_per_host: default_pool(),
        }
    }
}
fn default_ua() -> String {
    "cardmind/0.1".into()
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_pool_idle() -> Duration {
    Duration::from_secs(90)
}
fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}
fn default_pool() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmCfg {
    #[serde(rename = "baseUrl", default = "default_llm_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(rename = "rateLimitRpm", default = "default_llm_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(with = "humantime_serde", default = "default_llm_timeout")]
    pub timeout: Duration,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            api_key: "".to_string(),
            model: default_model(),
            rate_limit_rpm: default_llm_rpm(),
            timeout: default_llm_timeout(),
        }
    }
}
fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_rpm() -> u32 {
    60
}
fn default_llm_timeout() -> Duration {
    Duration::from_secs(45)
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionCfg {
    #[serde(rename = "baseUrl", default = "default_vision_url")]
    pub base_url: String,
    #[serde(with = "humantime_serde", default = "default_vision_timeout")]
    pub timeout: Duration,
}

impl Default for VisionCfg {
    fn default() -> Self {
        Self {
            base_url: default_vision_url(),
            timeout: default_vision_timeout(),
        }
    }
}
fn default_vision_url() -> String {
    "http://localhost:8089".to_string()
}
fn default_vision_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogCfg {
    #[serde(rename = "baseUrl", default = "default_catalog_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(rename = "pageLimit", default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(
        rename = "requestTimeout",
        with = "humantime_serde",
        default = "default_catalog_timeout"
    )]
    pub request_timeout: Duration,
}

impl Default for CatalogCfg {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            api_key: "".to_string(),
            page_limit: default_page_limit(),
            request_timeout: default_catalog_timeout(),
        }
    }
}
fn default_catalog_url() -> String {
    "https://api.pokemontcg.io/v2".to_string()
}
fn default_page_limit() -> u32 {
    50
}
fn default_catalog_timeout() -> Duration {
    // resolver budget: a slow catalog resolves as "no match", never a failure
    Duration::from_secs(20)
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PriceSourceKind {
    SoldListings,
    MarketPrices,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceSourceCfg {
    pub id: String,
    pub kind: PriceSourceKind,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(rename = "rateLimitRpm", default = "default_source_rpm")]
    pub rate_limit_rpm: u32,
}

fn default_source_rpm() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingCfg {
    #[serde(rename = "cacheTtl", with = "humantime_serde", default = "default_ttl")]
    pub cache_ttl: Duration,
    #[serde(rename = "windowDays", default = "default_window_days")]
    pub window_days: u32,
    #[serde(rename = "cacheCapacity", default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default)]
    pub sources: Vec<PriceSourceCfg>,
}

impl Default for PricingCfg {
    fn default() -> Self {
        Self {
            cache_ttl: default_ttl(),
            window_days: default_window_days(),
            cache_capacity: default_cache_capacity(),
            sources: Vec::new(),
        }
    }
}
fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}
fn default_window_days() -> u32 {
    90
}
fn default_cache_capacity() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningCfg {
    #[serde(rename = "maxTokens", default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Discount on the topmost OCR block's confidence when inference fails
    /// and the name falls back to raw OCR.
    #[serde(rename = "fallbackNameDiscount", default = "default_name_discount")]
    pub fallback_name_discount: f64,
    /// Further discount from the fallback name confidence to the overall.
    #[serde(
        rename = "fallbackOverallDiscount",
        default = "default_overall_discount"
    )]
    pub fallback_overall_discount: f64,
    #[serde(rename = "fuzzyThreshold", default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ReasoningCfg {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            fallback_name_discount: default_name_discount(),
            fallback_overall_discount: default_overall_discount(),
            fuzzy_threshold: default_fuzzy_threshold(),
            retry: RetryPolicy::default(),
        }
    }
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.1
}
fn default_name_discount() -> f64 {
    0.7
}
fn default_overall_discount() -> f64 {
    0.5
}
fn default_fuzzy_threshold() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowCfg {
    #[serde(
        rename = "resolveTimeout",
        with = "humantime_serde",
        default = "default_resolve_timeout"
    )]
    pub resolve_timeout: Duration,
    #[serde(
        rename = "pricingTimeout",
        with = "humantime_serde",
        default = "default_pricing_timeout"
    )]
    pub pricing_timeout: Duration,
    #[serde(
        rename = "authenticityTimeout",
        with = "humantime_serde",
        default = "default_authenticity_timeout"
    )]
    pub authenticity_timeout: Duration,
}

impl Default for WorkflowCfg {
    fn default() -> Self {
        Self {
            resolve_timeout: default_resolve_timeout(),
            pricing_timeout: default_pricing_timeout(),
            authenticity_timeout: default_authenticity_timeout(),
        }
    }
}
fn default_resolve_timeout() -> Duration {
    Duration::from_secs(25)
}
fn default_pricing_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_authenticity_timeout() -> Duration {
    Duration::from_secs(5)
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.llm.base_url.is_empty(), "llm.baseUrl missing");
        anyhow::ensure!(!self.vision.base_url.is_empty(), "vision.baseUrl missing");
        anyhow::ensure!(!self.catalog.base_url.is_empty(), "catalog.baseUrl missing");
        anyhow::ensure!(self.catalog.page_limit > 0, "catalog.pageLimit must be > 0");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.reasoning.fallback_name_discount),
            "reasoning.fallbackNameDiscount must be in [0,1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.reasoning.fallback_overall_discount),
            "reasoning.fallbackOverallDiscount must be in [0,1]"
        );
        for source in &self.pricing.sources {
            anyhow::ensure!(!source.id.is_empty(), "pricing source id missing");
            anyhow::ensure!(
                !source.base_url.is_empty(),
                "pricing source {} baseUrl missing",
                source.id
            );
            anyhow::ensure!(
                source.rate_limit_rpm > 0,
                "pricing source {} rateLimitRpm must be > 0",
                source.id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_env_var_override() {
        unsafe {
            env::set_var("LLM__API_KEY", "env-key-123");
        }

        let cfg = Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .unwrap();

        let val = cfg.get_string("llm.api_key").unwrap();
        assert_eq!(val, "env-key-123");

        unsafe {
            env::remove_var("LLM__API_KEY");
        }
    }

    #[test]
    fn defaults_pass_validation() {
        let cfg = AppCfg::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.pricing.cache_ttl, Duration::from_secs(3600));
        assert!((cfg.reasoning.fallback_name_discount - 0.7).abs() < 1e-9);
        assert_eq!(cfg.catalog.request_timeout, Duration::from_secs(20));
    }

    #[test]
    fn bad_discount_rejected() {
        let mut cfg = AppCfg::default();
        cfg.reasoning.fallback_name_discount = 1.5;
        assert!(cfg.validate().is_err());
    }
}

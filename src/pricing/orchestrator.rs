use crate::core::types::{PriceQuery, RawComp, Valuation};
use crate::pricing::cache::{KvStore, comps_cache_key};
use crate::pricing::source::PriceSource;
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fans a price query out to every configured source concurrently, merges
/// the comps, and aggregates them into a valuation. A shared cross-request
/// cache short-circuits repeat lookups; empty results and merges where any
/// source errored are never cached so transient failures self-heal on the
/// next request.
pub struct PricingOrchestrator {
    sources: Vec<Arc<dyn PriceSource>>,
    cache: Arc<dyn KvStore>,
    cache_ttl: Duration,
}

impl PricingOrchestrator {
    pub fn new(
        sources: Vec<Arc<dyn PriceSource>>,
        cache: Arc<dyn KvStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            sources,
            cache,
            cache_ttl,
        }
    }

    pub async fn value(&self, query: &PriceQuery) -> Valuation {
        if query.card_name.trim().is_empty() {
            return Valuation::insufficient();
        }

        let key = comps_cache_key(&query.card_name, query.set.as_deref());

        match self.cache.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<RawComp>>(&payload) {
                Ok(comps) => {
                    info!("comps cache hit for '{}' ({} comps)", key, comps.len());
                    return self.aggregate(&comps);
                }
                Err(e) => warn!("discarding undecodable cache entry for '{}': {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("comps cache read failed for '{}': {:#}", key, e),
        }

        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                let name = source.name().to_string();
                let result = source.fetch_comps(query).await;
                (name, result)
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut comps: Vec<RawComp> = Vec::new();
        let mut any_source_failed = false;
        for (name, result) in results {
            match result {
                Ok(source_comps) if !source_comps.is_empty() => {
                    info!("source '{}' returned {} comps", name, source_comps.len());
                    comps.extend(source_comps);
                }
                Ok(_) => info!("source '{}' had no comps", name),
                // non-fatal: excluded from aggregation, not retried this request
                Err(e) => {
                    warn!("source '{}' failed, excluded: {:#}", name, e);
                    any_source_failed = true;
                }
            }
        }

        // only priceable comps count, and only they are worth caching; a
        // partial merge is also skipped so a transient source outage is not
        // pinned for the full TTL at the cost of re-fetching the healthy
        // sources next time
        comps.retain(|c| c.price > Decimal::ZERO);
        if !comps.is_empty() && !any_source_failed {
            match serde_json::to_string(&comps) {
                Ok(payload) => {
                    if let Err(e) = self.cache.put(&key, payload, self.cache_ttl).await {
                        warn!("comps cache write failed for '{}': {:#}", key, e);
                    }
                }
                Err(e) => warn!("comps serialization failed for '{}': {}", key, e),
            }
        }

        self.aggregate(&comps)
    }

    /// Low/median/high over the raw price points; confidence grows with
    /// comps count and with how many distinct sources contributed.
    fn aggregate(&self, comps: &[RawComp]) -> Valuation {
        if comps.is_empty() {
            return Valuation::insufficient();
        }

        let mut prices: Vec<Decimal> = comps.iter().map(|c| c.price).collect();
        prices.sort();

        let median = if prices.len() % 2 == 1 {
            prices[prices.len() / 2]
        } else {
            (prices[prices.len() / 2 - 1] + prices[prices.len() / 2]) / Decimal::from(2)
        };

        let sources: BTreeSet<String> = comps.iter().map(|c| c.source.clone()).collect();
        let comps_factor = (prices.len() as f64 / 10.0).min(1.0);
        let diversity_factor = if self.sources.is_empty() {
            1.0
        } else {
            sources.len() as f64 / self.sources.len() as f64
        };
        let confidence = (0.7 * comps_factor + 0.3 * diversity_factor).clamp(0.0, 1.0);

        Valuation {
            value_low: prices[0],
            value_median: median,
            value_high: prices[prices.len() - 1],
            comps_count: prices.len(),
            sources: sources.into_iter().collect(),
            confidence,
        }
    }
}

/// Build the configured adapters over a shared HTTP client.
pub fn build_sources(
    cfgs: &[crate::config::config::PriceSourceCfg],
    client: reqwest::Client,
) -> Vec<Arc<dyn PriceSource>> {
    use crate::config::config::PriceSourceKind;
    use crate::pricing::source::{MarketPriceSource, SoldListingsSource};

    cfgs.iter()
        .map(|cfg| -> Arc<dyn PriceSource> {
            match cfg.kind {
                PriceSourceKind::SoldListings => {
                    Arc::new(SoldListingsSource::new(cfg.clone(), client.clone()))
                }
                PriceSourceKind::MarketPrices => {
                    Arc::new(MarketPriceSource::new(cfg.clone(), client.clone()))
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::cache::MemoryKvStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSource {
        id: String,
        comps: Result<Vec<RawComp>, String>,
        calls: AtomicU32,
    }

    impl FakeSource {
        fn ok(id: &str, prices: &[i64]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                comps: Ok(prices
                    .iter()
                    .map(|cents| RawComp {
                        source: id.to_string(),
                        price: Decimal::new(*cents, 2),
                        currency: "USD".to_string(),
                        sold_date: None,
                        condition: None,
                        listing_url: None,
                    })
                    .collect()),
                calls: AtomicU32::new(0),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                comps: Err("auth expired".to_string()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl PriceSource for FakeSource {
        fn name(&self) -> &str {
            &self.id
        }

        async fn fetch_comps(&self, _query: &PriceQuery) -> Result<Vec<RawComp>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.comps {
                Ok(comps) => Ok(comps.clone()),
                Err(msg) => anyhow::bail!("{msg}"),
            }
        }
    }

    fn query() -> PriceQuery {
        PriceQuery {
            card_name: "Charizard VMAX".to_string(),
            set: Some("Lost Origin".to_string()),
            window_days: 90,
            ..Default::default()
        }
    }

    fn orchestrator(
        sources: Vec<Arc<FakeSource>>,
    ) -> (PricingOrchestrator, Vec<Arc<FakeSource>>) {
        let dyn_sources: Vec<Arc<dyn PriceSource>> = sources
            .iter()
            .map(|s| s.clone() as Arc<dyn PriceSource>)
            .collect();
        (
            PricingOrchestrator::new(
                dyn_sources,
                Arc::new(MemoryKvStore::new(64)),
                Duration::from_secs(3600),
            ),
            sources,
        )
    }

    #[tokio::test]
    async fn aggregates_across_sources() {
        let (orch, _) = orchestrator(vec![
            FakeSource::ok("ebay", &[1000, 2000, 3000]),
            FakeSource::ok("tcg", &[1500]),
        ]);
        let valuation = orch.value(&query()).await;

        assert_eq!(valuation.comps_count, 4);
        assert_eq!(valuation.value_low, Decimal::new(1000, 2));
        assert_eq!(valuation.value_high, Decimal::new(3000, 2));
        assert_eq!(valuation.value_median, Decimal::new(1750, 2));
        assert_eq!(valuation.sources, vec!["ebay".to_string(), "tcg".to_string()]);
        assert!(valuation.confidence > 0.0);
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let (orch, sources) = orchestrator(vec![FakeSource::ok("ebay", &[1000, 2000])]);

        let first = orch.value(&query()).await;
        let second = orch.value(&query()).await;

        assert_eq!(first.comps_count, second.comps_count);
        assert_eq!(first.value_median, second.value_median);
        // one network pass only
        assert_eq!(sources[0].calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let (orch, sources) = orchestrator(vec![FakeSource::ok("ebay", &[])]);

        let first = orch.value(&query()).await;
        assert_eq!(first.confidence, 0.0);
        let _ = orch.value(&query()).await;
        // a fresh fetch happened both times
        assert_eq!(sources[0].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_errors_are_not_cached_and_do_not_poison() {
        let (orch, sources) = orchestrator(vec![FakeSource::failing("ebay")]);

        let first = orch.value(&query()).await;
        assert_eq!(first.comps_count, 0);
        let _ = orch.value(&query()).await;
        assert_eq!(sources[0].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_sink_the_others() {
        let (orch, _) = orchestrator(vec![
            FakeSource::failing("ebay"),
            FakeSource::ok("tcg", &[1200, 1800]),
        ]);
        let valuation = orch.value(&query()).await;

        assert_eq!(valuation.comps_count, 2);
        assert_eq!(valuation.sources, vec!["tcg".to_string()]);
        assert!(valuation.confidence > 0.0);
    }

    #[tokio::test]
    async fn partial_merge_is_not_cached() {
        let (orch, sources) = orchestrator(vec![
            FakeSource::failing("ebay"),
            FakeSource::ok("tcg", &[1200, 1800]),
        ]);

        let first = orch.value(&query()).await;
        assert_eq!(first.comps_count, 2);
        let second = orch.value(&query()).await;
        assert_eq!(second.comps_count, 2);
        // the failed source gets another chance instead of its absence
        // being served from cache for the full TTL
        assert_eq!(sources[0].calls.load(Ordering::SeqCst), 2);
        assert_eq!(sources[1].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_comps_yields_insufficient_not_error() {
        let (orch, _) = orchestrator(vec![FakeSource::ok("ebay", &[]), FakeSource::ok("tcg", &[])]);
        let valuation = orch.value(&query()).await;
        assert_eq!(valuation.comps_count, 0);
        assert_eq!(valuation.confidence, 0.0);
        assert!(valuation.sources.is_empty());
    }

    #[tokio::test]
    async fn blank_name_short_circuits() {
        let (orch, sources) = orchestrator(vec![FakeSource::ok("ebay", &[1000])]);
        let valuation = orch
            .value(&PriceQuery {
                card_name: " ".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(valuation.comps_count, 0);
        assert_eq!(sources[0].calls.load(Ordering::SeqCst), 0);
    }
}

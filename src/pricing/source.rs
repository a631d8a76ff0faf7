use crate::config::config::PriceSourceCfg;
use crate::core::error::{classify_status, classify_transport};
use crate::core::types::{PriceQuery, RawComp};
use crate::knowledge::base::KnowledgeBase;
use crate::matching::fuzzy::FuzzyMatcher;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One pluggable price source. "No match" is an empty vec, never an error;
/// errors mean genuine transport/auth failure and the orchestrator excludes
/// the source from that request.
#[async_trait]
pub trait PriceSource: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn fetch_comps(&self, query: &PriceQuery) -> Result<Vec<RawComp>>;
}

fn build_limiter(rpm: u32) -> Arc<DirectLimiter> {
    let rpm = NonZeroU32::new(rpm).unwrap_or(NonZeroU32::new(1).unwrap());
    Arc::new(RateLimiter::direct(Quota::per_minute(rpm)))
}

// ----------- Sold-listings adapter -----------------

#[derive(Debug, Deserialize)]
struct SoldSearchResponse {
    #[serde(default)]
    items: Vec<SoldItem>,
}

#[derive(Debug, Deserialize)]
struct SoldItem {
    title: String,
    price: Decimal,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(rename = "soldAt", default)]
    sold_at: Option<DateTime<Utc>>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Marketplace sold-listings source. Searches completed sales and keeps the
/// listings whose title actually matches the card; treated-finish cards get
/// "holo" folded into the search so the right variant's sales surface.
pub struct SoldListingsSource {
    client: Client,
    cfg: PriceSourceCfg,
    matcher: FuzzyMatcher,
    limiter: Arc<DirectLimiter>,
}

impl SoldListingsSource {
    pub fn new(cfg: PriceSourceCfg, client: Client) -> Self {
        let limiter = build_limiter(cfg.rate_limit_rpm);
        Self {
            client,
            cfg,
            matcher: FuzzyMatcher::new(0.6),
            limiter,
        }
    }
}

#[async_trait]
impl PriceSource for SoldListingsSource {
    fn name(&self) -> &str {
        &self.cfg.id
    }

    async fn fetch_comps(&self, query: &PriceQuery) -> Result<Vec<RawComp>> {
        self.limiter.until_ready().await;

        let mut term = query.card_name.clone();
        if let Some(set) = &query.set {
            term.push(' ');
            term.push_str(set);
        }
        if KnowledgeBase::treated_finish(query.rarity.as_deref(), &query.card_name) {
            term.push_str(" holo");
        }

        let resp = self
            .client
            .get(format!("{}/search", self.cfg.base_url))
            .query(&[
                ("q", term.as_str()),
                ("days", &query.window_days.to_string()),
                ("status", "sold"),
            ])
            .send()
            .await
            .map_err(|e| classify_transport(&e, "sold listings"))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(classify_status(status, "sold listings").into());
        }

        let parsed: SoldSearchResponse = resp.json().await.context("parsing sold listings")?;
        Ok(parsed
            .items
            .into_iter()
            .filter(|item| {
                item.price > Decimal::ZERO
                    && self.matcher.similarity(&item.title, &query.card_name) >= 0.6
            })
            .map(|item| RawComp {
                source: self.cfg.id.clone(),
                price: item.price,
                currency: item.currency,
                sold_date: item.sold_at,
                condition: item.condition,
                listing_url: item.url,
            })
            .collect())
    }
}

// ----------- Market-price adapter -----------------

#[derive(Debug, Deserialize)]
struct MarketPriceResponse {
    #[serde(default)]
    results: Vec<VariantPrices>,
}

#[derive(Debug, Deserialize)]
struct VariantPrices {
    variant: String, // "holofoil", "reverseHolofoil", "normal"
    #[serde(default)]
    low: Option<Decimal>,
    #[serde(default)]
    market: Option<Decimal>,
    #[serde(default)]
    high: Option<Decimal>,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Aggregator-style source exposing low/market/high per finish variant.
/// The variant is chosen from the card's rarity text; each published price
/// point becomes one comp.
pub struct MarketPriceSource {
    client: Client,
    cfg: PriceSourceCfg,
    limiter: Arc<DirectLimiter>,
}

impl MarketPriceSource {
    pub fn new(cfg: PriceSourceCfg, client: Client) -> Self {
        let limiter = build_limiter(cfg.rate_limit_rpm);
        Self {
            client,
            cfg,
            limiter,
        }
    }

    fn pick_variant<'a>(
        &self,
        results: &'a [VariantPrices],
        query: &PriceQuery,
    ) -> Option<&'a VariantPrices> {
        let treated = KnowledgeBase::treated_finish(query.rarity.as_deref(), &query.card_name);
        let preferred = if treated { "holofoil" } else { "normal" };
        results
            .iter()
            .find(|v| v.variant.eq_ignore_ascii_case(preferred))
            .or_else(|| results.first())
    }
}

#[async_trait]
impl PriceSource for MarketPriceSource {
    fn name(&self) -> &str {
        &self.cfg.id
    }

    async fn fetch_comps(&self, query: &PriceQuery) -> Result<Vec<RawComp>> {
        self.limiter.until_ready().await;

        let mut params = vec![("name", query.card_name.clone())];
        if let Some(set) = &query.set {
            params.push(("set", set.clone()));
        }
        if let Some(number) = &query.number {
            params.push(("number", number.clone()));
        }

        let mut req = self
            .client
            .get(format!("{}/prices", self.cfg.base_url))
            .query(&params);
        if !self.cfg.api_key.is_empty() {
            req = req.bearer_auth(&self.cfg.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&e, "market prices"))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(classify_status(status, "market prices").into());
        }

        let parsed: MarketPriceResponse = resp.json().await.context("parsing market prices")?;
        let Some(variant) = self.pick_variant(&parsed.results, query) else {
            return Ok(Vec::new());
        };

        let comps = [variant.low, variant.market, variant.high]
            .into_iter()
            .flatten()
            .filter(|p| *p > Decimal::ZERO)
            .map(|price| RawComp {
                source: self.cfg.id.clone(),
                price,
                currency: variant.currency.clone(),
                sold_date: variant.updated_at,
                condition: None,
                listing_url: None,
            })
            .collect();
        Ok(comps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::PriceSourceKind;

    fn cfg() -> PriceSourceCfg {
        PriceSourceCfg {
            id: "tcg".to_string(),
            kind: PriceSourceKind::MarketPrices,
            base_url: "http://localhost".to_string(),
            api_key: "".to_string(),
            rate_limit_rpm: 30,
        }
    }

    fn variant(name: &str) -> VariantPrices {
        VariantPrices {
            variant: name.to_string(),
            low: Some(Decimal::new(100, 2)),
            market: Some(Decimal::new(150, 2)),
            high: Some(Decimal::new(300, 2)),
            currency: "USD".to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn treated_rarity_prefers_holofoil_variant() {
        let source = MarketPriceSource::new(cfg(), Client::new());
        let results = vec![variant("normal"), variant("holofoil")];

        let holo_query = PriceQuery {
            card_name: "Charizard".to_string(),
            rarity: Some("Holo Rare".to_string()),
            ..Default::default()
        };
        assert_eq!(
            source.pick_variant(&results, &holo_query).unwrap().variant,
            "holofoil"
        );

        let common_query = PriceQuery {
            card_name: "Bidoof".to_string(),
            rarity: Some("Common".to_string()),
            ..Default::default()
        };
        assert_eq!(
            source.pick_variant(&results, &common_query).unwrap().variant,
            "normal"
        );
    }

    #[test]
    fn missing_preferred_variant_falls_back_to_first() {
        let source = MarketPriceSource::new(cfg(), Client::new());
        let results = vec![variant("reverseHolofoil")];
        let query = PriceQuery {
            card_name: "Bidoof".to_string(),
            ..Default::default()
        };
        assert_eq!(
            source.pick_variant(&results, &query).unwrap().variant,
            "reverseHolofoil"
        );
    }
}

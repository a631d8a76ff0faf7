use crate::catalog::client::CatalogClient;
use crate::core::types::{CatalogCard, SetMatch};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Collector number split into comparable parts: case-folded, whitespace and
/// leading zeros stripped. "018/195", "18/195", and " 018 / 195 " all
/// normalize identically.
pub fn normalize_collector_number(raw: &str) -> (String, Option<String>) {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let mut parts = cleaned.splitn(2, '/');
    let numerator = strip_leading_zeros(parts.next().unwrap_or(""));
    let total = parts.next().map(strip_leading_zeros);
    (numerator, total)
}

fn strip_leading_zeros(part: &str) -> String {
    // keep any alpha prefix ("tg12" stays "tg12", "018" becomes "18")
    let digits_start = part.find(|c: char| c.is_ascii_digit());
    match digits_start {
        Some(i) => {
            let (prefix, digits) = part.split_at(i);
            let trimmed = digits.trim_start_matches('0');
            let digits = if trimmed.is_empty() { "0" } else { trimmed };
            format!("{prefix}{digits}")
        }
        None => part.to_string(),
    }
}

/// Disambiguates which set/printing a card belongs to using the external
/// catalog. A timeout or catalog error resolves as "no match" so the caller
/// keeps its own lower-confidence set guess instead of aborting.
pub struct SetResolver {
    catalog: Arc<dyn CatalogClient>,
    budget: Duration,
}

impl SetResolver {
    pub fn new(catalog: Arc<dyn CatalogClient>, budget: Duration) -> Self {
        Self { catalog, budget }
    }

    pub async fn resolve(&self, card_name: &str, collector_number: Option<&str>) -> Option<SetMatch> {
        if card_name.trim().is_empty() {
            return None;
        }

        let cards = match tokio::time::timeout(self.budget, self.catalog.search_by_name(card_name))
            .await
        {
            Err(_) => {
                warn!("catalog lookup for '{}' exceeded {:?}", card_name, self.budget);
                return None;
            }
            Ok(Err(e)) => {
                warn!("catalog lookup for '{}' failed: {:#}", card_name, e);
                return None;
            }
            Ok(Ok(cards)) => cards,
        };

        if cards.is_empty() {
            debug!("catalog has no entries for '{}'", card_name);
            return None;
        }

        if let Some(number) = collector_number {
            let (query_num, query_total) = normalize_collector_number(number);

            // exact: numerator and printed total both agree
            if let Some(card) = cards.iter().find(|c| {
                let (num, total) = normalize_collector_number(&c.number);
                num == query_num && (query_total.is_none() || total == query_total || total.is_none())
            }) {
                return Some(to_match(card, 1.0, "exact collector number match"));
            }

            // fuzzy: numerator alone agrees (printed totals differ across
            // reprints of the same card)
            if let Some(card) = cards.iter().find(|c| {
                let (num, _) = normalize_collector_number(&c.number);
                num == query_num
            }) {
                return Some(to_match(card, 0.85, "collector number numerator match"));
            }
        }

        // recency fallback: most recently released printing
        let latest = cards
            .iter()
            .max_by_key(|c| c.release_date.unwrap_or(chrono::NaiveDate::MIN))?;
        Some(to_match(
            latest,
            0.5,
            "no collector number match; most recent printing assumed",
        ))
    }
}

fn to_match(card: &CatalogCard, confidence: f64, reason: &str) -> SetMatch {
    SetMatch {
        set_name: card.set_name.clone(),
        set_series: card.set_series.clone(),
        collector_number: card.number.clone(),
        rarity: card.rarity.clone(),
        confidence,
        match_reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::NaiveDate;

    fn card(set: &str, number: &str, date: Option<(i32, u32, u32)>) -> CatalogCard {
        CatalogCard {
            name: "Charizard VMAX".to_string(),
            set_name: set.to_string(),
            set_series: "Sword & Shield".to_string(),
            release_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            number: number.to_string(),
            rarity: Some("Holo Rare".to_string()),
        }
    }

    struct FakeCatalog {
        cards: Vec<CatalogCard>,
    }

    #[async_trait::async_trait]
    impl CatalogClient for FakeCatalog {
        async fn search_by_name(&self, _name: &str) -> Result<Vec<CatalogCard>> {
            Ok(self.cards.clone())
        }
    }

    struct HangingCatalog;

    #[async_trait::async_trait]
    impl CatalogClient for HangingCatalog {
        async fn search_by_name(&self, _name: &str) -> Result<Vec<CatalogCard>> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(vec![])
        }
    }

    struct BrokenCatalog;

    #[async_trait::async_trait]
    impl CatalogClient for BrokenCatalog {
        async fn search_by_name(&self, _name: &str) -> Result<Vec<CatalogCard>> {
            anyhow::bail!("catalog 503")
        }
    }

    fn resolver(cards: Vec<CatalogCard>) -> SetResolver {
        SetResolver::new(Arc::new(FakeCatalog { cards }), Duration::from_secs(20))
    }

    #[test]
    fn normalization_is_leading_zero_and_case_insensitive() {
        assert_eq!(normalize_collector_number("018/195"), normalize_collector_number("18/195"));
        assert_eq!(
            normalize_collector_number(" 018 / 195 "),
            ("18".to_string(), Some("195".to_string()))
        );
        assert_eq!(
            normalize_collector_number("TG12/TG30"),
            ("tg12".to_string(), Some("tg30".to_string()))
        );
        assert_eq!(normalize_collector_number("007"), ("7".to_string(), None));
    }

    #[tokio::test]
    async fn leading_zeros_still_exact_match() {
        let r = resolver(vec![
            card("Silver Tempest", "18/195", Some((2022, 11, 11))),
            card("Lost Origin", "44/196", Some((2022, 9, 9))),
        ]);
        let m = r.resolve("Charizard VMAX", Some("018/195")).await.unwrap();
        assert_eq!(m.set_name, "Silver Tempest");
        assert!((m.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn numerator_only_match_is_fuzzy_tier() {
        // same numerator, different printed total (reprint)
        let r = resolver(vec![card("Crown Zenith", "18/160", Some((2023, 1, 20)))]);
        let m = r.resolve("Charizard VMAX", Some("018/195")).await.unwrap();
        assert_eq!(m.set_name, "Crown Zenith");
        assert!((m.confidence - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_number_falls_back_to_latest_release() {
        let r = resolver(vec![
            card("Darkness Ablaze", "20/189", Some((2020, 8, 14))),
            card("Crown Zenith", "18/160", Some((2023, 1, 20))),
            card("Lost Origin", "44/196", Some((2022, 9, 9))),
        ]);
        let m = r.resolve("Charizard VMAX", None).await.unwrap();
        assert_eq!(m.set_name, "Crown Zenith");
        assert!((m.confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_as_no_match() {
        let r = SetResolver::new(Arc::new(HangingCatalog), Duration::from_secs(20));
        assert!(r.resolve("Charizard VMAX", Some("018/195")).await.is_none());
    }

    #[tokio::test]
    async fn catalog_error_resolves_as_no_match() {
        let r = SetResolver::new(Arc::new(BrokenCatalog), Duration::from_secs(20));
        assert!(r.resolve("Charizard VMAX", None).await.is_none());
    }

    #[tokio::test]
    async fn empty_name_short_circuits() {
        let r = resolver(vec![]);
        assert!(r.resolve("  ", Some("18/195")).await.is_none());
    }
}

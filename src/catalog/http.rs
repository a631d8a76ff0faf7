use crate::catalog::client::CatalogClient;
use crate::config::config::CatalogCfg;
use crate::core::error::{classify_status, classify_transport};
use crate::core::types::CatalogCard;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<ApiCard>,
}

#[derive(Debug, Deserialize)]
struct ApiCard {
    name: String,
    number: String,
    #[serde(default)]
    rarity: Option<String>,
    set: ApiSet,
}

#[derive(Debug, Deserialize)]
struct ApiSet {
    name: String,
    #[serde(default)]
    series: String,
    // catalog dates come as "2022/09/09"
    #[serde(rename = "releaseDate", default)]
    release_date: Option<String>,
}

/// Card catalog client against a pokemontcg.io-style REST API.
pub struct TcgCatalogClient {
    client: Client,
    cfg: CatalogCfg,
}

impl TcgCatalogClient {
    pub fn new(cfg: CatalogCfg, client: Client) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl CatalogClient for TcgCatalogClient {
    async fn search_by_name(&self, name: &str) -> Result<Vec<CatalogCard>> {
        let url = format!("{}/cards", self.cfg.base_url);
        let query = format!("name:\"{}\"", name.replace('"', ""));

        let mut req = self
            .client
            .get(&url)
            .timeout(self.cfg.request_timeout)
            .query(&[
                ("q", query.as_str()),
                ("pageSize", &self.cfg.page_limit.to_string()),
                ("orderBy", "-set.releaseDate"),
            ]);
        if !self.cfg.api_key.is_empty() {
            req = req.header("X-Api-Key", &self.cfg.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&e, "catalog search"))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(classify_status(status, "catalog search").into());
        }

        let parsed: SearchResponse = resp.json().await.context("parsing catalog response")?;
        Ok(parsed
            .data
            .into_iter()
            .map(|card| CatalogCard {
                name: card.name,
                set_name: card.set.name,
                set_series: card.set.series,
                release_date: card
                    .set
                    .release_date
                    .as_deref()
                    .and_then(parse_release_date),
                number: card.number,
                rarity: card.rarity,
            })
            .collect())
    }
}

fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_date_formats() {
        assert_eq!(
            parse_release_date("2022/09/09"),
            NaiveDate::from_ymd_opt(2022, 9, 9)
        );
        assert_eq!(
            parse_release_date("2022-09-09"),
            NaiveDate::from_ymd_opt(2022, 9, 9)
        );
        assert_eq!(parse_release_date("soon"), None);
    }
}

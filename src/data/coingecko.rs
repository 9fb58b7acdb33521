//! CoinGecko price collector.
//!
//! API: `https://api.coingecko.com/api/v3/coins/{id}/market_chart`
//! Auth: optional demo key via the `x-cg-demo-api-key` header.
//! Each source is a CoinGecko coin id; sources are tried in order and the
//! first one returning data wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CollectionWindow, PriceCollector};
use crate::types::{PricePoint, PriceSeries};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

pub struct CoinGeckoCollector {
    http: Client,
    base_url: String,
    vs_currency: String,
    api_key: Option<SecretString>,
}

impl CoinGeckoCollector {
    pub fn new(vs_currency: &str, api_key: Option<SecretString>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .user_agent("SENTINEL/0.1.0")
            .build()
            .context("Failed to build CoinGecko HTTP client")?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            vs_currency: vs_currency.to_string(),
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn fetch_chart(
        &self,
        coin_id: &str,
        window: CollectionWindow,
    ) -> Result<Vec<(f64, f64)>> {
        let days = window.hours.div_ceil(24).max(1);
        let url = format!(
            "{}/coins/{coin_id}/market_chart?vs_currency={}&days={days}",
            self.base_url, self.vs_currency
        );

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .context(format!("CoinGecko request failed for {coin_id}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("CoinGecko API error for {coin_id}: {status}");
        }

        let data: MarketChartResponse = resp
            .json()
            .await
            .context(format!("Failed to parse CoinGecko response for {coin_id}"))?;

        Ok(data.prices)
    }
}

/// Turn raw `[ms, price]` pairs into a valid series covering the window.
/// Drops points outside the window and non-positive prices, sorts by time
/// and keeps the last value for duplicate timestamps.
pub fn to_series(
    raw: &[(f64, f64)],
    window: CollectionWindow,
    now: DateTime<Utc>,
) -> Result<PriceSeries> {
    let cutoff = now - Duration::hours(i64::from(window.hours));
    let mut points: Vec<PricePoint> = raw
        .iter()
        .filter(|(_, price)| price.is_finite() && *price > 0.0)
        .filter_map(|&(ms, price)| {
            DateTime::<Utc>::from_timestamp_millis(ms as i64)
                .map(|timestamp| PricePoint { timestamp, price })
        })
        .filter(|p| p.timestamp >= cutoff && p.timestamp <= now)
        .collect();

    points.sort_by_key(|p| p.timestamp);
    let mut deduped: Vec<PricePoint> = Vec::with_capacity(points.len());
    for p in points {
        match deduped.last_mut() {
            Some(last) if last.timestamp == p.timestamp => *last = p,
            _ => deduped.push(p),
        }
    }

    PriceSeries::new(deduped).context("CoinGecko returned an invalid series")
}

#[async_trait]
impl PriceCollector for CoinGeckoCollector {
    async fn collect(&self, sources: &[String], window: CollectionWindow) -> Result<PriceSeries> {
        for source in sources {
            match self.fetch_chart(source, window).await {
                Ok(raw) => {
                    let series = to_series(&raw, window, Utc::now())?;
                    if series.is_empty() {
                        debug!(source = %source, "CoinGecko returned no points in window");
                        continue;
                    }
                    debug!(source = %source, points = series.len(), "Collected price series");
                    return Ok(series);
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "CoinGecko source failed, trying next")
                }
            }
        }
        anyhow::bail!("No price data from any source ({})", sources.join(", "))
    }
}

//! Market data collectors.
//!
//! Defines the `PriceCollector` trait used by the ensemble retrain and the
//! scheduler tick, plus a fixed-series collector for offline runs.

pub mod coingecko;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{PricePoint, PriceSeries};

/// How far back a collection reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWindow {
    pub hours: u32,
}

/// Abstraction over external price sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceCollector: Send + Sync {
    /// Fetch a price series covering `window` from the given sources.
    async fn collect(&self, sources: &[String], window: CollectionWindow) -> Result<PriceSeries>;
}

/// Replays a fixed series regardless of sources or window.
#[derive(Debug, Clone)]
pub struct StaticCollector {
    series: PriceSeries,
}

impl StaticCollector {
    pub fn new(series: PriceSeries) -> Self {
        Self { series }
    }

    /// Load a JSON array of price points, e.g. a recorded market chart.
    pub fn from_file(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prices from {path}"))?;
        let mut points: Vec<PricePoint> = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse prices from {path}"))?;
        points.sort_by_key(|p| p.timestamp);
        points.dedup_by_key(|p| p.timestamp);
        let series = PriceSeries::new(points)?;
        Ok(Self::new(series))
    }
}

#[async_trait]
impl PriceCollector for StaticCollector {
    async fn collect(&self, _sources: &[String], _window: CollectionWindow) -> Result<PriceSeries> {
        Ok(self.series.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_static_collector_replays() {
        let series =
            PriceSeries::from_prices(Utc::now(), Duration::minutes(1), &[1.0, 2.0]).unwrap();
        let collector = StaticCollector::new(series.clone());
        let window = CollectionWindow { hours: 1 };
        let got = tokio_test::block_on(collector.collect(&[], window)).unwrap();
        assert_eq!(got, series);
    }

    #[test]
    fn test_from_file_sorts_and_dedups() {
        let now = Utc::now();
        let points = vec![
            PricePoint { timestamp: now, price: 3.0 },
            PricePoint { timestamp: now - Duration::minutes(2), price: 1.0 },
            PricePoint { timestamp: now - Duration::minutes(1), price: 2.0 },
            PricePoint { timestamp: now, price: 3.5 },
        ];
        let path =
            std::env::temp_dir().join(format!("sentinel_prices_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&points).unwrap()).unwrap();

        let collector = StaticCollector::from_file(path.to_str().unwrap()).unwrap();
        let window = CollectionWindow { hours: 1 };
        let got = tokio_test::block_on(collector.collect(&[], window)).unwrap();
        assert_eq!(got.prices(), vec![1.0, 2.0, 3.0]);

        std::fs::remove_file(&path).unwrap();
        assert!(StaticCollector::from_file("/tmp/sentinel_missing_prices.json").is_err());
    }
}

//! Price forecasting models.
//!
//! A recurrent regressor and a tabular policy agent, blended by the
//! ensemble predictor. The trading pipeline only sees the [`Forecaster`]
//! trait.

pub mod ensemble;
pub mod lstm;
pub mod policy;
pub mod sequence;

use async_trait::async_trait;

use crate::types::{PredictionResult, PriceSeries, TradingError};

/// Anything that can turn a price series into a forecast.
#[async_trait]
pub trait Forecaster: Send + Sync {
    async fn forecast(&self, series: &PriceSeries) -> Result<PredictionResult, TradingError>;
}

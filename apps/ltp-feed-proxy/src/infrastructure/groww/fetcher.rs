//! Groww delayed-chart price fetcher.
//!
//! One bounded GET per lookup against the charting endpoint; the price is
//! the close field of the most recent candle. Every failure is logged and
//! reported as no data.

use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::application::ports::AlternativePriceSource;
use crate::domain::market::parse_price;
use crate::infrastructure::config::FallbackSettings;
use crate::infrastructure::metrics::{self, FetchOutcome};

/// Chart endpoint prefix, followed by `/{exchange}/segment/FNO/{symbol}/daily`.
const CHART_PATH: &str = "/v1/api/stocks_fo_data/v1/charting_service/delayed/chart/exchange";

/// Index of the price within a candle row (`[ts, price, ...]`).
const CANDLE_PRICE_INDEX: usize = 1;

/// Lookup failure. Never leaves this module.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Request failed, timed out or returned an unreadable body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// Response had no candles.
    #[error("no candle data")]
    NoData,

    /// Candle row did not carry a numeric price.
    #[error("malformed candle: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(default)]
    candles: Vec<Vec<serde_json::Value>>,
}

/// Groww price source.
#[derive(Debug, Clone)]
pub struct GrowwPriceFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl GrowwPriceFetcher {
    /// Create a fetcher with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: &FallbackSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange hosting a display symbol's contract.
    #[must_use]
    pub fn exchange_for(symbol: &str) -> &'static str {
        if symbol.to_uppercase().starts_with("SENSEX") {
            "BSE"
        } else {
            "NSE"
        }
    }

    fn chart_url(&self, symbol: &str) -> String {
        format!(
            "{}{CHART_PATH}/{}/segment/FNO/{}/daily",
            self.base_url,
            Self::exchange_for(symbol),
            symbol.to_uppercase()
        )
    }

    /// Latest candle price, with errors surfaced.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, bad status or missing data.
    pub async fn latest_price(&self, symbol: &str) -> Result<Decimal, FetchError> {
        let response = self
            .client
            .get(self.chart_url(symbol))
            .query(&[("intervalInMinutes", "1"), ("minimal", "true")])
            .header("x-app-id", "growwWeb")
            .header("x-platform", "web")
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let chart: ChartResponse = response.json().await?;
        let candle = chart.candles.last().ok_or(FetchError::NoData)?;
        let price = candle
            .get(CANDLE_PRICE_INDEX)
            .ok_or_else(|| FetchError::Malformed("missing price column".to_string()))?;

        match price {
            serde_json::Value::Number(n) => parse_price(&n.to_string())
                .ok_or_else(|| FetchError::Malformed(n.to_string())),
            other => Err(FetchError::Malformed(other.to_string())),
        }
    }
}

#[async_trait]
impl AlternativePriceSource for GrowwPriceFetcher {
    async fn fetch_ltp(&self, symbol: &str) -> Option<Decimal> {
        let started = Instant::now();
        let result = self.latest_price(symbol).await;

        match result {
            Ok(price) => {
                metrics::record_fallback_fetch(FetchOutcome::Hit, started.elapsed());
                tracing::trace!(symbol, %price, "Fallback price fetched");
                Some(price)
            }
            Err(e) => {
                metrics::record_fallback_fetch(FetchOutcome::Miss, started.elapsed());
                tracing::warn!(symbol, error = %e, "Fallback lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use test_case::test_case;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn chart_path(exchange: &str, symbol: &str) -> String {
        format!("{CHART_PATH}/{exchange}/segment/FNO/{symbol}/daily")
    }

    fn fetcher(server: &MockServer) -> GrowwPriceFetcher {
        GrowwPriceFetcher::new(&FallbackSettings {
            base_url: server.uri(),
            timeout: Duration::from_millis(500),
            ..FallbackSettings::default()
        })
        .unwrap()
    }

    #[test_case("SENSEX2610880000CE" => "BSE")]
    #[test_case("sensex26jan" => "BSE")]
    #[test_case("NIFTY26JAN26300CE" => "NSE")]
    #[test_case("BANKNIFTY26JAN52000PE" => "NSE")]
    fn exchange_selection(symbol: &str) -> &'static str {
        GrowwPriceFetcher::exchange_for(symbol)
    }

    #[tokio::test]
    async fn returns_latest_candle_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(chart_path("NSE", "NIFTY26JAN26300CE")))
            .and(query_param("intervalInMinutes", "1"))
            .and(query_param("minimal", "true"))
            .and(header("x-app-id", "growwWeb"))
            .and(header("x-platform", "web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candles": [[1_768_000_000, 180.1], [1_768_000_060, 181.35]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let price = fetcher(&server).fetch_ltp("nifty26jan26300ce").await;

        assert_eq!(price, Some("181.35".parse().unwrap()));
    }

    #[tokio::test]
    async fn sensex_routes_to_bse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(chart_path("BSE", "SENSEX2610880000CE")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"candles": [[1, 512.5]]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let price = fetcher(&server).fetch_ltp("SENSEX2610880000CE").await;

        assert_eq!(price, Some("512.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn empty_candles_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candles": []})))
            .mount(&server)
            .await;

        let f = fetcher(&server);

        assert!(matches!(f.latest_price("NIFTY26JAN26300CE").await, Err(FetchError::NoData)));
        assert_eq!(f.fetch_ltp("NIFTY26JAN26300CE").await, None);
    }

    #[tokio::test]
    async fn error_status_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let f = fetcher(&server);

        assert!(matches!(f.latest_price("NIFTY26JAN26300CE").await, Err(FetchError::Status(503))));
        assert_eq!(f.fetch_ltp("NIFTY26JAN26300CE").await, None);
    }

    #[tokio::test]
    async fn malformed_body_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"candles": [[1, "n/a"]]})),
            )
            .mount(&server)
            .await;

        assert_eq!(fetcher(&server).fetch_ltp("NIFTY26JAN26300CE").await, None);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"candles": [[1, 1.0]]}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        assert_eq!(fetcher(&server).fetch_ltp("NIFTY26JAN26300CE").await, None);
    }
}

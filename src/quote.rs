// src/quote.rs
use crate::models::{Cents, Quote};
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rate limit or error: {0}")]
    Provider(String),
    #[error("unparseable price {0:?}")]
    Price(String),
}

/// Source of current prices. Any failure to resolve a symbol is reported as `None`.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn lookup(&self, symbol: &str) -> Option<Quote>;
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol", default)]
    symbol: String,
    #[serde(rename = "05. price", default)]
    price: String,
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    quote: Option<GlobalQuote>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Deserialize)]
struct SearchMatch {
    #[serde(rename = "1. symbol")]
    symbol: String,
    #[serde(rename = "2. name")]
    name: String,
}

#[derive(Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<SearchMatch>,
}

pub struct AlphaVantage {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantage {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, QuoteError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(AlphaVantage {
            client,
            api_key,
            base_url: "https://www.alphavantage.co/query".to_string(),
        })
    }

    async fn fetch(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<GlobalQuoteResponse>()
            .await?;

        if let Some(message) = response.note.or(response.information) {
            return Err(QuoteError::Provider(message));
        }
        // Unknown tickers come back as an empty "Global Quote" object.
        let quote = match response.quote {
            Some(quote) if !quote.symbol.is_empty() => quote,
            _ => return Ok(None),
        };

        let price = parse_price(&quote.price)?;
        let name = self
            .company_name(&quote.symbol)
            .await
            .unwrap_or_else(|| quote.symbol.clone());

        Ok(Some(Quote {
            symbol: quote.symbol,
            name,
            price,
        }))
    }

    async fn company_name(&self, symbol: &str) -> Option<String> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", "SYMBOL_SEARCH"),
                ("keywords", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .ok()?
            .json::<SymbolSearchResponse>()
            .await
            .ok()?;

        response
            .best_matches
            .into_iter()
            .find(|m| m.symbol.eq_ignore_ascii_case(symbol))
            .map(|m| m.name)
    }
}

#[async_trait]
impl QuoteSource for AlphaVantage {
    async fn lookup(&self, symbol: &str) -> Option<Quote> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        match self.fetch(&symbol).await {
            Ok(Some(quote)) => {
                info!("Quoted {} at {}", quote.symbol, quote.price);
                Some(quote)
            }
            Ok(None) => {
                warn!("No quote available for {}", symbol);
                None
            }
            Err(e) => {
                error!("Quote lookup for {} failed: {}", symbol, e);
                None
            }
        }
    }
}

/// A price that rounds to less than one cent is rejected rather than traded for free.
fn parse_price(raw: &str) -> Result<Cents, QuoteError> {
    Decimal::from_str(raw.trim())
        .ok()
        .and_then(Cents::from_decimal)
        .filter(|price| *price > Cents::ZERO)
        .ok_or_else(|| QuoteError::Price(raw.to_string()))
}

/// Fixed price table, used when no provider API key is configured.
#[derive(Default)]
pub struct StaticQuotes {
    quotes: HashMap<String, Quote>,
}

impl StaticQuotes {
    pub fn new() -> Self {
        StaticQuotes::default()
    }

    pub fn with(mut self, symbol: &str, name: &str, price: Cents) -> Self {
        self.quotes.insert(
            symbol.to_uppercase(),
            Quote {
                symbol: symbol.to_uppercase(),
                name: name.to_string(),
                price,
            },
        );
        self
    }

    pub fn demo() -> Self {
        StaticQuotes::new()
            .with("AAPL", "Apple Inc.", Cents(18_950))
            .with("GOOGL", "Alphabet Inc.", Cents(14_210))
            .with("MSFT", "Microsoft Corporation", Cents(41_530))
            .with("ABNB", "Airbnb, Inc.", Cents(13_875))
            .with("ADBE", "Adobe Inc.", Cents(52_040))
    }
}

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn lookup(&self, symbol: &str) -> Option<Quote> {
        self.quotes.get(&symbol.trim().to_uppercase()).cloned()
    }
}

//! Client for the hosted Supabase backend

use std::time::Duration;

use async_trait::async_trait;
use entities::{NewWish, WishRow};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::debug;

use crate::{realtime, InsertSubscription, WishStore, WishStoreError, WishStoreResult};

/// Connection settings for a Supabase project
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Anonymous (publishable) API key
    pub anon_key: String,
    /// Table holding the entries
    pub table: String,
    /// Realtime channel name
    pub channel: String,
    /// Timeout for REST requests
    pub request_timeout: Duration,
}

/// Wish store backed by a Supabase table (PostgREST + Realtime)
#[derive(Debug, Clone)]
pub struct SupabaseWishStore {
    config: SupabaseConfig,
    /// HTTP client
    http_client: reqwest::Client,
}

impl SupabaseWishStore {
    /// Creates a new client for the given project
    pub fn new(mut config: SupabaseConfig) -> WishStoreResult<Self> {
        config.url = config.url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&config.anon_key)?);
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", config.anon_key))?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WishStoreError::Other(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// REST endpoint of the entry table
    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.config.url, self.config.table)
    }

    /// Decode a PostgREST response into rows
    async fn read_rows(response: reqwest::Response) -> WishStoreResult<Vec<WishRow>> {
        let status = response.status();
        let body = response.text().await.map_err(classify)?;

        if !status.is_success() {
            return Err(WishStoreError::rejected(status.as_u16(), body));
        }

        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl WishStore for SupabaseWishStore {
    async fn list_wishes(&self) -> WishStoreResult<Vec<WishRow>> {
        debug!(table = %self.config.table, "Fetching wishes");

        let response = self
            .http_client
            .get(self.table_url())
            .query(&[("select", "*"), ("order", "timestamp.desc")])
            .send()
            .await
            .map_err(classify)?;

        Self::read_rows(response).await
    }

    async fn insert_wish(&self, wish: &NewWish) -> WishStoreResult<Vec<WishRow>> {
        debug!(table = %self.config.table, "Inserting wish");

        let response = self
            .http_client
            .post(self.table_url())
            .query(&[("select", "*")])
            .header("Prefer", "return=representation")
            .json(&[wish])
            .send()
            .await
            .map_err(classify)?;

        Self::read_rows(response).await
    }

    async fn subscribe_inserts(&self) -> WishStoreResult<InsertSubscription> {
        realtime::subscribe(&self.config).await
    }
}

fn header_value(value: &str) -> WishStoreResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| WishStoreError::Other("API key is not a valid header value".to_string()))
}

/// Maps transport errors onto the store error taxonomy
fn classify(e: reqwest::Error) -> WishStoreError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        WishStoreError::Unreachable(e.to_string())
    } else if e.is_decode() || e.is_body() {
        WishStoreError::InvalidResponse(e.to_string())
    } else {
        WishStoreError::Other(e.to_string())
    }
}

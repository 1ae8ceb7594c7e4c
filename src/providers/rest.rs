use crate::core::config::StoreConfig;
use crate::core::store::{Collection, RecordQuery, RecordStore, StoreError};
use crate::providers::util::with_retry;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::{debug, instrument};

const USER_AGENT: &str = concat!("opsdash/", env!("CARGO_PKG_VERSION"));

/// Record store backed by a PostgREST-style HTTP API.
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retries: usize,
    retry_delay_ms: u64,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(RestStore {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retries: config.retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    /// `{base}/rest/v1/{table}?select=*` plus one filter per constraint. The
    /// window end is sent as an exclusive bound on the following day.
    fn query_url(&self, query: &RecordQuery) -> Result<Url, StoreError> {
        let collection = query.collection;
        let mut params = vec![("select".to_string(), "*".to_string())];
        if let Some(range) = &query.time_range {
            params.push((range.field.to_string(), format!("gte.{}", range.window.start)));
            if let Some(end) = range.window.end_exclusive() {
                params.push((range.field.to_string(), format!("lt.{end}")));
            }
        }
        for (field, value) in &query.equals {
            params.push((field.clone(), format!("eq.{value}")));
        }

        let endpoint = format!("{}/rest/v1/{}", self.base_url, collection.table());
        Url::parse_with_params(&endpoint, &params).map_err(|e| StoreError::Transport {
            collection,
            message: format!("invalid url {endpoint}: {e}"),
        })
    }

    async fn fetch_once(&self, url: &Url, collection: Collection) -> Result<Vec<Value>, StoreError> {
        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            request = request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| StoreError::Transport {
            collection,
            message: e.to_string(),
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(StoreError::MissingCollection(collection)),
            status if !status.is_success() => {
                return Err(StoreError::Http {
                    collection,
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::Decode {
                collection,
                message: e.to_string(),
            })
    }
}

fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Transport { .. } => true,
        StoreError::Http { status, .. } => *status == 429 || *status >= 500,
        StoreError::MissingCollection(_) | StoreError::Decode { .. } => false,
    }
}

#[async_trait]
impl RecordStore for RestStore {
    #[instrument(
        name = "RestSelect",
        skip(self, query),
        fields(collection = %query.collection)
    )]
    async fn select(&self, query: &RecordQuery) -> Result<Vec<Value>, StoreError> {
        let url = self.query_url(query)?;
        debug!(%url, "Querying record store");

        let rows = with_retry(
            || self.fetch_once(&url, query.collection),
            self.retries,
            self.retry_delay_ms,
            is_transient,
        )
        .await?;

        debug!(rows = rows.len(), "Received rows");
        Ok(rows)
    }
}

//! REST client for the table and stored-procedure endpoints.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{ClientConfig, ClientError, Filter, QueryClient, Row, Select};

/// Client for `/rest/v1` on a Bazaar backend.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    bearer: String,
}

impl RestClient {
    /// Build a client from validated configuration.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.trimmed_base().to_string(),
            api_key: config.api_key.clone(),
            bearer: config.bearer().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer))
    }

    /// Turn an error status into a typed error, or pass the response through.
    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.map_err(|e| {
            ClientError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        let (code, message) = match serde_json::from_str::<RestError>(&text) {
            Ok(body) => (body.code, body.message.unwrap_or(text)),
            Err(_) => (None, text),
        };

        debug!(status = status.as_u16(), code = ?code, message = %message, "request rejected");
        Err(ClientError::from_status(status.as_u16(), code, message))
    }

    async fn rows(response: Response) -> Result<Vec<Row>, ClientError> {
        let response = Self::check(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Error body returned by the REST layer.
#[derive(Debug, Deserialize)]
struct RestError {
    code: Option<String>,
    message: Option<String>,
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column.clone(), f.query_value()))
        .collect()
}

#[async_trait]
impl QueryClient for RestClient {
    #[instrument(skip(self, query), fields(table = %query.table))]
    async fn select(&self, query: &Select) -> Result<Vec<Row>, ClientError> {
        let mut params = vec![("select".to_string(), query.columns.clone())];
        params.extend(filter_pairs(&query.filters));
        if let Some(any_of) = query.any_of_expression() {
            params.push(("or".to_string(), any_of));
        }
        if !query.order.is_empty() {
            let order: Vec<String> = query.order.iter().map(|o| o.query_value()).collect();
            params.push(("order".to_string(), order.join(",")));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .request(Method::GET, &self.table_url(&query.table))
            .query(&params)
            .send()
            .await?;

        let rows = Self::rows(response).await?;
        debug!(count = rows.len(), "selected rows");
        Ok(rows)
    }

    #[instrument(skip(self, row))]
    async fn insert(&self, table: &str, row: Row) -> Result<Row, ClientError> {
        let response = self
            .request(Method::POST, &self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;

        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::InvalidResponse("insert returned no rows".into()))
    }

    #[instrument(skip(self, patch, filters))]
    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, ClientError> {
        let response = self
            .request(Method::PATCH, &self.table_url(table))
            .header("Prefer", "return=representation")
            .query(&filter_pairs(filters))
            .json(&patch)
            .send()
            .await?;

        Self::rows(response).await
    }

    #[instrument(skip(self, filters))]
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, ClientError> {
        let response = self
            .request(Method::DELETE, &self.table_url(table))
            .header("Prefer", "return=representation")
            .query(&filter_pairs(filters))
            .send()
            .await?;

        Self::rows(response).await
    }

    #[instrument(skip(self, args))]
    async fn invoke(&self, procedure: &str, args: Value) -> Result<Value, ClientError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, procedure);
        let response = self.request(Method::POST, &url).json(&args).send().await?;
        let response = Self::check(response).await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

// ABOUTME: HTTP client for the project's REST (PostgREST) endpoint
// ABOUTME: Handles row reads and writes, auth headers, and status-to-error mapping

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use seafarm_store::{row_id, Query, Row, StoreError, StoreResult, ID_FIELD};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub struct RestClient {
    client: Client,
    api_base_url: String,
    api_key: String,
    schema: String,
}

impl RestClient {
    pub fn new(
        project_url: &Url,
        api_key: impl Into<String>,
        schema: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base_url: format!("{}/rest/v1", project_url.as_str().trim_end_matches('/')),
            api_key: api_key.into(),
            schema: schema.into(),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.api_base_url, table);
        let profile = if method == Method::GET {
            "Accept-Profile"
        } else {
            "Content-Profile"
        };
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(profile, &self.schema)
    }

    pub async fn select(&self, table: &str, query: &Query) -> StoreResult<Vec<Row>> {
        let mut params: Vec<(String, String)> = vec![("select".into(), "*".into())];
        for (column, value) in &query.filters {
            params.push((column.clone(), format!("eq.{}", filter_value(value))));
        }
        if let Some(order) = &query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".into(), format!("{}.{}", order.column, direction)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".into(), limit.to_string()));
        }

        let response = self
            .request(Method::GET, table)
            .query(&params)
            .send()
            .await
            .map_err(send_error)?;
        let response = check_status(response, table, None).await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Malformed(format!("Failed to parse rows from {}: {}", table, e)))
    }

    pub async fn insert(&self, table: &str, row: Row) -> StoreResult<Row> {
        let id = row_id(&row);
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(send_error)?;
        let response = check_status(response, table, id.as_deref()).await?;
        first_row(response, table).await?.ok_or_else(|| {
            StoreError::Malformed(format!("Insert into {} returned no representation", table))
        })
    }

    pub async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<Row> {
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&[(ID_FIELD, format!("eq.{}", id))])
            .json(&patch)
            .send()
            .await
            .map_err(send_error)?;
        let response = check_status(response, table, Some(id)).await?;
        first_row(response, table)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })
    }

    /// Deleting a row that does not exist succeeds.
    pub async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        let response = self
            .request(Method::DELETE, table)
            .query(&[(ID_FIELD, format!("eq.{}", id))])
            .send()
            .await
            .map_err(send_error)?;
        check_status(response, table, Some(id)).await?;
        Ok(())
    }
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Failures before a response arrives. Only a refused connection is known
/// not to have reached the server.
fn send_error(error: reqwest::Error) -> StoreError {
    if error.is_connect() {
        StoreError::Connectivity(error.to_string())
    } else {
        StoreError::Timeout(error.to_string())
    }
}

async fn check_status(response: Response, table: &str, id: Option<&str>) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(format!(
            "{} (check the anon key and row level security policies)",
            message
        )),
        StatusCode::CONFLICT => StoreError::Conflict {
            table: table.to_string(),
            id: id.unwrap_or_default().to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => StoreError::Remote {
            status: status.as_u16(),
            message,
        },
        s if s.is_client_error() => StoreError::Malformed(format!("{}: {}", s.as_u16(), message)),
        s => StoreError::Remote {
            status: s.as_u16(),
            message,
        },
    })
}

/// PostgREST errors are JSON objects with a `message`; fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

async fn first_row(response: Response, table: &str) -> StoreResult<Option<Row>> {
    let rows: Vec<Row> = response
        .json()
        .await
        .map_err(|e| StoreError::Malformed(format!("Failed to parse rows from {}: {}", table, e)))?;
    Ok(rows.into_iter().next())
}

//! Cloudflare D1 over its HTTP query endpoint.
//!
//! There is no session to hold open: every statement is one POST carrying the
//! API token as a bearer credential. Rows come back as JSON objects, so column
//! order is the key order of the first row.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use dbterm_core::connection_manager::{BackendError, ConnectionBackend};
use dbterm_core::query_runner::{CellValue, QueryBackend, QueryBackendError, RowStream};
use dbterm_core::resolver::DialTarget;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct D1Backend;

#[async_trait]
impl ConnectionBackend for D1Backend {
    type Connection = D1Connection;

    async fn connect(&self, target: &DialTarget) -> Result<Self::Connection, BackendError> {
        let (endpoint, token) = split_token(&target.dial_string)?;
        let client = Client::builder()
            .connect_timeout(target.connect_timeout)
            .timeout(target.io_timeout)
            .build()
            .map_err(|error| BackendError::new(error.to_string()))?;
        debug!(endpoint = %endpoint, "d1 client ready");
        Ok(D1Connection {
            client,
            endpoint,
            token,
        })
    }

    async fn disconnect(&self, _connection: Self::Connection) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Separates the `token` query parameter from the endpoint it was attached to.
fn split_token(dial_string: &str) -> Result<(Url, String), BackendError> {
    let mut url = Url::parse(dial_string).map_err(|error| BackendError::new(error.to_string()))?;
    let mut token = None;
    let rest: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == "token" {
                token = Some(value.into_owned());
                None
            } else {
                Some((key.into_owned(), value.into_owned()))
            }
        })
        .collect();
    if rest.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(rest);
    }
    let token = token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| BackendError::new("D1 API token is missing"))?;
    Ok((url, token))
}

#[derive(Clone)]
pub struct D1Connection {
    client: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for D1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("D1Connection")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
    params: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    result: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    results: Vec<Map<String, Value>>,
    #[serde(default)]
    meta: StatementMeta,
}

#[derive(Debug, Default, Deserialize)]
struct StatementMeta {
    #[serde(default)]
    changes: u64,
}

impl D1Connection {
    async fn post(&self, sql: &str) -> Result<Vec<StatementResult>, QueryBackendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&QueryRequest { sql, params: &[] })
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(request_error)?;
        let parsed: QueryResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(QueryBackendError::new(format!("D1 returned HTTP {status}")))
            }
            Err(error) => {
                return Err(QueryBackendError::new(format!(
                    "unexpected D1 response: {error}"
                )))
            }
        };
        into_results(parsed, status.as_u16())
    }
}

fn into_results(
    response: QueryResponse,
    status: u16,
) -> Result<Vec<StatementResult>, QueryBackendError> {
    if response.success {
        return Ok(response.result);
    }
    let message = response
        .errors
        .iter()
        .map(|error| format!("{} (code {})", error.message, error.code))
        .collect::<Vec<_>>()
        .join("; ");
    if message.is_empty() {
        Err(QueryBackendError::new(format!("D1 returned HTTP {status}")))
    } else {
        Err(QueryBackendError::new(message))
    }
}

fn request_error(error: reqwest::Error) -> QueryBackendError {
    if error.is_timeout() {
        QueryBackendError::new("i/o timeout")
    } else {
        QueryBackendError::new(error.to_string())
    }
}

#[async_trait]
impl QueryBackend for D1Connection {
    type Stream = D1RowStream;

    async fn ping(&self) -> Result<(), QueryBackendError> {
        self.post("SELECT 1").await.map(drop)
    }

    async fn start_query(&self, sql: &str) -> Result<Self::Stream, QueryBackendError> {
        let results = self.post(sql).await?;
        Ok(D1RowStream::from_results(results))
    }

    async fn execute(&self, sql: &str) -> Result<u64, QueryBackendError> {
        let results = self.post(sql).await?;
        Ok(results.iter().map(|result| result.meta.changes).sum())
    }
}

/// A fully buffered result; D1 answers a statement in one response.
#[derive(Debug, Default)]
pub struct D1RowStream {
    columns: Vec<String>,
    rows: VecDeque<Vec<CellValue>>,
}

impl D1RowStream {
    fn from_results(results: Vec<StatementResult>) -> Self {
        // Multi-statement batches show the first result set.
        let Some(first) = results.into_iter().next() else {
            return Self::default();
        };
        let columns: Vec<String> = first
            .results
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        let rows = first
            .results
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|column| row.remove(column).map_or(CellValue::Null, cell_value))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }
}

#[async_trait]
impl RowStream for D1RowStream {
    async fn columns(&mut self) -> Result<Vec<String>, QueryBackendError> {
        Ok(self.columns.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Vec<CellValue>>, QueryBackendError> {
        Ok(self.rows.pop_front())
    }

    async fn cancel(&mut self) -> Result<(), QueryBackendError> {
        self.rows.clear();
        Ok(())
    }
}

fn cell_value(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(value) => CellValue::Bool(value),
        Value::Number(number) => number.as_i64().map_or_else(
            || number.as_f64().map_or_else(|| CellValue::Text(number.to_string()), CellValue::Float),
            CellValue::Int,
        ),
        Value::String(text) => CellValue::Text(text),
        other @ (Value::Array(_) | Value::Object(_)) => CellValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use dbterm_core::query_runner::{CellValue, RowStream};
    use serde_json::json;

    use super::{into_results, split_token, D1RowStream, QueryResponse};

    fn response(body: serde_json::Value) -> QueryResponse {
        serde_json::from_value(body).expect("response should deserialize")
    }

    #[test]
    fn token_is_lifted_out_of_the_endpoint() {
        let (url, token) = split_token(
            "https://api.cloudflare.com/client/v4/accounts/acc/d1/database/db/query?token=abc",
        )
        .expect("split should succeed");
        assert_eq!(
            url.as_str(),
            "https://api.cloudflare.com/client/v4/accounts/acc/d1/database/db/query"
        );
        assert_eq!(token, "abc");

        let err = split_token("https://api.cloudflare.com/client/v4/query?token=")
            .expect_err("empty token should fail");
        assert!(err.to_string().contains("token"));
    }

    #[tokio::test]
    async fn rows_keep_first_row_key_order_and_value_kinds() {
        let results = into_results(
            response(json!({
                "success": true,
                "errors": [],
                "result": [{
                    "success": true,
                    "meta": { "changes": 0 },
                    "results": [
                        { "id": 1, "name": "ada", "score": 9.5, "note": null },
                        { "id": 2, "name": "grace", "score": 7, "note": {"k": 1} }
                    ]
                }]
            })),
            200,
        )
        .expect("success response");

        let mut stream = D1RowStream::from_results(results);
        assert_eq!(
            stream.columns().await.expect("columns"),
            vec!["id", "name", "score", "note"]
        );
        assert_eq!(
            stream.next_row().await.expect("row"),
            Some(vec![
                CellValue::Int(1),
                CellValue::Text("ada".to_string()),
                CellValue::Float(9.5),
                CellValue::Null,
            ])
        );
        assert_eq!(
            stream.next_row().await.expect("row"),
            Some(vec![
                CellValue::Int(2),
                CellValue::Text("grace".to_string()),
                CellValue::Int(7),
                CellValue::Text("{\"k\":1}".to_string()),
            ])
        );
        assert_eq!(stream.next_row().await.expect("end"), None);
    }

    #[tokio::test]
    async fn empty_result_has_no_columns() {
        let results = into_results(
            response(json!({ "success": true, "result": [{ "results": [] }] })),
            200,
        )
        .expect("success response");
        let mut stream = D1RowStream::from_results(results);
        assert!(stream.columns().await.expect("columns").is_empty());
        assert_eq!(stream.next_row().await.expect("end"), None);
    }

    #[test]
    fn api_errors_are_joined() {
        let err = into_results(
            response(json!({
                "success": false,
                "errors": [
                    { "code": 7500, "message": "no such table: users" },
                    { "code": 7400, "message": "second" }
                ],
                "result": []
            })),
            400,
        )
        .expect_err("failure response");
        assert_eq!(
            err.message(),
            "no such table: users (code 7500); second (code 7400)"
        );

        let err = into_results(response(json!({ "success": false })), 503)
            .expect_err("failure response");
        assert_eq!(err.message(), "D1 returned HTTP 503");
    }

    #[test]
    fn changes_are_read_from_meta() {
        let results = into_results(
            response(json!({
                "success": true,
                "result": [
                    { "results": [], "meta": { "changes": 2 } },
                    { "results": [], "meta": { "changes": 3 } }
                ]
            })),
            200,
        )
        .expect("success response");
        assert_eq!(results.iter().map(|r| r.meta.changes).sum::<u64>(), 5);
    }
}

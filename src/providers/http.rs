//! Generic JSON-over-HTTP adapter.
//!
//! Maps each operation to a route on one base URL. For GET routes the params
//! become the query string; for POST routes they are the JSON body. Path
//! segments written as `{name}` are filled from params of the same name and
//! removed from the query/body. The pool credential is attached either as a
//! header or as a query parameter.
//!
//! ```rust,no_run
//! # use skirnir::providers::HttpAdapter;
//! # fn main() -> skirnir::Result<()> {
//! let weather = HttpAdapter::new("weather", "https://api.example.com/v1")?
//!     .get("current", "/weather")
//!     .get("forecast", "/forecast/{days}")
//!     .credential_query("appid");
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use super::traits::{AdapterRequest, ProviderAdapter};
use crate::error::ProviderError;
use crate::{Result, SkirnirError};

/// Longest upstream error body kept in a [`ProviderError`].
const MAX_ERROR_BODY: usize = 512;

/// Where the credential goes on the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "in", rename_all = "snake_case")]
pub enum CredentialPlacement {
    /// `name: {prefix}{key}`, e.g. `Authorization: Bearer sk-...`.
    Header {
        name: String,
        #[serde(default)]
        prefix: String,
    },
    Query { name: String },
}

impl Default for CredentialPlacement {
    fn default() -> Self {
        CredentialPlacement::Header {
            name: "Authorization".to_owned(),
            prefix: "Bearer ".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    method: Method,
    path: String,
}

/// A [`ProviderAdapter`] for plain JSON HTTP APIs.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    name: String,
    base_url: String,
    routes: BTreeMap<String, Route>,
    credential: CredentialPlacement,
    http: Client,
}

impl HttpAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| SkirnirError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(name, base_url, http))
    }

    /// Use an existing reqwest client.
    pub fn with_client(name: impl Into<String>, base_url: impl Into<String>, http: Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            routes: BTreeMap::new(),
            credential: CredentialPlacement::default(),
            http,
        }
    }

    /// Route `operation` to `GET {base_url}{path}`.
    pub fn get(self, operation: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(operation, Method::GET, path)
    }

    /// Route `operation` to `POST {base_url}{path}` with a JSON body.
    pub fn post(self, operation: impl Into<String>, path: impl Into<String>) -> Self {
        self.route(operation, Method::POST, path)
    }

    pub fn credential_header(mut self, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.credential = CredentialPlacement::Header {
            name: name.into(),
            prefix: prefix.into(),
        };
        self
    }

    pub fn credential_query(mut self, name: impl Into<String>) -> Self {
        self.credential = CredentialPlacement::Query { name: name.into() };
        self
    }

    fn route(mut self, operation: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        self.routes.insert(
            operation.into(),
            Route {
                method,
                path: path.into(),
            },
        );
        self
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    fn supports(&self, operation: &str) -> bool {
        self.routes.contains_key(operation)
    }

    async fn invoke(&self, request: AdapterRequest<'_>) -> std::result::Result<Value, ProviderError> {
        let route = self.routes.get(request.operation).ok_or_else(|| {
            ProviderError::status(404, format!("no route for operation '{}'", request.operation))
        })?;

        let mut params = match request.params {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ProviderError::status(
                    400,
                    format!("params must be an object, got {other}"),
                ));
            }
        };
        let path = fill_path(&route.path, &mut params);
        let url = format!("{}{}", self.base_url, path);
        trace!(provider = %self.name, method = %route.method, %url, "HTTP request");

        let mut builder = self.http.request(route.method.clone(), &url);
        let mut query: Vec<(String, String)> = Vec::new();
        if route.method == Method::GET {
            query.extend(query_pairs(&params));
        } else {
            builder = builder.json(&Value::Object(params));
        }
        if let Some(key) = request.credential {
            match &self.credential {
                CredentialPlacement::Header { name, prefix } => {
                    builder = builder.header(name.as_str(), format!("{prefix}{key}"));
                }
                CredentialPlacement::Query { name } => query.push((name.clone(), key.to_owned())),
            }
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(ProviderError::status(status.as_u16(), body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::status(502, format!("invalid JSON body: {e}")))
    }
}

/// Substitute `{name}` segments from params, consuming them.
fn fill_path(template: &str, params: &mut Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|i| open + i) else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &rest[open + 1..close];
        match params.remove(name) {
            Some(value) => out.push_str(&scalar_string(&value)),
            None => out.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), scalar_string(v)))
        .collect()
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fills_path_segments() {
        let mut params = json!({"days": 3, "city": "Oslo"})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(fill_path("/forecast/{days}", &mut params), "/forecast/3");
        assert!(!params.contains_key("days"));
        assert_eq!(fill_path("/x/{missing}", &mut params), "/x/{missing}");
    }

    #[test]
    fn query_skips_nulls() {
        let params = json!({"q": "Oslo", "units": null, "n": 2})
            .as_object()
            .cloned()
            .unwrap();
        let mut pairs = query_pairs(&params);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![("n".to_owned(), "2".to_owned()), ("q".to_owned(), "Oslo".to_owned())]
        );
    }

    #[test]
    fn truncates_on_char_boundary() {
        let mut s = "ééé".to_owned();
        truncate_at_char_boundary(&mut s, 3);
        assert_eq!(s, "é");
    }
}

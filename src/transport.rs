use crate::error::{ClientError, Result};
use crate::utils::normalize_api_url;
use reqwest::{Client as HttpClient, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Thin JSON-over-HTTP helper bound to one API base and credential.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: HttpClient,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &str, token: Option<String>) -> Self {
        Self::with_http(HttpClient::new(), base, token)
    }

    pub fn with_http(http: HttpClient, base: &str, token: Option<String>) -> Self {
        Self {
            http,
            base: normalize_api_url(base),
            token,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Absolute URL for an API path such as `/components/42`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Issues a request and returns the decoded body. Empty bodies become
    /// `Value::Null`, non-JSON bodies a `Value::String`.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value> {
        let url = self.url(path);
        debug!("{method} {url}");

        let mut req = self.http.request(method.clone(), &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                method: method.to_string(),
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(decode_body(&text))
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request::<Value>(Method::GET, path, None).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// POST without a body.
    pub async fn post_empty(&self, path: &str) -> Result<Value> {
        self.request::<Value>(Method::POST, path, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request::<Value>(Method::DELETE, path, None).await
    }
}

fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

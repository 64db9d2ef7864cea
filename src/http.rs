//! Thin JSON HTTP client with layered headers, gzip decoding, and an
//! optional endpoint override for test harnessing.
//!
//! Headers are merged from three layers on every call, latest wins:
//! client-level headers, context-propagated headers (scoped with
//! [`with_headers`]), and call-level headers.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
pub use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

const AUTH_PREFIX: &str = "Bearer ";

tokio::task_local! {
    static CTX_HEADERS: HeaderMap;
}

/// Run a future with context-propagated headers attached to every request
/// issued by an [`HttpClient`] inside it.
pub async fn with_headers<F: Future>(headers: HeaderMap, fut: F) -> F::Output {
    CTX_HEADERS.scope(headers, fut).await
}

/// Set the `Authorization: Bearer <token>` header. An empty token leaves
/// the headers untouched.
pub fn add_token_to_headers(headers: &mut HeaderMap, token: &str) {
    if token.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{AUTH_PREFIX}{token}")) {
        headers.insert(AUTHORIZATION, value);
    }
}

/// Extract the bearer token from the `Authorization` header, if any.
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(AUTH_PREFIX))
}

/// A JSON HTTP client safe for concurrent use.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    headers: HeaderMap,
    constraint_endpoint: Option<String>,
}

impl HttpClient {
    /// Build a client with the default transport: 5 s request timeout, 3 s
    /// connect timeout, 30 s TCP keep-alive, gzip decoding.
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .gzip(true)
            .build()
            .map_err(|e| Error::Transport(format!("HttpClient::new: build transport: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Wrap a preconfigured `reqwest::Client`.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
            constraint_endpoint: None,
        }
    }

    /// Client-level headers, merged into every request.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Override the origin of every target URL. Intended only for test
    /// harnessing: `https://td/.well-known/x` becomes `<endpoint>/.well-known/x`.
    pub fn set_constraint_endpoint(&mut self, endpoint: impl Into<String>) {
        self.constraint_endpoint = Some(endpoint.into());
    }

    /// GET a JSON resource.
    pub async fn get<O: DeserializeOwned>(&self, url: &str) -> Result<O, Error> {
        self.request(Method::GET, url, None, Option::<&()>::None).await
    }

    /// POST a JSON body and decode a JSON response.
    pub async fn post<I, O>(&self, url: &str, input: &I) -> Result<O, Error>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.request(Method::POST, url, None, Some(input)).await
    }

    /// Issue a JSON request.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] for network failures, status ≥ 300 (carrying
    /// status and body), and undecodable responses; [`Error::Cancelled`]
    /// when the request deadline fires.
    pub async fn request<I, O>(
        &self,
        method: Method,
        url: &str,
        headers: Option<HeaderMap>,
        input: Option<&I>,
    ) -> Result<O, Error>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        const OP: &str = "HttpClient::request";
        let url = self.rewrite_url(OP, url)?;
        let mut req = self.client.request(method, &url);

        let mut merged = self.headers.clone();
        if let Ok(ctx) = CTX_HEADERS.try_with(|h| h.clone()) {
            merge_headers(&mut merged, &ctx);
        }
        if let Some(h) = &headers {
            merge_headers(&mut merged, h);
        }
        if input.is_some() {
            merged.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
        }
        merged.insert(ACCEPT, HeaderValue::from_static("application/json"));
        req = req.headers(merged);

        if let Some(input) = input {
            req = req.body(serde_json::to_vec(input)?);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Cancelled(format!("{OP}: request to {url} timed out: {e}"))
            } else {
                Error::Transport(format!("{OP}: request to {url} failed: {e}"))
            }
        })?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("{OP}: read response from {url}: {e}")))?;
        if status.as_u16() >= 300 {
            return Err(Error::Transport(format!(
                "{OP}: non-success response, status code: {status}, response: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        serde_json::from_slice(&body).map_err(|e| {
            Error::Transport(format!(
                "{OP}: decoding response from {url}: {e}, response: {}",
                String::from_utf8_lossy(&body)
            ))
        })
    }

    /// GET the URL and report whether it answered with a success status.
    pub async fn probe(&self, url: &str) -> Result<(), Error> {
        const OP: &str = "HttpClient::probe";
        let url = self.rewrite_url(OP, url)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{OP}: {url} failed: {e}")))?;
        let status = resp.status();
        if status.as_u16() >= 300 {
            return Err(Error::Transport(format!(
                "{OP}: {url}: status code {status}"
            )));
        }
        Ok(())
    }

    fn rewrite_url(&self, op: &str, api: &str) -> Result<String, Error> {
        let Some(endpoint) = &self.constraint_endpoint else {
            return Ok(api.to_string());
        };
        if api.starts_with("http") {
            let u = url::Url::parse(api)
                .map_err(|e| Error::Transport(format!("{op}: invalid URL '{api}': {e}")))?;
            let mut rest = u.path().to_string();
            if let Some(q) = u.query() {
                rest.push('?');
                rest.push_str(q);
            }
            Ok(format!("{endpoint}{rest}"))
        } else {
            Ok(format!("{endpoint}{api}"))
        }
    }
}

fn merge_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        dst.insert(name, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderName;

    #[test]
    fn bearer_roundtrip() {
        let mut h = HeaderMap::new();
        add_token_to_headers(&mut h, "");
        assert!(extract_token_from_headers(&h).is_none());

        h.insert(AUTHORIZATION, HeaderValue::from_static("token"));
        assert!(extract_token_from_headers(&h).is_none());

        add_token_to_headers(&mut h, "123");
        assert_eq!(extract_token_from_headers(&h), Some("123"));

        add_token_to_headers(&mut h, "456");
        assert_eq!(extract_token_from_headers(&h), Some("456"));
    }

    #[test]
    fn constraint_endpoint_rewrites() {
        let mut client = HttpClient::new().unwrap();
        client.set_constraint_endpoint("http://127.0.0.1:8080");

        assert_eq!(
            client
                .rewrite_url("test", "https://localhost/.well-known/open-trust-configuration")
                .unwrap(),
            "http://127.0.0.1:8080/.well-known/open-trust-configuration"
        );
        assert_eq!(
            client.rewrite_url("test", "https://svc.example.com/v1/x?a=1").unwrap(),
            "http://127.0.0.1:8080/v1/x?a=1"
        );
        assert_eq!(
            client.rewrite_url("test", "/sign").unwrap(),
            "http://127.0.0.1:8080/sign"
        );
    }

    #[test]
    fn no_constraint_endpoint_passthrough() {
        let client = HttpClient::new().unwrap();
        assert_eq!(
            client.rewrite_url("test", "https://localhost/v1").unwrap(),
            "https://localhost/v1"
        );
    }

    #[test]
    fn merge_latest_wins() {
        let mut dst = HeaderMap::new();
        dst.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static("one"),
        );
        let mut src = HeaderMap::new();
        src.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static("two"),
        );
        src.insert(
            HeaderName::from_static("x-extra"),
            HeaderValue::from_static("yes"),
        );
        merge_headers(&mut dst, &src);
        assert_eq!(dst.get("user-agent").unwrap(), "two");
        assert_eq!(dst.get("x-extra").unwrap(), "yes");
    }
}

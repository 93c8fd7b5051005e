//! RouterOS v7 REST transport.
//!
//! `GET /rest/<path>?k=v` prints, `PUT` adds, `PATCH /rest/<path>/<id>` sets and
//! `DELETE /rest/<path>/<id>` removes. Every value on the wire is a string.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, RouterError};
use crate::pool::{ConnectionPool, PoolPermit};
use crate::transport::Transport;
use crate::types::{Record, paths};

/// Connection settings for the REST API.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// e.g. `https://10.0.0.1`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub pool_size: usize,
    pub command_timeout: Duration,
    /// RouterOS ships a self-signed certificate by default.
    pub accept_invalid_certs: bool,
}

/// REST transport with a bounded command pool.
pub struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    pool: ConnectionPool,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RestTransport {
    pub fn new(config: &RestConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(RouterError::Config("base_url is empty".into()));
        }
        if config.username.is_empty() {
            return Err(RouterError::Config("username is empty".into()));
        }

        // reqwest is built with rustls-no-provider; Err only means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| RouterError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            pool: ConnectionPool::new(config.pool_size, config.command_timeout),
        })
    }

    pub(crate) fn url(&self, path: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/rest/{}/{}", self.base_url, path, id),
            None => format!("{}/rest/{}", self.base_url, path),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Acquire a slot, probing the router first when the health mark is stale.
    async fn checkout(&self) -> Result<PoolPermit> {
        let permit = self.pool.acquire().await?;
        if permit.needs_health_check {
            self.probe().await?;
        }
        Ok(permit)
    }

    async fn probe(&self) -> Result<()> {
        let url = self.url(paths::SYSTEM_RESOURCE, None);
        let result = self.request(reqwest::Method::GET, &url).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                self.pool.mark_healthy().await;
                Ok(())
            }
            Ok(resp) => {
                self.pool.mark_unhealthy().await;
                Err(RouterError::Unreachable(format!(
                    "health check returned {}",
                    resp.status()
                )))
            }
            Err(e) => {
                self.pool.mark_unhealthy().await;
                warn!(error = %e, "Router health check failed");
                Err(RouterError::Unreachable(e.to_string()))
            }
        }
    }

    /// Map a response to an error unless it is a success.
    async fn check_status(&self, resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            self.pool.mark_healthy().await;
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RouterError::NotFound(what.to_string()));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RouterError::Command {
            status: status.as_u16(),
            message: error_message(&body).unwrap_or_else(|| {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            }),
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        match req.send().await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err = RouterError::from(e);
                if err.is_unreachable() {
                    self.pool.mark_unhealthy().await;
                }
                Err(err)
            }
        }
    }
}

/// RouterOS error bodies look like `{"error":400,"message":"Bad Request","detail":"..."}`.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("detail")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn to_record(value: &Value) -> Option<Record> {
    let obj = value.as_object()?;
    Some(
        obj.iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect(),
    )
}

#[async_trait]
impl Transport for RestTransport {
    async fn print(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Record>> {
        let _permit = self.checkout().await?;
        let url = self.url(path, None);
        let resp = self
            .send(self.request(reqwest::Method::GET, &url).query(query))
            .await?;
        let resp = self.check_status(resp, path).await?;
        let body: Value = resp.json().await?;
        let items = body
            .as_array()
            .ok_or_else(|| RouterError::Decode(format!("{path}: expected an array")))?;
        Ok(items.iter().filter_map(to_record).collect())
    }

    async fn add(&self, path: &str, attrs: &Record) -> Result<String> {
        let _permit = self.checkout().await?;
        debug!(path, "router add");
        let url = self.url(path, None);
        let resp = self
            .send(self.request(reqwest::Method::PUT, &url).json(attrs))
            .await?;
        let resp = self.check_status(resp, path).await?;
        let body: Value = resp.json().await?;
        body.get(".id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| RouterError::Decode(format!("{path}: add returned no .id")))
    }

    async fn set(&self, path: &str, id: &str, attrs: &Record) -> Result<()> {
        let _permit = self.checkout().await?;
        debug!(path, id, "router set");
        let url = self.url(path, Some(id));
        let resp = self
            .send(self.request(reqwest::Method::PATCH, &url).json(attrs))
            .await?;
        self.check_status(resp, &format!("{path}/{id}")).await?;
        Ok(())
    }

    async fn remove(&self, path: &str, id: &str) -> Result<()> {
        let _permit = self.checkout().await?;
        debug!(path, id, "router remove");
        let url = self.url(path, Some(id));
        let resp = self
            .send(self.request(reqwest::Method::DELETE, &url))
            .await?;
        self.check_status(resp, &format!("{path}/{id}")).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _permit = self.pool.acquire().await?;
        self.probe().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> RestConfig {
        RestConfig {
            base_url: base_url.into(),
            username: "api".into(),
            password: "secret".into(),
            pool_size: 2,
            command_timeout: Duration::from_secs(1),
            accept_invalid_certs: true,
        }
    }

    #[test]
    fn empty_base_url_is_rejected() {
        assert!(matches!(RestTransport::new(&config("")), Err(RouterError::Config(_))));
    }

    #[test]
    fn trailing_slash_stripped() {
        let t = RestTransport::new(&config("https://10.0.0.1/")).unwrap();
        assert_eq!(t.url("ip/hotspot/user", None), "https://10.0.0.1/rest/ip/hotspot/user");
        assert_eq!(
            t.url("ip/hotspot/user", Some("*1")),
            "https://10.0.0.1/rest/ip/hotspot/user/*1"
        );
    }

    #[test]
    fn error_body_detail_preferred() {
        let body = r#"{"error":400,"message":"Bad Request","detail":"no such item"}"#;
        assert_eq!(error_message(body).as_deref(), Some("no such item"));
        assert_eq!(error_message("not json"), None);
    }

    #[test]
    fn non_string_values_are_stringified() {
        let rec = to_record(&serde_json::json!({".id": "*1", "dynamic": true, "n": 5})).unwrap();
        assert_eq!(rec.get("dynamic").map(String::as_str), Some("true"));
        assert_eq!(rec.get("n").map(String::as_str), Some("5"));
    }
}

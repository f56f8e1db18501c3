//! Request authentication

use super::{http_error, json_at, parse_method};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tributary_core::spec::AuthSpec;
use tributary_core::{StreamError, StreamResult};

/// Tokens are refreshed this long before they expire
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AuthProvider: Send {
    /// Attach credentials to a request
    async fn authorize(&mut self, http: &Client, request: RequestBuilder) -> StreamResult<RequestBuilder>;
}

pub fn auth_provider(spec: &AuthSpec) -> StreamResult<Box<dyn AuthProvider>> {
    Ok(match spec {
        AuthSpec::None => Box::new(NoAuth),
        AuthSpec::FixedHeaders { headers } => Box::new(FixedHeaderAuth::new(headers.clone())),
        AuthSpec::DynamicBearer {
            token_url,
            method,
            body,
            headers,
            token_property,
            expiration_property,
            expiration_period_secs,
        } => Box::new(DynamicBearerAuth {
            token_url: token_url.clone(),
            method: parse_method(method)?,
            body: body.clone().map(TokenRequestBody::Raw),
            headers: headers.clone(),
            token_property: token_property.clone(),
            expiration_property: expiration_property.clone(),
            expiration_period: expiration_period_secs.map(Duration::from_secs),
            token: None,
            last_response: None,
        }),
    })
}

pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn authorize(&mut self, _http: &Client, request: RequestBuilder) -> StreamResult<RequestBuilder> {
        Ok(request)
    }
}

/// Static headers added to every request
pub struct FixedHeaderAuth {
    headers: HashMap<String, String>,
}

impl FixedHeaderAuth {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl AuthProvider for FixedHeaderAuth {
    async fn authorize(&mut self, _http: &Client, request: RequestBuilder) -> StreamResult<RequestBuilder> {
        Ok(self
            .headers
            .iter()
            .fold(request, |request, (name, value)| request.header(name, value)))
    }
}

#[derive(Debug, Clone)]
struct BearerToken {
    value: String,
    /// `None` when the token endpoint gave no lifetime
    expires_at: Option<Instant>,
}

impl BearerToken {
    fn needs_refresh(&self, now: Instant) -> bool {
        self.expires_at
            .is_some_and(|at| now + TOKEN_REFRESH_MARGIN >= at)
    }
}

#[derive(Debug, Clone)]
enum TokenRequestBody {
    /// Sent as configured
    Raw(String),
    /// `application/x-www-form-urlencoded` pairs
    Form(Vec<(String, String)>),
}

/// Bearer token fetched from a token endpoint and cached until shortly before expiry
pub struct DynamicBearerAuth {
    token_url: String,
    method: reqwest::Method,
    body: Option<TokenRequestBody>,
    headers: HashMap<String, String>,
    token_property: String,
    expiration_property: Option<String>,
    expiration_period: Option<Duration>,
    token: Option<BearerToken>,
    last_response: Option<Value>,
}

impl DynamicBearerAuth {
    /// OAuth2 password grant, form encoded
    pub fn password_grant(token_url: impl Into<String>, form: &[(&str, &str)]) -> Self {
        let pairs = form
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            token_url: token_url.into(),
            method: reqwest::Method::POST,
            body: Some(TokenRequestBody::Form(pairs)),
            headers: HashMap::new(),
            token_property: "access_token".into(),
            expiration_property: None,
            expiration_period: None,
            token: None,
            last_response: None,
        }
    }

    pub fn with_expiration_period(mut self, period: Duration) -> Self {
        self.expiration_period = Some(period);
        self
    }

    /// Body of the most recent token response
    pub fn last_response(&self) -> Option<&Value> {
        self.last_response.as_ref()
    }

    /// Current token, fetching a new one when missing or about to expire
    pub async fn token(&mut self, http: &Client) -> StreamResult<String> {
        let now = Instant::now();
        if let Some(token) = self.token.as_ref().filter(|t| !t.needs_refresh(now)) {
            return Ok(token.value.clone());
        }
        let token = self.fetch(http).await?;
        let value = token.value.clone();
        self.token = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next request fetches a new one
    pub fn invalidate(&mut self) {
        self.token = None;
    }

    async fn fetch(&mut self, http: &Client) -> StreamResult<BearerToken> {
        debug!(url = %self.token_url, "requesting bearer token");
        let mut request = http.request(self.method.clone(), &self.token_url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request = match &self.body {
            Some(TokenRequestBody::Raw(body)) => request.body(body.clone()),
            Some(TokenRequestBody::Form(pairs)) => request.form(pairs),
            None => request,
        };
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                message: format!("token request failed: {message}"),
            });
        }
        let body: Value = response.json().await.map_err(http_error)?;
        let value = match json_at(&body, std::slice::from_ref(&self.token_property)) {
            Some(Value::String(token)) if !token.is_empty() => token.clone(),
            _ => {
                return Err(StreamError::parse(format!(
                    "token response has no {} property",
                    self.token_property
                )))
            }
        };
        let lifetime = self
            .expiration_property
            .as_ref()
            .and_then(|p| body.get(p))
            .and_then(seconds)
            .or(self.expiration_period);
        info!(expires_in = ?lifetime, "bearer token refreshed");
        self.last_response = Some(body);
        Ok(BearerToken {
            value,
            expires_at: lifetime.map(|l| Instant::now() + l),
        })
    }
}

#[async_trait]
impl AuthProvider for DynamicBearerAuth {
    async fn authorize(&mut self, http: &Client, request: RequestBuilder) -> StreamResult<RequestBuilder> {
        let token = self.token(http).await?;
        Ok(request.bearer_auth(token))
    }
}

fn seconds(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_secs),
        Value::String(s) => s.parse().ok().map(Duration::from_secs),
        _ => None,
    }
}

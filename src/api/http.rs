use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{
    Client as ReqwestClient, Method, Request,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use serde::de::DeserializeOwned;
use url::Url;

use super::types::{OrderAck, OrderRequest, ReadyResponse, SessionInfo};
use super::{OrderApi, SessionApi};
use crate::Result;
use crate::auth::{ExposeSecret as _, TokenProvider};
use crate::error::{ConnectError, Error};
use crate::serde_helpers;

/// REST client for the gateway's session and order endpoints.
///
/// Every request carries the bearer token currently offered by the [`TokenProvider`]. Nothing is
/// retried here; a non-2xx answer becomes an error of kind [`Kind::Status`](crate::error::Kind::Status).
#[derive(Clone)]
pub struct HttpApi {
    host: Url,
    client: ReqwestClient,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi")
            .field("host", &self.host.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpApi {
    /// Creates a client for `host`, e.g. `https://gateway.example.com/api/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host URL is invalid or the HTTP client fails to build.
    pub fn new(host: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert("User-Agent", HeaderValue::from_static("trading_gateway_client"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        let mut host = Url::parse(host)?;
        if !host.path().ends_with('/') {
            let path = format!("{}/", host.path());
            host.set_path(&path);
        }

        Ok(Self {
            host,
            client,
            tokens,
        })
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.host.join(path)?)
    }

    async fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self
            .tokens
            .access_token()
            .await
            .ok_or(ConnectError::NoCredential)?;

        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    async fn send<Response: DeserializeOwned>(&self, request: Request) -> Result<Response> {
        let headers = self.auth_headers().await?;
        request_json(&self.client, request, headers).await
    }
}

#[async_trait]
impl SessionApi for HttpApi {
    async fn create_session(&self) -> Result<SessionInfo> {
        let request = self
            .client
            .request(Method::POST, self.url("sessions")?)
            .build()?;

        self.send(request).await
    }

    async fn check_session_ready(&self, session_id: &str) -> Result<bool> {
        let request = self
            .client
            .request(
                Method::GET,
                self.url(&format!("sessions/{session_id}/ready"))?,
            )
            .build()?;

        let ready: ReadyResponse = self.send(request).await?;
        Ok(ready.ready)
    }

    async fn reconnect_session(&self, session_id: &str, attempt: u32) -> Result<SessionInfo> {
        let request = self
            .client
            .request(
                Method::POST,
                self.url(&format!("sessions/{session_id}/reconnect"))?,
            )
            .json(&serde_json::json!({ "attempt": attempt }))
            .build()?;

        self.send(request).await
    }

    async fn session_state(&self, session_id: &str) -> Result<SessionInfo> {
        let request = self
            .client
            .request(Method::GET, self.url(&format!("sessions/{session_id}"))?)
            .build()?;

        self.send(request).await
    }
}

#[async_trait]
impl OrderApi for HttpApi {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let request = self
            .client
            .request(Method::POST, self.url("orders")?)
            .json(order)
            .build()?;

        self.send(request).await
    }

    async fn cancel_order(&self, session_id: &str, order_id: &str) -> Result<OrderAck> {
        let request = self
            .client
            .request(
                Method::DELETE,
                self.url(&format!("sessions/{session_id}/orders/{order_id}"))?,
            )
            .build()?;

        self.send(request).await
    }
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(client, request, headers),
        fields(
            method = %request.method(),
            path = request.url().path(),
            status_code
        )
    )
)]
async fn request_json<Response: DeserializeOwned>(
    client: &ReqwestClient,
    mut request: Request,
    headers: HeaderMap,
) -> Result<Response> {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    request.headers_mut().extend(headers);

    let response = client.execute(request).await?;
    let status_code = response.status();

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = response.text().await.unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            status = %status_code,
            method = %method,
            path = %path,
            message = %message,
            "API request failed"
        );

        return Err(Error::status(status_code, method, path, message));
    }

    let json_value = response.json::<serde_json::Value>().await?;
    serde_helpers::deserialize_with_warnings(json_value)
}

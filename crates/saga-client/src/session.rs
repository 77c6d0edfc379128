//! Session refresh against the hosted store's auth endpoint.

use std::sync::{PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use saga_realtime::health::SessionRefresher;
use saga_types::store::StoreError;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Clone, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// Holds the current access token and trades the refresh token for a new
/// pair when asked.
pub struct HttpSession {
    client: Client,
    token_url: String,
    api_key: String,
    tokens: RwLock<Tokens>,
}

impl HttpSession {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: Client::new(),
            token_url: format!("{}/auth/v1/token?grant_type=refresh_token", config.store_url),
            api_key: config.api_key.clone(),
            tokens: RwLock::new(Tokens::default()),
        }
    }

    pub fn with_refresh_token(self, refresh_token: impl Into<String>) -> Self {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner).refresh = Some(refresh_token.into());
        self
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).access.clone()
    }

    /// Attach the store credentials to a request. The bearer is the current
    /// access token, or the API key until the first refresh lands.
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token().unwrap_or_else(|| self.api_key.clone());
        request.header("apikey", &self.api_key).bearer_auth(bearer)
    }

    async fn exchange(&self) -> Result<(), StoreError> {
        let refresh_token = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh
            .clone()
            .ok_or_else(|| StoreError::Auth("no refresh token".into()))?;

        debug!("refreshing session at {}", self.token_url);
        let resp = self
            .authorize(self.client.post(&self.token_url))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| StoreError::Network(format!("session refresh request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("session refresh rejected ({}): {}", status, body);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => StoreError::Auth(body),
                s if s.is_server_error() => StoreError::Network(format!("{}: {}", s, body)),
                s => StoreError::Rejected(format!("{}: {}", s, body)),
            });
        }

        let tokens: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Rejected(format!("malformed token response: {}", e)))?;
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Tokens {
            access: Some(tokens.access_token),
            refresh: Some(tokens.refresh_token),
        };
        info!("session refreshed");
        Ok(())
    }
}

impl SessionRefresher for HttpSession {
    fn refresh(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.exchange().boxed()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use super::*;

    fn config(store_url: &str) -> ClientConfig {
        ClientConfig {
            store_url: store_url.into(),
            api_key: "anon-key".into(),
            ..ClientConfig::default()
        }
    }

    fn tokens(access: &str, refresh: &str) -> (u16, String) {
        let body = serde_json::json!({ "access_token": access, "refresh_token": refresh });
        (200, body.to_string())
    }

    /// Serves one canned reply per connection and reports each raw request,
    /// lowercased.
    async fn auth_endpoint(replies: Vec<(u16, String)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                tx.send(request.to_ascii_lowercase()).unwrap();
                let reply = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (url, rx)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_ascii_lowercase();
            let Some(end) = text.find("\r\n\r\n") else {
                continue;
            };
            let length = text[..end]
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn refreshed_access_token_is_sent_on_later_requests() {
        let replies = vec![tokens("access-1", "refresh-1"), tokens("access-2", "refresh-2")];
        let (url, mut requests) = auth_endpoint(replies).await;
        let session = HttpSession::new(&config(&url)).with_refresh_token("refresh-0");

        session.refresh().await.unwrap();
        let first = requests.recv().await.unwrap();
        assert!(first.starts_with("post /auth/v1/token?grant_type=refresh_token"), "{first}");
        assert!(first.contains("apikey: anon-key"), "{first}");
        assert!(first.contains("authorization: bearer anon-key"), "{first}");
        assert!(first.contains("refresh-0"), "{first}");
        assert_eq!(session.access_token().as_deref(), Some("access-1"));

        session.refresh().await.unwrap();
        let second = requests.recv().await.unwrap();
        assert!(second.contains("authorization: bearer access-1"), "{second}");
        assert!(second.contains("refresh-1"), "{second}");
        assert_eq!(session.access_token().as_deref(), Some("access-2"));
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_the_current_token() {
        let (url, _requests) = auth_endpoint(vec![
            tokens("access-1", "refresh-1"),
            (401, r#"{"error":"invalid_grant"}"#.to_string()),
        ])
        .await;
        let session = HttpSession::new(&config(&url)).with_refresh_token("refresh-0");

        session.refresh().await.unwrap();
        let err = session.refresh().await.unwrap_err();
        assert!(err.is_auth(), "{err:?}");
        assert_eq!(session.access_token().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_an_auth_error() {
        let session = HttpSession::new(&config("http://127.0.0.1:9"));
        let err = session.refresh().await.unwrap_err();
        assert!(err.is_auth());
        assert!(session.access_token().is_none());
    }

    #[tokio::test]
    async fn unreachable_store_is_a_network_error() {
        let session = HttpSession::new(&config("http://127.0.0.1:9")).with_refresh_token("stale");
        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)), "{err:?}");
    }
}

// Spotify Web API client: track lookup/search and player commands.
//
// Every request goes through `send`, which refreshes the access token once on
// a 401 and reports `AuthExpired` if the retry is rejected too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::auth::{RefreshResponse, TokenStore};
use super::{ExternalTrackRef, PlaybackError, StreamingApi};
use crate::config::SpotifyConfig;

pub struct SpotifyClient {
    http: reqwest::Client,
    api_base: String,
    accounts_base: String,
    client_id: String,
    tokens: Arc<TokenStore>,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig, tokens: Arc<TokenStore>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            accounts_base: config.accounts_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            tokens,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Exchange the refresh token for a new access token (PKCE refresh grant).
    pub async fn refresh(&self) -> Result<String, PlaybackError> {
        let refresh_token = self.tokens.refresh_token().ok_or(PlaybackError::AuthExpired)?;
        let response = self
            .http
            .post(format!("{}/api/token", self.accounts_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PlaybackError::Transient(format!("token refresh: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PlaybackError::Transient(format!("token refresh returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Token refresh rejected ({}): {}", status, body);
            return Err(PlaybackError::AuthExpired);
        }
        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| PlaybackError::Transient(format!("token refresh body: {e}")))?;
        info!("Refreshed streaming access token");
        Ok(self.tokens.apply_refresh(parsed).access_token)
    }

    async fn valid_access_token(&self) -> Result<String, PlaybackError> {
        match self.tokens.fresh_access_token() {
            Some(token) => Ok(token),
            None => self.refresh().await,
        }
    }

    async fn send<F>(&self, build: F) -> Result<Response, PlaybackError>
    where
        F: Fn(&reqwest::Client, &str) -> RequestBuilder,
    {
        let token = self.valid_access_token().await?;
        let response = build(&self.http, &token)
            .send()
            .await
            .map_err(|e| PlaybackError::Transient(e.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Streaming API returned 401; refreshing token and retrying once");
        let token = self.refresh().await?;
        let response = build(&self.http, &token)
            .send()
            .await
            .map_err(|e| PlaybackError::Transient(e.to_string()))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(PlaybackError::AuthExpired);
        }
        Ok(response)
    }

    async fn player_command(
        &self,
        method: Method,
        path: &str,
        device_id: Option<&str>,
        body: Option<Value>,
    ) -> Result<(), PlaybackError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .send(|http, token| {
                let mut req = http.request(method.clone(), &url).bearer_auth(token);
                if let Some(device) = device_id {
                    req = req.query(&[("device_id", device)]);
                }
                match &body {
                    Some(b) => req.json(b),
                    None => req.header(reqwest::header::CONTENT_LENGTH, 0),
                }
            })
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_player_failure(status, &text))
    }

    async fn lookup(&self, track: &ExternalTrackRef) -> Result<Option<ExternalTrackRef>, PlaybackError> {
        let url = format!("{}/tracks/{}", self.api_base, track.track_id());
        let response = self.send(|http, token| http.get(&url).bearer_auth(token)).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_lookup_failure(status, &text));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlaybackError::Transient(format!("track body: {e}")))?;
        Ok(body
            .get("uri")
            .and_then(Value::as_str)
            .and_then(ExternalTrackRef::from_uri))
    }

    async fn search(&self, name: &str) -> Result<Option<ExternalTrackRef>, PlaybackError> {
        let url = format!("{}/search", self.api_base);
        let response = self
            .send(|http, token| {
                http.get(&url)
                    .bearer_auth(token)
                    .query(&[("q", name), ("type", "track"), ("limit", "1")])
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_lookup_failure(status, &text));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlaybackError::Transient(format!("search body: {e}")))?;
        Ok(first_search_hit(&body))
    }
}

#[async_trait]
impl StreamingApi for SpotifyClient {
    async fn resolve(
        &self,
        name: &str,
        hint: Option<&ExternalTrackRef>,
    ) -> Result<ExternalTrackRef, PlaybackError> {
        if let Some(hint) = hint {
            match self.lookup(hint).await? {
                Some(found) => return Ok(found),
                None => debug!("Embedded ref {} not found, searching by name", hint),
            }
        }
        let query = name.trim();
        if query.is_empty() {
            return Err(PlaybackError::TrackResolution {
                query: name.to_string(),
                reason: "empty track name".into(),
            });
        }
        self.search(query)
            .await?
            .ok_or_else(|| PlaybackError::TrackResolution {
                query: query.to_string(),
                reason: "no search results".into(),
            })
    }

    async fn play(&self, device_id: &str, track: &ExternalTrackRef) -> Result<(), PlaybackError> {
        self.player_command(
            Method::PUT,
            "/me/player/play",
            Some(device_id),
            Some(json!({ "uris": [track.uri()], "position_ms": 0 })),
        )
        .await
    }

    async fn pause(&self, device_id: &str) -> Result<(), PlaybackError> {
        self.player_command(Method::PUT, "/me/player/pause", Some(device_id), None)
            .await
    }

    async fn resume(&self, device_id: &str) -> Result<(), PlaybackError> {
        self.player_command(Method::PUT, "/me/player/play", Some(device_id), None)
            .await
    }

    async fn transfer_playback(&self, device_id: &str) -> Result<(), PlaybackError> {
        self.player_command(
            Method::PUT,
            "/me/player",
            None,
            Some(json!({ "device_ids": [device_id], "play": false })),
        )
        .await
    }

    async fn access_token(&self) -> Result<String, PlaybackError> {
        self.valid_access_token().await
    }
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Map a failed player-endpoint response onto the error taxonomy.
pub(crate) fn classify_player_failure(status: StatusCode, body: &str) -> PlaybackError {
    if status == StatusCode::NOT_FOUND || body.contains("NO_ACTIVE_DEVICE") {
        return PlaybackError::NoDevice;
    }
    classify_lookup_failure(status, body)
}

pub(crate) fn classify_lookup_failure(status: StatusCode, body: &str) -> PlaybackError {
    if status == StatusCode::UNAUTHORIZED {
        PlaybackError::AuthExpired
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PlaybackError::Transient(format!("status {status}"))
    } else {
        PlaybackError::Api {
            status: status.as_u16(),
            message: error_message(body),
        }
    }
}

/// Pull `error.message` out of a Spotify error body, or return the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

pub(crate) fn first_search_hit(body: &Value) -> Option<ExternalTrackRef> {
    body.pointer("/tracks/items/0/uri")
        .and_then(Value::as_str)
        .and_then(ExternalTrackRef::from_uri)
}

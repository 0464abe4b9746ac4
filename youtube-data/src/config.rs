//! Client credentials and endpoint configuration.

use oauth2::{AccessToken, ClientId, ClientSecret, RefreshToken};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Google OAuth2 token endpoint, used for code exchange, device polling and refresh.
pub const TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";
/// Google OAuth2 device-code endpoint.
pub const DEVICE_CODE_URL: &str = "https://accounts.google.com/o/oauth2/device/code";
/// Google OAuth2 revocation endpoint.
pub const REVOKE_TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/revoke";
/// Google OAuth2 authorization page for the installed-application flow.
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
/// Base URL of the YouTube Data API v3.
pub const API_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Redirect URI telling Google to show the authorization code to the user instead of
/// redirecting anywhere.
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Commonly requested scopes.
pub mod scopes {
    /// Manage a YouTube account.
    pub const YOUTUBE: &str = "https://www.googleapis.com/auth/youtube";
    /// View a YouTube account.
    pub const YOUTUBE_READONLY: &str = "https://www.googleapis.com/auth/youtube.readonly";
    /// Upload YouTube videos and manage YouTube videos.
    pub const YOUTUBE_UPLOAD: &str = "https://www.googleapis.com/auth/youtube.upload";
    /// Retrieve the auditDetails part in a channel resource.
    pub const YOUTUBE_PARTNER_CHANNEL_AUDIT: &str =
        "https://www.googleapis.com/auth/youtubepartner-channel-audit";
}

/// Where requests are sent.
///
/// Defaults to Google's production endpoints; tests point these elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub token: String,
    pub device_code: String,
    pub revoke: String,
    pub authorization: String,
    pub api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token: TOKEN_URL.to_string(),
            device_code: DEVICE_CODE_URL.to_string(),
            revoke: REVOKE_TOKEN_URL.to_string(),
            authorization: AUTH_URL.to_string(),
            api: API_URL.to_string(),
        }
    }
}

/// API key and OAuth client credentials.
///
/// Any of these may be absent; operations that need a missing value fail with
/// [`Error::InvalidArgument`](crate::Error::InvalidArgument).
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub client_id: Option<ClientId>,
    pub client_secret: Option<ClientSecret>,
    pub access_token: Option<AccessToken>,
    pub refresh_token: Option<RefreshToken>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key_set", &self.api_key.is_some())
            .field("client_id", &self.client_id)
            .field("client_secret_set", &self.client_secret.is_some())
            .field("access_token_set", &self.access_token.is_some())
            .field("refresh_token_set", &self.refresh_token.is_some())
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Credentials {
    /// Reads credentials from `YOUTUBE_API_KEY`, `YOUTUBE_CLIENT_ID`, `YOUTUBE_CLIENT_SECRET`,
    /// `YOUTUBE_ACCESS_TOKEN` and `YOUTUBE_REFRESH_TOKEN`.
    ///
    /// Unset and empty variables are treated the same.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| non_empty(lookup(name));
        Self {
            api_key: get("YOUTUBE_API_KEY"),
            client_id: get("YOUTUBE_CLIENT_ID").map(ClientId::new),
            client_secret: get("YOUTUBE_CLIENT_SECRET").map(ClientSecret::new),
            access_token: get("YOUTUBE_ACCESS_TOKEN").map(AccessToken::new),
            refresh_token: get("YOUTUBE_REFRESH_TOKEN").map(RefreshToken::new),
        }
    }

    pub fn with_client(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.client_id = Some(ClientId::new(id.into()));
        self.client_secret = Some(ClientSecret::new(secret.into()));
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(AccessToken::new(token.into()));
        self
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(RefreshToken::new(token.into()));
        self
    }
}

//! Asynchronous client for the YouTube Data API v3.
//!
//! The crate is built around three request objects that share a [`Client`]:
//!
//! - [`Request`] performs a single call and tracks its lifecycle
//!   (`Idle → Loading → Ready | Failed | Canceled`).
//! - [`AuthenticationRequest`] obtains, refreshes, and revokes OAuth 2.0 tokens, including the
//!   device flow for input-constrained devices.
//! - [`ListModel`] loads a paginated collection on demand.
//!
//! Every request object allows one operation at a time, can be canceled from another task,
//! and broadcasts [`Event`]s as its state changes.

use eyre::Context;
use oauth2::basic::BasicTokenResponse;
use std::ops::AsyncFnMut;

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod list;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod request;
pub mod resources;
pub mod transport;
pub mod types;

pub use auth::{AuthenticationRequest, DeviceCodeResponse};
pub use client::Client;
pub use config::{Credentials, Endpoints, scopes};
pub use error::{Error, NetworkErrorCode, Result};
pub use list::ListModel;
pub use request::{Event, Payload, Request, RequestState, Status};
pub use resources::{ListQuery, Resource, ResourceRequest};
pub use transport::{HttpRequest, ReqwestTransport, Transport, TransportError, TransportReply};

/// Runs the device flow to completion and installs the resulting token in `client`.
///
/// `on_code` is called once Google has issued a user code; it should tell the user where to
/// enter it. The returned token includes the refresh token, which callers may want to keep.
pub async fn device_login<T, S, F>(
    client: &Client<T>,
    scopes: &[S],
    mut on_code: F,
) -> eyre::Result<BasicTokenResponse>
where
    T: Transport,
    S: AsRef<str>,
    F: AsyncFnMut(&DeviceCodeResponse),
{
    let auth = client.authentication_request();
    let mut events = auth.subscribe();
    let mut flow = std::pin::pin!(auth.request_authorization_code(scopes));

    let result = loop {
        tokio::select! {
            result = &mut flow => break result,
            event = events.recv() => {
                if let Ok(Event::AuthorizationCodeReady(payload)) = event {
                    let code: DeviceCodeResponse =
                        serde_json::from_value(payload).context("parse device code response")?;
                    on_code(&code).await;
                }
            }
        }
    };

    let value = result.context("authorize device")?;
    let token: BasicTokenResponse =
        serde_json::from_value(value).context("parse token response")?;
    client.apply_token(&token);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use http::StatusCode;
    use oauth2::TokenResponse;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn device_login_installs_token() {
        let mock = MockTransport::new();
        mock.push_json(
            StatusCode::OK,
            json!({
                "device_code": "D",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://www.google.com/device",
                "expires_in": 1800,
                "interval": 5
            }),
        );
        mock.push_json(StatusCode::OK, json!({"error": "authorization_pending"}));
        mock.push_json(
            StatusCode::OK,
            json!({
                "access_token": "ya29.a",
                "refresh_token": "1//r",
                "token_type": "Bearer",
                "expires_in": 3599
            }),
        );
        let client = Client::with_endpoints(
            mock,
            Credentials::default().with_client("X", "S"),
            MockTransport::endpoints(),
        );

        let mut shown = Vec::new();
        let token = device_login(&client, &[scopes::YOUTUBE_READONLY], async |code| {
            shown.push((code.user_code.clone(), code.verification_url.clone()));
        })
        .await
        .unwrap();

        assert_eq!(
            shown,
            vec![(
                Some("ABCD-EFGH".to_owned()),
                Some("https://www.google.com/device".to_owned())
            )]
        );
        assert_eq!(token.access_token().secret(), "ya29.a");
        let credentials = client.credentials();
        assert_eq!(
            credentials.refresh_token.as_ref().map(|t| t.secret().as_str()),
            Some("1//r")
        );
    }

    #[tokio::test]
    async fn device_login_reports_failure() {
        let mock = MockTransport::new();
        mock.push_json(StatusCode::BAD_REQUEST, json!({"error": "invalid_client"}));
        let client = Client::with_endpoints(
            mock,
            Credentials::default().with_client("X", "S"),
            MockTransport::endpoints(),
        );
        let err = device_login(&client, &[scopes::YOUTUBE], async |_| {})
            .await
            .unwrap_err();
        assert_eq!(format!("{err}"), "authorize device");
        assert!(client.credentials().access_token.is_none());
    }
}

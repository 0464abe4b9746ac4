//! OAuth 2.0 against Google's token endpoints.
//!
//! [`AuthenticationRequest`] runs one of four operations per submission: exchanging an
//! authorization code, the device flow, refreshing an access token, or revoking a token.
//! Each counts as a single submission of the underlying [`Request`], even when it spans
//! several HTTP calls.

mod device;

pub use device::{DEFAULT_EXPIRY, DEFAULT_POLL_INTERVAL, DeviceCodeResponse};

use crate::client::Client;
use crate::config::{Credentials, OOB_REDIRECT_URI};
use crate::error::{Error, Result};
use crate::request::{Call, Event, Request, RequestState, Status, Ticket, parse_url};
use crate::transport::Transport;
use device::{DeviceFlow, Step};
use http::Method;
use oauth2::basic::BasicTokenResponse;
use serde_json::Value;
use std::borrow::Cow;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::instrument;

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const GRANT_DEVICE: &str = "http://oauth.net/grant_type/device/1.0";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Escapes only what would break the `key=value&...` structure.
///
/// Google accepts unescaped URLs and slashes in these values, and keeping them readable makes
/// the bodies match the documented examples byte for byte.
fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '=', '+', '%', '#', ' ']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("%26"),
            '=' => escaped.push_str("%3D"),
            '+' => escaped.push_str("%2B"),
            '%' => escaped.push_str("%25"),
            '#' => escaped.push_str("%23"),
            ' ' => escaped.push('+'),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", escape(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn client_id(credentials: &Credentials) -> Result<&str> {
    credentials
        .client_id
        .as_deref()
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidArgument("client id is not configured".into()))
}

fn client_secret(credentials: &Credentials) -> Result<&str> {
    credentials
        .client_secret
        .as_ref()
        .map(|s| s.secret().as_str())
        .ok_or_else(|| Error::InvalidArgument("client secret is not configured".into()))
}

/// The refresh call for `client`, if it has everything a refresh needs.
pub(crate) fn refresh_call<T>(client: &Client<T>) -> Option<Call> {
    let credentials = client.credentials();
    let refresh_token = credentials.refresh_token.as_ref()?;
    refresh_call_with(client, &credentials, refresh_token.secret()).ok()
}

fn refresh_call_with<T>(
    client: &Client<T>,
    credentials: &Credentials,
    refresh_token: &str,
) -> Result<Call> {
    let body = form_body(&[
        ("client_id", client_id(credentials)?),
        ("client_secret", client_secret(credentials)?),
        ("refresh_token", refresh_token),
        ("grant_type", GRANT_REFRESH_TOKEN),
    ]);
    Ok(Call::new(Method::POST, parse_url(&client.endpoints().token)?).form(body))
}

/// The authorization code in what the user pasted back from the consent page.
///
/// Accepts the bare code, or a redirect URL or query string carrying a `code` parameter.
pub fn authorization_code_from(input: &str) -> String {
    let input = input.trim();
    let query = input.split_once('?').map_or(input, |(_, query)| query);
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, code)| code.into_owned())
        .unwrap_or_else(|| input.to_owned())
}

/// Authorization and token management for one client.
///
/// Tokens obtained here are returned (and kept in [`state`](Self::state)) but not installed
/// in the client; call [`Client::apply_token`] to start using them.
#[derive(Debug)]
pub struct AuthenticationRequest<T> {
    request: Request<T>,
}

impl<T: Transport> AuthenticationRequest<T> {
    pub fn new(client: Client<T>) -> Self {
        Self {
            request: Request::new(client),
        }
    }

    pub fn client(&self) -> &Client<T> {
        self.request.client()
    }

    pub fn state(&self) -> RequestState {
        self.request.state()
    }

    pub fn status(&self) -> Status {
        self.request.status()
    }

    pub fn error(&self) -> Option<Error> {
        self.request.error()
    }

    pub fn error_string(&self) -> String {
        self.request.error_string()
    }

    pub fn result(&self) -> Option<Value> {
        self.request.result()
    }

    pub fn is_busy(&self) -> bool {
        self.request.is_busy()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.request.subscribe()
    }

    /// Aborts the running operation, including a pending device-flow poll.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// The last successful token response, decoded.
    pub fn token(&self) -> Option<BasicTokenResponse> {
        let state = self.request.state();
        if state.status != Status::Ready {
            return None;
        }
        serde_json::from_value(state.result?).ok()
    }

    /// Trades an authorization code from the installed-application flow for tokens.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn exchange_code_for_access_token(&self, code: &str) -> Result<Value> {
        let client = self.request.client();
        let credentials = client.credentials();
        let body = form_body(&[
            ("code", code),
            ("client_id", client_id(&credentials)?),
            ("client_secret", client_secret(&credentials)?),
            ("redirect_uri", OOB_REDIRECT_URI),
            ("grant_type", GRANT_AUTHORIZATION_CODE),
        ]);
        let call = Call::new(Method::POST, parse_url(&client.endpoints().token)?).form(body);

        let mut ticket = self.request.begin()?;
        let state = self.request.perform(&mut ticket, &call).await;
        self.request.finish(ticket, state)
    }

    /// Trades the client's refresh token for a new access token.
    ///
    /// On success the new access token is also installed in the client.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn refresh_access_token(&self) -> Result<Value> {
        let client = self.request.client();
        let credentials = client.credentials();
        let refresh_token = credentials
            .refresh_token
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("refresh token is not configured".into()))?;
        let call = refresh_call_with(client, &credentials, refresh_token.secret())?;

        let mut ticket = self.request.begin()?;
        let state = self.request.perform(&mut ticket, &call).await;
        let token = state
            .result
            .as_ref()
            .filter(|_| state.status == Status::Ready)
            .and_then(|v| serde_json::from_value::<BasicTokenResponse>(v.clone()).ok());
        if let Some(token) = &token {
            client.apply_token(token);
            self.request.notify(Event::AccessTokenChanged);
        }
        self.request.finish(ticket, state)
    }

    /// Revokes `token`, which may be an access or a refresh token.
    ///
    /// Google answers with an empty body, so a body that does not decode still counts as
    /// success here.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn revoke_access_token(&self, token: &str) -> Result<Value> {
        let mut url = parse_url(&self.request.client().endpoints().revoke)?;
        url.query_pairs_mut().append_pair("token", token);
        let call = Call::new(Method::GET, url).unauthorized();

        let mut ticket = self.request.begin()?;
        let mut state = self.request.perform(&mut ticket, &call).await;
        if state.error == Some(Error::Parse) {
            state = RequestState::ready(Value::Null);
        }
        self.request.finish(ticket, state)
    }

    /// Runs the device flow for `scopes` until the user authorizes, the code expires, or the
    /// operation is canceled.
    ///
    /// Once Google issues a user code, [`Event::AuthorizationCodeReady`] is broadcast with
    /// the full device-code response; show its `user_code` and `verification_url` to the
    /// user. Polling then continues in the background of this future.
    #[instrument(skip_all, fields(scopes = scopes.len()), err(level = "debug"))]
    pub async fn request_authorization_code<S: AsRef<str>>(&self, scopes: &[S]) -> Result<Value> {
        let client = self.request.client();
        let credentials = client.credentials();
        let id = client_id(&credentials)?;
        let scope = scopes
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        let code_call = Call::new(Method::POST, parse_url(&client.endpoints().device_code)?)
            .form(form_body(&[("scope", scope.as_str()), ("client_id", id)]));
        // the secret is only needed once polling starts, but fail before anything is sent
        let secret = client_secret(&credentials)?;
        let token_url = parse_url(&client.endpoints().token)?;

        let mut ticket = self.request.begin()?;
        let mut flow = DeviceFlow::new();

        let state = self.request.perform(&mut ticket, &code_call).await;
        let mut step = match state.status {
            Status::Ready => {
                let payload = state.result.unwrap_or(Value::Null);
                flow.on_code_response(payload, Instant::now())
            }
            _ => flow.on_failure(state),
        };

        loop {
            let delay = match step {
                Step::Finish(state) => return self.request.finish(ticket, state),
                Step::Ignore => return self.stay_pending(ticket).await,
                Step::CodeReady { payload, delay } => {
                    self.request.notify(Event::AuthorizationCodeReady(payload));
                    delay
                }
                Step::Schedule(delay) => delay,
            };

            tracing::trace!(delay_ms = delay.as_millis() as u64, "next poll scheduled");
            if !self.request.wait(&mut ticket, delay).await {
                return self.request.finish(ticket, RequestState::canceled());
            }
            let Some(device_code) = flow.start_poll() else {
                return self.stay_pending(ticket).await;
            };
            let poll = Call::new(Method::POST, token_url.clone()).form(form_body(&[
                ("client_id", id),
                ("client_secret", secret),
                ("code", device_code.secret().as_str()),
                ("grant_type", GRANT_DEVICE),
            ]));
            let state = self.request.perform(&mut ticket, &poll).await;
            step = match state.status {
                Status::Ready => {
                    flow.on_poll_response(state.result.unwrap_or(Value::Null), Instant::now())
                }
                _ => flow.on_failure(state),
            };
        }
    }

    /// The operation stays in flight, without transitions or notifications, until canceled.
    async fn stay_pending(&self, mut ticket: Ticket) -> Result<Value> {
        tracing::debug!("device flow is waiting for cancellation");
        ticket.canceled().await;
        self.request.finish(ticket, RequestState::canceled())
    }
}

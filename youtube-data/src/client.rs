//! Shared client handle: transport, endpoints and credentials.

use crate::auth::AuthenticationRequest;
use crate::config::{Credentials, Endpoints, OOB_REDIRECT_URI};
use crate::error::Result;
use crate::list::ListModel;
use crate::request::{Call, Payload, Request, parse_url};
use crate::resources::{Resource, ResourceRequest};
use crate::transport::{HttpRequest, ReqwestTransport, Transport};
use http::HeaderValue;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use oauth2::basic::BasicTokenResponse;
use oauth2::{AccessToken, TokenResponse};
use reqwest::Url;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Handle to the YouTube Data API.
///
/// Cloning is cheap; clones share the transport and the credentials, so an access token
/// refreshed through one request is used by every other request made from the same client.
pub struct Client<T = ReqwestTransport> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    transport: T,
    endpoints: Endpoints,
    credentials: RwLock<Credentials>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoints", &self.inner.endpoints)
            .field("credentials", &self.credentials())
            .finish()
    }
}

impl Client<ReqwestTransport> {
    /// A client using `reqwest` and credentials from the environment.
    ///
    /// See [`Credentials::from_env`].
    pub fn from_env() -> Self {
        Self::new(ReqwestTransport::default(), Credentials::from_env())
    }
}

impl<T> Client<T> {
    /// A snapshot of the current credentials.
    pub fn credentials(&self) -> Credentials {
        self.inner
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_credentials(&self, f: impl FnOnce(&mut Credentials)) {
        let mut credentials = self
            .inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut credentials);
    }

    pub fn set_access_token(&self, token: AccessToken) {
        self.update_credentials(|c| c.access_token = Some(token));
    }

    /// Stores the access token (and the refresh token, if one was issued) from a token response.
    pub fn apply_token(&self, token: &BasicTokenResponse) {
        self.update_credentials(|c| {
            c.access_token = Some(token.access_token().clone());
            if let Some(refresh) = token.refresh_token() {
                c.refresh_token = Some(refresh.clone());
            }
        });
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// The page the user visits to authorize this client in the installed-application flow.
    ///
    /// Google shows the authorization code on that page once the user consents; pass it to
    /// [`AuthenticationRequest::exchange_code_for_access_token`].
    pub fn authorization_url<S: AsRef<str>>(&self, scopes: &[S]) -> Result<Url> {
        let mut url = parse_url(&self.inner.endpoints.authorization)?;
        let credentials = self.credentials();
        let client_id = credentials.client_id.as_deref().map_or("", String::as_str);
        let scope = scopes
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", OOB_REDIRECT_URI)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope);
        Ok(url)
    }

    /// URL of the collection endpoint for `resource`.
    pub(crate) fn resource_url(&self, resource: Resource) -> Result<Url> {
        let base = self.inner.endpoints.api.trim_end_matches('/');
        parse_url(&format!("{base}/{}", resource.path()))
    }

    pub(crate) fn http_request(&self, call: &Call) -> HttpRequest {
        let mut url = call.url.clone();
        let mut headers = http::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if call.authorized {
            let credentials = self.credentials();
            if let Some(key) = &credentials.api_key {
                url.query_pairs_mut().append_pair("key", key);
            }
            if let Some(token) = &credentials.access_token {
                match HeaderValue::from_str(&format!("Bearer {}", token.secret())) {
                    Ok(mut value) => {
                        value.set_sensitive(true);
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(_) => tracing::warn!("access token is not a valid header value"),
                }
            }
        }

        let body = match &call.payload {
            Payload::Empty => None,
            Payload::Form(body) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
                Some(body.clone())
            }
            Payload::Json(body) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(body.to_string())
            }
        };

        HttpRequest {
            method: call.method.clone(),
            url,
            headers,
            body,
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, credentials: Credentials) -> Self {
        Self::with_endpoints(transport, credentials, Endpoints::default())
    }

    pub fn with_endpoints(transport: T, credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                endpoints,
                credentials: RwLock::new(credentials),
            }),
        }
    }

    /// A fresh, idle request bound to this client.
    pub fn request(&self) -> Request<T> {
        Request::new(self.clone())
    }

    pub fn authentication_request(&self) -> AuthenticationRequest<T> {
        AuthenticationRequest::new(self.clone())
    }

    pub fn list_model(&self, resource: Resource) -> ListModel<T> {
        ListModel::new(self.clone(), resource)
    }

    pub fn resource_request(&self, resource: Resource) -> ResourceRequest<T> {
        ResourceRequest::new(self.clone(), resource)
    }
}

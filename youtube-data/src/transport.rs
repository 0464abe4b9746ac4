//! The HTTP transport seam.
//!
//! Everything above this module talks to the network through [`Transport`], which performs
//! exactly one HTTP exchange per call. Aborting a call is done by dropping its future; the
//! [`Request`](crate::request::Request) engine turns that into a
//! [`NetworkErrorCode::OperationCanceled`] reply.

use crate::error::NetworkErrorCode;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use reqwest::Url;
use std::future::Future;

/// A single outbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

/// A transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: NetworkErrorCode,
    pub message: String,
}

/// What the transport hands back once a call completes.
///
/// The body is delivered even when `error` is set, since error statuses usually come with a
/// JSON payload describing the problem.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// `None` if no response was received at all.
    pub status: Option<StatusCode>,
    pub body: Bytes,
    pub error: Option<TransportError>,
}

impl TransportReply {
    /// A completed exchange with the given status and body.
    ///
    /// Non-success statuses are turned into a [`TransportError`].
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let error = (!status.is_success()).then(|| TransportError {
            code: NetworkErrorCode::from_status(status),
            message: format!("server replied with status {status}"),
        });
        Self {
            status: Some(status),
            body: body.into(),
            error,
        }
    }

    /// A call that never produced a response.
    pub fn failed(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: None,
            body: Bytes::new(),
            error: Some(TransportError {
                code,
                message: message.into(),
            }),
        }
    }

    /// A call that was aborted on request.
    pub fn canceled() -> Self {
        Self::failed(NetworkErrorCode::OperationCanceled, "operation canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.code == NetworkErrorCode::OperationCanceled)
    }
}

/// Performs HTTP exchanges on behalf of the request engine.
pub trait Transport: Send + Sync {
    /// Sends `request` and resolves once the full response body has been read.
    ///
    /// Dropping the returned future aborts the exchange.
    fn execute(&self, request: HttpRequest) -> impl Future<Output = TransportReply> + Send;
}

/// [`Transport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        let client = reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("building reqwest client should not fail");
        Self::new(client)
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> NetworkErrorCode {
    if error.is_timeout() {
        NetworkErrorCode::Timeout
    } else if error.is_connect() {
        NetworkErrorCode::ConnectionRefused
    } else {
        NetworkErrorCode::Unknown
    }
}

impl Transport for ReqwestTransport {
    #[tracing::instrument(skip_all, fields(method = %request.method, url = %request.url.path()))]
    async fn execute(&self, request: HttpRequest) -> TransportReply {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "transport failure");
                return TransportReply::failed(classify_reqwest_error(&e), e.to_string());
            }
        };

        let status = response.status();
        match response.bytes().await {
            Ok(body) => {
                tracing::trace!(%status, len = body.len(), "received response");
                let mut reply = TransportReply::new(status, body);
                if let Some(error) = reply.error.as_mut() {
                    error.message = format!("{method} request failed with status {status}");
                }
                reply
            }
            Err(e) => TransportReply {
                status: Some(status),
                body: Bytes::new(),
                error: Some(TransportError {
                    code: classify_reqwest_error(&e),
                    message: format!("read response body: {e}"),
                }),
            },
        }
    }
}

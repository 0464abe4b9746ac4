//! The request engine: one transport call wrapped in lifecycle state.
//!
//! A [`Request`] moves `Idle → Loading → Ready | Failed | Canceled` once per submission.
//! Only one submission may be in flight at a time; overlapping submissions fail fast with
//! [`Error::Busy`] without touching the transport. Once a submission reaches its terminal
//! state, exactly one [`Event::Finished`] is broadcast to subscribers.
//!
//! The controllers in [`auth`](crate::auth) and [`list`](crate::list) drive the engine through
//! its crate-private `begin` / `perform` / `finish` steps so that an operation can span several
//! transport calls (and timers) while still counting as one submission.

use crate::client::Client;
use crate::error::{Error, NetworkErrorCode, Result};
use crate::transport::{Transport, TransportReply};
use http::{Method, StatusCode};
use oauth2::AccessToken;
use reqwest::Url;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::instrument;

const EVENT_CAPACITY: usize = 64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
    Canceled,
}

/// Status, error and decoded result of the most recent submission.
///
/// The engine replaces this value wholesale on every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestState {
    pub status: Status,
    /// `None` unless `status` is [`Status::Failed`].
    pub error: Option<Error>,
    /// The decoded response body, if there was one.
    ///
    /// Failed requests keep whatever JSON the server sent alongside the failure.
    pub result: Option<Value>,
}

impl RequestState {
    pub(crate) fn loading() -> Self {
        Self {
            status: Status::Loading,
            ..Self::default()
        }
    }

    pub(crate) fn ready(result: Value) -> Self {
        Self {
            status: Status::Ready,
            error: None,
            result: Some(result),
        }
    }

    pub(crate) fn failed(error: Error, result: Option<Value>) -> Self {
        Self {
            status: Status::Failed,
            error: Some(error),
            result,
        }
    }

    pub(crate) fn canceled() -> Self {
        Self {
            status: Status::Canceled,
            ..Self::default()
        }
    }

    /// Human-readable description of the error, empty if there is none.
    pub fn error_string(&self) -> String {
        self.error.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    /// Converts a terminal state into the value handed back to the caller.
    pub(crate) fn into_result(self) -> Result<Value> {
        match self.status {
            Status::Ready => Ok(self.result.unwrap_or(Value::Null)),
            Status::Canceled => Err(Error::Canceled),
            _ => Err(self
                .error
                .unwrap_or_else(|| Error::UnknownContent("request did not complete".into()))),
        }
    }
}

/// Notifications broadcast by requests and the controllers built on them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StatusChanged(Status),
    /// The submission is over; carries its final state.
    Finished(RequestState),
    /// The device flow obtained a user code; carries the full device-code response.
    AuthorizationCodeReady(Value),
    /// The client's access token was replaced after a refresh.
    AccessTokenChanged,
    /// `count` items were appended starting at `start`.
    ItemsInserted { start: usize, count: usize },
    /// The item at this index was replaced.
    ItemChanged(usize),
    /// All accumulated items were discarded.
    ItemsCleared,
}

/// Request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded`, already encoded.
    Form(String),
    Json(Value),
}

/// A fully described API call, ready to hand to the transport.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) payload: Payload,
    /// Whether the client's API key and bearer token are attached.
    pub(crate) authorized: bool,
}

impl Call {
    pub(crate) fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            payload: Payload::Empty,
            authorized: true,
        }
    }

    pub(crate) fn form(mut self, body: String) -> Self {
        self.payload = Payload::Form(body);
        self.authorized = false;
        self
    }

    pub(crate) fn json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub(crate) fn unauthorized(mut self) -> Self {
        self.authorized = false;
        self
    }
}

pub(crate) fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::InvalidArgument(format!("malformed url {url:?}: {e}")))
}

/// Proof that the holder owns the current submission.
///
/// Dropping a ticket that still owns the submission (for example because the future driving
/// it was dropped by a timeout) ends it as [`Status::Canceled`] and emits [`Event::Finished`].
#[derive(Debug)]
pub(crate) struct Ticket {
    generation: u64,
    cancel: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl Ticket {
    /// Resolves once the submission has been canceled.
    pub(crate) async fn canceled(&mut self) {
        let closed = self.cancel.wait_for(|&canceled| canceled).await.is_err();
        if closed {
            // the guard outlives every ticket it hands out, so this only happens after release
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.shared.flight.release(self.generation) {
            tracing::debug!("submission abandoned before finishing");
            self.shared.conclude(RequestState::canceled());
        }
    }
}

#[derive(Debug, Default)]
struct FlightState {
    generation: u64,
    active: Option<watch::Sender<bool>>,
}

/// Explicit single-flight guard: at most one submission is active at a time.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    state: Mutex<FlightState>,
}

impl SingleFlight {
    fn begin(&self) -> Result<(u64, watch::Receiver<bool>)> {
        let mut state = lock(&self.state);
        if state.active.is_some() {
            return Err(Error::Busy);
        }
        state.generation += 1;
        let (tx, rx) = watch::channel(false);
        state.active = Some(tx);
        Ok((state.generation, rx))
    }

    /// Requests cancellation of the active submission. Returns false if there is none.
    pub(crate) fn cancel(&self) -> bool {
        let state = lock(&self.state);
        match &state.active {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    /// True if `generation` still owns the active, uncanceled submission.
    fn is_live(&self, generation: u64) -> bool {
        let state = lock(&self.state);
        state.generation == generation && state.active.as_ref().is_some_and(|tx| !*tx.borrow())
    }

    /// Ends the submission `generation`. Returns false if it was already ended or superseded.
    fn release(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation == generation && state.active.is_some() {
            state.active = None;
            true
        } else {
            false
        }
    }
}

/// What a request shares with the tickets it hands out.
#[derive(Debug)]
struct Shared {
    state: Mutex<RequestState>,
    flight: SingleFlight,
    events: broadcast::Sender<Event>,
}

impl Shared {
    fn notify(&self, event: Event) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, next: RequestState) {
        let status = next.status;
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        if previous.status != status {
            self.notify(Event::StatusChanged(status));
        }
    }

    /// Records a terminal state. The caller must have released the flight.
    fn conclude(&self, state: RequestState) {
        tracing::debug!(status = ?state.status, error = %state.error_string(), "request finished");
        self.transition(state.clone());
        self.notify(Event::Finished(state));
    }
}

/// One logical API call with observable lifecycle state.
#[derive(Debug)]
pub struct Request<T> {
    client: Client<T>,
    shared: Arc<Shared>,
}

impl<T: Transport> Request<T> {
    pub fn new(client: Client<T>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            shared: Arc::new(Shared {
                state: Mutex::new(RequestState::default()),
                flight: SingleFlight::default(),
                events,
            }),
        }
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> RequestState {
        lock(&self.shared.state).clone()
    }

    pub fn status(&self) -> Status {
        lock(&self.shared.state).status
    }

    pub fn error(&self) -> Option<Error> {
        lock(&self.shared.state).error.clone()
    }

    pub fn error_string(&self) -> String {
        lock(&self.shared.state).error_string()
    }

    pub fn result(&self) -> Option<Value> {
        lock(&self.shared.state).result.clone()
    }

    /// True while a submission is in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.flight.is_active()
    }

    /// Subscribes to this request's notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Aborts the in-flight submission, if any.
    ///
    /// The submission then finishes as [`Status::Canceled`]. Does nothing when idle.
    pub fn cancel(&self) {
        if self.shared.flight.cancel() {
            tracing::debug!("cancel requested");
        }
    }

    /// Submits a single call and waits for it to finish.
    ///
    /// Requests to the API carry the client's API key and access token. Returns the decoded
    /// body on [`Status::Ready`], and the recorded error otherwise.
    #[instrument(skip(self, payload), err(level = "debug"))]
    pub async fn submit(&self, method: Method, url: &str, payload: Payload) -> Result<Value> {
        let mut call = Call::new(method, parse_url(url)?);
        call.payload = payload;
        let mut ticket = self.begin()?;
        let state = self.perform(&mut ticket, &call).await;
        self.finish(ticket, state)
    }

    pub(crate) fn begin(&self) -> Result<Ticket> {
        let (generation, cancel) = self.shared.flight.begin()?;
        self.shared.transition(RequestState::loading());
        Ok(Ticket {
            generation,
            cancel,
            shared: Arc::clone(&self.shared),
        })
    }

    pub(crate) fn notify(&self, event: Event) {
        self.shared.notify(event);
    }

    /// Records the terminal state of the submission owned by `ticket` and notifies.
    pub(crate) fn finish(&self, ticket: Ticket, state: RequestState) -> Result<Value> {
        if !self.shared.flight.release(ticket.generation) {
            tracing::debug!("dropping result of superseded submission");
            return Err(Error::Canceled);
        }
        self.shared.conclude(state.clone());
        state.into_result()
    }

    /// Sleeps for `delay` unless the submission is canceled first.
    ///
    /// Returns true only if the timer fired and `ticket` still owns a live submission.
    pub(crate) async fn wait(&self, ticket: &mut Ticket, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = ticket.canceled() => false,
            _ = tokio::time::sleep(delay) => self.shared.flight.is_live(ticket.generation),
        }
    }

    /// Performs `call` and classifies the reply, without recording it.
    ///
    /// If an API call is rejected with 401 and a refresh token is configured, the access token
    /// is refreshed once and the call is retried.
    pub(crate) async fn perform(&self, ticket: &mut Ticket, call: &Call) -> RequestState {
        let reply = self.execute(ticket, call).await;
        let rejected = reply
            .error
            .as_ref()
            .is_some_and(|e| e.code == NetworkErrorCode::AuthenticationRequired);
        if call.authorized && rejected {
            if let Some(refresh) = crate::auth::refresh_call(&self.client) {
                tracing::debug!("access token rejected, attempting refresh");
                match self.refresh(ticket, &refresh).await {
                    Refreshed::Yes => return classify(self.execute(ticket, call).await),
                    Refreshed::Canceled => return RequestState::canceled(),
                    Refreshed::No => {}
                }
            }
        }
        classify(reply)
    }

    async fn execute(&self, ticket: &mut Ticket, call: &Call) -> TransportReply {
        let request = self.client.http_request(call);
        tracing::trace!(method = %call.method, url = %call.url.path(), "sending request");
        tokio::select! {
            biased;
            _ = ticket.canceled() => TransportReply::canceled(),
            reply = self.client.transport().execute(request) => reply,
        }
    }

    async fn refresh(&self, ticket: &mut Ticket, call: &Call) -> Refreshed {
        let reply = self.execute(ticket, call).await;
        if reply.is_canceled() {
            return Refreshed::Canceled;
        }
        let state = classify(reply);
        let token = state
            .result
            .as_ref()
            .filter(|_| state.status == Status::Ready)
            .and_then(|v| v.get("access_token"))
            .and_then(Value::as_str);
        match token {
            Some(token) => {
                self.client.set_access_token(AccessToken::new(token.to_string()));
                self.notify(Event::AccessTokenChanged);
                tracing::debug!("access token refreshed");
                Refreshed::Yes
            }
            None => {
                tracing::warn!(error = %state.error_string(), "access token refresh failed");
                Refreshed::No
            }
        }
    }
}

enum Refreshed {
    Yes,
    No,
    Canceled,
}

/// Turns a transport reply into a terminal request state.
///
/// The body is decoded whatever the outcome, so that diagnostic payloads sent alongside
/// error statuses stay available to the caller.
pub(crate) fn classify(reply: TransportReply) -> RequestState {
    let decoded = serde_json::from_slice::<Value>(&reply.body).ok();
    match reply.error {
        Some(error) if error.code == NetworkErrorCode::OperationCanceled => {
            RequestState::canceled()
        }
        Some(error) if error.code == NetworkErrorCode::AuthenticationRequired => {
            RequestState::failed(Error::Authentication(error.message), decoded)
        }
        Some(error) => RequestState::failed(
            Error::Network {
                code: error.code,
                message: error.message,
            },
            decoded,
        ),
        // deletions answer with no body at all
        None if reply.status == Some(StatusCode::NO_CONTENT) => RequestState::ready(Value::Null),
        None => match decoded {
            Some(value) => RequestState::ready(value),
            None => RequestState::failed(Error::Parse, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::mock::MockTransport;
    use http::header::AUTHORIZATION;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(mock: MockTransport, credentials: Credentials) -> Request<MockTransport> {
        Request::new(Client::with_endpoints(mock, credentials, MockTransport::endpoints()))
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn ready_on_json() {
        let mock = MockTransport::new();
        mock.push_json(StatusCode::OK, json!({"kind": "youtube#channelListResponse"}));
        let request = request(mock, Credentials::default());
        let mut events = request.subscribe();

        let value = request
            .submit(Method::GET, "https://example.test/channels", Payload::Empty)
            .await
            .unwrap();
        assert_eq!(value, json!({"kind": "youtube#channelListResponse"}));
        assert_eq!(request.status(), Status::Ready);
        assert_eq!(request.error(), None);
        assert_eq!(request.error_string(), "");

        assert_eq!(
            drain(&mut events),
            vec![
                Event::StatusChanged(Status::Loading),
                Event::StatusChanged(Status::Ready),
                Event::Finished(request.state()),
            ]
        );
    }

    #[tokio::test]
    async fn parse_error_on_garbage() {
        let mock = MockTransport::new();
        mock.push_body(StatusCode::OK, "<html>oops</html>");
        let request = request(mock, Credentials::default());

        let err = request
            .submit(Method::GET, "https://example.test/x", Payload::Empty)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Parse);
        assert_eq!(request.status(), Status::Failed);
        assert_eq!(request.error_string(), "Unable to parse response");
        assert_eq!(request.result(), None);
    }

    #[tokio::test]
    async fn network_error_keeps_diagnostic_body() {
        let mock = MockTransport::new();
        mock.push_json(
            StatusCode::FORBIDDEN,
            json!({"error": {"code": 403, "message": "quotaExceeded"}}),
        );
        let request = request(mock, Credentials::default());

        let err = request
            .submit(Method::GET, "https://example.test/x", Payload::Empty)
            .await
            .unwrap_err();
        assert_eq!(err.network_code(), Some(NetworkErrorCode::ContentAccessDenied));
        let state = request.state();
        assert_eq!(state.status, Status::Failed);
        assert_eq!(
            state.result,
            Some(json!({"error": {"code": 403, "message": "quotaExceeded"}}))
        );
    }

    #[tokio::test]
    async fn no_content_is_ready() {
        let mock = MockTransport::new();
        mock.push_body(StatusCode::NO_CONTENT, "");
        let request = request(mock, Credentials::default());
        let value = request
            .submit(Method::DELETE, "https://example.test/x?id=1", Payload::Empty)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_without_transport() {
        let mock = MockTransport::new();
        let request = request(mock, Credentials::default());
        let err = request
            .submit(Method::GET, "not a url", Payload::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
        assert_eq!(request.status(), Status::Idle);
        assert!(request.client().transport().requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_submit_is_busy_and_cancel_finishes_once() {
        let mock = MockTransport::new();
        mock.push_pending();
        let request = Arc::new(request(mock, Credentials::default()));
        let mut events = request.subscribe();

        let first = tokio::spawn({
            let request = Arc::clone(&request);
            async move {
                request
                    .submit(Method::GET, "https://example.test/slow", Payload::Empty)
                    .await
            }
        });
        assert_eq!(
            events.recv().await.unwrap(),
            Event::StatusChanged(Status::Loading)
        );

        let err = request
            .submit(Method::GET, "https://example.test/other", Payload::Empty)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Busy);
        assert_eq!(request.client().transport().requests().len(), 1);

        request.cancel();
        assert_eq!(first.await.unwrap().unwrap_err(), Error::Canceled);
        // idempotent once idle
        request.cancel();

        let state = request.state();
        assert_eq!(state.status, Status::Canceled);
        assert_eq!(state.error, None);
        assert_eq!(state.error_string(), "");
        assert_eq!(
            drain(&mut events),
            vec![
                Event::StatusChanged(Status::Canceled),
                Event::Finished(state),
            ]
        );

        // resubmission after a terminal state is allowed
        request
            .client()
            .transport()
            .push_json(StatusCode::OK, json!({}));
        request
            .submit(Method::GET, "https://example.test/again", Payload::Empty)
            .await
            .unwrap();
        assert_eq!(request.status(), Status::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_submission_is_canceled() {
        let mock = MockTransport::new();
        mock.push_pending();
        mock.push_json(StatusCode::OK, json!({"ok": true}));
        let request = request(mock, Credentials::default());
        let mut events = request.subscribe();

        let submit = request.submit(Method::GET, "https://example.test/slow", Payload::Empty);
        assert!(
            tokio::time::timeout(Duration::from_secs(30), submit)
                .await
                .is_err()
        );
        assert!(!request.is_busy());
        assert_eq!(request.state(), RequestState::canceled());
        assert_eq!(
            drain(&mut events),
            vec![
                Event::StatusChanged(Status::Loading),
                Event::StatusChanged(Status::Canceled),
                Event::Finished(RequestState::canceled()),
            ]
        );

        let value = request
            .submit(Method::GET, "https://example.test/again", Payload::Empty)
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        // the abandoned submission has nothing left to report
        assert_eq!(finished_count(&drain(&mut events)), 1);
    }

    fn finished_count(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Finished(_)))
            .count()
    }

    #[tokio::test]
    async fn api_key_and_bearer_are_attached() {
        let mock = MockTransport::new();
        mock.push_json(StatusCode::OK, json!({}));
        let request = request(
            mock,
            Credentials::default()
                .with_api_key("AIza")
                .with_access_token("ya29.a"),
        );
        request
            .submit(Method::GET, "https://example.test/channels?part=id", Payload::Empty)
            .await
            .unwrap();

        let sent = request.client().transport().requests();
        assert_eq!(
            sent[0].url.as_str(),
            "https://example.test/channels?part=id&key=AIza"
        );
        assert_eq!(sent[0].headers[AUTHORIZATION], "Bearer ya29.a");
    }

    #[tokio::test]
    async fn refreshes_once_on_401() {
        let mock = MockTransport::new();
        mock.push_json(
            StatusCode::UNAUTHORIZED,
            json!({"error": {"code": 401, "message": "Invalid Credentials"}}),
        );
        mock.push_json(
            StatusCode::OK,
            json!({"access_token": "ya29.fresh", "token_type": "Bearer", "expires_in": 3599}),
        );
        mock.push_json(StatusCode::OK, json!({"items": []}));
        let request = request(
            mock,
            Credentials::default()
                .with_client("id", "secret")
                .with_access_token("ya29.stale")
                .with_refresh_token("1//r"),
        );
        let mut events = request.subscribe();

        let value = request
            .submit(Method::GET, "https://example.test/channels", Payload::Empty)
            .await
            .unwrap();
        assert_eq!(value, json!({"items": []}));

        let sent = request.client().transport().requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].headers[AUTHORIZATION], "Bearer ya29.stale");
        assert_eq!(
            sent[1].body.as_deref(),
            Some("client_id=id&client_secret=secret&refresh_token=1//r&grant_type=refresh_token")
        );
        assert!(sent[1].headers.get(AUTHORIZATION).is_none());
        assert_eq!(sent[2].headers[AUTHORIZATION], "Bearer ya29.fresh");
        assert!(drain(&mut events).contains(&Event::AccessTokenChanged));
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_token_fails() {
        let mock = MockTransport::new();
        mock.push_json(StatusCode::UNAUTHORIZED, json!({"error": "invalid"}));
        let request = request(mock, Credentials::default().with_access_token("ya29.stale"));
        let err = request
            .submit(Method::GET, "https://example.test/channels", Payload::Empty)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)), "{err:?}");
        assert_eq!(request.client().transport().requests().len(), 1);
    }
}

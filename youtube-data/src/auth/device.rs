//! The OAuth 2.0 device flow as an explicit state machine.
//!
//! [`DeviceFlow`] does no I/O. It is fed decoded responses and answers with a [`Step`] telling
//! the driver in [`AuthenticationRequest`](super::AuthenticationRequest) what to do next:
//! announce the user code, wait and poll again, stay pending, or finish.
//!
//! ```text
//! RequestingCode ──code──▶ AwaitingAuthorization ◀──pending/slow_down── Polling
//!                                   └───────────────timer──────────────────▶┘
//! Polling ──token──▶ Complete
//! Polling ──other error or expired──▶ Failed
//! ```

use crate::error::Error;
use crate::request::RequestState;
use oauth2::DeviceCode;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// How long a device code stays valid if the server does not say.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);
/// Poll interval if the server does not suggest one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);
/// Server-suggested intervals are stretched by 10% to stay clear of `slow_down`.
const INTERVAL_MILLIS_PER_SECOND: u64 = 1100;

const AUTHORIZATION_PENDING: &str = "authorization_pending";
const SLOW_DOWN: &str = "slow_down";

/// Integers may arrive as numbers or numeric strings; anything else counts as absent.
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Any non-null value is kept; non-strings are kept as their JSON text.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Response of the device-code endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceCodeResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    pub device_code: Option<String>,
    /// The code the user enters at [`Self::verification_url`].
    #[serde(default)]
    pub user_code: Option<String>,
    #[serde(default, alias = "verification_uri")]
    pub verification_url: Option<String>,
    /// Seconds until `device_code` expires.
    #[serde(default, deserialize_with = "lenient_int")]
    pub expires_in: Option<i64>,
    /// Minimum seconds between polls.
    #[serde(default, deserialize_with = "lenient_int")]
    pub interval: Option<i64>,
}

/// The part of a token-endpoint response that drives polling.
#[derive(Debug, Clone, Default, Deserialize)]
struct PollResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    error: Option<String>,
}

/// State kept between polls.
#[derive(Debug, Clone)]
pub(crate) struct DeviceSession {
    pub(crate) device_code: DeviceCode,
    pub(crate) started_at: Instant,
    /// How long after `started_at` polling may continue.
    pub(crate) expires_in: Duration,
    /// Delay before the next poll. Never decreases within a session.
    pub(crate) poll_interval: Duration,
}

impl DeviceSession {
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= self.expires_in
    }
}

#[derive(Debug, Clone)]
pub(crate) enum DeviceFlowState {
    RequestingCode,
    /// Waiting for the poll timer.
    AwaitingAuthorization(DeviceSession),
    /// A poll is in flight.
    Polling(DeviceSession),
    Complete,
    Failed,
}

/// What the driver should do after feeding the machine.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    /// A user code was issued: announce `payload`, then poll after `delay`.
    CodeReady { payload: Value, delay: Duration },
    /// Poll again after this delay.
    Schedule(Duration),
    /// Nothing to do; the operation stays pending.
    Ignore,
    /// The operation is over.
    Finish(RequestState),
}

#[derive(Debug)]
pub(crate) struct DeviceFlow {
    state: DeviceFlowState,
}

impl Default for DeviceFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFlow {
    pub(crate) fn new() -> Self {
        Self {
            state: DeviceFlowState::RequestingCode,
        }
    }

    #[cfg(test)]
    fn state(&self) -> &DeviceFlowState {
        &self.state
    }

    #[cfg(test)]
    fn session(&self) -> Option<&DeviceSession> {
        match &self.state {
            DeviceFlowState::AwaitingAuthorization(s) | DeviceFlowState::Polling(s) => Some(s),
            _ => None,
        }
    }

    /// Handles a successfully decoded device-code response.
    pub(crate) fn on_code_response(&mut self, payload: Value, now: Instant) -> Step {
        if !matches!(self.state, DeviceFlowState::RequestingCode) {
            return Step::Ignore;
        }
        if !payload.is_object() {
            tracing::warn!("ignoring device code response that is not an object");
            return Step::Ignore;
        }
        let response = match DeviceCodeResponse::deserialize(&payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed device code response");
                return Step::Ignore;
            }
        };
        let Some(device_code) = response.device_code.filter(|c| !c.is_empty()) else {
            tracing::warn!("device code response carries no device_code, ignoring it");
            return Step::Ignore;
        };

        let expires_in = match response.expires_in {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_EXPIRY,
        };
        let poll_interval = match response.interval {
            Some(secs) if secs > 0 => {
                Duration::from_millis((secs as u64).saturating_mul(INTERVAL_MILLIS_PER_SECOND))
            }
            _ => DEFAULT_POLL_INTERVAL,
        };
        tracing::debug!(
            expires_in_ms = expires_in.as_millis() as u64,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "device code issued"
        );

        self.state = DeviceFlowState::AwaitingAuthorization(DeviceSession {
            device_code: DeviceCode::new(device_code),
            started_at: now,
            expires_in,
            poll_interval,
        });
        Step::CodeReady {
            payload,
            delay: poll_interval,
        }
    }

    /// The poll timer fired. Returns the code to poll with, if a poll is due.
    pub(crate) fn start_poll(&mut self) -> Option<DeviceCode> {
        match std::mem::replace(&mut self.state, DeviceFlowState::Failed) {
            DeviceFlowState::AwaitingAuthorization(session) => {
                let code = session.device_code.clone();
                self.state = DeviceFlowState::Polling(session);
                Some(code)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Handles a successfully decoded token-endpoint response.
    pub(crate) fn on_poll_response(&mut self, payload: Value, now: Instant) -> Step {
        let mut session = match std::mem::replace(&mut self.state, DeviceFlowState::Failed) {
            DeviceFlowState::Polling(session) => session,
            other => {
                self.state = other;
                return Step::Ignore;
            }
        };
        let decoded = payload
            .is_object()
            .then(|| PollResponse::deserialize(&payload).ok())
            .flatten();
        let response = match decoded {
            Some(response) => response,
            None => {
                return Step::Finish(RequestState::failed(
                    Error::UnknownContent("unexpected token response".into()),
                    Some(payload),
                ));
            }
        };
        let Some(error) = response.error else {
            self.state = DeviceFlowState::Complete;
            return Step::Finish(RequestState::ready(payload));
        };

        if !session.is_expired(now) {
            match error.as_str() {
                AUTHORIZATION_PENDING => {
                    let delay = session.poll_interval;
                    self.state = DeviceFlowState::AwaitingAuthorization(session);
                    return Step::Schedule(delay);
                }
                SLOW_DOWN => {
                    session.poll_interval = session.poll_interval.saturating_mul(2);
                    tracing::debug!(
                        poll_interval_ms = session.poll_interval.as_millis() as u64,
                        "server asked to slow down"
                    );
                    let delay = session.poll_interval;
                    self.state = DeviceFlowState::AwaitingAuthorization(session);
                    return Step::Schedule(delay);
                }
                _ => {}
            }
        }

        tracing::debug!(%error, expired = session.is_expired(now), "device flow failed");
        Step::Finish(RequestState::failed(Error::UnknownContent(error), Some(payload)))
    }

    /// A transport or parse failure ended the flow.
    pub(crate) fn on_failure(&mut self, state: RequestState) -> Step {
        self.state = DeviceFlowState::Failed;
        Step::Finish(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Status;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn started(payload: Value) -> (DeviceFlow, Instant) {
        let mut flow = DeviceFlow::new();
        let t0 = Instant::now();
        let step = flow.on_code_response(payload, t0);
        assert!(matches!(step, Step::CodeReady { .. }), "{step:?}");
        (flow, t0)
    }

    fn poll(flow: &mut DeviceFlow, payload: Value, now: Instant) -> Step {
        assert!(flow.start_poll().is_some());
        flow.on_poll_response(payload, now)
    }

    #[test]
    fn interval_gets_safety_margin() {
        let payload = json!({"device_code": "D", "expires_in": 60, "interval": 5});
        let mut flow = DeviceFlow::new();
        let t0 = Instant::now();
        assert_eq!(
            flow.on_code_response(payload.clone(), t0),
            Step::CodeReady {
                payload,
                delay: Duration::from_millis(5500)
            }
        );
        let session = flow.session().unwrap();
        assert_eq!(session.device_code.secret(), "D");
        assert_eq!(session.expires_in, Duration::from_secs(60));
        assert_eq!(session.started_at, t0);
    }

    #[test]
    fn huge_expiry_does_not_overflow() {
        let (mut flow, t0) = started(json!({
            "device_code": "D",
            "expires_in": i64::MAX,
            "interval": i64::MAX
        }));
        assert_eq!(flow.start_poll().map(|c| c.secret().clone()), Some("D".to_owned()));
        let later = t0 + Duration::from_secs(86_400);
        assert!(matches!(
            flow.on_poll_response(json!({"error": "authorization_pending"}), later),
            Step::Schedule(_)
        ));
    }

    #[test]
    fn defaults_when_server_is_vague() {
        let (flow, _) = started(json!({"device_code": "D", "expires_in": 0, "interval": -3}));
        let session = flow.session().unwrap();
        assert_eq!(session.expires_in, DEFAULT_EXPIRY);
        assert_eq!(session.poll_interval, DEFAULT_POLL_INTERVAL);

        let (flow, _) = started(json!({"device_code": "D", "expires_in": "1800", "interval": "5"}));
        let session = flow.session().unwrap();
        assert_eq!(session.expires_in, Duration::from_secs(1800));
        assert_eq!(session.poll_interval, Duration::from_millis(5500));
    }

    #[test]
    fn missing_device_code_is_ignored() {
        let mut flow = DeviceFlow::new();
        let now = Instant::now();
        assert_eq!(
            flow.on_code_response(json!({"user_code": "ABCD-EFGH"}), now),
            Step::Ignore
        );
        assert_eq!(flow.on_code_response(json!(["D"]), now), Step::Ignore);
        assert!(matches!(flow.state(), DeviceFlowState::RequestingCode));
    }

    #[test]
    fn pending_keeps_interval_and_slow_down_doubles_it() {
        let (mut flow, t0) = started(json!({"device_code": "D", "expires_in": 60, "interval": 5}));

        let step = poll(
            &mut flow,
            json!({"error": "authorization_pending"}),
            t0 + Duration::from_millis(5500),
        );
        assert_eq!(step, Step::Schedule(Duration::from_millis(5500)));

        let step = poll(
            &mut flow,
            json!({"error": "slow_down"}),
            t0 + Duration::from_millis(11000),
        );
        assert_eq!(step, Step::Schedule(Duration::from_millis(11000)));
        assert_eq!(
            flow.session().unwrap().poll_interval,
            Duration::from_millis(11000)
        );

        // still doubled for later pending answers
        let step = poll(
            &mut flow,
            json!({"error": "authorization_pending"}),
            t0 + Duration::from_millis(22000),
        );
        assert_eq!(step, Step::Schedule(Duration::from_millis(11000)));
    }

    #[test]
    fn expiry_stops_polling() {
        let (mut flow, t0) = started(json!({"device_code": "D", "expires_in": 60, "interval": 5}));
        let payload = json!({"error": "authorization_pending"});
        let Step::Finish(state) = poll(&mut flow, payload.clone(), t0 + Duration::from_secs(60))
        else {
            panic!("expired session must not reschedule");
        };
        assert_eq!(state.status, Status::Failed);
        assert_eq!(
            state.error,
            Some(Error::UnknownContent("authorization_pending".into()))
        );
        assert_eq!(state.result, Some(payload));
        assert!(matches!(flow.state(), DeviceFlowState::Failed));
        // nothing left to poll
        assert!(flow.start_poll().is_none());
    }

    #[test]
    fn other_errors_fail_immediately() {
        let (mut flow, t0) = started(json!({"device_code": "D"}));
        let Step::Finish(state) = poll(
            &mut flow,
            json!({"error": "access_denied"}),
            t0 + Duration::from_secs(5),
        ) else {
            panic!("access_denied is terminal");
        };
        assert_eq!(state.error_string(), "access_denied");
    }

    #[test]
    fn non_object_poll_response_fails() {
        let (mut flow, t0) = started(json!({"device_code": "D"}));
        let Step::Finish(state) = poll(&mut flow, json!([]), t0) else {
            panic!("arrays are not token responses");
        };
        assert!(matches!(state.error, Some(Error::UnknownContent(_))));
        assert_eq!(state.result, Some(json!([])));
    }

    #[test]
    fn token_completes() {
        let (mut flow, t0) = started(json!({"device_code": "D"}));
        let token = json!({"access_token": "ya29", "token_type": "Bearer", "error": null});
        assert_eq!(
            poll(&mut flow, token.clone(), t0 + Duration::from_secs(5)),
            Step::Finish(RequestState::ready(token))
        );
        assert!(matches!(flow.state(), DeviceFlowState::Complete));
    }

    #[test]
    fn poll_responses_outside_polling_are_ignored() {
        let (mut flow, t0) = started(json!({"device_code": "D"}));
        // the timer has not fired yet
        assert_eq!(
            flow.on_poll_response(json!({"access_token": "x"}), t0),
            Step::Ignore
        );
        assert!(matches!(
            flow.state(),
            DeviceFlowState::AwaitingAuthorization(_)
        ));
    }
}

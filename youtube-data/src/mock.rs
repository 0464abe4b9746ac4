//! Scripted transport for testing code built on this crate.
//!
//! [`MockTransport`] never touches the network. Replies are queued up front and handed out
//! in order, one per request, while every request is recorded (along with the
//! [`tokio::time::Instant`] it arrived at) so tests can assert on what was sent and when.
//! Combine it with a paused tokio clock to exercise polling deterministically.

use crate::config::Endpoints;
use crate::error::NetworkErrorCode;
use crate::request::lock;
use crate::transport::{HttpRequest, Transport, TransportReply};
use http::StatusCode;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
enum Scripted {
    Reply(TransportReply),
    Delayed(Duration, TransportReply),
    /// Never completes; only cancellation ends the call.
    Pending,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<Scripted>,
    requests: Vec<(Instant, HttpRequest)>,
}

/// A [`Transport`] that replays canned replies.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints pointing at hosts that only exist in tests.
    pub fn endpoints() -> Endpoints {
        Endpoints {
            token: "https://oauth.test/token".into(),
            device_code: "https://oauth.test/device/code".into(),
            revoke: "https://oauth.test/revoke".into(),
            authorization: "https://oauth.test/auth".into(),
            api: "https://api.test/youtube/v3".into(),
        }
    }

    fn push(&self, scripted: Scripted) {
        lock(&self.state).replies.push_back(scripted);
    }

    pub fn push_reply(&self, reply: TransportReply) {
        self.push(Scripted::Reply(reply));
    }

    pub fn push_body(&self, status: StatusCode, body: impl Into<String>) {
        self.push_reply(TransportReply::new(status, body.into()));
    }

    pub fn push_json(&self, status: StatusCode, body: serde_json::Value) {
        self.push_body(status, body.to_string());
    }

    /// Queues a reply that is only delivered after `delay` has elapsed.
    pub fn push_delayed(&self, delay: Duration, status: StatusCode, body: serde_json::Value) {
        self.push(Scripted::Delayed(
            delay,
            TransportReply::new(status, body.to_string()),
        ));
    }

    /// Queues a transport failure that produced no response at all.
    pub fn push_failure(&self, code: NetworkErrorCode, message: &str) {
        self.push_reply(TransportReply::failed(code, message));
    }

    /// Queues a call that never completes.
    pub fn push_pending(&self) {
        self.push(Scripted::Pending);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.state)
            .requests
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// When each request was received.
    pub fn request_times(&self) -> Vec<Instant> {
        lock(&self.state).requests.iter().map(|(at, _)| *at).collect()
    }

    /// Number of replies that have not been handed out yet.
    pub fn remaining(&self) -> usize {
        lock(&self.state).replies.len()
    }
}

impl Transport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> TransportReply {
        let next = {
            let mut state = lock(&self.state);
            tracing::trace!(method = %request.method, url = %request.url, "mock request");
            state.requests.push((Instant::now(), request));
            state.replies.pop_front()
        };
        match next {
            Some(Scripted::Reply(reply)) => reply,
            Some(Scripted::Delayed(delay, reply)) => {
                tokio::time::sleep(delay).await;
                reply
            }
            Some(Scripted::Pending) => std::future::pending().await,
            None => TransportReply::failed(NetworkErrorCode::Unknown, "no scripted reply left"),
        }
    }
}

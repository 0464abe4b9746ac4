//! A demand-driven model over a paginated list endpoint.
//!
//! [`ListModel`] accumulates the items of consecutive pages. Callers fetch the first page
//! with [`ListModel::list`] and ask for more with [`ListModel::fetch_more`] as they need it,
//! typically when a view scrolls near the end of what has been loaded.

use crate::client::Client;
use crate::error::{Error, Result};
use crate::request::{Call, Event, Request, RequestState, Status, Ticket, lock};
use crate::resources::{ListQuery, Resource, decode_page};
use crate::transport::Transport;
use http::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::instrument;

#[derive(Debug, Default)]
struct PageCursor {
    query: Option<ListQuery>,
    next_page_token: Option<String>,
    items: Vec<Value>,
    /// Whether the most recent page fetch failed. Updates do not touch this.
    fetch_failed: bool,
}

/// Items of one collection, loaded page by page.
///
/// At most one fetch or update is in flight; anything submitted meanwhile fails with
/// [`Error::Busy`]. Items loaded by earlier pages survive failures and cancellation of later
/// ones.
#[derive(Debug)]
pub struct ListModel<T> {
    request: Request<T>,
    resource: Resource,
    cursor: Mutex<PageCursor>,
}

impl<T: Transport> ListModel<T> {
    pub fn new(client: Client<T>, resource: Resource) -> Self {
        Self {
            request: Request::new(client),
            resource,
            cursor: Mutex::new(PageCursor::default()),
        }
    }

    pub fn resource(&self) -> Resource {
        self.resource
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

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.request.subscribe()
    }

    /// Aborts the fetch or update in flight. Loaded items and the page token are kept.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    pub fn items(&self) -> Vec<Value> {
        lock(&self.cursor).items.clone()
    }

    pub fn item(&self, index: usize) -> Option<Value> {
        lock(&self.cursor).items.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.cursor).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All loaded items, decoded as `R`.
    pub fn items_as<R: DeserializeOwned>(&self) -> Result<Vec<R>> {
        lock(&self.cursor)
            .items
            .iter()
            .map(|item| {
                serde_json::from_value(item.clone())
                    .map_err(|e| Error::UnknownContent(format!("unexpected {}: {e}", self.resource)))
            })
            .collect()
    }

    pub fn next_page_token(&self) -> Option<String> {
        lock(&self.cursor).next_page_token.clone()
    }

    /// The query of the current listing.
    pub fn query(&self) -> Option<ListQuery> {
        lock(&self.cursor).query.clone()
    }

    /// True if another page exists and nothing prevents fetching it.
    ///
    /// A failed fetch disables paging until the next [`list`](Self::list) or
    /// [`reload`](Self::reload). A canceled fetch does not: the page it was loading can be
    /// requested again. Failed updates have no effect on paging.
    pub fn can_fetch_more(&self) -> bool {
        if self.request.is_busy() {
            return false;
        }
        let cursor = lock(&self.cursor);
        !cursor.fetch_failed
            && cursor
                .next_page_token
                .as_deref()
                .is_some_and(|t| !t.is_empty())
    }

    /// Starts a new listing: discards loaded items and fetches the first page of `query`.
    ///
    /// Returns the number of items loaded.
    #[instrument(skip_all, fields(resource = %self.resource), err(level = "debug"))]
    pub async fn list(&self, query: ListQuery) -> Result<usize> {
        query.validate()?;
        let ticket = self.request.begin()?;
        {
            let mut cursor = lock(&self.cursor);
            cursor.query = Some(query);
            cursor.next_page_token = None;
            cursor.items.clear();
            cursor.fetch_failed = false;
        }
        self.request.notify(Event::ItemsCleared);
        self.fetch(ticket).await
    }

    /// Lists again with the last query.
    pub async fn reload(&self) -> Result<usize> {
        let query = self
            .query()
            .ok_or_else(|| Error::InvalidArgument("nothing has been listed yet".into()))?;
        self.list(query).await
    }

    /// Fetches the next page, if there is one. Does nothing otherwise.
    #[instrument(skip_all, fields(resource = %self.resource), err(level = "debug"))]
    pub async fn fetch_more(&self) -> Result<usize> {
        if !self.can_fetch_more() {
            return Ok(0);
        }
        let ticket = self.request.begin()?;
        self.fetch(ticket).await
    }

    async fn fetch(&self, mut ticket: Ticket) -> Result<usize> {
        let (query, page_token) = {
            let cursor = lock(&self.cursor);
            (cursor.query.clone(), cursor.next_page_token.clone())
        };
        let Some(query) = query else {
            let state = RequestState::failed(Error::InvalidArgument("no query".into()), None);
            return self.finish_fetch(ticket, state).map(|_| 0);
        };
        let mut url = match self.request.client().resource_url(self.resource) {
            Ok(url) => url,
            Err(e) => return self.finish_fetch(ticket, RequestState::failed(e, None)).map(|_| 0),
        };
        query.apply(&mut url, page_token.as_deref());

        let state = self
            .request
            .perform(&mut ticket, &Call::new(Method::GET, url))
            .await;
        let (state, page) = decode_page::<Value>(state);

        let mut inserted = 0;
        if let Some(page) = page {
            let start = {
                let mut cursor = lock(&self.cursor);
                let start = cursor.items.len();
                cursor.next_page_token = page.next_page_token().map(str::to_owned);
                inserted = page.items.len();
                cursor.items.extend(page.items);
                start
            };
            tracing::debug!(
                items = inserted,
                more = page.next_page_token.as_deref().is_some_and(|t| !t.is_empty()),
                "page loaded"
            );
            if inserted > 0 {
                self.request.notify(Event::ItemsInserted {
                    start,
                    count: inserted,
                });
            }
        }
        self.finish_fetch(ticket, state).map(|_| inserted)
    }

    fn finish_fetch(&self, ticket: Ticket, state: RequestState) -> Result<Value> {
        lock(&self.cursor).fetch_failed = state.status == Status::Failed;
        self.request.finish(ticket, state)
    }

    /// Replaces `resource` on the server and, on success, the loaded item with the same `id`.
    ///
    /// Paging state is left alone.
    #[instrument(skip_all, fields(resource = %self.resource), err(level = "debug"))]
    pub async fn update<S: AsRef<str>>(
        &self,
        resource: Value,
        part: &[S],
        params: &[(&str, &str)],
    ) -> Result<Value> {
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidArgument("resource has no id".into()))?;
        let query = ListQuery {
            part: part.iter().map(|p| p.as_ref().to_owned()).collect(),
            filters: Vec::new(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        query.validate()?;
        let mut url = self.request.client().resource_url(self.resource)?;
        query.apply(&mut url, None);
        let call = Call::new(Method::PUT, url).json(resource);

        let mut ticket = self.request.begin()?;
        let state = self.request.perform(&mut ticket, &call).await;
        if state.status == Status::Ready {
            if let Some(updated) = state.result.clone().filter(Value::is_object) {
                let index = {
                    let mut cursor = lock(&self.cursor);
                    let index = cursor
                        .items
                        .iter()
                        .position(|item| item.get("id").and_then(Value::as_str) == Some(id.as_str()));
                    if let Some(i) = index {
                        cursor.items[i] = updated;
                    }
                    index
                };
                match index {
                    Some(i) => self.request.notify(Event::ItemChanged(i)),
                    None => tracing::debug!(%id, "updated resource is not loaded"),
                }
            }
        }
        self.request.finish(ticket, state)
    }
}

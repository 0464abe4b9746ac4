//! Per-resource endpoints of the Data API.

use crate::client::Client;
use crate::error::{Error, Result};
use crate::request::{Call, Event, Request, RequestState, Status};
use crate::transport::Transport;
use crate::types::{ListPage, PagedStream};
use http::Method;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::instrument;

/// A collection exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Channels,
    GuideCategories,
    Subscriptions,
    Videos,
    VideoCategories,
    Playlists,
    PlaylistItems,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Resource::Channels,
        Resource::GuideCategories,
        Resource::Subscriptions,
        Resource::Videos,
        Resource::VideoCategories,
        Resource::Playlists,
        Resource::PlaylistItems,
    ];

    /// Path of the collection below the API base URL.
    pub fn path(self) -> &'static str {
        match self {
            Resource::Channels => "channels",
            Resource::GuideCategories => "guideCategories",
            Resource::Subscriptions => "subscriptions",
            Resource::Videos => "videos",
            Resource::VideoCategories => "videoCategories",
            Resource::Playlists => "playlists",
            Resource::PlaylistItems => "playlistItems",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Resource::ALL
            .into_iter()
            .find(|r| r.path().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown resource {s:?}")))
    }
}

/// What to list: the `part` selector, filters, and any other query parameters.
///
/// Filters (`id`, `mine`, `channelId`, ...) select which resources are returned; params are
/// passed through untouched (`maxResults`, `hl`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub part: Vec<String>,
    pub filters: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
}

impl ListQuery {
    pub fn new<S: AsRef<str>>(part: &[S]) -> Self {
        Self {
            part: part.iter().map(|p| p.as_ref().to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((key.into(), value.into()));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn max_results(self, max: u32) -> Self {
        self.param("maxResults", max.to_string())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.part.iter().all(|p| p.trim().is_empty()) {
            return Err(Error::InvalidArgument("part must not be empty".into()));
        }
        Ok(())
    }

    /// Adds this query, and `page_token` if given, to `url`.
    pub(crate) fn apply(&self, url: &mut Url, page_token: Option<&str>) {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("part", &part_list(&self.part));
        for (k, v) in self.filters.iter().chain(&self.params) {
            pairs.append_pair(k, v);
        }
        if let Some(token) = page_token {
            pairs.append_pair("pageToken", token);
        }
    }
}

fn part_list<S: AsRef<str>>(part: &[S]) -> String {
    part.iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a settled list state into the typed page, or a failure if the body is not a page.
pub(crate) fn decode_page<R: DeserializeOwned>(
    state: RequestState,
) -> (RequestState, Option<ListPage<R>>) {
    if state.status != Status::Ready {
        return (state, None);
    }
    let value = state.result.clone().unwrap_or(Value::Null);
    if !value.is_object() {
        let error = Error::UnknownContent("list response is not an object".into());
        return (RequestState::failed(error, Some(value)), None);
    }
    match ListPage::<R>::deserialize(&value) {
        Ok(page) => (state, Some(page)),
        Err(e) => {
            let error = Error::UnknownContent(format!("unexpected list response: {e}"));
            (RequestState::failed(error, Some(value)), None)
        }
    }
}

/// One-shot calls against a single collection: list, insert, update, delete.
#[derive(Debug)]
pub struct ResourceRequest<T> {
    request: Request<T>,
    resource: Resource,
}

impl<T: Transport> ResourceRequest<T> {
    pub fn new(client: Client<T>, resource: Resource) -> Self {
        Self {
            request: Request::new(client),
            resource,
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

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.request.subscribe()
    }

    pub fn cancel(&self) {
        self.request.cancel();
    }

    fn url<S: AsRef<str>>(&self, part: &[S]) -> Result<Url> {
        let mut url = self.request.client().resource_url(self.resource)?;
        if !part.is_empty() {
            url.query_pairs_mut().append_pair("part", &part_list(part));
        }
        Ok(url)
    }

    async fn run(&self, call: Call) -> Result<Value> {
        let mut ticket = self.request.begin()?;
        let state = self.request.perform(&mut ticket, &call).await;
        self.request.finish(ticket, state)
    }

    /// The first page matching `query`.
    pub async fn list(&self, query: &ListQuery) -> Result<ListPage> {
        self.list_page(query, None).await
    }

    /// The page of `query` identified by `page_token`.
    #[instrument(skip(self, query), fields(resource = %self.resource), err(level = "debug"))]
    pub async fn list_page<R: DeserializeOwned>(
        &self,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<ListPage<R>> {
        query.validate()?;
        let mut url = self.request.client().resource_url(self.resource)?;
        query.apply(&mut url, page_token);
        let call = Call::new(Method::GET, url);

        let mut ticket = self.request.begin()?;
        let state = self.request.perform(&mut ticket, &call).await;
        let (state, page) = decode_page(state);
        self.request.finish(ticket, state)?;
        page.ok_or_else(|| Error::UnknownContent("list response missing".into()))
    }

    /// Every resource matching `query`, across all pages.
    ///
    /// Pages are fetched one at a time as the stream is consumed.
    pub fn list_all<R>(&self, query: ListQuery) -> impl Stream<Item = Result<R>> + use<'_, T, R>
    where
        R: DeserializeOwned + Send + Unpin + 'static,
    {
        PagedStream::new(move |page_token: Option<String>| {
            let query = query.clone();
            async move { self.list_page::<R>(&query, page_token.as_deref()).await }
        })
    }

    /// Creates `resource`, returning it as stored by the server.
    #[instrument(skip(self, part, resource), fields(resource = %self.resource), err(level = "debug"))]
    pub async fn insert<S: AsRef<str>>(&self, part: &[S], resource: Value) -> Result<Value> {
        let call = Call::new(Method::POST, self.url(part)?).json(resource);
        self.run(call).await
    }

    /// Replaces the resource with the same `id` as `resource`.
    #[instrument(skip(self, part, resource), fields(resource = %self.resource), err(level = "debug"))]
    pub async fn update<S: AsRef<str>>(&self, part: &[S], resource: Value) -> Result<Value> {
        if resource.get("id").and_then(Value::as_str).is_none() {
            return Err(Error::InvalidArgument("resource has no id".into()));
        }
        let call = Call::new(Method::PUT, self.url(part)?).json(resource);
        self.run(call).await
    }

    #[instrument(skip(self), fields(resource = %self.resource), err(level = "debug"))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut url = self.url::<&str>(&[])?;
        url.query_pairs_mut().append_pair("id", id);
        self.run(Call::new(Method::DELETE, url)).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::mock::MockTransport;
    use crate::types::GuideCategory;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn resource(resource: Resource) -> ResourceRequest<MockTransport> {
        Client::with_endpoints(
            MockTransport::new(),
            Credentials::default(),
            MockTransport::endpoints(),
        )
        .resource_request(resource)
    }

    fn mock(r: &ResourceRequest<MockTransport>) -> &MockTransport {
        r.request.client().transport()
    }

    #[test]
    fn resource_names_parse() {
        assert_eq!("guideCategories".parse::<Resource>(), Ok(Resource::GuideCategories));
        assert_eq!("playlistitems".parse::<Resource>(), Ok(Resource::PlaylistItems));
        assert!("comments".parse::<Resource>().is_err());
    }

    #[test]
    fn query_string() {
        let query = ListQuery::new(&["snippet", " contentDetails "])
            .filter("mine", "true")
            .max_results(50);
        let mut url = Url::parse("https://api.test/youtube/v3/channels").unwrap();
        query.apply(&mut url, Some("CAUQAA"));
        assert_eq!(
            url.as_str(),
            "https://api.test/youtube/v3/channels\
             ?part=snippet%2CcontentDetails&mine=true&maxResults=50&pageToken=CAUQAA"
        );
        assert!(ListQuery::new(&[" "]).validate().is_err());
    }

    #[tokio::test]
    async fn typed_list_page() {
        let r = resource(Resource::GuideCategories);
        mock(&r).push_json(
            StatusCode::OK,
            json!({
                "items": [{"id": "GCQmVzdCBvZiBZb3VUdWJl", "snippet": {"title": "Best of YouTube"}}]
            }),
        );
        let page: ListPage<GuideCategory> = r
            .list_page(&ListQuery::new(&["snippet"]).filter("regionCode", "US"), None)
            .await
            .unwrap();
        assert_eq!(page.items[0].snippet.as_ref().unwrap().title, "Best of YouTube");
        assert_eq!(
            mock(&r).requests()[0].url.as_str(),
            "https://api.test/youtube/v3/guideCategories?part=snippet&regionCode=US"
        );
    }

    #[tokio::test]
    async fn non_object_list_is_unknown_content() {
        let r = resource(Resource::Channels);
        mock(&r).push_json(StatusCode::OK, json!([1, 2]));
        let err = r.list(&ListQuery::new(&["id"])).await.unwrap_err();
        assert!(matches!(err, Error::UnknownContent(_)), "{err:?}");
        assert_eq!(r.status(), Status::Failed);
        assert_eq!(r.state().result, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn list_all_follows_tokens() {
        let r = resource(Resource::Subscriptions);
        mock(&r).push_json(
            StatusCode::OK,
            json!({"items": [{"id": "a"}, {"id": "b"}], "nextPageToken": "t2"}),
        );
        mock(&r).push_json(StatusCode::OK, json!({"items": [{"id": "c"}]}));

        let ids: Vec<String> = r
            .list_all::<Value>(ListQuery::new(&["id"]).filter("mine", "true"))
            .map(|item| item.unwrap()["id"].as_str().unwrap().to_owned())
            .collect()
            .await;
        assert_eq!(ids, ["a", "b", "c"]);
        let sent = mock(&r).requests();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].url.as_str().ends_with("&pageToken=t2"));
    }

    #[tokio::test]
    async fn insert_update_delete() {
        let r = resource(Resource::Playlists);
        let playlist = json!({"snippet": {"title": "Favourites"}});
        mock(&r).push_json(StatusCode::OK, json!({"id": "PL1", "snippet": {"title": "Favourites"}}));
        mock(&r).push_json(StatusCode::OK, json!({"id": "PL1", "snippet": {"title": "Best"}}));
        mock(&r).push_body(StatusCode::NO_CONTENT, "");

        let created = r.insert(&["snippet"], playlist.clone()).await.unwrap();
        assert_eq!(created["id"], "PL1");
        r.update(&["snippet"], json!({"id": "PL1", "snippet": {"title": "Best"}}))
            .await
            .unwrap();
        r.delete("PL1").await.unwrap();

        let sent = mock(&r).requests();
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].url.as_str(), "https://api.test/youtube/v3/playlists?part=snippet");
        assert_eq!(sent[0].body.as_deref(), Some(playlist.to_string().as_str()));
        assert_eq!(sent[0].headers[http::header::CONTENT_TYPE], "application/json");
        assert_eq!(sent[1].method, Method::PUT);
        assert_eq!(sent[2].method, Method::DELETE);
        assert_eq!(sent[2].url.as_str(), "https://api.test/youtube/v3/playlists?id=PL1");
    }

    #[tokio::test]
    async fn update_requires_id() {
        let r = resource(Resource::Playlists);
        let err = r.update(&["snippet"], json!({"snippet": {}})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
        assert!(mock(&r).requests().is_empty());
    }
}

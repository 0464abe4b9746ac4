//! Response shapes and streaming over paginated list endpoints.

use crate::error::Result;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio_stream::Stream;

type PendingPage<'a, F, T> = Pin<Box<dyn Future<Output = Result<(F, ListPage<T>)>> + Send + 'a>>;

/// Every item of a list endpoint, fetching further pages as earlier ones are consumed.
///
/// The stream ends after the first page without a `nextPageToken`, or right after yielding
/// the first error.
pub struct PagedStream<'a, T, F> {
    buffered: VecDeque<T>,
    pending: Option<PendingPage<'a, F, T>>,
    done: bool,
}

impl<'a, T, F> PagedStream<'a, T, F> {
    pub fn new<Fut>(fetch: F) -> Self
    where
        F: Fn(Option<String>) -> Fut + Send + 'a,
        Fut: Future<Output = Result<ListPage<T>>> + Send + 'a,
    {
        let first = async move {
            let page = fetch(None).await?;
            Ok((fetch, page))
        };
        Self {
            buffered: VecDeque::new(),
            pending: Some(Box::pin(first)),
            done: false,
        }
    }
}

impl<T: Unpin, F> Unpin for PagedStream<'_, T, F> {}

impl<'a, T: Unpin, F, Fut> Stream for PagedStream<'a, T, F>
where
    F: Fn(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<ListPage<T>>> + Send + 'a,
{
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            let Some(pending) = self.pending.as_mut() else {
                self.done = true;
                return Poll::Ready(None);
            };
            match pending.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    self.pending = None;
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok((fetch, page))) => {
                    let next = page.next_page_token().map(str::to_owned);
                    self.buffered.extend(page.items);
                    match next {
                        // queued, but only polled once the buffer runs dry
                        Some(token) => {
                            self.pending = Some(Box::pin(async move {
                                let page = fetch(Some(token)).await?;
                                Ok((fetch, page))
                            }));
                        }
                        None => {
                            self.pending = None;
                            self.done = true;
                        }
                    }
                }
            }
        }
    }
}

/// Paging details for lists of resources.
///
/// See: <https://developers.google.com/youtube/v3/docs/pageInfo>
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// The total number of results in the result set.
    #[serde(default)]
    pub total_results: u32,
    /// The number of results included in the API response.
    #[serde(default)]
    pub results_per_page: u32,
}

/// One page of a `*.list` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T = Value> {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub page_info: Option<PageInfo>,
}

impl<T> ListPage<T> {
    /// The token for the following page; an empty token means there is none.
    pub fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// A `channel` resource.
///
/// See: <https://developers.google.com/youtube/v3/docs/channels#resource>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<ChannelSnippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnippet {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    pub published_at: Timestamp,
}

/// A category that YouTube associates with channels based on their content.
///
/// See: <https://developers.google.com/youtube/v3/docs/guideCategories#resource>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideCategory {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<GuideCategorySnippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideCategorySnippet {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// A user's subscription to a channel.
///
/// See: <https://developers.google.com/youtube/v3/docs/subscriptions#resource>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<SubscriptionSnippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnippet {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub published_at: Timestamp,
    /// The channel the subscription is for.
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    #[test]
    fn decodes_channel() {
        let page: ListPage<Channel> = serde_json::from_value(json!({
            "kind": "youtube#channelListResponse",
            "pageInfo": {"totalResults": 1, "resultsPerPage": 5},
            "items": [{
                "kind": "youtube#channel",
                "id": "UC_x5XG1OV2P6uZZ5FSM9Ttw",
                "snippet": {
                    "title": "Google for Developers",
                    "customUrl": "@googledevelopers",
                    "publishedAt": "2007-08-23T00:34:43Z"
                }
            }]
        }))
        .unwrap();
        assert_eq!(page.next_page_token(), None);
        assert_eq!(
            page.page_info,
            Some(PageInfo {
                total_results: 1,
                results_per_page: 5
            })
        );
        let snippet = page.items[0].snippet.as_ref().unwrap();
        assert_eq!(snippet.custom_url.as_deref(), Some("@googledevelopers"));
        assert_eq!(snippet.published_at.as_second(), 1187829283);
    }

    #[test]
    fn decodes_subscription() {
        let sub: Subscription = serde_json::from_value(json!({
            "id": "sub1",
            "snippet": {
                "title": "Some Channel",
                "publishedAt": "2020-01-01T00:00:00.5Z",
                "resourceId": {"kind": "youtube#channel", "channelId": "UCabc"}
            }
        }))
        .unwrap();
        let snippet = sub.snippet.unwrap();
        assert_eq!(snippet.resource_id.channel_id.as_deref(), Some("UCabc"));
        assert_eq!(snippet.description, None);
    }

    #[test]
    fn empty_token_means_last_page() {
        let page: ListPage = serde_json::from_value(json!({"nextPageToken": ""})).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_page_token(), None);
    }

    fn page(items: &[u32], next: Option<&str>) -> ListPage<u32> {
        ListPage {
            kind: None,
            items: items.to_vec(),
            next_page_token: next.map(str::to_owned),
            page_info: None,
        }
    }

    #[tokio::test]
    async fn stream_walks_all_pages() {
        let seen = Mutex::new(Vec::new());
        let stream = PagedStream::new(|token: Option<String>| {
            seen.lock().unwrap().push(token.clone());
            async move {
                Ok::<_, Error>(match token.as_deref() {
                    None => page(&[1, 2], Some("p2")),
                    Some("p2") => page(&[], Some("p3")),
                    _ => page(&[3], None),
                })
            }
        });
        let items: Vec<u32> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("p2".to_owned()), Some("p3".to_owned())]
        );
    }

    #[tokio::test]
    async fn stream_stops_after_error() {
        let stream = PagedStream::new(|token: Option<String>| async move {
            match token {
                None => Ok(page(&[1], Some("p2"))),
                Some(_) => Err(Error::Parse),
            }
        });
        let results: Vec<Result<u32>> = stream.collect().await;
        assert_eq!(results, vec![Ok(1), Err(Error::Parse)]);
    }
}

//! Confluence-style REST client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{
    AncestorRef, InventoryPage, ItemDraft, RateLimitHints, RemoteApi, RemoteAttachment, RemoteItem,
    RemoteResponse, RemoteResult, RemoteSummary, Scope,
};
use crate::errors::RemoteError;
use crate::models::{ContentStatus, Contributor};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Listing<T> {
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageVersion {
    number: i64,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Storage {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PageBody {
    storage: Option<Storage>,
}

#[derive(Debug, Deserialize)]
struct LabelEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    id: String,
    title: String,
    #[serde(default)]
    status: Option<String>,
    space_id: Option<String>,
    parent_id: Option<String>,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    version: Option<PageVersion>,
    #[serde(default)]
    body: PageBody,
    labels: Option<Listing<LabelEntry>>,
}

#[derive(Debug, Deserialize)]
struct Ancestor {
    id: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attachment {
    id: String,
    title: String,
    media_type: Option<String>,
    file_size: Option<i64>,
    page_id: Option<String>,
    version: Option<PageVersion>,
    download_link: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageWrite<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    status: &'static str,
    title: &'a str,
    space_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    body: BodyWrite<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<VersionWrite>,
}

#[derive(Debug, Serialize)]
struct BodyWrite<'a> {
    representation: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct VersionWrite {
    number: i64,
    message: &'static str,
}

fn parse_status(s: Option<&str>) -> ContentStatus {
    s.and_then(|s| s.parse().ok()).unwrap_or_default()
}

impl Page {
    fn summary(&self) -> RemoteSummary {
        RemoteSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            parent_id: self.parent_id.clone(),
            collection: self.space_id.clone().unwrap_or_default(),
            version: self.version.as_ref().map(|v| v.number).unwrap_or(0),
            modified_at: self.version.as_ref().and_then(|v| v.created_at),
            status: parse_status(self.status.as_deref()),
        }
    }

    fn into_item(self) -> RemoteItem {
        let summary = self.summary();
        let modified_by = self.version.as_ref().and_then(|v| v.author_id.clone());

        let mut contributors: Vec<Contributor> = Vec::new();
        for (account, when) in [
            (self.author_id.clone(), self.created_at),
            (modified_by.clone(), summary.modified_at),
        ] {
            let Some(account_id) = account else { continue };
            match contributors.iter_mut().find(|c| c.account_id == account_id) {
                Some(c) => {
                    c.edit_count += 1;
                    c.last_edit_at = when.or(c.last_edit_at);
                }
                None => contributors.push(Contributor {
                    display_name: account_id.clone(),
                    account_id,
                    edit_count: 1,
                    last_edit_at: when,
                }),
            }
        }

        RemoteItem {
            id: summary.id,
            title: summary.title,
            parent_id: summary.parent_id,
            collection: summary.collection,
            version: summary.version,
            body: self.body.storage.map(|s| s.value).unwrap_or_default(),
            status: summary.status,
            restricted: false,
            created_by: self.author_id,
            created_at: self.created_at,
            modified_by,
            modified_at: summary.modified_at,
            labels: self
                .labels
                .map(|l| l.results.into_iter().map(|e| e.name).collect())
                .unwrap_or_default(),
            contributors,
        }
    }
}

// ---------------------------------------------------------------------------
// Header and status handling
// ---------------------------------------------------------------------------

/// Read `X-RateLimit-Remaining`, `X-RateLimit-NearLimit` and `Retry-After`.
pub fn parse_hints(headers: &HeaderMap) -> RateLimitHints {
    let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
    RateLimitHints {
        remaining: text("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
        near_limit: text("x-ratelimit-nearlimit")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        retry_after: text("retry-after").and_then(parse_retry_after),
    }
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values are
/// not used by this API and are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Map a non-success status to the error taxonomy.
pub fn status_error(
    status: StatusCode,
    id: &str,
    retry_after: Option<Duration>,
    body: String,
) -> RemoteError {
    match status.as_u16() {
        404 => RemoteError::NotFound { id: id.to_string() },
        401 | 403 => RemoteError::Forbidden { id: id.to_string() },
        409 => RemoteError::VersionConflict {
            id: id.to_string(),
            expected: -1,
        },
        429 => RemoteError::RateLimited { retry_after },
        500..=599 => RemoteError::TransientServer {
            status: status.as_u16(),
            detail: body,
        },
        other => RemoteError::Api { status: other, body },
    }
}

/// Pull the `cursor` query parameter out of a `_links.next` URL.
pub fn cursor_from_next(next: &str) -> Option<String> {
    let base = Url::parse("http://localhost/").ok()?;
    let url = base.join(next).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "cursor")
        .map(|(_, v)| v.into_owned())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous REST client for a Confluence-style v2 API.
#[derive(Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        page_size: usize,
    ) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("pagesync/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        if token.is_none() {
            warn!("no API token configured; requests will be anonymous");
        }
        info!(base_url = %base_url, "created HttpRemote");
        Ok(Self {
            http,
            base_url,
            token,
            page_size: page_size.max(1),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Turn a response into its hints, or an error for non-success codes.
    async fn check(&self, resp: Response, id: &str) -> Result<(Response, RateLimitHints), RemoteError> {
        let hints = parse_hints(resp.headers());
        let status = resp.status();
        if status.is_success() {
            return Ok((resp, hints));
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), id, "remote returned error status");
        Err(status_error(status, id, hints.retry_after, body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        id: &str,
    ) -> RemoteResult<T> {
        let resp = self
            .authed(self.http.get(url).query(query))
            .send()
            .await
            .map_err(classify_transport)?;
        let (resp, hints) = self.check(resp, id).await?;
        let data = resp
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        Ok(RemoteResponse { data, hints })
    }

    fn site_url(&self, link: &str) -> Result<String, RemoteError> {
        let base = Url::parse(&self.base_url).map_err(|e| RemoteError::Parse(e.to_string()))?;
        base.join(link)
            .map(|u| u.to_string())
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }
}

/// Connection-level failures are transient; anything else stays an HTTP error.
fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() {
        RemoteError::TransientServer {
            status: 0,
            detail: err.to_string(),
        }
    } else {
        RemoteError::Http(err)
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    #[instrument(skip(self))]
    async fn list_scope(&self, scope: &Scope, cursor: Option<&str>) -> RemoteResult<InventoryPage> {
        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let (url, id) = match scope {
            Scope::Item(id) => {
                let page = self.get_item(id).await?;
                return Ok(RemoteResponse {
                    data: InventoryPage {
                        items: vec![page.data.summary()],
                        next_cursor: None,
                    },
                    hints: page.hints,
                });
            }
            Scope::Subtree(id) => (format!("{}/pages/{id}/descendants", self.base_url), id),
            Scope::Collection(key) => (format!("{}/spaces/{key}/pages", self.base_url), key),
        };

        let resp: RemoteResponse<Listing<Page>> = self.get_json(&url, &query, id).await?;
        let mut items: Vec<RemoteSummary> = resp.data.results.iter().map(Page::summary).collect();

        // The descendants listing does not include the subtree root itself.
        if let (Scope::Subtree(root), None) = (scope, cursor) {
            let root_page = self.get_item(root).await?;
            items.insert(0, root_page.data.summary());
        }

        let next_cursor = resp.data.links.next.as_deref().and_then(cursor_from_next);
        debug!(count = items.len(), has_more = next_cursor.is_some(), "listed scope page");
        Ok(RemoteResponse {
            data: InventoryPage { items, next_cursor },
            hints: resp.hints,
        })
    }

    #[instrument(skip(self))]
    async fn get_item(&self, id: &str) -> RemoteResult<RemoteItem> {
        let url = format!("{}/pages/{id}", self.base_url);
        let query = [
            ("body-format", "storage".to_string()),
            ("include-labels", "true".to_string()),
            ("include-version", "true".to_string()),
        ];
        let resp: RemoteResponse<Page> = self.get_json(&url, &query, id).await?;
        Ok(RemoteResponse {
            data: resp.data.into_item(),
            hints: resp.hints,
        })
    }

    #[instrument(skip(self))]
    async fn get_ancestors(&self, id: &str) -> RemoteResult<Vec<AncestorRef>> {
        let url = format!("{}/pages/{id}/ancestors", self.base_url);
        let resp: RemoteResponse<Listing<Ancestor>> = self.get_json(&url, &[], id).await?;
        // The API returns the closest ancestor last.
        let chain = resp
            .data
            .results
            .into_iter()
            .map(|a| AncestorRef {
                id: a.id,
                title: a.title,
            })
            .collect();
        Ok(RemoteResponse {
            data: chain,
            hints: resp.hints,
        })
    }

    #[instrument(skip(self, draft), fields(title = %draft.title))]
    async fn create_item(&self, draft: &ItemDraft) -> RemoteResult<RemoteItem> {
        let url = format!("{}/pages", self.base_url);
        let body = PageWrite {
            id: None,
            status: "current",
            title: &draft.title,
            space_id: &draft.collection,
            parent_id: draft.parent_id.as_deref(),
            body: BodyWrite {
                representation: "storage",
                value: &draft.body,
            },
            version: None,
        };
        let resp = self
            .authed(self.http.post(&url).json(&body))
            .send()
            .await
            .map_err(classify_transport)?;
        let (resp, hints) = self.check(resp, &draft.title).await?;
        let page: Page = resp
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        info!(id = %page.id, "created remote item");
        Ok(RemoteResponse {
            data: page.into_item(),
            hints,
        })
    }

    #[instrument(skip(self, draft), fields(base_version = ?draft.base_version))]
    async fn update_item(&self, id: &str, draft: &ItemDraft) -> RemoteResult<RemoteItem> {
        let base_version = match draft.base_version {
            Some(v) => v,
            None => self.get_item(id).await?.data.version,
        };
        let url = format!("{}/pages/{id}", self.base_url);
        let body = PageWrite {
            id: Some(id),
            status: "current",
            title: &draft.title,
            space_id: &draft.collection,
            parent_id: draft.parent_id.as_deref(),
            body: BodyWrite {
                representation: "storage",
                value: &draft.body,
            },
            version: Some(VersionWrite {
                number: base_version + 1,
                message: "pagesync",
            }),
        };
        let resp = self
            .authed(self.http.put(&url).json(&body))
            .send()
            .await
            .map_err(classify_transport)?;
        let (resp, hints) = match self.check(resp, id).await {
            Err(RemoteError::VersionConflict { id, .. }) => {
                return Err(RemoteError::VersionConflict {
                    id,
                    expected: base_version,
                })
            }
            other => other?,
        };
        let page: Page = resp
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        debug!(id, version = page.version.as_ref().map(|v| v.number), "updated remote item");
        Ok(RemoteResponse {
            data: page.into_item(),
            hints,
        })
    }

    #[instrument(skip(self))]
    async fn delete_item(&self, id: &str) -> RemoteResult<()> {
        let url = format!("{}/pages/{id}", self.base_url);
        let resp = self
            .authed(self.http.delete(&url))
            .send()
            .await
            .map_err(classify_transport)?;
        let (_, hints) = self.check(resp, id).await?;
        Ok(RemoteResponse { data: (), hints })
    }

    #[instrument(skip(self))]
    async fn list_attachments(&self, id: &str) -> RemoteResult<Vec<RemoteAttachment>> {
        let url = format!("{}/pages/{id}/attachments", self.base_url);
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        let mut hints = RateLimitHints::default();
        loop {
            let mut query = vec![("limit", self.page_size.to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let resp: RemoteResponse<Listing<Attachment>> = self.get_json(&url, &query, id).await?;
            hints = resp.hints;
            out.extend(resp.data.results.into_iter().map(|a| RemoteAttachment {
                item_id: a.page_id.unwrap_or_else(|| id.to_string()),
                file_name: a.title,
                media_type: a
                    .media_type
                    .unwrap_or_else(|| "application/octet-stream".into()),
                size: a.file_size.unwrap_or(0),
                version: a.version.map(|v| v.number).unwrap_or(0),
                download_url: a.download_link,
                id: a.id,
            }));
            cursor = resp.data.links.next.as_deref().and_then(cursor_from_next);
            if cursor.is_none() {
                break;
            }
        }
        Ok(RemoteResponse { data: out, hints })
    }

    #[instrument(skip(self, attachment), fields(id = %attachment.id))]
    async fn download_attachment(&self, attachment: &RemoteAttachment) -> RemoteResult<Vec<u8>> {
        let link = attachment
            .download_url
            .as_deref()
            .ok_or_else(|| RemoteError::NotFound {
                id: attachment.id.clone(),
            })?;
        let url = self.site_url(link)?;
        let resp = self
            .authed(self.http.get(&url))
            .send()
            .await
            .map_err(classify_transport)?;
        let (resp, hints) = self.check(resp, &attachment.id).await?;
        let bytes = resp.bytes().await.map_err(classify_transport)?;
        Ok(RemoteResponse {
            data: bytes.to_vec(),
            hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hints() {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("12"));
        headers.insert("X-RateLimit-NearLimit", HeaderValue::from_static("true"));
        headers.insert("Retry-After", HeaderValue::from_static("2.5"));
        let hints = parse_hints(&headers);
        assert_eq!(hints.remaining, Some(12));
        assert!(hints.near_limit);
        assert_eq!(hints.retry_after, Some(Duration::from_millis(2500)));

        assert_eq!(parse_hints(&HeaderMap::new()), RateLimitHints::default());
    }

    #[test]
    fn test_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_status_mapping() {
        let err = |code: u16| {
            status_error(
                StatusCode::from_u16(code).unwrap(),
                "7",
                Some(Duration::from_secs(1)),
                String::new(),
            )
        };
        assert!(matches!(err(404), RemoteError::NotFound { .. }));
        assert!(matches!(err(401), RemoteError::Forbidden { .. }));
        assert!(matches!(err(403), RemoteError::Forbidden { .. }));
        assert!(matches!(err(409), RemoteError::VersionConflict { .. }));
        assert!(matches!(
            err(429),
            RemoteError::RateLimited { retry_after: Some(_) }
        ));
        assert!(matches!(err(503), RemoteError::TransientServer { status: 503, .. }));
        assert!(matches!(err(400), RemoteError::Api { status: 400, .. }));
    }

    #[test]
    fn test_cursor_from_next() {
        assert_eq!(
            cursor_from_next("/wiki/api/v2/spaces/1/pages?limit=25&cursor=abc%3D%3D"),
            Some("abc==".to_string())
        );
        assert_eq!(cursor_from_next("/wiki/api/v2/spaces/1/pages?limit=25"), None);
    }

    #[test]
    fn test_page_json_into_item() {
        let json = r#"{
            "id": "123",
            "status": "current",
            "title": "Runbook",
            "spaceId": "ENG",
            "parentId": "100",
            "authorId": "u1",
            "createdAt": "2024-01-02T03:04:05Z",
            "version": { "number": 7, "authorId": "u2", "createdAt": "2024-02-01T00:00:00Z" },
            "body": { "storage": { "value": "<p>hi</p>", "representation": "storage" } },
            "labels": { "results": [ { "name": "ops" } ] }
        }"#;
        let page: Page = serde_json::from_str(json).unwrap();
        let item = page.into_item();
        assert_eq!(item.version, 7);
        assert_eq!(item.parent_id.as_deref(), Some("100"));
        assert_eq!(item.body, "<p>hi</p>");
        assert_eq!(item.labels, vec!["ops"]);
        assert_eq!(item.modified_by.as_deref(), Some("u2"));
        assert_eq!(item.contributors.len(), 2);
        assert_eq!(item.status, ContentStatus::Current);
    }

    #[test]
    fn test_client_builds_without_token() {
        let client = HttpRemote::new(
            "https://wiki.example.com/api/v2/",
            None,
            Duration::from_secs(5),
            50,
        )
        .unwrap();
        assert_eq!(client.base_url, "https://wiki.example.com/api/v2");
        assert_eq!(
            client.site_url("/download/att1").unwrap(),
            "https://wiki.example.com/download/att1"
        );
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";
pub const POSTS_PATH: &str = "/api/posts/";

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Failures the feed can see from the remote API.
///
/// Authentication failures and undecodable bodies fold into `Transport`:
/// from the feed's point of view the request simply did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by server: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for ApiError {
    fn from(err: url::ParseError) -> Self {
        ApiError::Transport(format!("invalid url: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PostId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(PostId)
    }
}

/// Where the next page of the feed lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Cursor {
    /// The default first-page endpoint.
    #[default]
    Start,
    /// Opaque next-page location handed out by the server.
    Next(String),
    Exhausted,
}

impl Cursor {
    pub fn from_next(next: Option<String>) -> Self {
        match next {
            Some(next) if !next.trim().is_empty() => Cursor::Next(next),
            _ => Cursor::Exhausted,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Cursor::Exhausted)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub page_size: Option<u32>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    page_size: Option<u32>,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("api client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
            page_size: config.page_size.filter(|size| *size > 0),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn posts(&self, cursor: &Cursor) -> Result<Page<Post>, ApiError> {
        let url = match cursor {
            Cursor::Start => {
                let mut url = self.base_url.join(POSTS_PATH)?;
                if let Some(size) = self.page_size {
                    url.query_pairs_mut()
                        .append_pair("page_size", &size.to_string());
                }
                url
            }
            // Absolute next links replace the base entirely.
            Cursor::Next(next) => self.base_url.join(next)?,
            Cursor::Exhausted => return Ok(Page::default()),
        };
        let resp = self.send(self.request(Method::GET, url))?;
        decode(resp)
    }

    pub fn create_post(&self, content: &str) -> Result<Post, ApiError> {
        let url = self.base_url.join(POSTS_PATH)?;
        let req = self
            .request(Method::POST, url)
            .json(&PostContent { content });
        decode(self.send(req)?)
    }

    /// Likes the post if the current user hasn't, unlikes it otherwise.
    pub fn toggle_like(&self, id: PostId) -> Result<LikeOutcome, ApiError> {
        let url = self.post_url(id)?;
        let resp = self.send(self.request(Method::PATCH, url))?;
        let liked = match resp.status() {
            StatusCode::CREATED => Some(true),
            StatusCode::OK => Some(false),
            _ => None,
        };
        let message = resp
            .json::<MessageBody>()
            .ok()
            .and_then(|body| body.message);
        Ok(LikeOutcome {
            liked,
            likes_count: None,
            message,
        })
    }

    pub fn delete_post(&self, id: PostId) -> Result<(), ApiError> {
        let url = self.post_url(id)?;
        self.send(self.request(Method::DELETE, url))?;
        Ok(())
    }

    pub fn update_post(&self, id: PostId, content: &str) -> Result<Post, ApiError> {
        let url = self.post_url(id)?;
        let req = self
            .request(Method::PUT, url)
            .json(&PostContent { content });
        decode(self.send(req)?)
    }

    fn post_url(&self, id: PostId) -> Result<Url, ApiError> {
        Ok(self.base_url.join(&format!("{POSTS_PATH}{id}/"))?)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("api: {} {}", method, url);
        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = self.token_provider.token() {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        let message = error_message(&body);
        match status.as_u16() {
            400 => Err(ApiError::Validation(message)),
            401 => Err(ApiError::Transport("unauthorized".into())),
            403 => Err(ApiError::Transport(format!("forbidden: {message}"))),
            404 => Err(ApiError::NotFound),
            _ => Err(ApiError::Transport(format!("api error {status}: {message}"))),
        }
    }
}

fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    resp.json()
        .map_err(|err| ApiError::Transport(format!("decode response: {err}")))
}

/// Flattens the server's error payload (`{"error": ..}`, `{"detail": ..}` or
/// per-field lists) into one line.
pub fn error_message(body: &str) -> String {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return body.trim().to_string(),
    };
    let Value::Object(map) = value else {
        return body.trim().to_string();
    };
    for key in ["error", "detail", "message"] {
        if let Some(Value::String(text)) = map.get(key) {
            return text.clone();
        }
    }
    map.iter()
        .map(|(field, value)| match value {
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{field}: {joined}")
            }
            Value::String(text) => format!("{field}: {text}"),
            other => format!("{field}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            count: None,
            next: None,
            previous: None,
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    #[serde(default)]
    pub owner: Option<u64>,
    #[serde(default)]
    pub owner_username: String,
    #[serde(default)]
    pub owner_profile_image: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "isOwner")]
    pub is_owner: bool,
    #[serde(default, rename = "isLiked")]
    pub is_liked: bool,
    #[serde(default)]
    pub likes_count: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// What the server said about a like toggle. Either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LikeOutcome {
    pub liked: Option<bool>,
    pub likes_count: Option<u32>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PostContent<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;
    use tiny_http::{Header, Response as StubResponse, Server};

    struct Anonymous;

    impl TokenProvider for Anonymous {
        fn token(&self) -> Option<String> {
            None
        }
    }

    struct Fixed(&'static str);

    impl TokenProvider for Fixed {
        fn token(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[derive(Debug)]
    struct Recorded {
        method: String,
        url: String,
        authorization: Option<String>,
        body: String,
    }

    fn serve(replies: Vec<(u16, String)>) -> (String, thread::JoinHandle<Vec<Recorded>>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let base = format!("http://{}/", server.server_addr());
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let mut request = server.recv().unwrap();
                let mut request_body = String::new();
                request.as_reader().read_to_string(&mut request_body).unwrap();
                seen.push(Recorded {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    authorization: request
                        .headers()
                        .iter()
                        .find(|header| header.field.equiv("Authorization"))
                        .map(|header| header.value.as_str().to_string()),
                    body: request_body,
                });
                let response = StubResponse::from_string(body)
                    .with_status_code(status)
                    .with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                            .unwrap(),
                    );
                request.respond(response).unwrap();
            }
            seen
        });
        (base, handle)
    }

    fn client(base: &str, tokens: Arc<dyn TokenProvider>) -> Client {
        Client::new(
            tokens,
            ClientConfig {
                user_agent: "feedroll-test".into(),
                base_url: Some(base.to_string()),
                page_size: Some(10),
                ..Default::default()
            },
        )
        .unwrap()
    }

    const FIRST_PAGE: &str = r#"{
        "count": 3,
        "next": "http://example.invalid/api/posts/?page=2",
        "previous": null,
        "results": [
            {"id": 7, "content": "hi", "owner": 2, "owner_username": "ana",
             "owner_profile_image": "/media/profile_images/ana.png",
             "isOwner": true, "isLiked": false, "likes_count": 3,
             "created_at": "2024-01-02T10:00:00Z", "updated_at": "2024-01-02T10:00:00Z"}
        ]
    }"#;

    #[test]
    fn first_page_uses_default_endpoint_and_bearer_token() {
        let (base, server) = serve(vec![(200, FIRST_PAGE.to_string())]);
        let api = client(&base, Arc::new(Fixed("abc")));

        let page = api.posts(&Cursor::Start).unwrap();
        let seen = server.join().unwrap();

        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].url, "/api/posts/?page_size=10");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(
            page.next.as_deref(),
            Some("http://example.invalid/api/posts/?page=2")
        );
        let post = &page.results[0];
        assert_eq!(post.id, PostId(7));
        assert_eq!(post.owner_username, "ana");
        assert!(post.is_owner);
        assert!(!post.is_liked);
        assert_eq!(post.likes_count, 3);
        assert!(post.created_at.is_some());
    }

    #[test]
    fn next_cursor_is_followed_as_given() {
        let (base, server) = serve(vec![(200, r#"{"next": null, "results": []}"#.into())]);
        let api = client(&base, Arc::new(Anonymous));
        let next = format!("{base}api/posts/?page=2&page_size=10");

        let page = api.posts(&Cursor::Next(next)).unwrap();
        let seen = server.join().unwrap();

        assert_eq!(seen[0].url, "/api/posts/?page=2&page_size=10");
        assert_eq!(seen[0].authorization, None);
        assert!(page.results.is_empty());
        assert_eq!(Cursor::from_next(page.next), Cursor::Exhausted);
    }

    #[test]
    fn create_sends_content_and_returns_canonical_post() {
        let reply = r#"{"id": 42, "content": "hello", "owner_username": "ana",
                        "isOwner": true, "isLiked": false, "likes_count": 0}"#;
        let (base, server) = serve(vec![(201, reply.into())]);
        let api = client(&base, Arc::new(Anonymous));

        let post = api.create_post("hello").unwrap();
        let seen = server.join().unwrap();

        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "/api/posts/");
        let sent: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(sent["content"], "hello");
        assert_eq!(post.id, PostId(42));
        assert_eq!(post.likes_count, 0);
    }

    #[test]
    fn like_toggle_reads_direction_from_status() {
        let (base, server) = serve(vec![
            (201, r#"{"message": "Post liked."}"#.into()),
            (200, r#"{"message": "Like removed."}"#.into()),
        ]);
        let api = client(&base, Arc::new(Anonymous));

        let liked = api.toggle_like(PostId(3)).unwrap();
        let unliked = api.toggle_like(PostId(3)).unwrap();
        let seen = server.join().unwrap();

        assert_eq!(seen[0].method, "PATCH");
        assert_eq!(seen[0].url, "/api/posts/3/");
        assert_eq!(liked.liked, Some(true));
        assert_eq!(liked.message.as_deref(), Some("Post liked."));
        assert_eq!(unliked.liked, Some(false));
    }

    #[test]
    fn status_codes_map_to_error_taxonomy() {
        let (base, server) = serve(vec![
            (400, r#"{"content": ["This field may not be blank."]}"#.into()),
            (404, r#"{"error": "Post not found."}"#.into()),
            (500, "boom".into()),
        ]);
        let api = client(&base, Arc::new(Anonymous));

        let rejected = api.update_post(PostId(1), "").unwrap_err();
        let missing = api.delete_post(PostId(1)).unwrap_err();
        let broken = api.delete_post(PostId(1)).unwrap_err();
        let seen = server.join().unwrap();

        assert_eq!(seen[0].method, "PUT");
        assert_eq!(seen[1].method, "DELETE");
        assert_eq!(
            rejected,
            ApiError::Validation("content: This field may not be blank.".into())
        );
        assert_eq!(missing, ApiError::NotFound);
        assert!(matches!(broken, ApiError::Transport(msg) if msg.contains("500")));
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let api = client(&base, Arc::new(Anonymous));

        let err = api.posts(&Cursor::Start).unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }

    #[test]
    fn exhausted_cursor_yields_empty_page_without_request() {
        let api = client("http://127.0.0.1:9/", Arc::new(Anonymous));
        let page = api.posts(&Cursor::Exhausted).unwrap();
        assert!(page.results.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn error_message_prefers_named_fields() {
        assert_eq!(error_message(r#"{"error": "Username taken."}"#), "Username taken.");
        assert_eq!(error_message(r#"{"detail": "Not found."}"#), "Not found.");
        assert_eq!(error_message("  plain text "), "plain text");
    }

    #[test]
    fn post_id_parses_with_optional_hash() {
        assert_eq!("#12".parse::<PostId>().unwrap(), PostId(12));
        assert_eq!(" 5 ".parse::<PostId>().unwrap(), PostId(5));
        assert!("abc".parse::<PostId>().is_err());
    }
}

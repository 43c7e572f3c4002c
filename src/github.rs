use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::FetchError;
use crate::models::{Cursor, Quota, Record, SearchPage};
use crate::rate_limit::{parse_reset_at, reset_from_epoch, RateLimitGovernor};

// === Configuration Constants ===

const GRAPHQL_URL: &str = "https://api.github.com/graphql";

const USER_AGENT: &str = "star-crawler/0.1.0";

/// Repository search, one page at a time. `rateLimit` rides along so every response
/// carries the current quota.
pub const REPO_SEARCH_QUERY: &str = r#"
query ($query: String!, $first: Int!, $after: String) {
  search(query: $query, type: REPOSITORY, first: $first, after: $after) {
    repositoryCount
    pageInfo {
      hasNextPage
      endCursor
    }
    nodes {
      ... on Repository {
        id
        name
        owner { login }
        stargazerCount
      }
    }
  }
  rateLimit {
    limit
    cost
    remaining
    resetAt
  }
}
"#;

const RATE_LIMIT_QUERY: &str = "query { rateLimit { limit cost remaining resetAt } }";

/// Retry configuration for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries before giving up (throttling waits are not counted)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Where a single request stands
#[derive(Debug)]
pub enum RequestState<T> {
    Attempting,
    BackingOff { delay: Duration, reason: String },
    RateLimitedWait { reset_at: Option<DateTime<Utc>> },
    Succeeded(T),
    Failed(FetchError),
}

impl RetryPolicy {
    /// Delay after the `failures`-th transient failure: base, 2x base, 4x base...
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Transition after an attempt, given how many transient failures came before it
    pub fn next_state<T>(&self, outcome: Result<T, FetchError>, failures: u32) -> RequestState<T> {
        match outcome {
            Ok(payload) => RequestState::Succeeded(payload),
            Err(FetchError::RateLimited { reset_at }) => RequestState::RateLimitedWait { reset_at },
            Err(FetchError::TransientNetwork(reason)) => {
                let failures = failures + 1;
                if failures >= self.max_attempts {
                    RequestState::Failed(FetchError::Exhausted {
                        attempts: failures,
                        last_error: reason,
                    })
                } else {
                    RequestState::BackingOff {
                        delay: self.backoff_delay(failures),
                        reason,
                    }
                }
            }
            Err(e) => RequestState::Failed(e),
        }
    }
}

// === Transport ===

/// Raw HTTP answer from the GraphQL endpoint
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: reqwest::StatusCode,
    /// `x-ratelimit-reset` header (unix seconds)
    pub rate_limit_reset: Option<u64>,
    /// `x-ratelimit-remaining` header
    pub rate_limit_remaining: Option<u64>,
    /// `retry-after` header (seconds), sent with secondary rate limits
    pub retry_after: Option<u64>,
    pub body: String,
}

impl HttpReply {
    /// GitHub also answers 403 for missing scopes or SSO; only an exhausted quota or a
    /// `retry-after` marks it as throttling
    fn is_throttled(&self) -> bool {
        match self.status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => true,
            reqwest::StatusCode::FORBIDDEN => {
                self.rate_limit_remaining == Some(0) || self.retry_after.is_some()
            }
            _ => false,
        }
    }

    fn throttle_reset(&self) -> Option<DateTime<Utc>> {
        self.rate_limit_reset.and_then(reset_from_epoch).or_else(|| {
            self.retry_after
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs.min(86_400) as i64))
        })
    }
}

/// Sends one GraphQL request body; `Err` is a transport-level failure
#[async_trait]
pub trait GraphQLTransport: Send + Sync {
    async fn post(&self, body: &serde_json::Value) -> Result<HttpReply, String>;
}

/// reqwest-backed transport with bearer authentication
pub struct HttpTransport {
    client: reqwest::Client,
    token: String,
}

impl HttpTransport {
    pub fn new(token: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, token })
    }
}

/// Flatten a reqwest error with its kind and root causes
fn describe_error(e: reqwest::Error) -> String {
    use std::error::Error;
    let mut details = e.to_string();
    if e.is_timeout() {
        details.push_str(" [TIMEOUT]");
    } else if e.is_connect() {
        details.push_str(" [CONNECT]");
    } else if e.is_request() {
        details.push_str(" [REQUEST]");
    }
    if let Some(source) = e.source() {
        details.push_str(&format!(" <- {}", source));
    }
    details
}

#[async_trait]
impl GraphQLTransport for HttpTransport {
    async fn post(&self, body: &serde_json::Value) -> Result<HttpReply, String> {
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(GRAPHQL_URL)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(describe_error)?;

        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
        };
        let rate_limit_reset = header("x-ratelimit-reset");
        let rate_limit_remaining = header("x-ratelimit-remaining");
        let retry_after = header("retry-after");
        let body = response.text().await.map_err(describe_error)?;

        debug!(
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "POST {}", GRAPHQL_URL
        );

        Ok(HttpReply {
            status,
            rate_limit_reset,
            rate_limit_remaining,
            retry_after,
            body,
        })
    }
}

// === GraphQL Types ===

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl GraphQLError {
    fn is_rate_limit(&self) -> bool {
        self.kind.as_deref() == Some("RATE_LIMITED")
            || self.message.to_lowercase().contains("rate limit")
    }
}

/// Envelope decoded before the payload so errors are visible whatever shape `data` has
#[derive(Debug, Deserialize)]
struct RawResponse {
    data: Option<serde_json::Value>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub cost: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<String>,
}

impl RateLimitInfo {
    pub fn quota(&self) -> Quota {
        Quota {
            remaining: self.remaining,
            reset_at: self.reset_at.as_deref().and_then(parse_reset_at),
        }
    }
}

/// A decoded `data` object that may report the quota
pub trait Payload: DeserializeOwned + Send {
    fn rate_limit(&self) -> Option<&RateLimitInfo>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    search: Option<SearchConnection>,
    rate_limit: Option<RateLimitInfo>,
}

impl Payload for SearchData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    repository_count: Option<u64>,
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Option<RepoNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

/// Search hit; non-repository hits come back as `{}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoNode {
    id: Option<String>,
    name: Option<String>,
    owner: Option<OwnerNode>,
    stargazer_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    login: String,
}

impl RepoNode {
    fn into_record(self, now: DateTime<Utc>) -> Option<Record> {
        Some(Record::new(
            self.id?,
            self.name?,
            self.owner?.login,
            self.stargazer_count?,
            now,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitData {
    rate_limit: Option<RateLimitInfo>,
}

impl Payload for RateLimitData {
    fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }
}

/// Classify one HTTP reply into a payload or a fetch error
fn interpret_reply<P: Payload>(reply: HttpReply) -> Result<P, FetchError> {
    let status = reply.status;

    if reply.is_throttled() {
        return Err(FetchError::RateLimited {
            reset_at: reply.throttle_reset(),
        });
    }

    if !status.is_success() {
        return Err(FetchError::transient(format!("GitHub API error {}", status)));
    }

    let raw: RawResponse = serde_json::from_str(&reply.body)
        .map_err(|e| FetchError::transient(format!("Parse error: {}", e)))?;

    if let Some(errors) = raw.errors.filter(|errors| !errors.is_empty()) {
        if errors.iter().any(GraphQLError::is_rate_limit) {
            let reset_at = raw
                .data
                .as_ref()
                .and_then(|data| data.get("rateLimit"))
                .and_then(|rl| rl.get("resetAt"))
                .and_then(|v| v.as_str())
                .and_then(parse_reset_at);
            return Err(FetchError::RateLimited { reset_at });
        }

        let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
        return Err(FetchError::upstream(messages.join("; ")));
    }

    let data = raw
        .data
        .ok_or_else(|| FetchError::transient("Response carried neither data nor errors"))?;

    serde_json::from_value(data).map_err(|e| FetchError::transient(format!("Parse error: {}", e)))
}

// === Pagination seam ===

/// Anything that can serve one page of repository search results
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn search_page(
        &self,
        filter: &str,
        first: usize,
        after: Option<&str>,
    ) -> Result<SearchPage, FetchError>;
}

/// GitHub GraphQL client: retries, backoff and quota waits around one transport
pub struct GitHubClient<T = HttpTransport> {
    transport: T,
    governor: RateLimitGovernor,
    retry: RetryPolicy,
}

impl<T: GraphQLTransport> GitHubClient<T> {
    pub fn new(transport: T, governor: RateLimitGovernor, retry: RetryPolicy) -> Self {
        Self {
            transport,
            governor,
            retry,
        }
    }

    async fn attempt<P: Payload>(&self, body: &serde_json::Value) -> Result<P, FetchError> {
        let reply = self
            .transport
            .post(body)
            .await
            .map_err(|e| FetchError::transient(format!("Request failed: {}", e)))?;
        interpret_reply(reply)
    }

    /// Execute one query until it succeeds, fails for good, or exhausts its retries
    ///
    /// Rate-limit waits are repeated as often as the endpoint asks for them. On success
    /// the reported quota goes through the governor, which may block before returning.
    pub async fn execute<P: Payload>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<P, FetchError> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let mut failures = 0;
        let mut state = RequestState::Attempting;

        loop {
            state = match state {
                RequestState::Attempting => {
                    let outcome = self.attempt::<P>(&body).await;
                    self.retry.next_state(outcome, failures)
                }
                RequestState::BackingOff { delay, reason } => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "GraphQL request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    RequestState::Attempting
                }
                RequestState::RateLimitedWait { reset_at } => {
                    self.governor.wait_for_reset(reset_at).await;
                    RequestState::Attempting
                }
                RequestState::Succeeded(payload) => {
                    if let Some(quota) = payload.rate_limit().map(RateLimitInfo::quota) {
                        self.governor.throttle(&quota).await;
                    }
                    return Ok(payload);
                }
                RequestState::Failed(e) => return Err(e),
            };
        }
    }

    /// Fetch one page of repository search results
    pub async fn search(
        &self,
        filter: &str,
        first: usize,
        after: Option<&str>,
    ) -> Result<SearchPage, FetchError> {
        let variables = serde_json::json!({
            "query": filter,
            "first": first,
            "after": after,
        });

        let data: SearchData = self.execute(REPO_SEARCH_QUERY, variables).await?;
        let quota = data.rate_limit.as_ref().map(RateLimitInfo::quota);
        let search = data
            .search
            .ok_or_else(|| FetchError::upstream("Response is missing search results"))?;

        let now = Utc::now();
        let records = search
            .nodes
            .into_iter()
            .flatten()
            .filter_map(|node| node.into_record(now))
            .collect();

        Ok(SearchPage {
            records,
            cursor: Cursor {
                end_cursor: search.page_info.end_cursor,
                has_next: search.page_info.has_next_page,
            },
            total_matches: search.repository_count,
            quota,
        })
    }

    /// Current GraphQL quota
    pub async fn rate_limit(&self) -> Result<RateLimitInfo, FetchError> {
        let data: RateLimitData = self
            .execute(RATE_LIMIT_QUERY, serde_json::json!({}))
            .await?;
        data.rate_limit
            .ok_or_else(|| FetchError::upstream("Response is missing rateLimit"))
    }
}

#[async_trait]
impl<T: GraphQLTransport> SearchSource for GitHubClient<T> {
    async fn search_page(
        &self,
        filter: &str,
        first: usize,
        after: Option<&str>,
    ) -> Result<SearchPage, FetchError> {
        self.search(filter, first, after).await
    }
}

/// Replays canned replies in order, recording every request body
#[cfg(test)]
pub(crate) struct ScriptedTransport {
    replies: std::sync::Mutex<std::collections::VecDeque<Result<HttpReply, String>>>,
    pub requests: std::sync::Mutex<Vec<serde_json::Value>>,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(replies: Vec<Result<HttpReply, String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl GraphQLTransport for ScriptedTransport {
    async fn post(&self, body: &serde_json::Value) -> Result<HttpReply, String> {
        self.requests.lock().unwrap().push(body.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::GovernorConfig;
    use reqwest::StatusCode;
    use serde_json::json;

    fn reply(status: StatusCode, body: serde_json::Value) -> Result<HttpReply, String> {
        Ok(HttpReply {
            status,
            body: body.to_string(),
            ..HttpReply::default()
        })
    }

    fn search_body(remaining: u64, reset_at: &str) -> serde_json::Value {
        json!({
            "data": {
                "search": {
                    "repositoryCount": 2,
                    "pageInfo": { "hasNextPage": true, "endCursor": "Y3Vyc29yOjI=" },
                    "nodes": [
                        { "id": "R_1", "name": "alpha", "owner": { "login": "octo" }, "stargazerCount": 10 },
                        {},
                        null,
                        { "id": "R_2", "name": "beta", "owner": { "login": "hub" }, "stargazerCount": 0 }
                    ]
                },
                "rateLimit": { "limit": 5000, "cost": 1, "remaining": remaining, "resetAt": reset_at }
            }
        })
    }

    fn ok_search() -> Result<HttpReply, String> {
        reply(StatusCode::OK, search_body(4_999, "2030-01-01T00:00:00Z"))
    }

    fn client(replies: Vec<Result<HttpReply, String>>, max_attempts: u32) -> GitHubClient<ScriptedTransport> {
        GitHubClient::new(
            ScriptedTransport::new(replies),
            RateLimitGovernor::new(GovernorConfig::default()),
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        )
    }

    // === Retry policy ===

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_next_state_transitions() {
        let policy = RetryPolicy::default();

        assert!(matches!(policy.next_state(Ok(1), 0), RequestState::Succeeded(1)));

        match policy.next_state::<()>(Err(FetchError::transient("boom")), 0) {
            RequestState::BackingOff { delay, reason } => {
                assert_eq!(delay, Duration::from_secs(1));
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected state {:?}", other),
        }

        // Fifth transient failure reaches the ceiling
        match policy.next_state::<()>(Err(FetchError::transient("boom")), 4) {
            RequestState::Failed(FetchError::Exhausted { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected state {:?}", other),
        }

        // Throttling never consumes the budget, even at the ceiling
        assert!(matches!(
            policy.next_state::<()>(Err(FetchError::RateLimited { reset_at: None }), 4),
            RequestState::RateLimitedWait { reset_at: None }
        ));

        assert!(matches!(
            policy.next_state::<()>(Err(FetchError::upstream("bad query")), 0),
            RequestState::Failed(FetchError::Upstream(_))
        ));
    }

    // === Reply classification ===

    #[test]
    fn test_interpret_throttling_status() {
        let throttled = [
            HttpReply {
                status: StatusCode::TOO_MANY_REQUESTS,
                rate_limit_reset: Some(1_700_000_000),
                ..HttpReply::default()
            },
            HttpReply {
                status: StatusCode::FORBIDDEN,
                rate_limit_reset: Some(1_700_000_000),
                rate_limit_remaining: Some(0),
                ..HttpReply::default()
            },
        ];
        for reply in throttled {
            match interpret_reply::<SearchData>(reply) {
                Err(FetchError::RateLimited { reset_at }) => {
                    assert_eq!(reset_at.unwrap().timestamp(), 1_700_000_000)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_interpret_forbidden_with_retry_after() {
        let reply = HttpReply {
            status: StatusCode::FORBIDDEN,
            retry_after: Some(90),
            ..HttpReply::default()
        };
        let before = Utc::now();
        match interpret_reply::<SearchData>(reply) {
            Err(FetchError::RateLimited { reset_at: Some(reset_at) }) => {
                let ahead = (reset_at - before).num_seconds();
                assert!((89..=91).contains(&ahead), "reset {}s ahead", ahead);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interpret_plain_forbidden_is_transient() {
        // Missing scope / SSO: quota left, no retry-after
        let reply = HttpReply {
            status: StatusCode::FORBIDDEN,
            rate_limit_remaining: Some(4_800),
            body: r#"{"message":"Resource not accessible by integration"}"#.into(),
            ..HttpReply::default()
        };
        assert!(matches!(
            interpret_reply::<SearchData>(reply),
            Err(FetchError::TransientNetwork(_))
        ));
    }

    #[test]
    fn test_interpret_server_errors_are_transient() {
        for status in [StatusCode::BAD_GATEWAY, StatusCode::INTERNAL_SERVER_ERROR, StatusCode::UNAUTHORIZED] {
            let result = interpret_reply::<SearchData>(reply(status, json!({})).unwrap());
            assert!(matches!(result, Err(FetchError::TransientNetwork(_))));
        }

        let garbage = HttpReply {
            status: StatusCode::OK,
            body: "<html>unicorn</html>".into(),
            ..HttpReply::default()
        };
        assert!(matches!(
            interpret_reply::<SearchData>(garbage),
            Err(FetchError::TransientNetwork(_))
        ));
    }

    #[test]
    fn test_interpret_embedded_rate_limit() {
        let body = json!({
            "data": { "rateLimit": { "remaining": 0, "resetAt": "2030-01-01T00:00:00Z" } },
            "errors": [{ "type": "RATE_LIMITED", "message": "API rate limit exceeded" }]
        });
        match interpret_reply::<SearchData>(reply(StatusCode::OK, body).unwrap()) {
            Err(FetchError::RateLimited { reset_at }) => {
                assert_eq!(reset_at, parse_reset_at("2030-01-01T00:00:00Z"))
            }
            other => panic!("unexpected {:?}", other),
        }

        // Message-only signal, no reset time available
        let body = json!({ "data": null, "errors": [{ "message": "You have exceeded a secondary rate limit" }] });
        assert!(matches!(
            interpret_reply::<SearchData>(reply(StatusCode::OK, body).unwrap()),
            Err(FetchError::RateLimited { reset_at: None })
        ));
    }

    #[test]
    fn test_interpret_other_embedded_errors_are_upstream() {
        let body = json!({
            "data": null,
            "errors": [
                { "type": "INVALID", "message": "Field 'nope' doesn't exist" },
                { "message": "Something else" }
            ]
        });
        match interpret_reply::<SearchData>(reply(StatusCode::OK, body).unwrap()) {
            Err(FetchError::Upstream(msg)) => {
                assert_eq!(msg, "Field 'nope' doesn't exist; Something else")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    // === Executor ===

    #[tokio::test(start_paused = true)]
    async fn test_search_decodes_page() {
        let gh = client(vec![ok_search()], 5);
        let page = gh.search("created:2010-01-01..2010-01-01", 50, None).await.unwrap();

        let ids: Vec<_> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["R_1", "R_2"]);
        assert_eq!(page.records[0].owner, "octo");
        assert_eq!(page.records[0].star_count, 10);
        assert_eq!(page.records[0].updated_at, page.records[0].fetched_at);
        assert_eq!(page.cursor.end_cursor.as_deref(), Some("Y3Vyc29yOjI="));
        assert!(page.cursor.has_next);
        assert_eq!(page.total_matches, Some(2));
        assert_eq!(page.quota.unwrap().remaining, Some(4_999));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_sends_variables() {
        let gh = client(vec![ok_search(), ok_search()], 5);
        gh.search("created:2010-01-01..2010-01-01 fork:false", 25, None).await.unwrap();
        gh.search("created:2010-01-01..2010-01-01 fork:false", 25, Some("abc")).await.unwrap();

        let requests = gh.transport.requests.lock().unwrap();
        assert_eq!(requests[0]["variables"]["query"], "created:2010-01-01..2010-01-01 fork:false");
        assert_eq!(requests[0]["variables"]["first"], 25);
        assert!(requests[0]["variables"]["after"].is_null());
        assert_eq!(requests[1]["variables"]["after"], "abc");
        assert!(requests[0]["query"].as_str().unwrap().contains("search("));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_backoff() {
        let gh = client(
            vec![
                Err("connection reset".into()),
                reply(StatusCode::BAD_GATEWAY, json!({})),
                ok_search(),
            ],
            5,
        );

        let started = tokio::time::Instant::now();
        let page = gh.search("q", 10, None).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(gh.transport.calls(), 3);
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_surfaces_exhausted() {
        let replies = (0..10)
            .map(|_| reply(StatusCode::SERVICE_UNAVAILABLE, json!({})))
            .collect();
        let gh = client(replies, 5);

        match gh.search("q", 10, None).await {
            Err(FetchError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(gh.transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_rate_limit_waits_and_retries_without_spending_budget() {
        let rate_limited = reply(
            StatusCode::OK,
            json!({ "errors": [{ "type": "RATE_LIMITED", "message": "API rate limit exceeded" }] }),
        );
        // A single allowed attempt: the rate-limit retry must not count
        let gh = client(vec![rate_limited.clone(), rate_limited, ok_search()], 1);

        let started = tokio::time::Instant::now();
        let page = gh.search("q", 10, None).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(gh.transport.calls(), 3);
        // Two fallback waits (no resetAt)
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_waits_until_header_reset() {
        let reset = Utc::now().timestamp() as u64 + 20;
        let forbidden = Ok(HttpReply {
            status: StatusCode::FORBIDDEN,
            rate_limit_reset: Some(reset),
            rate_limit_remaining: Some(0),
            body: "{}".into(),
            ..HttpReply::default()
        });
        let gh = client(vec![forbidden, ok_search()], 1);

        let started = tokio::time::Instant::now();
        gh.search("q", 10, None).await.unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(19), "waited {:?}", waited);
        assert!(waited <= Duration::from_secs(26), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_plain_forbidden_is_bounded() {
        let replies = (0..20)
            .map(|_| reply(StatusCode::FORBIDDEN, json!({ "message": "Must have admin rights" })))
            .collect();
        let gh = client(replies, 5);

        let outcome = tokio::time::timeout(Duration::from_secs(3_600), gh.search("q", 10, None)).await;

        match outcome {
            Ok(Err(FetchError::Exhausted { attempts, last_error })) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("403"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(gh.transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_error_is_not_retried() {
        let body = json!({ "errors": [{ "type": "INVALID", "message": "Invalid search query" }] });
        let gh = client(vec![reply(StatusCode::OK, body), ok_search()], 5);

        let err = gh.search("q", 10, None).await.unwrap_err();
        assert_eq!(err, FetchError::upstream("Invalid search query"));
        assert_eq!(gh.transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_quota_blocks_before_returning() {
        let reset_at = (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339();
        let low = reply(StatusCode::OK, search_body(5, &reset_at));
        let gh = GitHubClient::new(
            ScriptedTransport::new(vec![low]),
            RateLimitGovernor::new(GovernorConfig {
                low_water: 10,
                ..GovernorConfig::default()
            }),
            RetryPolicy::default(),
        );

        let started = tokio::time::Instant::now();
        gh.search("q", 10, None).await.unwrap();

        // 30s to reset plus the 5s safety margin
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(34), "waited {:?}", waited);
        assert!(waited <= Duration::from_secs(35), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_query() {
        let body = json!({
            "data": { "rateLimit": { "limit": 5000, "cost": 1, "remaining": 4321, "resetAt": "2030-01-01T00:00:00Z" } }
        });
        let gh = client(vec![reply(StatusCode::OK, body)], 5);

        let info = gh.rate_limit().await.unwrap();
        assert_eq!(info.limit, Some(5000));
        assert_eq!(info.remaining, Some(4321));
        assert_eq!(info.cost, Some(1));
        assert!(info.quota().reset_at.is_some());
    }
}

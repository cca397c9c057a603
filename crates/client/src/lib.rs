//! Sift client: authenticated search requests against Zoekt-compatible
//! nodes, with multi-node fan-out and aggregation.
//!
//! Collaborators are injected at construction: a node resolver, an HTTP
//! transport, a token signer, and an access policy. Nothing here reaches
//! for globals, so the whole surface is mockable.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sift_core::{
    CountSource, InvalidSearchMode, MultiNodeResponse, NodeId, Response, SearchMode,
    SearchPayload,
};

pub mod auth;

pub use auth::{JwtSigner, NoSigner, TokenSigner};

/// Header carrying the signed bearer credential. Distinct from the standard
/// Authorization header, which stays reserved for basic auth.
pub const API_REQUEST_HEADER: &str = "Sift-Api-Request";

/// A backend search node as known to the external registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub index_base_url: String,
    pub search_base_url: String,
}

/// Resolves node ids against the cluster topology. Read-only here.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, id: NodeId) -> Option<Node>;
}

/// In-memory resolver backed by a fixed node list (CLI, tests).
#[derive(Debug, Default)]
pub struct StaticNodes {
    nodes: FxHashMap<NodeId, Node>,
}

impl StaticNodes {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self { nodes: nodes.into_iter().map(|n| (n.id, n)).collect() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeResolver for StaticNodes {
    fn resolve(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }
}

/// Whether the caller may search across project boundaries. Checked once
/// per fan-out; a denial short-circuits to an empty successful aggregate.
pub trait AccessPolicy: Send + Sync {
    fn allow_cross_project(&self) -> bool;
}

/// Policy for trusted internal callers.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allow_cross_project(&self) -> bool {
        true
    }
}

/// Project scoping for a single-node query. `Any` is the global-search
/// sentinel used elsewhere in the stack; this layer refuses it outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectScope {
    Ids(Vec<i64>),
    Any,
}

/// Runtime environment gate for payload logging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Development,
    Test,
    Production,
}

/// Client behavior flags, injected at construction.
///
/// | field | default | effect |
/// |---|---|---|
/// | `counts` | `Reported` | trust backend counters, or recompute from `Files` |
/// | `traversal_scoped` | `false` | fan-out posts search-equivalent queries to `/api/search` instead of the webserver proxy route |
/// | `log_payloads` | `false` | debug-log request/response bodies; only outside `Production` |
/// | `request_timeout` | 30s | per-request transport deadline; expiry surfaces as `Connection` |
/// | `username_file`/`password_file` | unset | basic-auth credential files, read fresh per request |
#[derive(Debug, Clone)]
pub struct Config {
    pub counts: CountSource,
    pub traversal_scoped: bool,
    pub log_payloads: bool,
    pub env: RuntimeEnv,
    pub request_timeout: Duration,
    pub username_file: Option<PathBuf>,
    pub password_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            counts: CountSource::Reported,
            traversal_scoped: false,
            log_payloads: false,
            env: RuntimeEnv::Production,
            request_timeout: Duration::from_secs(30),
            username_file: None,
            password_file: None,
        }
    }
}

impl Config {
    fn debug_enabled(&self) -> bool {
        self.log_payloads && self.env != RuntimeEnv::Production
    }
}

/// Client errors suitable for surfacing to callers as-is.
///
/// `InvalidArgument` is caller misuse, raised before any I/O and never
/// retried. `Connection` is the single kind every transport, status, and
/// parse failure collapses into; the backend's own diagnostic text is
/// preserved where available.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection: {0}")]
    Connection(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<InvalidSearchMode> for ClientError {
    fn from(e: InvalidSearchMode) -> Self {
        ClientError::InvalidArgument(e.to_string())
    }
}

/// Basic-auth material resolved for one request. Attached to every outbound
/// request, even when unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One fully-resolved outbound request handed to the transport.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub url: String,
    pub body: serde_json::Value,
    /// Full header value, `Bearer <token>`; the token may be empty but the
    /// header is never omitted.
    pub bearer: String,
    pub basic_auth: BasicAuth,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Blocking-per-request HTTP seam. The real implementation is reqwest;
/// tests substitute a recorder.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, request: &SearchRequest) -> anyhow::Result<RawResponse>;
}

/// reqwest-backed transport. TLS via rustls; one shared connection pool.
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { inner: reqwest::Client::new() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, request: &SearchRequest) -> anyhow::Result<RawResponse> {
        let mut builder = self
            .inner
            .post(&request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(API_REQUEST_HEADER, &request.bearer)
            .json(&request.body);
        if let Some(username) = &request.basic_auth.username {
            builder = builder.basic_auth(username, request.basic_auth.password.as_deref());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse { status, body })
    }
}

/// The search client. One instance serves many concurrent callers.
pub struct Client {
    nodes: Arc<dyn NodeResolver>,
    transport: Arc<dyn HttpTransport>,
    signer: Arc<dyn TokenSigner>,
    access: Arc<dyn AccessPolicy>,
    config: Config,
}

impl Client {
    pub fn new(
        nodes: Arc<dyn NodeResolver>,
        transport: Arc<dyn HttpTransport>,
        signer: Arc<dyn TokenSigner>,
        config: Config,
    ) -> Self {
        Self { nodes, transport, signer, access: Arc::new(AllowAll), config }
    }

    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    /// Query a single node. Project scoping is mandatory: an empty id list
    /// or the `Any` sentinel fails before anything goes on the wire.
    pub async fn search(
        &self,
        query: &str,
        num: usize,
        scope: &ProjectScope,
        node_id: NodeId,
        mode: SearchMode,
    ) -> ClientResult<Response> {
        let ids = validate_scope(scope)?;
        let node = self.resolve(node_id)?;
        let t0 = Instant::now();
        info!(node = node_id, num, mode = mode.as_str(), "client: search start");
        let url = format!("{}/api/search", node.index_base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "Q": scoped_query(query, mode, ids), "Num": num });
        let payload = self.post_search(&url, body).await?;
        let response = Response::new(payload, self.config.counts);
        info!(
            node = node_id,
            files = response.file_count(),
            ok = response.is_success(),
            took_ms = %t0.elapsed().as_millis(),
            "client: search ok"
        );
        Ok(response)
    }

    /// Fan a query out to every targeted node and aggregate the results.
    ///
    /// Aggregation order is the `targets` order regardless of which node
    /// answers first. A node that cannot be queried becomes a failed
    /// constituent rather than an error; callers read the aggregate's
    /// success flag and first failure message.
    pub async fn search_proxy(
        &self,
        query: &str,
        num: usize,
        targets: &[(NodeId, Vec<i64>)],
        mode: SearchMode,
    ) -> ClientResult<MultiNodeResponse> {
        if !self.access.allow_cross_project() {
            info!("client: fan-out skipped, cross-project read not allowed");
            return Ok(MultiNodeResponse::empty());
        }
        if targets.is_empty() {
            return Ok(MultiNodeResponse::empty());
        }
        // Validate every entry before the first request goes out.
        let mut nodes = Vec::with_capacity(targets.len());
        for (node_id, ids) in targets {
            if ids.is_empty() {
                return Err(ClientError::InvalidArgument(format!(
                    "project ids for node {node_id} must not be empty"
                )));
            }
            nodes.push((self.resolve(*node_id)?, ids.as_slice()));
        }

        let t0 = Instant::now();
        let calls = nodes
            .iter()
            .map(|(node, ids)| self.query_node(query, num, node, ids, mode));
        let results = futures::future::join_all(calls).await;

        let responses: Vec<(NodeId, Response)> = nodes
            .iter()
            .zip(results)
            .map(|((node, _), result)| {
                let response = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(node = node.id, error = %e, "client: node query failed");
                        Response::from_error(e.to_string())
                    }
                };
                (node.id, response)
            })
            .collect();

        let aggregate = MultiNodeResponse::new(responses);
        info!(
            nodes = targets.len(),
            files = aggregate.file_count(),
            ok = aggregate.is_success(),
            took_ms = %t0.elapsed().as_millis(),
            "client: fan-out done"
        );
        Ok(aggregate)
    }

    async fn query_node(
        &self,
        query: &str,
        num: usize,
        node: &Node,
        ids: &[i64],
        mode: SearchMode,
    ) -> ClientResult<Response> {
        let base = node.search_base_url.trim_end_matches('/');
        let (url, body) = if self.config.traversal_scoped {
            (
                format!("{base}/api/search"),
                serde_json::json!({ "Q": scoped_query(query, mode, ids), "Num": num }),
            )
        } else {
            (
                format!("{base}/webserver/api/v2/search"),
                serde_json::json!({ "Q": mode_query(query, mode), "Num": num, "RepoIds": ids }),
            )
        };
        let payload = self.post_search(&url, body).await?;
        Ok(Response::new(payload, self.config.counts))
    }

    async fn post_search(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> ClientResult<SearchPayload> {
        let t0 = Instant::now();
        let request = SearchRequest {
            url: url.to_string(),
            body,
            bearer: format!("Bearer {}", self.signer.sign().unwrap_or_default()),
            basic_auth: self.read_basic_auth()?,
            timeout: self.config.request_timeout,
        };
        if self.config.debug_enabled() {
            debug!(url = %request.url, body = %request.body, "client: outgoing search request");
        }
        metrics::counter!("search_requests_total", 1u64);

        let raw = match self.transport.post_json(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                metrics::counter!("search_request_errors_total", 1u64, "kind" => "transport");
                return Err(ClientError::Connection(e.to_string()));
            }
        };
        if self.config.debug_enabled() {
            debug!(
                status = raw.status,
                body = %String::from_utf8_lossy(&raw.body),
                "client: raw search response"
            );
        }
        if !(200..300).contains(&raw.status) {
            metrics::counter!("search_request_errors_total", 1u64, "kind" => "http_status");
            let text = String::from_utf8_lossy(&raw.body);
            return Err(ClientError::Connection(format!(
                "search returned status {}: {}",
                raw.status,
                text.trim()
            )));
        }
        let payload: SearchPayload = serde_json::from_slice(&raw.body).map_err(|e| {
            metrics::counter!("search_request_errors_total", 1u64, "kind" => "parse");
            ClientError::Connection(format!("parsing search response: {e}"))
        })?;
        metrics::histogram!("search_request_ms", t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(payload)
    }

    fn read_basic_auth(&self) -> ClientResult<BasicAuth> {
        let read = |path: &PathBuf| {
            auth::read_credential(path).map_err(|e| {
                ClientError::Connection(format!("reading credential file {}: {e}", path.display()))
            })
        };
        let username = self.config.username_file.as_ref().map(read).transpose()?;
        let password = self.config.password_file.as_ref().map(read).transpose()?;
        Ok(BasicAuth { username, password })
    }

    fn resolve(&self, node_id: NodeId) -> ClientResult<Node> {
        self.nodes
            .resolve(node_id)
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown search node: {node_id}")))
    }
}

fn validate_scope(scope: &ProjectScope) -> ClientResult<&[i64]> {
    match scope {
        ProjectScope::Any => Err(ClientError::InvalidArgument(
            "global project scope is not supported here; list project ids explicitly".into(),
        )),
        ProjectScope::Ids(ids) if ids.is_empty() => Err(ClientError::InvalidArgument(
            "project ids must not be empty".into(),
        )),
        ProjectScope::Ids(ids) => Ok(ids),
    }
}

fn mode_query(query: &str, mode: SearchMode) -> String {
    match mode {
        SearchMode::Regex => query.to_string(),
        // The backend only speaks regex; exact match is a fully escaped one.
        SearchMode::Exact => regex::escape(query),
    }
}

fn scoped_query(query: &str, mode: SearchMode, ids: &[i64]) -> String {
    let repos: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    format!("({}) repo:^({})$", mode_query(query, mode), repos.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    const EMPTY_OK: &str = r#"{"Result":{"FileCount":0,"MatchCount":0,"Files":null}}"#;

    #[derive(Clone)]
    enum MockReply {
        Reply { status: u16, body: String },
        Fail(String),
    }

    struct MockTransport {
        calls: Mutex<Vec<SearchRequest>>,
        routes: Vec<(String, MockReply)>,
    }

    impl MockTransport {
        fn new(routes: Vec<(&str, MockReply)>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                routes: routes
                    .into_iter()
                    .map(|(frag, reply)| (frag.to_string(), reply))
                    .collect(),
            })
        }

        fn ok(body: &str) -> MockReply {
            MockReply::Reply { status: 200, body: body.to_string() }
        }

        fn status(status: u16, body: &str) -> MockReply {
            MockReply::Reply { status, body: body.to_string() }
        }

        fn calls(&self) -> Vec<SearchRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for MockTransport {
        async fn post_json(&self, request: &SearchRequest) -> anyhow::Result<RawResponse> {
            self.calls.lock().unwrap().push(request.clone());
            let reply = self
                .routes
                .iter()
                .find(|(frag, _)| request.url.contains(frag.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| MockTransport::ok(EMPTY_OK));
            match reply {
                MockReply::Reply { status, body } => {
                    Ok(RawResponse { status, body: body.into_bytes() })
                }
                MockReply::Fail(msg) => Err(anyhow::anyhow!(msg)),
            }
        }
    }

    struct DenyAll;

    impl AccessPolicy for DenyAll {
        fn allow_cross_project(&self) -> bool {
            false
        }
    }

    fn test_nodes() -> Arc<StaticNodes> {
        Arc::new(StaticNodes::new([
            Node {
                id: 1,
                index_base_url: "http://zoekt-1.internal".into(),
                search_base_url: "http://zoekt-1.internal".into(),
            },
            Node {
                id: 2,
                index_base_url: "http://zoekt-2.internal".into(),
                search_base_url: "http://zoekt-2.internal".into(),
            },
        ]))
    }

    fn client_with(transport: Arc<MockTransport>, config: Config) -> Client {
        Client::new(test_nodes(), transport, Arc::new(NoSigner), config)
    }

    fn ids(values: &[i64]) -> ProjectScope {
        ProjectScope::Ids(values.to_vec())
    }

    #[tokio::test]
    async fn empty_project_ids_fail_before_any_request() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        let err = client
            .search("foo", 20, &ids(&[]), 1, SearchMode::Regex)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)), "{err}");
        assert!(transport.calls().is_empty(), "no network call expected");
    }

    #[tokio::test]
    async fn global_scope_sentinel_is_rejected() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        let err = client
            .search("foo", 20, &ProjectScope::Any, 1, SearchMode::Regex)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_node_is_an_argument_error() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        let err = client
            .search("foo", 20, &ids(&[1]), 99, SearchMode::Regex)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn invalid_mode_string_is_an_argument_error() {
        let err: ClientError = "dummy".parse::<SearchMode>().unwrap_err().into();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        assert!(!matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn bearer_header_is_present_even_without_a_signer() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer, "Bearer ");
        assert_eq!(calls[0].basic_auth, BasicAuth::default());
    }

    #[tokio::test]
    async fn bearer_header_carries_a_signed_token() {
        let transport = MockTransport::new(vec![]);
        let client = Client::new(
            test_nodes(),
            transport.clone(),
            Arc::new(JwtSigner::new(b"secret", "sift-client", "zoekt")),
            Config::default(),
        );
        client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap();
        let bearer = &transport.calls()[0].bearer;
        assert!(bearer.starts_with("Bearer ey"), "got {bearer}");
    }

    #[tokio::test]
    async fn basic_auth_is_read_fresh_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("username");
        let pass_path = dir.path().join("password");
        write!(std::fs::File::create(&user_path).unwrap(), "svc-search\n").unwrap();
        write!(std::fs::File::create(&pass_path).unwrap(), "s3cret\r\n").unwrap();

        let transport = MockTransport::new(vec![]);
        let config = Config {
            username_file: Some(user_path),
            password_file: Some(pass_path),
            ..Config::default()
        };
        let client = client_with(transport.clone(), config);
        client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap();
        let auth = transport.calls()[0].basic_auth.clone();
        assert_eq!(auth.username.as_deref(), Some("svc-search"));
        assert_eq!(auth.password.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn search_scopes_query_by_repository_filter() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        client
            .search("foo.*bar", 20, &ids(&[11, 12]), 1, SearchMode::Regex)
            .await
            .unwrap();
        let call = &transport.calls()[0];
        assert_eq!(call.url, "http://zoekt-1.internal/api/search");
        assert_eq!(call.body["Q"], "(foo.*bar) repo:^(11|12)$");
        assert_eq!(call.body["Num"], 20);
    }

    #[tokio::test]
    async fn exact_mode_escapes_regex_metacharacters() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        client
            .search("call(a.b)", 20, &ids(&[11]), 1, SearchMode::Exact)
            .await
            .unwrap();
        let q = transport.calls()[0].body["Q"].as_str().unwrap().to_string();
        assert!(q.starts_with(r"(call\(a\.b\))"), "got {q}");
    }

    #[tokio::test]
    async fn per_request_timeout_is_propagated() {
        let transport = MockTransport::new(vec![]);
        let config = Config { request_timeout: Duration::from_secs(5), ..Config::default() };
        let client = client_with(transport.clone(), config);
        client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap();
        assert_eq!(transport.calls()[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_2xx_maps_to_connection_error_preserving_body() {
        let transport = MockTransport::new(vec![(
            "zoekt-1",
            MockTransport::status(401, "Unauthorized: invalid JWT token"),
        )]);
        let client = client_with(transport, Config::default());
        let err = client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap_err();
        match err {
            ClientError::Connection(msg) => {
                assert!(msg.contains("401"), "{msg}");
                assert!(msg.contains("Unauthorized: invalid JWT token"), "{msg}");
            }
            other => panic!("expected connection error, got {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_maps_to_connection_error() {
        let transport =
            MockTransport::new(vec![("zoekt-1", MockTransport::ok("not json at all"))]);
        let client = client_with(transport, Config::default());
        let err = client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)), "{err}");
    }

    #[tokio::test]
    async fn transport_failure_maps_to_connection_error() {
        let transport = MockTransport::new(vec![(
            "zoekt-1",
            MockReply::Fail("connect timeout".to_string()),
        )]);
        let client = client_with(transport, Config::default());
        let err = client
            .search("foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap_err();
        match err {
            ClientError::Connection(msg) => assert!(msg.contains("connect timeout"), "{msg}"),
            other => panic!("expected connection error, got {other}"),
        }
    }

    #[tokio::test]
    async fn backend_query_errors_are_normal_responses() {
        let transport = MockTransport::new(vec![(
            "zoekt-1",
            MockTransport::ok(r#"{"Error":"error parsing regexp: missing closing )"}"#),
        )]);
        let client = client_with(transport, Config::default());
        let response = client
            .search("(foo", 20, &ids(&[1]), 1, SearchMode::Regex)
            .await
            .unwrap();
        assert!(!response.is_success());
        assert_eq!(
            response.error_message(),
            Some("error parsing regexp: missing closing )")
        );
    }

    #[tokio::test]
    async fn derived_counts_follow_the_configured_source() {
        let transport = MockTransport::new(vec![(
            "zoekt-1",
            MockTransport::ok(
                r#"{"Result":{"FileCount":99,"MatchCount":99,"Files":[
                    {"FileName":"a.rb","RepositoryID":11,"Score":1.0,"LineMatches":[{},{}]}
                ]}}"#,
            ),
        )]);
        let config = Config { counts: CountSource::Derived, ..Config::default() };
        let client = client_with(transport, config);
        let response = client
            .search("foo", 20, &ids(&[11]), 1, SearchMode::Regex)
            .await
            .unwrap();
        assert_eq!(response.file_count(), 1);
        assert_eq!(response.match_count(), 2);
    }

    #[tokio::test]
    async fn fan_out_without_cross_project_access_short_circuits() {
        let transport = MockTransport::new(vec![]);
        let client =
            client_with(transport.clone(), Config::default()).with_access_policy(Arc::new(DenyAll));
        let aggregate = client
            .search_proxy("foo", 20, &[(1, vec![11])], SearchMode::Regex)
            .await
            .unwrap();
        assert!(aggregate.is_success());
        assert_eq!(aggregate.file_count(), 0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn fan_out_with_no_targets_short_circuits() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        let aggregate = client
            .search_proxy("foo", 20, &[], SearchMode::Regex)
            .await
            .unwrap();
        assert!(aggregate.is_success());
        assert!(aggregate.responses().is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn fan_out_rejects_empty_ids_for_a_target_before_any_request() {
        let transport = MockTransport::new(vec![]);
        let client = client_with(transport.clone(), Config::default());
        let err = client
            .search_proxy(
                "foo",
                20,
                &[(1, vec![11]), (2, vec![])],
                SearchMode::Regex,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn fan_out_routes_through_the_webserver_proxy_and_aggregates() {
        let transport = MockTransport::new(vec![
            (
                "zoekt-1",
                MockTransport::ok(
                    r#"{"Result":{"FileCount":2,"MatchCount":10,"Files":[
                        {"FileName":"a.rb","RepositoryID":11,"Score":9.5},
                        {"FileName":"b.rb","RepositoryID":12,"Score":2.0}
                    ]}}"#,
                ),
            ),
            (
                "zoekt-2",
                MockTransport::ok(
                    r#"{"Result":{"FileCount":1,"MatchCount":3,"Files":[
                        {"FileName":"c.rb","RepositoryID":21,"Score":5.0}
                    ]}}"#,
                ),
            ),
        ]);
        let client = client_with(transport.clone(), Config::default());
        let aggregate = client
            .search_proxy(
                "foo",
                20,
                &[(1, vec![11, 12]), (2, vec![21])],
                SearchMode::Regex,
            )
            .await
            .unwrap();

        assert!(aggregate.is_success());
        assert_eq!(aggregate.file_count(), 3);
        assert_eq!(aggregate.match_count(), 13);
        let names: Vec<_> = aggregate.files().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.rb", "c.rb", "b.rb"]);

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert!(call.url.ends_with("/webserver/api/v2/search"), "{}", call.url);
            assert_eq!(call.body["Q"], "foo");
        }
        let first = calls.iter().find(|c| c.url.contains("zoekt-1")).unwrap();
        assert_eq!(first.body["RepoIds"], serde_json::json!([11, 12]));
    }

    #[tokio::test]
    async fn fan_out_traversal_mode_issues_search_equivalent_calls() {
        let transport = MockTransport::new(vec![]);
        let config = Config { traversal_scoped: true, ..Config::default() };
        let client = client_with(transport.clone(), config);
        client
            .search_proxy("foo", 20, &[(1, vec![11, 12])], SearchMode::Regex)
            .await
            .unwrap();
        let call = &transport.calls()[0];
        assert!(call.url.ends_with("/api/search"), "{}", call.url);
        assert_eq!(call.body["Q"], "(foo) repo:^(11|12)$");
        assert!(call.body.get("RepoIds").is_none());
    }

    #[tokio::test]
    async fn fan_out_node_failure_becomes_a_constituent_failure() {
        let transport = MockTransport::new(vec![
            (
                "zoekt-1",
                MockTransport::ok(
                    r#"{"Result":{"FileCount":1,"MatchCount":1,"Files":[
                        {"FileName":"a.rb","RepositoryID":11,"Score":1.0}
                    ]}}"#,
                ),
            ),
            ("zoekt-2", MockReply::Fail("connection refused".to_string())),
        ]);
        let client = client_with(transport, Config::default());
        let aggregate = client
            .search_proxy("foo", 20, &[(1, vec![11]), (2, vec![21])], SearchMode::Regex)
            .await
            .unwrap();
        assert!(!aggregate.is_success());
        let msg = aggregate.error_message().unwrap();
        assert!(msg.contains("connection refused"), "{msg}");
        // The healthy node's results still count.
        assert_eq!(aggregate.file_count(), 1);
        assert_eq!(aggregate.responses().len(), 2);
    }
}

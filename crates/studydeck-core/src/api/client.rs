//! Request dispatcher for the study server API.
//!
//! `ApiClient::send` attaches the stored access token, backs off on 429, and
//! turns a 401 into a single coordinated token refresh followed by one replay
//! of the original call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::refresh::{RefreshCoordinator, RefreshEndpoint};
use super::{ApiError, ApiResponse, PendingRequest};
use crate::auth::{CredentialStore, SessionEvent, SessionEventBus};
use crate::config::Config;
use crate::models::{Credentials, Profile};

// ============================================================================
// Constants
// ============================================================================

pub const SIGNIN_PATH: &str = "/api/auth/signin";
pub const SIGNOUT_PATH: &str = "/api/auth/signout";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const PROFILE_PATH: &str = "/api/users/me";

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Body of sign-in and refresh responses.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(rename = "accessToken", alias = "token")]
    pub(crate) access_token: String,
}

/// API client for the study server.
/// Clone is cheap - the reqwest client, token store, event bus and refresh
/// coordinator are all shared between clones.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: Arc<Config>,
    credentials: CredentialStore,
    events: SessionEventBus,
    refresh: RefreshCoordinator,
    initial_backoff: Duration,
}

impl ApiClient {
    /// Create a client for one session. The cookie jar it builds holds the
    /// refresh credential, so all calls of a session must share this client.
    pub fn new(config: &Config, credentials: CredentialStore, events: SessionEventBus) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .cookie_store(true)
            .build()?;

        let endpoint = RefreshEndpoint::new(http.clone(), config.url_for(REFRESH_PATH));
        let refresh = RefreshCoordinator::new(endpoint, credentials.clone(), events.clone());

        Ok(Self {
            http,
            config: Arc::new(config.clone()),
            credentials,
            events,
            refresh,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first 429 backoff delay (it doubles on each retry).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.events
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Send a call with the stored token attached.
    ///
    /// A 401 is recovered transparently when a refresh succeeds: the call is
    /// replayed once with the new token. A replay that is still rejected
    /// fails with `ReplayExhausted`. Other statuses and transport errors are
    /// returned as they are and never touch the session.
    pub async fn send(&self, request: PendingRequest) -> Result<ApiResponse, ApiError> {
        let mut request = request;
        let mut token = self.credentials.token();

        loop {
            let response = self.dispatch(&request, token.as_deref()).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return response.error_for_status();
            }

            if request.is_refresh() {
                // Never route the refresh endpoint back into the coordinator
                warn!("Refresh endpoint rejected the session");
                self.end_session(true);
                return Err(ApiError::RefreshFailed(
                    "refresh endpoint returned 401".to_string(),
                ));
            }

            if request.retried {
                warn!(method = %request.method, path = %request.path, "Still unauthorized after refresh");
                self.end_session(false);
                return Err(ApiError::ReplayExhausted);
            }

            debug!(method = %request.method, path = %request.path, "Unauthorized, waiting for fresh token");
            let fresh = self.refresh.await_fresh_token().await?;
            request.retried = true;
            token = Some(fresh);
        }
    }

    /// One HTTP exchange, retrying only on 429. No session logic.
    async fn dispatch(
        &self,
        request: &PendingRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.config.url_for(&request.path);
        // The refresh endpoint authenticates by cookie only
        let token = if request.is_refresh() { None } else { token };
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut builder = self
                .http
                .request(request.method.into(), &url)
                .header(header::ACCEPT, "application/json");
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            debug!(
                method = %request.method,
                path = %request.path,
                authenticated = token.is_some(),
                retried = request.retried,
                "Dispatching request"
            );
            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > self.config.max_rate_limit_retries {
                    return Err(ApiError::RateLimited);
                }
                let backoff_ms = backoff.as_millis() as u64;
                warn!(path = %request.path, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await?;
            return Ok(ApiResponse { status, body });
        }
    }

    /// Drop the stored token and announce the logout. When `always_publish`
    /// is false the event only fires if a token was actually removed, so a
    /// burst of failing replays produces a single logout.
    fn end_session(&self, always_publish: bool) {
        let removed = match self.credentials.clear() {
            Ok(previous) => previous.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to clear access token");
                false
            }
        };
        if removed || always_publish {
            self.events.publish(SessionEvent::LoggedOut);
        }
    }

    // ===== Typed helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(PendingRequest::get(path)).await?.json()
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = PendingRequest::post(path).with_json(body)?;
        self.send(request).await?.json()
    }

    /// Fetch the signed-in user's profile
    pub async fn fetch_profile(&self) -> Result<Profile, ApiError> {
        self.get_json(PROFILE_PATH).await
    }

    /// Exchange credentials for an access token. Bypasses the refresh
    /// coordinator: there is no session to renew yet.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<String, ApiError> {
        let request = PendingRequest::post(SIGNIN_PATH).with_json(credentials)?;
        let response = self.dispatch(&request, None).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }

        let token: TokenResponse = response.error_for_status()?.json()?;
        info!(email = %credentials.email, "Signed in");
        Ok(token.access_token)
    }

    /// Tell the server the session is over. Errors, including a 401, are
    /// returned without attempting a refresh.
    pub async fn sign_out(&self) -> Result<(), ApiError> {
        let token = self.credentials.token();
        self.dispatch(&PendingRequest::post(SIGNOUT_PATH), token.as_deref())
            .await?
            .error_for_status()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SharedOrigin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        let origin = SharedOrigin::new();
        let credentials = CredentialStore::new(Arc::new(origin.open_tab()));
        ApiClient::new(&Config::for_server(server.uri()), credentials, SessionEventBus::new())
            .unwrap()
            .with_initial_backoff(Duration::from_millis(5))
    }

    fn count_logouts(client: &ApiClient) -> (Arc<AtomicUsize>, crate::Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = client.events().subscribe(move |e| {
            if *e == SessionEvent::LoggedOut {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, sub)
    }

    #[tokio::test]
    async fn test_bearer_header_attached_when_token_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cards"))
            .and(header("authorization", "Bearer tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        api.credentials().set_token("tok1").unwrap();
        let response = api.send(PendingRequest::get("/api/cards")).await.unwrap();
        assert_eq!(response.body, "[]");
        server.verify().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_request_goes_out_without_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/categories"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let api = client(&server);
        api.send(PendingRequest::get("/api/categories")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_server_error_passes_through_without_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cards"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = client(&server);
        api.credentials().set_token("tok1").unwrap();
        let (logouts, _sub) = count_logouts(&api);

        let err = api.send(PendingRequest::get("/api/cards")).await.unwrap_err();
        assert!(matches!(err, ApiError::ServerError(ref body) if body == "db down"));
        assert_eq!(api.credentials().token().as_deref(), Some("tok1"));
        assert_eq!(logouts.load(Ordering::SeqCst), 0);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_network_error_passes_through() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let origin = SharedOrigin::new();
        let credentials = CredentialStore::new(Arc::new(origin.open_tab()));
        credentials.set_token("tok1").unwrap();
        let api = ApiClient::new(&Config::for_server(uri), credentials, SessionEventBus::new()).unwrap();

        let err = api.send(PendingRequest::get("/api/cards")).await.unwrap_err();
        assert!(matches!(err, ApiError::NetworkError(_)));
        assert_eq!(api.credentials().token().as_deref(), Some("tok1"));
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/notifications"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let api = client(&server);
        let response = api.send(PendingRequest::get("/api/notifications")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let api = client(&server);
        let err = api.send(PendingRequest::get("/api/notifications")).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited));
        // First attempt plus three retries
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_sign_in_returns_token_without_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SIGNIN_PATH))
            .and(body_json(serde_json::json!({"email": "ada@example.com", "password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"accessToken": "tok1"})))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        api.credentials().set_token("stale").unwrap();
        let token = api.sign_in(&Credentials::new("ada@example.com", "pw")).await.unwrap();
        assert_eq!(token, "tok1");

        let requests = server.received_requests().await.unwrap();
        assert!(!requests[0].headers.contains_key("authorization"));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_sign_in_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SIGNIN_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = client(&server);
        let err = api.sign_in(&Credentials::new("ada@example.com", "wrong")).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_post_json_sends_body_and_parses_reply() {
        #[derive(Deserialize)]
        struct Created {
            id: u32,
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cards"))
            .and(body_json(serde_json::json!({"front": "gato", "back": "cat"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 9})))
            .mount(&server)
            .await;

        let api = client(&server);
        let created: Created = api
            .post_json("/api/cards", &serde_json::json!({"front": "gato", "back": "cat"}))
            .await
            .unwrap();
        assert_eq!(created.id, 9);
    }
}

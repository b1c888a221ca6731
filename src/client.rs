//! Blocking HTTP client for the Muller Intuitiv cloud API.
//!
//! - Blocking client using `ureq` (no async); shared between worker threads.
//! - Covers the endpoints the integration needs: homesdata, homestatus, setstate and
//!   gethomemeasure.
//! - Every answer is checked for the upstream `{"error": {...}}` envelope.
//!
//! Authentication
//! - OAuth2 password grant, then refresh-token grant, falling back to the password grant
//!   when a refresh is refused.
//! - Refreshes are coalesced: the token lives behind one mutex, so threads discovering
//!   expiry at the same time wait for a single refresh.
//! - A request answered with 401 (or an invalid/expired token error code) invalidates the
//!   token it used, refreshes once and retries once.

use http::StatusCode;
use log::{debug, info, warn};
use serde::de::{DeserializeOwned, IgnoredAny};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::models::intuis::*;
use crate::utils::excerpt;

pub const DEFAULT_BASE_URL: &str = "https://app.muller-intuitiv.net";
const OAUTH_TOKEN_PATH: &str = "/oauth2/token";
const OAUTH_SCOPE: &str = "read_muller write_muller";
const OAUTH_USER_PREFIX: &str = "muller";
const HOMESDATA_PATH: &str = "/api/homesdata";
const HOMESTATUS_PATH: &str = "/syncapi/v1/homestatus";
const SETSTATE_PATH: &str = "/syncapi/v1/setstate";
const HOMEMEASURE_PATH: &str = "/api/gethomemeasure";

// Refresh slightly before the advertised expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, excerpt: String },
    Json { path: String, message: String, excerpt: String },
    /// The upstream answered with an error envelope.
    Api { code: i64, message: String },
    /// Credentials were refused; integration-wide.
    Auth(String),
    MissingBody(&'static str),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, excerpt } => write!(f, "http {}: {}", status, excerpt),
            ClientError::Json { path, message, excerpt } => {
                write!(f, "json error at {}: {} (payload: {})", path, message, excerpt)
            }
            ClientError::Api { code, message } => write!(f, "upstream error {}: {}", code, message),
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
            ClientError::MissingBody(endpoint) => write!(f, "{} answered without a body", endpoint),
        }
    }
}

impl std::error::Error for ClientError {}

/// Upstream operations the integration depends on.
pub trait HeatingApi: Send + Sync {
    fn homes_data(&self) -> Result<HomesData, ClientError>;
    fn home_status(&self, home_id: &HomeId) -> Result<HomeStatus, ClientError>;
    fn set_state(&self, request: &SetStateRequest) -> Result<(), ClientError>;
    fn home_measure(&self, request: &MeasureRequest) -> Result<HomeMeasure, ClientError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct OAuthState {
    access: Option<AccessToken>,
    refresh_token: Option<String>,
    /// Bumped each time a new access token is stored.
    generation: u64,
}

pub struct MullerClient {
    agent: ureq::Agent,
    base_url: String,
    credentials: Credentials,
    oauth: Mutex<OAuthState>,
}

impl MullerClient {
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        MullerClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            oauth: Mutex::new(OAuthState::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Obtains a token up front so bad credentials fail at startup.
    pub fn authenticate(&self) -> Result<(), ClientError> {
        self.bearer().map(|_| ())
    }

    /// Current access token and its generation, refreshing under the lock if needed.
    fn bearer(&self) -> Result<(String, u64), ClientError> {
        let mut state = self.oauth.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = &state.access {
            if Instant::now() + EXPIRY_MARGIN < token.expires_at {
                return Ok((token.value.clone(), state.generation));
            }
        }

        let grant = match state.refresh_token.clone() {
            Some(refresh) => match self.refresh_grant(&refresh) {
                Ok(t) => t,
                Err(ClientError::Auth(e)) => {
                    warn!("Token refresh refused ({}); falling back to password grant", e);
                    self.password_grant()?
                }
                Err(e) => return Err(e),
            },
            None => self.password_grant()?,
        };

        state.generation += 1;
        state.access = Some(AccessToken {
            value: grant.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(grant.expires_in),
        });
        if grant.refresh_token.is_some() {
            state.refresh_token = grant.refresh_token;
        }
        debug!("Stored access token generation {}", state.generation);
        Ok((grant.access_token, state.generation))
    }

    /// Drops the access token if it is still the one a failed request used.
    fn invalidate(&self, generation: u64) {
        let mut state = self.oauth.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation == generation {
            state.access = None;
        }
    }

    fn password_grant(&self) -> Result<TokenGrant, ClientError> {
        let c = &self.credentials;
        let result = self.agent.post(self.url(OAUTH_TOKEN_PATH)).send_form([
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("grant_type", "password"),
            ("user_prefix", OAUTH_USER_PREFIX),
            ("scope", OAUTH_SCOPE),
            ("username", c.username.as_str()),
            ("password", c.password.as_str()),
        ]);
        let grant = Self::parse_token_response(result)?;
        info!("Authenticated to the Muller Intuitiv API");
        Ok(grant)
    }

    fn refresh_grant(&self, refresh: &str) -> Result<TokenGrant, ClientError> {
        let c = &self.credentials;
        let result = self.agent.post(self.url(OAUTH_TOKEN_PATH)).send_form([
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
        ]);
        Self::parse_token_response(result)
    }

    fn parse_token_response(
        result: Result<http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<TokenGrant, ClientError> {
        let mut resp = result.map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if is_credential_refusal(status, &text) {
            return Err(ClientError::Auth(format!("http {}: {}", status.as_u16(), excerpt(&text))));
        }
        if !status.is_success() {
            // Outages and throttling are retried on the next cycle.
            return Err(ClientError::Http {
                status: status.as_u16(),
                excerpt: excerpt(&text),
            });
        }
        let grant: TokenGrant = parse_json(&text)?;
        if grant.access_token.is_empty() {
            return Err(ClientError::Auth("token endpoint returned an empty access token".into()));
        }
        Ok(grant)
    }

    /// Sends an authenticated request, retrying once after a token rejection.
    fn execute<T, F>(&self, endpoint: &'static str, send: F) -> Result<ApiResponse<T>, ClientError>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> Result<http::Response<ureq::Body>, ureq::Error>,
    {
        let mut retried = false;
        loop {
            let (token, generation) = self.bearer()?;
            let auth = format!("Bearer {}", token);
            let mut resp = send(&auth).map_err(|e| ClientError::Transport(format!("{}: {}", endpoint, e)))?;
            let status = resp.status();
            let text = resp
                .body_mut()
                .read_to_string()
                .map_err(|e| ClientError::Transport(format!("{}: {}", endpoint, e)))?;

            match classify(status, &text) {
                Outcome::Ok => {
                    let envelope: ApiResponse<T> = parse_json(&text)?;
                    return Ok(envelope);
                }
                Outcome::TokenRejected if !retried => {
                    debug!("{}: token rejected; refreshing and retrying once", endpoint);
                    self.invalidate(generation);
                    retried = true;
                }
                Outcome::TokenRejected => {
                    return Err(ClientError::Auth(format!(
                        "{} rejected a freshly refreshed token: {}",
                        endpoint,
                        excerpt(&text)
                    )));
                }
                Outcome::Failed(e) => return Err(e),
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

enum Outcome {
    Ok,
    TokenRejected,
    Failed(ClientError),
}

/// The token endpoint refused the credentials themselves, as opposed to being unavailable.
fn is_credential_refusal(status: StatusCode, text: &str) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) || text.contains("invalid_grant")
}

fn classify(status: StatusCode, text: &str) -> Outcome {
    // Only the envelope matters here; the body is parsed again by the caller.
    let envelope = serde_json::from_str::<ApiResponse<IgnoredAny>>(text).ok();
    let api_error = envelope.and_then(|e| e.error);

    if status == StatusCode::UNAUTHORIZED {
        return Outcome::TokenRejected;
    }
    if let Some(err) = api_error {
        if err.code == ERROR_CODE_INVALID_TOKEN || err.code == ERROR_CODE_TOKEN_EXPIRED {
            return Outcome::TokenRejected;
        }
        return Outcome::Failed(ClientError::Api {
            code: err.code,
            message: err.message,
        });
    }
    if !status.is_success() {
        return Outcome::Failed(ClientError::Http {
            status: status.as_u16(),
            excerpt: excerpt(text),
        });
    }
    Outcome::Ok
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(text);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json {
        path: e.path().to_string(),
        message: e.inner().to_string(),
        excerpt: excerpt(text),
    })
}

impl HeatingApi for MullerClient {
    fn homes_data(&self) -> Result<HomesData, ClientError> {
        let url = self.url(HOMESDATA_PATH);
        let resp: ApiResponse<HomesData> =
            self.execute("homesdata", |auth| self.agent.get(url.as_str()).header("Authorization", auth).call())?;
        resp.body.ok_or(ClientError::MissingBody("homesdata"))
    }

    fn home_status(&self, home_id: &HomeId) -> Result<HomeStatus, ClientError> {
        let url = self.url(HOMESTATUS_PATH);
        let resp: ApiResponse<HomeStatusBody> = self.execute("homestatus", |auth| {
            self.agent
                .get(&url)
                .header("Authorization", auth)
                .query("home_id", &home_id.0)
                .call()
        })?;
        resp.body
            .and_then(|b| b.home)
            .ok_or(ClientError::MissingBody("homestatus"))
    }

    fn set_state(&self, request: &SetStateRequest) -> Result<(), ClientError> {
        let url = self.url(SETSTATE_PATH);
        let _: ApiResponse<IgnoredAny> = self.execute("setstate", |auth| {
            self.agent.post(url.as_str()).header("Authorization", auth).send_json(request)
        })?;
        Ok(())
    }

    fn home_measure(&self, request: &MeasureRequest) -> Result<HomeMeasure, ClientError> {
        let url = self.url(HOMEMEASURE_PATH);
        let resp: ApiResponse<HomeMeasureBody> = self.execute("gethomemeasure", |auth| {
            self.agent.post(url.as_str()).header("Authorization", auth).send_json(request)
        })?;
        resp.body
            .and_then(|b| b.home)
            .ok_or(ClientError::MissingBody("gethomemeasure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::thread;

    fn credentials() -> Credentials {
        Credentials {
            username: "user@example.com".into(),
            password: "secret".into(),
            client_id: "cid".into(),
            client_secret: "csecret".into(),
        }
    }

    fn client(server: &Server) -> MullerClient {
        MullerClient::new(&server.url(), credentials(), Duration::from_secs(5))
    }

    fn token_body(access: &str, refresh: &str) -> String {
        format!(
            r#"{{"access_token":"{}","refresh_token":"{}","expires_in":10800}}"#,
            access, refresh
        )
    }

    const STATUS_BODY: &str = r#"{"status":"ok","body":{"home":{"id":"home-1","rooms":[{"id":"r-salon","therm_measured_temperature":19.0}]}}}"#;

    #[test]
    fn concurrent_requests_share_one_token_grant() {
        let mut server = Server::new();
        let token = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("user_prefix".into(), "muller".into()),
                Matcher::UrlEncoded("scope".into(), "read_muller write_muller".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(token_body("tok-1", "ref-1"))
            .expect(1)
            .create();
        let status = server
            .mock("GET", "/syncapi/v1/homestatus")
            .match_query(Matcher::UrlEncoded("home_id".into(), "home-1".into()))
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(STATUS_BODY)
            .expect(4)
            .create();

        let client = client(&server);
        let home = HomeId("home-1".into());
        thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|| client.home_status(&home))).collect();
            for h in handles {
                let status = h.join().expect("worker thread").expect("home status");
                assert_eq!(status.id, Some(HomeId("home-1".into())));
            }
        });

        token.assert();
        status.assert();
    }

    #[test]
    fn unauthorized_response_refreshes_once_and_retries() {
        let mut server = Server::new();
        let password = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "password".into()))
            .with_status(200)
            .with_body(token_body("tok-1", "ref-1"))
            .expect(1)
            .create();
        let refresh = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "ref-1".into()),
            ]))
            .with_status(200)
            .with_body(token_body("tok-2", "ref-2"))
            .expect(1)
            .create();
        let rejected = server
            .mock("GET", "/api/homesdata")
            .match_header("authorization", "Bearer tok-1")
            .with_status(401)
            .with_body(r#"{"error":{"code":3,"message":"Access token expired"}}"#)
            .expect(1)
            .create();
        let accepted = server
            .mock("GET", "/api/homesdata")
            .match_header("authorization", "Bearer tok-2")
            .with_status(200)
            .with_body(r#"{"body":{"homes":[{"id":"home-1","name":"Maison"}]},"status":"ok"}"#)
            .expect(1)
            .create();

        let data = client(&server).homes_data().expect("homes data after retry");
        assert_eq!(data.homes.map(|h| h.len()), Some(1));

        password.assert();
        refresh.assert();
        rejected.assert();
        accepted.assert();
    }

    #[test]
    fn error_envelope_surfaces_as_api_error() {
        let mut server = Server::new();
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_body("tok-1", "ref-1"))
            .create();
        let setstate = server
            .mock("POST", "/syncapi/v1/setstate")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "home": {"id": "home-1", "rooms": [{"id": "r-salon", "therm_setpoint_mode": "off"}]}
            })))
            .with_status(200)
            .with_body(r#"{"error":{"code":9,"message":"Device not found"}}"#)
            .expect(1)
            .create();

        let request = SetStateRequest {
            home: SetStateHome {
                id: HomeId("home-1".into()),
                rooms: vec![SetStateRoom {
                    id: RoomId("r-salon".into()),
                    therm_setpoint_mode: "off".into(),
                    therm_setpoint_temperature: None,
                }],
                modules: Vec::new(),
            },
        };
        let err = client(&server).set_state(&request).expect_err("rejected");
        assert_eq!(
            err,
            ClientError::Api {
                code: 9,
                message: "Device not found".into()
            }
        );
        setstate.assert();
    }

    #[test]
    fn refused_credentials_are_an_auth_error() {
        let mut server = Server::new();
        server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create();

        let err = client(&server).authenticate().expect_err("refused");
        assert!(matches!(err, ClientError::Auth(ref m) if m.contains("invalid_grant")), "{err}");
    }

    #[test]
    fn token_endpoint_outage_is_not_an_auth_error() {
        let mut server = Server::new();
        let token = server
            .mock("POST", "/oauth2/token")
            .with_status(503)
            .with_body("upstream maintenance")
            .expect(2)
            .create();
        let status = server
            .mock("GET", "/syncapi/v1/homestatus")
            .with_status(200)
            .with_body(STATUS_BODY)
            .expect(0)
            .create();

        let client = client(&server);
        let home = HomeId("home-1".into());
        let err = client.home_status(&home).expect_err("token endpoint down");
        assert_eq!(
            err,
            ClientError::Http {
                status: 503,
                excerpt: "upstream maintenance".into()
            }
        );
        // nothing cached, so the next call asks again
        assert!(matches!(client.home_status(&home), Err(ClientError::Http { status: 503, .. })));
        token.assert();
        status.assert();
    }

    #[test]
    fn refresh_outage_does_not_fall_back_to_password_grant() {
        let mut server = Server::new();
        let password = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "password".into()))
            .with_status(200)
            .with_body(token_body("tok-1", "ref-1"))
            .expect(1)
            .create();
        let refresh = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(429)
            .with_body("slow down")
            .expect(1)
            .create();
        server
            .mock("GET", "/api/homesdata")
            .match_header("authorization", "Bearer tok-1")
            .with_status(401)
            .with_body(r#"{"error":{"code":3,"message":"Access token expired"}}"#)
            .create();

        let err = client(&server).homes_data().expect_err("refresh throttled");
        assert!(matches!(err, ClientError::Http { status: 429, .. }), "{err}");
        password.assert();
        refresh.assert();
    }

    #[test]
    fn malformed_body_names_the_failing_path() {
        let mut server = Server::new();
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(token_body("tok-1", "ref-1"))
            .create();
        server
            .mock("GET", "/syncapi/v1/homestatus")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"body":{"home":{"id":"home-1","rooms":[{"id":"r-salon","reachable":"yes"}]}}}"#)
            .create();

        let err = client(&server)
            .home_status(&HomeId("home-1".into()))
            .expect_err("invalid payload");
        match err {
            ClientError::Json { path, .. } => assert_eq!(path, "body.home.rooms[0].reachable"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

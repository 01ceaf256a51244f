use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;

use crate::farm::gateway::SessionGateway;
use crate::types::{
    decode_status_payload, DepositRecord, DepositsPayload, Overview, SessionRecord,
    StartSessionResponse,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionPayload<'a> {
    wallet_address: &'a str,
    num_bots: u32,
}

#[derive(Debug)]
pub struct ApiStatusError {
    endpoint: String,
    status: StatusCode,
    message: String,
}

impl ApiStatusError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ApiStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.endpoint, self.status, self.message
        )
    }
}

impl std::error::Error for ApiStatusError {}

#[derive(Clone)]
pub struct ApiClient {
    json_client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();

        if let Some(token) = token {
            let auth_value = format!("Bearer {token}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value).context("invalid authorization header")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let json_client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP JSON client")?;

        Ok(Self {
            json_client,
            base_url,
        })
    }

    pub fn start_session(&self, wallet: &str, workers: u32) -> Result<StartSessionResponse> {
        let url = format!("{}/api/farming/start", self.base_url);
        let resp = self
            .json_client
            .post(url)
            .json(&StartSessionPayload {
                wallet_address: wallet,
                num_bots: workers,
            })
            .send()
            .context("request to farming/start endpoint failed")?;

        decode_json_response(resp, "farming/start")
    }

    pub fn get_status(&self, session_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        let url = format!("{}/api/farming/status", self.base_url);
        let mut request = self.json_client.get(url);
        if let Some(session_id) = session_id {
            request = request.query(&[("sessionId", session_id)]);
        }
        let resp = request
            .send()
            .context("request to farming/status endpoint failed")?;

        let value: Value = decode_json_response(resp, "farming/status")?;
        decode_status_payload(value)
    }

    pub fn get_overview(&self) -> Result<Overview> {
        let url = format!("{}/api/farming/overview", self.base_url);
        let resp = self
            .json_client
            .get(url)
            .send()
            .context("request to farming/overview endpoint failed")?;

        decode_json_response(resp, "farming/overview")
    }

    pub fn get_deposits(
        &self,
        wallet: &str,
        since_version: Option<u64>,
        limit: u32,
    ) -> Result<Vec<DepositRecord>> {
        let url = format!("{}/api/farming/deposits", self.base_url);
        let mut query = vec![
            ("wallet", wallet.to_string()),
            ("limit", limit.max(1).to_string()),
        ];
        if let Some(since) = since_version {
            query.push(("sinceVersion", since.to_string()));
        }
        let resp = self
            .json_client
            .get(url)
            .query(&query)
            .send()
            .context("request to farming/deposits endpoint failed")?;

        let payload: DepositsPayload = decode_json_response(resp, "farming/deposits")?;
        Ok(payload.deposits)
    }

    pub fn stop_session(&self, session_id: &str) -> Result<()> {
        let url = self.stop_url(session_id)?;
        let resp = self
            .json_client
            .post(url)
            .send()
            .context("request to farming/stop endpoint failed")?;

        match confirm_response(resp, "farming/stop") {
            Ok(()) => Ok(()),
            Err(err) if is_not_found_error(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The session id is backend-issued, so it goes in as one escaped path segment.
    fn stop_url(&self, session_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid api url '{}'", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("api url '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["api", "farming", "stop", session_id]);
        Ok(url)
    }

    pub fn clear_all_sessions(&self) -> Result<()> {
        let url = format!("{}/api/farming/clear", self.base_url);
        let resp = self
            .json_client
            .post(url)
            .send()
            .context("request to farming/clear endpoint failed")?;

        confirm_response(resp, "farming/clear")
    }
}

impl SessionGateway for ApiClient {
    fn start_session(&self, wallet: &str, workers: u32) -> Result<StartSessionResponse> {
        ApiClient::start_session(self, wallet, workers)
    }

    fn get_status(&self, session_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        ApiClient::get_status(self, session_id)
    }

    fn get_overview(&self) -> Result<Overview> {
        ApiClient::get_overview(self)
    }

    fn get_deposits(
        &self,
        wallet: &str,
        since_version: Option<u64>,
        limit: u32,
    ) -> Result<Vec<DepositRecord>> {
        ApiClient::get_deposits(self, wallet, since_version, limit)
    }

    fn stop_session(&self, session_id: &str) -> Result<()> {
        ApiClient::stop_session(self, session_id)
    }

    fn clear_all_sessions(&self) -> Result<()> {
        ApiClient::clear_all_sessions(self)
    }
}

/// Stopping a session the backend already reaped is treated as success.
pub fn is_not_found_error(err: &anyhow::Error) -> bool {
    let Some(api_err) = err.downcast_ref::<ApiStatusError>() else {
        return false;
    };
    api_err.status() == StatusCode::NOT_FOUND
}

pub fn is_capacity_error(err: &anyhow::Error) -> bool {
    let Some(api_err) = err.downcast_ref::<ApiStatusError>() else {
        return false;
    };
    api_err.status() == StatusCode::TOO_MANY_REQUESTS
        || api_err.status() == StatusCode::SERVICE_UNAVAILABLE
}

fn decode_json_response<T: serde::de::DeserializeOwned>(
    resp: Response,
    endpoint: &str,
) -> Result<T> {
    if resp.status().is_success() {
        return resp
            .json::<T>()
            .with_context(|| format!("failed to decode {endpoint} response JSON"));
    }
    Err(status_error(resp, endpoint))
}

/// Any 2xx is a confirmation; the body may be empty, JSON, or plain text.
fn confirm_response(resp: Response, endpoint: &str) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(status_error(resp, endpoint))
}

fn status_error(resp: Response, endpoint: &str) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    let message = if let Ok(value) = serde_json::from_str::<Value>(&body) {
        value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(body)
    } else {
        body
    };

    anyhow!(ApiStatusError {
        endpoint: endpoint.to_string(),
        status,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_client(server: &MockServer) -> ApiClient {
        let base = server.url("").trim_end_matches('/').to_string();
        ApiClient::new(base, None, Duration::from_secs(5)).expect("test client should be created")
    }

    #[test]
    fn start_session_posts_wallet_and_worker_count() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/farming/start")
                .json_body(json!({"walletAddress": "0xabc", "numBots": 5}));
            then.status(200).json_body(json!({
                "sessionId": "s-1",
                "status": "active",
                "bots": [{"id": "b1"}, {"id": "b2"}, {"id": "b3"}]
            }));
        });

        let client = test_client(&server);
        let resp = client
            .start_session("0xabc", 5)
            .expect("start request should succeed");
        assert_eq!(resp.session_id, "s-1");
        assert_eq!(resp.worker_count(), 3);
        mock.assert();
    }

    #[test]
    fn token_is_sent_as_bearer_header() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/farming/overview")
                .header("authorization", "Bearer testtoken");
            then.status(200).json_body(json!({
                "totalSessions": 10,
                "activeSessions": 2,
                "totalBots": 7,
                "estimatedTotalMinted": "123456789012"
            }));
        });

        let base = server.url("").trim_end_matches('/').to_string();
        let client = ApiClient::new(base, Some("testtoken".to_string()), Duration::from_secs(5))
            .expect("test client should be created");
        let overview = client.get_overview().expect("overview should succeed");
        assert_eq!(overview.active_sessions, 2);
        assert_eq!(overview.estimated_total_minted, 123_456_789_012);
        mock.assert();
    }

    #[test]
    fn get_deposits_requests_single_record_for_baseline() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/farming/deposits")
                .query_param("wallet", "0xabc")
                .query_param("limit", "1");
            then.status(200).json_body(json!({
                "deposits": [{"txHash": "0x01", "amount": "5", "version": "99"}]
            }));
        });

        let client = test_client(&server);
        let deposits = client
            .get_deposits("0xabc", None, 1)
            .expect("deposits should succeed");
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].version, 99);
        mock.assert();
    }

    #[test]
    fn get_deposits_passes_since_version() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/farming/deposits")
                .query_param("wallet", "0xabc")
                .query_param("sinceVersion", "18446744073709551000")
                .query_param("limit", "25");
            then.status(200).json_body(json!({"deposits": []}));
        });

        let client = test_client(&server);
        let deposits = client
            .get_deposits("0xabc", Some(18_446_744_073_709_551_000), 25)
            .expect("deposits should succeed");
        assert!(deposits.is_empty());
        mock.assert();
    }

    #[test]
    fn stop_session_treats_not_found_as_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/farming/stop/s-gone");
            then.status(404)
                .json_body(json!({"error": "session not found"}));
        });

        let client = test_client(&server);
        client
            .stop_session("s-gone")
            .expect("stopping a missing session should be idempotent");
        mock.assert();
    }

    #[test]
    fn stop_session_accepts_empty_confirmation_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/farming/stop/s-1");
            then.status(200);
        });

        let client = test_client(&server);
        client
            .stop_session("s-1")
            .expect("empty 200 body should confirm the stop");
        mock.assert();
    }

    #[test]
    fn stop_url_escapes_session_id() {
        let client = ApiClient::new(
            "http://127.0.0.1:3001".to_string(),
            None,
            Duration::from_secs(1),
        )
        .expect("client should build");
        let url = client.stop_url("a/b?c").expect("stop url");
        assert_eq!(url.as_str(), "http://127.0.0.1:3001/api/farming/stop/a%2Fb%3Fc");
        assert!(url.query().is_none());

        let prefixed = ApiClient::new(
            "http://host/dash".to_string(),
            None,
            Duration::from_secs(1),
        )
        .expect("client should build");
        assert_eq!(
            prefixed.stop_url("s-1").expect("stop url").as_str(),
            "http://host/dash/api/farming/stop/s-1"
        );
    }

    #[test]
    fn clear_all_sessions_surfaces_json_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/farming/clear");
            then.status(500).json_body(json!({"error": "orchestrator offline"}));
        });

        let client = test_client(&server);
        let err = client
            .clear_all_sessions()
            .expect_err("clear should fail");
        assert!(format!("{err:#}").contains("orchestrator offline"));
        assert!(!is_not_found_error(&err));
        mock.assert();
    }

    #[test]
    fn capacity_error_is_classified() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/farming/start");
            then.status(429)
                .json_body(json!({"message": "bot capacity reached"}));
        });

        let client = test_client(&server);
        let err = client
            .start_session("0xabc", 5)
            .expect_err("start should fail");
        assert!(is_capacity_error(&err));
        assert!(format!("{err:#}").contains("bot capacity reached"));
        mock.assert();
    }

    #[test]
    fn get_status_filters_by_session_id() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/farming/status")
                .query_param("sessionId", "s-7");
            then.status(200).json_body(json!({
                "sessionId": "s-7", "walletAddress": "0xabc", "status": "active"
            }));
        });

        let client = test_client(&server);
        let sessions = client
            .get_status(Some("s-7"))
            .expect("status should succeed");
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_active());
        mock.assert();
    }
}

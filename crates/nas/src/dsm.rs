use std::{
    collections::{HashMap, HashSet},
    sync::{PoisonError, RwLock},
};

use cmx_presence_core::entry::{
    DataDomain, EntryData, NasApi, NasError, CAMERA_API_KEY, DEFAULT_VERIFY_SSL,
    HOME_MODE_API_KEY, INFO_API_KEY,
};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const API_INFO_KEY: &str = "SYNO.API.Info";
pub const AUTH_API_KEY: &str = "SYNO.API.Auth";
pub const DSM_INFO_API_KEY: &str = "SYNO.DSM.Info";
pub const NETWORK_API_KEY: &str = "SYNO.DSM.Network";

const SESSION_NAME: &str = "webui";

/// Client for the Synology DSM web API.
///
/// [`NasApi::setup`] must run first: it discovers the CGI path and version of
/// every API and opens the session used by all later calls.
pub struct DsmClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    state: RwLock<SessionState>,
}

#[derive(Default)]
struct SessionState {
    apis: HashMap<String, ApiDescriptor>,
    sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiDescriptor {
    path: String,
    #[serde(rename = "maxVersion")]
    max_version: u32,
}

impl DsmClient {
    /// Creates a client for the DSM instance served under `base_url`.
    pub fn new(
        base_url: Url,
        username: impl Into<String>,
        password: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            username: username.into(),
            password: password.into(),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Builds a client from stored entry data, honouring its TLS settings.
    pub fn from_entry(data: &EntryData) -> Result<Self, DsmError> {
        let scheme = if data.use_https { "https" } else { "http" };
        let base_url = Url::parse(&format!("{scheme}://{}:{}/", data.host, data.port))?;
        let verify_ssl = data.verify_ssl.unwrap_or(DEFAULT_VERIFY_SSL);
        let http = Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;
        Ok(Self::new(
            base_url,
            data.username.clone(),
            data.password.clone(),
            http,
        ))
    }

    pub fn is_logged_in(&self) -> bool {
        self.read_state().sid.is_some()
    }

    async fn discover(&self) -> Result<HashMap<String, ApiDescriptor>, DsmError> {
        let mut url = self.base_url.join("webapi/query.cgi")?;
        url.query_pairs_mut()
            .append_pair("api", API_INFO_KEY)
            .append_pair("version", "1")
            .append_pair("method", "query")
            .append_pair("query", "all");

        let response = self.http.get(url).send().await?;
        let envelope: Envelope<HashMap<String, ApiDescriptor>> = parse_json(response).await?;
        envelope.into_data(API_INFO_KEY)
    }

    async fn login(&self) -> Result<String, DsmError> {
        #[derive(Default, Deserialize)]
        struct LoginData {
            sid: String,
        }

        let params = [
            ("account", self.username.as_str()),
            ("passwd", self.password.as_str()),
            ("session", SESSION_NAME),
            ("format", "sid"),
        ];
        match self.request::<LoginData>(AUTH_API_KEY, "login", &params).await {
            Ok(data) if !data.sid.is_empty() => Ok(data.sid),
            Ok(_) => Err(DsmError::Auth { code: 100 }),
            Err(DsmError::Api { code, .. }) => Err(DsmError::Auth { code }),
            Err(other) => Err(other),
        }
    }

    async fn call(&self, api: &str, method: &str) -> Result<Value, DsmError> {
        self.request::<Value>(api, method, &[]).await
    }

    async fn request<T>(
        &self,
        api: &str,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<T, DsmError>
    where
        T: DeserializeOwned + Default,
    {
        let (descriptor, sid) = {
            let state = self.read_state();
            let descriptor = state
                .apis
                .get(api)
                .cloned()
                .ok_or_else(|| DsmError::UnknownApi(api.to_string()))?;
            (descriptor, state.sid.clone())
        };

        let mut url = self.base_url.join("webapi/")?.join(&descriptor.path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api", api);
            query.append_pair("version", &descriptor.max_version.to_string());
            query.append_pair("method", method);
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(sid) = &sid {
                query.append_pair("_sid", sid);
            }
        }

        let response = self.http.get(url).send().await?;
        let envelope: Envelope<T> = parse_json(response).await?;
        envelope.into_data(api)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NasApi for DsmClient {
    async fn setup(&self) -> Result<(), NasError> {
        let apis = self.discover().await?;
        self.write_state().apis = apis;

        let sid = self.login().await?;
        self.write_state().sid = Some(sid);
        Ok(())
    }

    fn available_apis(&self) -> HashSet<String> {
        self.read_state().apis.keys().cloned().collect()
    }

    async fn network_macs(&self) -> Result<Vec<String>, NasError> {
        #[derive(Default, Deserialize)]
        struct NetworkData {
            #[serde(default)]
            interfaces: Vec<NetworkInterface>,
        }

        #[derive(Deserialize)]
        struct NetworkInterface {
            mac: Option<String>,
        }

        let data: NetworkData = self.request(NETWORK_API_KEY, "list", &[]).await?;
        Ok(data
            .interfaces
            .into_iter()
            .filter_map(|interface| interface.mac)
            .filter(|mac| !mac.is_empty())
            .collect())
    }

    async fn fetch(&self, domain: DataDomain) -> Result<Value, NasError> {
        let (api, method) = match domain {
            DataDomain::Central => (DSM_INFO_API_KEY, "getinfo"),
            DataDomain::Cameras => (CAMERA_API_KEY, "List"),
            DataDomain::Switches => (HOME_MODE_API_KEY, "GetInfo"),
        };
        Ok(self.call(api, method).await?)
    }

    async fn setup_switches(&self) -> Result<(), NasError> {
        self.call(INFO_API_KEY, "GetInfo").await?;
        Ok(())
    }

    async fn unload(&self) -> Result<(), NasError> {
        if !self.is_logged_in() {
            return Ok(());
        }
        let result = self
            .request::<Value>(AUTH_API_KEY, "logout", &[("session", SESSION_NAME)])
            .await;
        self.write_state().sid = None;
        result.map(|_| ()).map_err(NasError::from)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
}

impl<T: Default> Envelope<T> {
    fn into_data(self, api: &str) -> Result<T, DsmError> {
        if self.success {
            return Ok(self.data.unwrap_or_default());
        }
        Err(DsmError::Api {
            api: api.to_string(),
            code: self.error.map(|error| error.code).unwrap_or(100),
        })
    }
}

/// Errors produced by the DSM client.
#[derive(Debug, Error)]
pub enum DsmError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("{api} returned error code {code}")]
    Api { api: String, code: i64 },
    #[error("login refused: {}", describe_auth_error(*code))]
    Auth { code: i64 },
    #[error("api {0} is not available on this NAS")]
    UnknownApi(String),
}

impl From<DsmError> for NasError {
    fn from(err: DsmError) -> Self {
        match err {
            DsmError::Auth { code } => NasError::auth(Some(describe_auth_error(code))),
            DsmError::Api { api, code } => NasError::Api { api, code },
            other => NasError::connection(Some(other.to_string())),
        }
    }
}

/// Human readable reason for a failed `SYNO.API.Auth` login.
pub fn describe_auth_error(code: i64) -> String {
    match code {
        400 => "invalid credentials".to_string(),
        401 => "account disabled".to_string(),
        402 => "permission denied".to_string(),
        403 => "two-step verification required".to_string(),
        404 => "two-step verification failed".to_string(),
        other => format!("login error code {other}"),
    }
}

async fn parse_json<T>(response: Response) -> Result<T, DsmError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(DsmError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> DsmClient {
        let base = Url::parse(&server.url("/")).expect("url");
        DsmClient::new(
            base,
            "admin",
            "hunter2",
            Client::builder().build().expect("client"),
        )
    }

    async fn mock_discovery(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/query.cgi")
                    .query_param("api", API_INFO_KEY)
                    .query_param("method", "query");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {
                        "SYNO.API.Auth": {"path": "auth.cgi", "minVersion": 1, "maxVersion": 6},
                        "SYNO.DSM.Info": {"path": "entry.cgi", "minVersion": 1, "maxVersion": 2},
                        "SYNO.DSM.Network": {"path": "entry.cgi", "minVersion": 1, "maxVersion": 1},
                        "SYNO.SurveillanceStation.Camera": {"path": "entry.cgi", "minVersion": 1, "maxVersion": 9}
                    }
                }));
            })
            .await;
    }

    async fn mock_login(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/auth.cgi")
                    .query_param("api", AUTH_API_KEY)
                    .query_param("method", "login")
                    .query_param("account", "admin")
                    .query_param("passwd", "hunter2")
                    .query_param("format", "sid");
                then.status(200)
                    .json_body(json!({"success": true, "data": {"sid": "sid-1"}}));
            })
            .await;
    }

    #[tokio::test]
    async fn setup_discovers_apis_and_logs_in() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_login(&server).await;
        let client = client(&server);

        client.setup().await.expect("setup");

        assert!(client.is_logged_in());
        let apis = client.available_apis();
        assert!(apis.contains(CAMERA_API_KEY));
        assert!(!apis.contains(HOME_MODE_API_KEY));
    }

    #[tokio::test]
    async fn fetch_passes_session_and_version() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_login(&server).await;
        let info = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/entry.cgi")
                    .query_param("api", DSM_INFO_API_KEY)
                    .query_param("version", "2")
                    .query_param("method", "getinfo")
                    .query_param("_sid", "sid-1");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {"model": "DS918+", "uptime": 1234}
                }));
            })
            .await;
        let client = client(&server);
        client.setup().await.expect("setup");

        let data = client.fetch(DataDomain::Central).await.expect("fetch");
        info.assert_async().await;
        assert_eq!(data["model"], json!("DS918+"));
    }

    #[tokio::test]
    async fn network_macs_reads_interfaces() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_login(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/entry.cgi")
                    .query_param("api", NETWORK_API_KEY)
                    .query_param("method", "list");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {"interfaces": [
                        {"id": "eth0", "mac": "00:11:32:aa:bb:cc"},
                        {"id": "eth1", "mac": "00:11:32:aa:bb:cd"},
                        {"id": "ovs_bond0"}
                    ]}
                }));
            })
            .await;
        let client = client(&server);
        client.setup().await.expect("setup");

        let macs = client.network_macs().await.expect("macs");
        assert_eq!(macs, vec!["00:11:32:aa:bb:cc", "00:11:32:aa:bb:cd"]);
    }

    #[tokio::test]
    async fn rejected_login_maps_to_auth_error() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/auth.cgi")
                    .query_param("method", "login");
                then.status(200)
                    .json_body(json!({"success": false, "error": {"code": 400}}));
            })
            .await;
        let client = client(&server);

        let err = client.setup().await.expect_err("login refused");
        match err {
            NasError::Auth { details } => assert_eq!(details, "invalid credentials"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!client.is_logged_in());
    }

    #[tokio::test]
    async fn http_failure_maps_to_connection_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/webapi/query.cgi");
                then.status(502).body("bad gateway");
            })
            .await;
        let client = client(&server);

        let err = client.setup().await.expect_err("discovery fails");
        match err {
            NasError::Connection { details } => assert!(details.contains("bad gateway")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetching_an_unknown_api_fails() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_login(&server).await;
        let client = client(&server);
        client.setup().await.expect("setup");

        let err = client
            .fetch(DataDomain::Switches)
            .await
            .expect_err("home mode missing");
        assert!(matches!(err, NasError::Connection { .. }));
    }

    #[tokio::test]
    async fn unload_logs_out_and_drops_session() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_login(&server).await;
        let logout = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/webapi/auth.cgi")
                    .query_param("method", "logout")
                    .query_param("_sid", "sid-1");
                then.status(200).json_body(json!({"success": true}));
            })
            .await;
        let client = client(&server);
        client.setup().await.expect("setup");

        client.unload().await.expect("unload");
        logout.assert_async().await;
        assert!(!client.is_logged_in());

        client.unload().await.expect("second unload is a no-op");
        logout.assert_hits_async(1).await;
    }

    #[test]
    fn auth_error_codes_are_described() {
        assert_eq!(describe_auth_error(401), "account disabled");
        assert_eq!(describe_auth_error(402), "permission denied");
        assert_eq!(describe_auth_error(403), "two-step verification required");
        assert_eq!(describe_auth_error(404), "two-step verification failed");
        assert_eq!(describe_auth_error(999), "login error code 999");
    }

    #[test]
    fn from_entry_builds_base_url() {
        let data = EntryData {
            host: "nas.local".to_string(),
            port: 5001,
            use_https: true,
            username: "admin".to_string(),
            password: "pw".to_string(),
            verify_ssl: None,
            macs: Vec::new(),
        };
        let client = DsmClient::from_entry(&data).expect("client");
        assert_eq!(client.base_url.as_str(), "https://nas.local:5001/");
    }
}

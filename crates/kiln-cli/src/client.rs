//! HTTP client for the master API.

use crate::config::CliConfig;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Thin wrapper over reqwest with the configured base URL and operator
/// credentials applied.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    auth: Option<(String, String)>,
}

impl ApiClient {
    pub fn new(config: &CliConfig) -> Self {
        let auth = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };
        Self {
            http: reqwest::Client::new(),
            base: config.api_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        let response = self.http.get(self.url(path)).send().await?;
        parse(response).await
    }

    /// Fetch a path as raw JSON, for `--output json` style printing.
    pub async fn get_value(&self, path: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        self.get(path).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        let response = self.authed_post(path).send().await?;
        parse(response).await
    }

    /// POST where the master answers with a bare status code.
    pub async fn post_no_content(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let response = self.authed_post(path).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("{}: {}", status, body).into())
        }
    }

    fn authed_post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(self.url(path));
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        request
    }
}

async fn parse<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json().await?)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(format!("{}: {}", status, body).into())
    }
}

#[derive(Deserialize)]
pub struct BuilderSummary {
    pub name: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub steps: Vec<String>,
    pub max_duration_secs: u64,
}

#[derive(Deserialize)]
pub struct ListBuilders {
    pub builders: Vec<BuilderSummary>,
    pub total: usize,
}

#[derive(Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub log_tail: Vec<String>,
}

#[derive(Deserialize)]
pub struct BuildSummary {
    pub builder: String,
    pub number: u32,
    pub request_id: String,
    pub outcome: String,
    pub worker: Option<String>,
    pub steps: Vec<StepSummary>,
    pub logs_ref: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: String,
}

#[derive(Deserialize)]
pub struct ListBuilds {
    pub builds: Vec<BuildSummary>,
    pub total: usize,
}

#[derive(Deserialize)]
pub struct ForceResponse {
    pub request_id: String,
}

#[derive(Deserialize)]
pub struct WorkerSummary {
    pub name: String,
    pub platform: String,
    pub arch: String,
    pub tags: Vec<String>,
    pub status: String,
    pub version: Option<String>,
    pub current_request_id: Option<String>,
    pub registered_at: String,
    pub last_heartbeat_at: Option<String>,
}

#[derive(Deserialize)]
pub struct ListWorkers {
    pub workers: Vec<WorkerSummary>,
    pub total: usize,
}

#[derive(Deserialize)]
pub struct RequestSummary {
    pub request: RequestBody,
    pub phase: String,
    pub worker: Option<String>,
}

#[derive(Deserialize)]
pub struct RequestBody {
    pub id: String,
    pub builder: String,
    pub attempts: u32,
}

#[derive(Deserialize)]
pub struct ListRequests {
    pub requests: Vec<RequestSummary>,
    pub total: usize,
}

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::config::{BASE_URL, USER_AGENT};

/// Where a hook lives: a single repository or a whole organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookTarget {
    Repository { owner: String, name: String },
    Organization(String),
}

impl HookTarget {
    pub fn repository(owner: &str, name: &str) -> Self {
        Self::Repository {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    fn hooks_path(&self) -> String {
        match self {
            Self::Repository { owner, name } => format!("/repos/{}/{}/hooks", owner, name),
            Self::Organization(org) => format!("/orgs/{}/hooks", org),
        }
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository { owner, name } => write!(f, "repo {}/{}", owner, name),
            Self::Organization(org) => write!(f, "org {}", org),
        }
    }
}

/// Delivery settings of a hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// "0" or "1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_ssl: Option<String>,
    /// Only ever sent; GitHub masks it in responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Hook as returned by GitHub.
#[derive(Debug, Clone, Deserialize)]
pub struct Hook {
    pub id: u64,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub config: HookConfig,
}

/// Body of a hook creation request.
#[derive(Debug, Clone, Serialize)]
pub struct NewHook {
    pub name: String,
    pub events: Vec<String>,
    pub active: bool,
    pub config: HookConfig,
}

impl NewHook {
    pub fn web(events: Vec<String>, active: bool, config: HookConfig) -> Self {
        Self {
            name: "web".to_string(),
            events,
            active,
            config,
        }
    }
}

/// HTTP client for the GitHub repository and organization hooks API.
///
/// Authenticates with a Bearer token and sets a User-Agent header.
pub struct GitHubClient {
    access_token: String,
    http_client: Client,
    base_url: String,
}

impl GitHubClient {
    pub fn new(access_token: String) -> Result<Self> {
        Self::with_base_url(access_token, BASE_URL.to_string())
    }

    /// Create a client with a custom base URL (GitHub Enterprise, or a mock server).
    pub fn with_base_url(access_token: String, base_url: String) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            access_token,
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_hooks(&self, target: &HookTarget) -> Result<Vec<Hook>> {
        let url = format!("{}{}", self.base_url, target.hooks_path());
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send list_hooks request")?;

        check_response_status(&response)?;
        response
            .json::<Vec<Hook>>()
            .await
            .context("Failed to parse hooks response")
    }

    pub async fn create_hook(&self, target: &HookTarget, hook: &NewHook) -> Result<Hook> {
        let url = format!("{}{}", self.base_url, target.hooks_path());
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(hook)
            .send()
            .await
            .context("Failed to send create_hook request")?;

        check_response_status(&response)?;
        response
            .json::<Hook>()
            .await
            .context("Failed to parse created hook")
    }

    pub async fn delete_hook(&self, target: &HookTarget, id: u64) -> Result<()> {
        let url = format!("{}{}/{}", self.base_url, target.hooks_path(), id);
        let response = self
            .http_client
            .delete(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to send delete_hook request")?;

        check_response_status(&response)
    }
}

/// Check the response status and map known error codes to descriptive errors.
///
/// - 401 → auth error (token expired or invalid)
/// - 403 → rate limit (logs X-RateLimit-Remaining)
/// - 404 → repository, organization or hook not found
/// - Other non-2xx → generic API error
fn check_response_status(response: &reqwest::Response) -> Result<()> {
    match response.status() {
        StatusCode::UNAUTHORIZED => Err(anyhow!("GitHub auth error: token expired or invalid")),
        StatusCode::FORBIDDEN => {
            let remaining = response
                .headers()
                .get("X-RateLimit-Remaining")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Err(anyhow!(
                "GitHub rate limit exceeded (X-RateLimit-Remaining: {})",
                remaining
            ))
        }
        StatusCode::NOT_FOUND => Err(anyhow!("GitHub resource not found: {}", response.url().path())),
        s if !s.is_success() => Err(anyhow!("GitHub API error: {}", s)),
        _ => Ok(()),
    }
}

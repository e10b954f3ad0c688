use eventgate::filter::FilterConfig;
use eventgate::secrets::SecretKeySelector;
use eventgate::webhook::WebhookContext;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const BASE_URL: &str = "https://api.github.com";
pub const USER_AGENT: &str = "eventgate-source-manager/0.1";

/// Repositories of one owner to register hooks on.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OwnedRepositories {
    pub owner: String,
    pub names: Vec<String>,
}

/// GitHub webhook event source.
///
/// Hooks are only managed when an API token is configured; otherwise the
/// route just receives deliveries for hooks registered out of band. When a
/// webhook secret is set, deliveries must carry a matching
/// `X-Hub-Signature-256` header.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GithubEventSource {
    pub webhook: WebhookContext,
    #[serde(default)]
    pub repositories: Vec<OwnedRepositories>,
    /// Organizations to register an organization-wide hook on
    #[serde(default)]
    pub organizations: Vec<String>,
    /// Event types the hook subscribes to, e.g. "push"
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub api_token: Option<SecretKeySelector>,
    /// Shared secret GitHub signs deliveries with
    #[serde(default)]
    pub webhook_secret: Option<SecretKeySelector>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub delete_hook_on_finish: bool,
    /// API base URL for GitHub Enterprise
    #[serde(default)]
    pub github_base_url: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

fn default_active() -> bool {
    true
}

fn default_content_type() -> String {
    "json".to_string()
}

impl GithubEventSource {
    pub fn needs_hooks(&self) -> bool {
        self.api_token.is_some() && (!self.repositories.is_empty() || !self.organizations.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        self.webhook.validate()?;
        for repo in &self.repositories {
            if repo.owner.is_empty() {
                bail!("repository owner is required");
            }
            if repo.names.is_empty() || repo.names.iter().any(String::is_empty) {
                bail!("repository names are required for owner {}", repo.owner);
            }
        }
        if self.organizations.iter().any(String::is_empty) {
            bail!("organization names must not be empty");
        }
        if !matches!(self.content_type.as_str(), "json" | "form") {
            bail!("content type must be 'json' or 'form', got '{}'", self.content_type);
        }
        if self.needs_hooks() {
            if self.events.is_empty() {
                bail!("at least one event type is required to register hooks");
            }
            if self.webhook.url.is_empty() {
                bail!("webhook url is required to register hooks");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> GithubEventSource {
        toml::from_str(toml_str).unwrap()
    }

    const HOOKED: &str = r#"
        events = ["push"]

        [webhook]
        endpoint = "/push"
        port = 12000
        url = "https://hooks.example.com"

        [api_token]
        name = "github"
        key = "token"

        [[repositories]]
        owner = "alice"
        names = ["my-repo"]
    "#;

    #[test]
    fn test_defaults() {
        let source = parse(HOOKED);
        assert!(source.active);
        assert_eq!(source.content_type, "json");
        assert!(!source.insecure);
        assert!(!source.delete_hook_on_finish);
        assert!(source.needs_hooks());
        assert!(source.validate().is_ok());
    }

    #[test]
    fn test_receive_only_source_needs_no_hooks() {
        let source = parse(
            r#"
                [webhook]
                endpoint = "/push"
                port = 12000
            "#,
        );
        assert!(!source.needs_hooks());
        assert!(source.validate().is_ok());
    }

    #[test]
    fn test_hooks_require_events_and_url() {
        let mut source = parse(HOOKED);
        source.events.clear();
        assert!(source.validate().is_err());

        let mut source = parse(HOOKED);
        source.webhook.url.clear();
        assert!(source.validate().unwrap_err().to_string().contains("webhook url"));
    }

    #[test]
    fn test_organizations_alone_need_hooks() {
        let source = parse(
            r#"
                events = ["push"]
                organizations = ["acme"]

                [webhook]
                endpoint = "/push"
                port = 12000
                url = "https://hooks.example.com"

                [api_token]
                name = "github"
                key = "token"

                [webhook_secret]
                name = "github"
                key = "secret"
            "#,
        );
        assert!(source.needs_hooks());
        assert_eq!(source.webhook_secret.as_ref().map(|s| s.key.as_str()), Some("secret"));
        assert!(source.validate().is_ok());

        let mut source = source;
        source.organizations.push(String::new());
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_invalid_content_type() {
        let mut source = parse(HOOKED);
        source.content_type = "xml".to_string();
        assert!(source.validate().is_err());
    }
}

//! Bearer tokens for registry pulls.

use mirror_core::config::RegistryConfig;
use mirror_core::context::OperationContext;
use mirror_core::error::{MirrorError, Result};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use serde::Deserialize;

/// Credentials for one image pull.
#[derive(Clone, PartialEq, Eq)]
pub enum PullAuth {
    /// Plain HTTP requests carrying this bearer token, if any
    Bearer(Option<String>),
    /// Basic credentials; the OCI client negotiates whatever token realm the registry advertises
    Basic { username: String, password: String },
}

impl PullAuth {
    pub(crate) fn to_oci_auth(&self) -> OciRegistryAuth {
        match self {
            PullAuth::Basic { username, password } => OciRegistryAuth::Basic(username.clone(), password.clone()),
            PullAuth::Bearer(_) => OciRegistryAuth::Anonymous,
        }
    }
}

impl std::fmt::Debug for PullAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullAuth::Bearer(token) => f.debug_tuple("Bearer").field(&token.as_ref().map(|_| "***")).finish(),
            PullAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Where pull tokens come from.
#[derive(Debug, Clone)]
enum TokenSource {
    /// No authentication
    Anonymous,
    /// A fixed bearer token
    Static(String),
    /// Registry credentials without a configured token endpoint
    Basic { username: String, password: String },
    /// Docker token authentication (`GET {url}?service=..&scope=..`)
    Exchange {
        url: String,
        service: String,
        username: Option<String>,
        password: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Issues bearer tokens scoped to `repository:{name}:pull`.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    http: reqwest::Client,
    source: TokenSource,
}

impl TokenProvider {
    /// Anonymous provider; registry requests carry no `Authorization` header.
    pub fn anonymous() -> Self {
        Self {
            http: reqwest::Client::new(),
            source: TokenSource::Anonymous,
        }
    }

    /// Provider that always hands out `token`.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            source: TokenSource::Static(token.into()),
        }
    }

    /// Build from registry configuration.
    ///
    /// A token endpoint wins over a static token, which wins over bare
    /// credentials.
    pub fn from_config(config: &RegistryConfig, http: reqwest::Client) -> Self {
        let source = match (&config.token_url, &config.token, &config.username) {
            (Some(url), _, _) => TokenSource::Exchange {
                url: url.clone(),
                service: config.service.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            },
            (None, Some(token), _) => TokenSource::Static(token.clone()),
            (None, None, Some(username)) => TokenSource::Basic {
                username: username.clone(),
                password: config.password.clone().unwrap_or_default(),
            },
            (None, None, None) => TokenSource::Anonymous,
        };
        Self { http, source }
    }

    /// Credentials allowing pulls from `repository`.
    pub async fn pull_auth(&self, ctx: &OperationContext, repository: &str) -> Result<PullAuth> {
        match &self.source {
            TokenSource::Anonymous => Ok(PullAuth::Bearer(None)),
            TokenSource::Static(token) => Ok(PullAuth::Bearer(Some(token.clone()))),
            TokenSource::Basic { username, password } => Ok(PullAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            TokenSource::Exchange {
                url,
                service,
                username,
                password,
            } => {
                let scope = pull_scope(repository);
                let mut request = self
                    .http
                    .get(url)
                    .query(&[("service", service.as_str()), ("scope", scope.as_str())]);
                if let Some(username) = username {
                    request = request.basic_auth(username, password.as_deref());
                }

                let body: TokenResponse = ctx
                    .run("registry token", async {
                        let response = request
                            .send()
                            .await
                            .map_err(|e| MirrorError::external("registry-auth", e.to_string()))?;
                        let status = response.status();
                        if !status.is_success() {
                            return Err(MirrorError::external(
                                "registry-auth",
                                format!("Token request for scope '{}' returned {}", scope, status),
                            ));
                        }
                        response.json::<TokenResponse>().await.map_err(|e| {
                            MirrorError::external("registry-auth", format!("Invalid token response: {}", e))
                        })
                    })
                    .await?;

                tracing::debug!(repository = %repository, "Obtained registry pull token");
                body.token
                    .or(body.access_token)
                    .filter(|t| !t.is_empty())
                    .map(|token| PullAuth::Bearer(Some(token)))
                    .ok_or_else(|| {
                        MirrorError::external("registry-auth", "Token response carried no token")
                    })
            }
        }
    }
}

/// Scope string granting pull access to `repository`.
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

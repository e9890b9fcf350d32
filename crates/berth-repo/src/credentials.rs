//! Repository credentials and the HTTP client that carries them
//!
//! Credentials are scoped to the repository origin and are never sent after
//! a cross-origin redirect unless the caller opts into passing them along.

use base64::Engine as _;
use berth_core::Sensitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{RepoError, Result};

/// Username and password for a repository or registry
#[derive(Debug, Clone, PartialEq)]
pub struct BasicAuth {
    pub username: String,
    pub password: Sensitive<String>,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Sensitive::new(password.into()),
        }
    }

    /// `Authorization` header value
    pub fn header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password.expose()));
        format!("Basic {}", encoded)
    }
}

/// Client-certificate TLS settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

impl TlsSettings {
    pub fn is_empty(&self) -> bool {
        self.cert_file.is_none()
            && self.key_file.is_none()
            && self.ca_file.is_none()
            && !self.insecure_skip_verify
    }

    fn read_ca(&self) -> Result<Option<Vec<u8>>> {
        self.ca_file
            .as_ref()
            .map(|path| read_pem(path, "CA bundle"))
            .transpose()
    }

    fn read_identity(&self) -> Result<Option<Vec<u8>>> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert, "client certificate")?;
                pem.push(b'\n');
                pem.extend(read_pem(key, "client key")?);
                Ok(Some(pem))
            }
            (None, None) => Ok(None),
            _ => Err(RepoError::Tls {
                message: "client certificate and key must be provided together".to_string(),
            }),
        }
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| RepoError::Tls {
        message: format!("cannot read {} {}: {}", what, path.display(), e),
    })
}

/// Scoped credentials - maps URL prefixes to credentials
#[derive(Debug, Clone, Default)]
pub struct ScopedCredentials {
    scopes: HashMap<String, BasicAuth>,
    /// Sent to every URL when set
    everywhere: Option<BasicAuth>,
}

impl ScopedCredentials {
    /// Add credentials for a URL scope
    pub fn add(&mut self, url_prefix: &str, credentials: BasicAuth) {
        let prefix = url_prefix.trim_end_matches('/').to_string();
        self.scopes.insert(prefix, credentials);
    }

    /// Send these credentials to any host
    pub fn pass_everywhere(&mut self, credentials: BasicAuth) {
        self.everywhere = Some(credentials);
    }

    /// Get credentials for a URL (by longest matching prefix)
    pub fn for_url(&self, url: &str) -> Option<&BasicAuth> {
        self.scopes
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, creds)| creds)
            .or(self.everywhere.as_ref())
    }

    /// Check if two URLs are same-origin (for redirect safety)
    pub fn same_origin(url1: &str, url2: &str) -> bool {
        match (Url::parse(url1), Url::parse(url2)) {
            (Ok(u1), Ok(u2)) => {
                u1.scheme() == u2.scheme()
                    && u1.host() == u2.host()
                    && u1.port_or_known_default() == u2.port_or_known_default()
            }
            _ => false,
        }
    }
}

/// HTTP client with redirect protection and optional client-certificate TLS
#[derive(Clone)]
pub struct SecureHttpClient {
    client: reqwest::Client,
    credentials: ScopedCredentials,
}

impl SecureHttpClient {
    /// Create a new secure HTTP client
    pub fn new(credentials: ScopedCredentials, tls: &TlsSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            // Redirects are followed manually so credentials stay on their origin
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(tls.insecure_skip_verify);

        if let Some(ca) = tls.read_ca()? {
            let cert = reqwest::Certificate::from_pem(&ca).map_err(|e| RepoError::Tls {
                message: format!("invalid CA bundle: {}", e),
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(identity) = tls.read_identity()? {
            let identity = reqwest::Identity::from_pem(&identity).map_err(|e| RepoError::Tls {
                message: format!("invalid client certificate: {}", e),
            })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| RepoError::NetworkError {
            message: e.to_string(),
        })?;

        Ok(Self {
            client,
            credentials,
        })
    }

    /// Create without credentials (public repos)
    pub fn public() -> Result<Self> {
        Self::new(ScopedCredentials::default(), &TlsSettings::default())
    }

    /// Fetch a URL, following up to 10 redirects
    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.get_with_redirects(url, 10).await
    }

    async fn get_with_redirects(&self, url: &str, max_redirects: u32) -> Result<reqwest::Response> {
        let mut current_url = url.to_string();
        let mut redirects = 0;

        loop {
            let mut request = self.client.get(&current_url);

            let same_origin = ScopedCredentials::same_origin(url, &current_url);
            match self.credentials.for_url(&current_url) {
                Some(creds) if same_origin || self.credentials.everywhere.is_some() => {
                    request = request.header("Authorization", creds.header());
                }
                Some(_) => {
                    tracing::warn!(
                        "Cross-origin redirect from {} to {} - credentials not forwarded",
                        url,
                        current_url
                    );
                }
                None => {}
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > max_redirects {
                    return Err(RepoError::NetworkError {
                        message: format!("Too many redirects (max {})", max_redirects),
                    });
                }

                let location = response
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RepoError::NetworkError {
                        message: "Redirect without Location header".to_string(),
                    })?;

                let base = Url::parse(&current_url)?;
                current_url = base.join(location)?.to_string();
                continue;
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);

                return Err(RepoError::RateLimited { retry_after });
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(RepoError::AuthRequired { url: current_url });
            }
            if status == reqwest::StatusCode::FORBIDDEN {
                return Err(RepoError::AuthFailed {
                    message: format!("Access denied to {}", current_url),
                });
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(RepoError::HttpError {
                    status: 404,
                    message: format!("{} not found", current_url),
                });
            }

            if !status.is_success() {
                return Err(RepoError::HttpError {
                    status: status.as_u16(),
                    message: format!("Request to {} failed", current_url),
                });
            }

            return Ok(response);
        }
    }

    /// Fetch bytes from URL
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        let bytes = response.bytes().await.map_err(|e| RepoError::NetworkError {
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

// =========================================================================
// Registry credentials (docker config.json)
// =========================================================================

/// Docker config.json format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuth>,

    /// Default credential helper for every registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creds_store: Option<String>,

    /// Per-registry credential helpers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DockerConfig {
    /// Load a config file; a missing file yields an empty config
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match dirs::home_dir() {
                Some(home) => home.join(".docker").join("config.json"),
                None => return Ok(Self::default()),
            },
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Inline credentials for a registry host
    pub fn auth_for_registry(&self, host: &str) -> Option<BasicAuth> {
        let candidates = [
            host.to_string(),
            format!("https://{}", host),
            format!("http://{}", host),
            format!("https://{}/v1/", host),
        ];

        candidates
            .iter()
            .find_map(|candidate| self.auths.get(candidate))
            .and_then(DockerAuth::decode)
    }

    /// Credential helper configured for a registry host
    pub fn helper_for_registry(&self, host: &str) -> Option<&str> {
        self.cred_helpers
            .get(host)
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }

    /// Resolve credentials for a host, inline entries first, then helpers
    pub async fn resolve(&self, host: &str) -> Result<Option<BasicAuth>> {
        if let Some(auth) = self.auth_for_registry(host) {
            return Ok(Some(auth));
        }
        match self.helper_for_registry(host) {
            Some(helper) => run_credential_helper(helper, host).await,
            None => Ok(None),
        }
    }
}

impl DockerAuth {
    fn decode(&self) -> Option<BasicAuth> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            return Some(BasicAuth::new(u.clone(), p.clone()));
        }
        let encoded = self.auth.as_ref()?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        let creds = String::from_utf8(decoded).ok()?;
        let (user, pass) = creds.split_once(':')?;
        Some(BasicAuth::new(user, pass))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

/// Run `docker-credential-<helper> get` for a host
async fn run_credential_helper(helper: &str, host: &str) -> Result<Option<BasicAuth>> {
    use tokio::io::AsyncWriteExt;

    let program = format!("docker-credential-{}", helper);
    tracing::debug!(helper = %program, host, "querying credential helper");

    let mut child = match tokio::process::Command::new(&program)
        .arg("get")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("credential helper {} unavailable: {}", program, e);
            return Ok(None);
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(host.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        // Helpers exit non-zero when they hold nothing for the host
        return Ok(None);
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)?;
    Ok(Some(BasicAuth::new(response.username, response.secret)))
}

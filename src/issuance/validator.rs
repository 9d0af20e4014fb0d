use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Url, redirect};
use thiserror::Error;
use tokio::net::lookup_host;

/// Network-level failures during the challenge fetch. These are retried by
/// the orchestrator; a reachable-but-wrong response is not an error, it is
/// `Ok(false)`.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The host resolves to a loopback/private/link-local address. Retrying
    /// will not help, and following the fetch would hand an attacker-chosen
    /// hostname access to the internal network.
    #[error("refusing to fetch challenge from non-public address for {0}")]
    Blocked(String),
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Per-attempt budget covering connect, TLS-free GET, and body read.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Upper bound on bytes read from the response body. A key
    /// authorization is ~100 bytes; anything near the cap is not one.
    pub max_body_bytes: usize,
    /// Permit fetches against loopback/private ranges. Off everywhere
    /// except tests and explicitly configured internal deployments.
    pub allow_private_networks: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: resolve_timeout(),
            max_redirects: 3,
            max_body_bytes: 4096,
            allow_private_networks: false,
        }
    }
}

fn resolve_timeout() -> Duration {
    const DEFAULT_TIMEOUT_SECS: u64 = 5;
    let timeout = std::env::var("CERTFLOW_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[validator] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

/// Performs the pre-check fetch of
/// `http://{domain}/.well-known/acme-challenge/{token}` and compares the
/// trimmed body against the expected key authorization.
///
/// The fetch target is attacker-influenced input, so every hop gets the same
/// treatment: the host is resolved and screened first, the screened
/// addresses are pinned into the client so the actual connection cannot
/// re-resolve elsewhere, and redirects are never followed automatically.
pub struct ChallengeValidator {
    config: ValidatorConfig,
}

impl ChallengeValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// `Ok(true)` on an exact (trimmed) match, `Ok(false)` when the domain
    /// answered but with the wrong content, a non-2xx status, or more
    /// redirects than allowed, `Err` when the fetch itself failed.
    pub async fn validate(
        &self,
        domain: &str,
        token: &str,
        expected_key_authorization: &str,
    ) -> Result<bool, FetchError> {
        let mut url = Url::parse(&format!(
            "http://{domain}/.well-known/acme-challenge/{token}"
        ))
        .map_err(|err| FetchError::Transient(format!("invalid challenge URL for {domain}: {err}")))?;

        // The client never follows redirects on its own; each hop re-enters
        // address screening here so a public host cannot bounce the fetch
        // into a private range.
        for hop in 0..=self.config.max_redirects {
            debug!("[validator] fetching {url}");
            let response = self.fetch(&url).await?;

            if response.status().is_redirection() {
                if hop == self.config.max_redirects {
                    debug!(
                        "[validator] {domain} exceeded {} redirects",
                        self.config.max_redirects
                    );
                    return Ok(false);
                }
                match redirect_target(&url, &response) {
                    Some(next) => {
                        debug!("[validator] {domain} redirected to {next}");
                        url = next;
                    }
                    None => {
                        debug!("[validator] {domain} answered a redirect without a usable target");
                        return Ok(false);
                    }
                }
                continue;
            }

            let status = response.status();
            if !status.is_success() {
                debug!("[validator] {domain} answered {status} for challenge fetch");
                return Ok(false);
            }

            let body = match self.read_capped(response).await? {
                Some(body) => body,
                None => {
                    debug!(
                        "[validator] {domain} returned more than {} bytes; not a key authorization",
                        self.config.max_body_bytes
                    );
                    return Ok(false);
                }
            };

            let matched = body.trim() == expected_key_authorization;
            if !matched {
                debug!("[validator] challenge body mismatch for {domain}");
            }
            return Ok(matched);
        }
        Ok(false)
    }

    /// Screens the URL's host, then performs one GET with the screened
    /// addresses pinned into the client, so the connection goes to exactly
    /// the addresses that passed screening.
    async fn fetch(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::Transient(format!("no host in {url}")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let pinned = self.screened_addrs(host, port).await?;

        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .redirect(redirect::Policy::none());
        if let Some(addrs) = &pinned {
            builder = builder.resolve_to_addrs(host, addrs);
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::Transient(format!("failed to build HTTP client: {err}")))?;

        client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchError::Transient(format!("fetch of {url} failed: {err}")))
    }

    /// Reads the body up to the configured cap. `None` means the response
    /// was oversized and got discarded.
    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Option<String>, FetchError> {
        let mut collected: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if collected.len() + chunk.len() > self.config.max_body_bytes {
                        return Ok(None);
                    }
                    collected.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(FetchError::Transient(format!(
                        "reading challenge body failed: {err}"
                    )));
                }
            }
        }
        Ok(Some(String::from_utf8_lossy(&collected).into_owned()))
    }

    /// Resolves the host and refuses the fetch when any address is outside
    /// the public ranges. Returns the resolved addresses for pinning, or
    /// `None` when no pinning is needed (IP-literal host, or private
    /// networks explicitly allowed). DNS failure is transient; a non-public
    /// answer is final.
    async fn screened_addrs(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Option<Vec<SocketAddr>>, FetchError> {
        if self.config.allow_private_networks {
            return Ok(None);
        }

        // `Url::host_str` keeps the brackets on IPv6 literals.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if !is_public_address(ip) {
                return Err(FetchError::Blocked(host.to_string()));
            }
            return Ok(None);
        }

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|err| FetchError::Transient(format!("DNS lookup for {host} failed: {err}")))?
            .collect();
        if addrs.is_empty() {
            return Err(FetchError::Transient(format!("no addresses for {host}")));
        }
        if addrs.iter().any(|addr| !is_public_address(addr.ip())) {
            warn!("[validator] {host} resolves to a non-public address; refusing fetch");
            return Err(FetchError::Blocked(host.to_string()));
        }
        Ok(Some(addrs))
    }
}

/// The next URL a redirect response points at, resolved against the current
/// one. `None` when the `Location` header is missing, unparsable, or not an
/// HTTP(S) target.
fn redirect_target(current: &Url, response: &reqwest::Response) -> Option<Url> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)?
        .to_str()
        .ok()?;
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

fn is_public_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local())
        }
    }
}

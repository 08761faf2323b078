use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{Error, IndexClient};

/// Longest we are willing to sleep for a GitHub rate-limit reset.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(300);

/// Attempts per page, counting rate-limit sleeps.
const MAX_ATTEMPTS: u32 = 5;

/// A repository tag as returned by the GitHub API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubTag {
    pub name: String,
    pub tarball_url: String,
}

impl IndexClient {
    /// List every tag of `organization/repo`, following pagination.
    ///
    /// Honors `GITHUB_TOKEN` for authentication and sleeps until
    /// `X-RateLimit-Reset` (capped) when the rate limit trips.
    pub async fn github_tags(
        &self,
        api_url: &str,
        organization: &str,
        repo: &str,
    ) -> Result<Vec<GitHubTag>, Error> {
        let token = std::env::var("GITHUB_TOKEN").ok();
        let mut tags = Vec::new();
        let mut page = 1u32;
        loop {
            let url = Url::parse(&format!(
                "{}/repos/{organization}/{repo}/tags?per_page=100&page={page}",
                api_url.trim_end_matches('/'),
            ))?;
            let batch = self.github_get(url, token.as_deref()).await?;
            let batch: Vec<GitHubTag> = serde_json::from_str(&batch).map_err(|err| {
                Error::BadJson {
                    source: err,
                    url: format!("{organization}/{repo} tags page {page}"),
                }
            })?;
            if batch.is_empty() {
                break;
            }
            tags.extend(batch);
            page += 1;
        }
        Ok(tags)
    }

    async fn github_get(&self, url: Url, token: Option<&str>) -> Result<String, Error> {
        for _ in 0..MAX_ATTEMPTS {
            let mut request = self
                .raw_client()
                .get(url.clone())
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;

            if matches!(
                response.status(),
                StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
            ) && rate_limited(&response)
            {
                let wait = reset_delay(&response).unwrap_or(MAX_RATE_LIMIT_WAIT);
                if wait > MAX_RATE_LIMIT_WAIT {
                    return Err(Error::GitHubRateLimit);
                }
                warn!(
                    "GitHub rate limit hit for {url}, sleeping {}s until reset",
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let response = response.error_for_status().map_err(Error::Request)?;
            return Ok(response.text().await?);
        }
        Err(Error::GitHubRateLimit)
    }
}

fn rate_limited(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|remaining| remaining == "0")
}

/// Seconds until the advertised reset, if the header is present and sane.
fn reset_delay(response: &reqwest::Response) -> Option<Duration> {
    let reset = response
        .headers()
        .get("x-ratelimit-reset")
        .and_then(|value| value.to_str().ok())?
        .parse::<u64>()
        .ok()?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    let delay = reset.saturating_sub(now).max(1);
    debug!("rate limit resets in {delay}s");
    Some(Duration::from_secs(delay))
}

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, ClientBuilder, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use tracing::{debug, trace};
use url::Url;

use fromager_normalize::PackageName;
use fromager_pypi_types::{File, Metadata, SimpleJson};

use crate::html::SimpleHtml;
use crate::Error;

/// The Accept header for simple-index fetches: JSON per PEP 691 with an
/// HTML fallback.
const SIMPLE_ACCEPT: &str = "application/vnd.pypi.simple.v1+json, text/html;q=0.2";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Cap on a single retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A builder for an [`IndexClient`].
#[derive(Debug, Clone)]
pub struct IndexClientBuilder {
    retries: u32,
    timeout: Duration,
}

impl Default for IndexClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexClientBuilder {
    pub fn new() -> Self {
        Self {
            retries: 5,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> IndexClient {
        let client_raw = {
            let client_core = ClientBuilder::new()
                .user_agent("fromager")
                .pool_max_idle_per_host(20)
                .timeout(self.timeout);
            client_core.build().expect("Failed to build HTTP client")
        };

        // Exponential backoff with jitter on 429s and 5xx, bounded per
        // request and per attempt count.
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), MAX_BACKOFF)
            .build_with_max_retries(self.retries);
        let retry_strategy = RetryTransientMiddleware::new_with_policy(retry_policy);

        let client = reqwest_middleware::ClientBuilder::new(client_raw.clone())
            .with(retry_strategy)
            .build();

        IndexClient { client, client_raw }
    }
}

/// A client for fetching project pages, metadata, and artifacts from
/// PyPI-compatible indexes.
#[derive(Debug, Clone)]
pub struct IndexClient {
    client: ClientWithMiddleware,
    /// The bare client, used where middleware retries would mask a
    /// rate-limit header we want to inspect.
    client_raw: Client,
}

impl IndexClient {
    pub fn raw_client(&self) -> &Client {
        &self.client_raw
    }

    /// Fetch a project page from a simple index.
    ///
    /// "simple" here refers to
    /// [PEP 503 – Simple Repository API](https://peps.python.org/pep-0503/)
    /// and [PEP 691 – JSON-based Simple API](https://peps.python.org/pep-0691/);
    /// JSON is preferred, HTML is the fallback.
    pub async fn simple(
        &self,
        index_url: &str,
        package_name: &PackageName,
    ) -> Result<Vec<File>, Error> {
        let mut url = Url::parse(index_url)?;
        url.path_segments_mut()
            .map_err(|()| Error::PackageNotFound(package_name.to_string()))?
            .pop_if_empty()
            .push(package_name.as_ref())
            .push("");

        trace!("fetching project page for {package_name} from {url}");
        let response = self
            .client
            .get(url.clone())
            .header("Accept", SIMPLE_ACCEPT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::PackageNotFound(package_name.to_string()));
        }
        let response = response.error_for_status().map_err(Error::Request)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response.text().await?;

        if content_type.starts_with("application/vnd.pypi.simple.v1+json")
            || content_type.starts_with("application/json")
        {
            let data: SimpleJson =
                serde_json::from_str(&text).map_err(|err| Error::BadJson {
                    source: err,
                    url: url.to_string(),
                })?;
            Ok(data.files)
        } else {
            let html = SimpleHtml::parse(&text, &url)?;
            Ok(html.files)
        }
    }

    /// Fetch the metadata for a wheel file.
    ///
    /// Prefers the [PEP 658](https://peps.python.org/pep-0658/) `.metadata`
    /// sidecar; on any sidecar failure, falls back to downloading the wheel
    /// and reading `*.dist-info/METADATA` from the zip.
    pub async fn wheel_metadata(&self, file: &File) -> Result<Metadata, Error> {
        if file.has_metadata() {
            match self.metadata_from_sidecar(file).await {
                Ok(metadata) => return Ok(metadata),
                Err(err) => {
                    debug!(
                        "failed to fetch metadata sidecar for {}, falling back to the wheel: {err}",
                        file.filename
                    );
                }
            }
        }
        self.metadata_from_wheel(&file.url).await
    }

    async fn metadata_from_sidecar(&self, file: &File) -> Result<Metadata, Error> {
        let url = Url::parse(&format!("{}.metadata", file.url))?;
        trace!("fetching metadata sidecar from {url}");
        let response = self.client.get(url).send().await?;
        let bytes = response.error_for_status().map_err(Error::Request)?.bytes().await?;
        Ok(Metadata::parse(&bytes)?)
    }

    /// Download the wheel into memory and read the `METADATA` entry from
    /// its `.dist-info` directory.
    pub async fn metadata_from_wheel(&self, wheel_url: &str) -> Result<Metadata, Error> {
        trace!("downloading wheel for metadata from {wheel_url}");
        let response = self.client.get(wheel_url).send().await?;
        let bytes = response.error_for_status().map_err(Error::Request)?.bytes().await?;

        let reader = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|err| Error::Zip(wheel_url.to_string(), err))?;
        let entry_name = archive
            .file_names()
            .find(|name| {
                name.ends_with(".dist-info/METADATA") && name.matches('/').count() == 1
            })
            .map(String::from)
            .ok_or_else(|| Error::MissingDistInfo(wheel_url.to_string()))?;
        let mut contents = Vec::new();
        archive
            .by_name(&entry_name)
            .map_err(|err| Error::Zip(wheel_url.to_string(), err))?
            .read_to_end(&mut contents)?;
        Ok(Metadata::parse(&contents)?)
    }

    /// Stream a download to `destination`, which must not yet exist; the
    /// file is written through a `.part` path and renamed into place so a
    /// crash never leaves a truncated artifact behind.
    pub async fn download_to(&self, url: &str, destination: &Path) -> Result<(), Error> {
        debug!("downloading {url} to {}", destination.display());
        let response = self.client.get(url).send().await?;
        let response = response.error_for_status().map_err(Error::Request)?;

        let part = destination.with_extension("part");
        {
            let mut file = fs_err::tokio::File::create(&part).await?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(Error::Request)?;
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
        }
        fs_err::tokio::rename(&part, destination).await?;
        Ok(())
    }

    /// GET a URL and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, Error> {
        let response = self.client.get(url).send().await?;
        Ok(response.error_for_status().map_err(Error::Request)?.text().await?)
    }

}

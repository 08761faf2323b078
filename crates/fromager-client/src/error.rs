use thiserror::Error;

use fromager_pypi_types::MetadataError;

#[derive(Debug, Error)]
pub enum Error {
    /// An invalid URL was provided.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// The package was not found in the registry.
    ///
    /// Make sure the package name is spelled correctly and that you've
    /// configured the right registry to fetch it from.
    #[error("Package `{0}` was not found in the registry.")]
    PackageNotFound(String),

    /// A generic request error happened while making a request. Refer to the
    /// error message for more details.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// A generic request middleware error happened while making a request.
    /// Refer to the error message for more details.
    #[error(transparent)]
    RequestMiddleware(#[from] reqwest_middleware::Error),

    #[error("Received some unexpected JSON from {url}")]
    BadJson {
        source: serde_json::Error,
        url: String,
    },

    #[error("Failed to parse the simple index HTML page from {url}: {message}")]
    BadHtml { message: String, url: String },

    #[error("The wheel at {0} is not a valid zip file")]
    Zip(String, #[source] zip::result::ZipError),

    #[error("The wheel at {0} does not contain a `*.dist-info/METADATA` entry")]
    MissingDistInfo(String),

    #[error(transparent)]
    MetadataParse(#[from] MetadataError),

    #[error("GitHub rate limit exceeded and reset is too far away")]
    GitHubRateLimit,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! HTTP access for the bootstrap: simple-index pages (PEP 503/691), wheel
//! metadata (PEP 658 with a zip-inspection fallback), artifact downloads,
//! and GitHub tag listings.

pub use crate::client::{IndexClient, IndexClientBuilder};
pub use crate::error::Error;
pub use crate::github::GitHubTag;
pub use crate::html::SimpleHtml;

mod client;
mod error;
mod github;
mod html;

use tl::HTMLTag;
use url::Url;

use fromager_pypi_types::{DistInfoMetadata, File, Hashes};

use crate::Error;

/// The files parsed from a PEP 503 simple HTML project page.
#[derive(Debug, Clone)]
pub struct SimpleHtml {
    /// The base to which relative file URLs are resolved.
    pub base: Url,
    /// The list of [`File`]s available for download.
    pub files: Vec<File>,
}

impl SimpleHtml {
    /// Parse the list of [`File`]s from the simple HTML page returned by the
    /// given URL.
    pub fn parse(text: &str, url: &Url) -> Result<Self, Error> {
        let dom = tl::parse(text, tl::ParserOptions::default()).map_err(|err| Error::BadHtml {
            message: err.to_string(),
            url: url.to_string(),
        })?;
        // The HTML spec requires any `<base>` tag to appear before tags with
        // URL attribute values, so scanning for the first one suffices.
        let mut base = url.clone();
        for node in dom.nodes() {
            let Some(tag) = node.as_tag() else { continue };
            if matches!(tag.name().as_bytes(), b"a" | b"link") {
                break;
            }
            if tag.name().as_bytes() == b"base" {
                if let Some(Some(href)) = tag.attributes().get("href") {
                    let href = std::str::from_utf8(href.as_bytes()).map_err(|err| {
                        Error::BadHtml {
                            message: err.to_string(),
                            url: url.to_string(),
                        }
                    })?;
                    base = Url::parse(href).map_err(|err| Error::BadHtml {
                        message: format!("invalid base href `{href}`: {err}"),
                        url: url.to_string(),
                    })?;
                }
                break;
            }
        }

        let mut files = Vec::new();
        for node in dom.nodes() {
            let Some(tag) = node.as_tag() else { continue };
            if tag.name().as_bytes() != b"a" {
                continue;
            }
            if let Some(file) = Self::parse_anchor(tag, &base, url)? {
                files.push(file);
            }
        }
        Ok(Self { base, files })
    }

    /// Parse a [`File`] from an `<a>` tag; anchors without an `href` are
    /// skipped.
    fn parse_anchor(link: &HTMLTag, base: &Url, page_url: &Url) -> Result<Option<File>, Error> {
        let Some(Some(href)) = link.attributes().get("href") else {
            return Ok(None);
        };
        let href = std::str::from_utf8(href.as_bytes()).map_err(|err| Error::BadHtml {
            message: err.to_string(),
            url: page_url.to_string(),
        })?;
        if href.is_empty() {
            return Ok(None);
        }
        let href = html_escape::decode_html_entities(href);

        let resolved = base.join(&href).map_err(|err| Error::BadHtml {
            message: format!("invalid href `{href}`: {err}"),
            url: page_url.to_string(),
        })?;

        // The hash, when present, rides in the URL fragment as
        // `#sha256=<hex>`.
        let mut hashes = Hashes::default();
        if let Some(fragment) = resolved.fragment() {
            if let Some((name, value)) = fragment.split_once('=') {
                if name == "sha256" {
                    hashes.sha256 = Some(value.to_string());
                }
            }
        }
        let mut file_url = resolved.clone();
        file_url.set_fragment(None);

        // The filename is the display text, which must match the last path
        // component; prefer the path component as the original scrapers do.
        let filename = file_url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        if filename.is_empty() {
            return Ok(None);
        }
        let filename = urlencoding_decode(&filename);

        let requires_python = link
            .attributes()
            .get("data-requires-python")
            .flatten()
            .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
            .map(|value| html_escape::decode_html_entities(value).to_string());

        let dist_info_metadata = link
            .attributes()
            .get("data-core-metadata")
            .flatten()
            .or_else(|| link.attributes().get("data-dist-info-metadata").flatten())
            .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
            .map(|value| {
                if value == "false" {
                    DistInfoMetadata::Bool(false)
                } else {
                    DistInfoMetadata::Bool(true)
                }
            });

        let yanked = link
            .attributes()
            .get("data-yanked")
            .flatten()
            .map(|_| fromager_pypi_types::Yanked::Bool(true));

        Ok(Some(File {
            filename,
            url: file_url.to_string(),
            hashes,
            requires_python,
            dist_info_metadata,
            yanked,
        }))
    }
}

/// Percent-decode a filename component; index pages escape `+` and friends.
fn urlencoding_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next();
            let lo = bytes.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let hex = [hi, lo];
                if let Ok(hex) = std::str::from_utf8(&hex) {
                    if let Ok(value) = u8::from_str_radix(hex, 16) {
                        out.push(value as char);
                        continue;
                    }
                }
            }
            out.push('%');
            if let Some(hi) = hi {
                out.push(hi as char);
            }
            if let Some(lo) = lo {
                out.push(lo as char);
            }
        } else {
            out.push(b as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<!DOCTYPE html>
<html>
  <body>
    <h1>Links for pbr</h1>
    <a href="https://files.example.com/pbr-6.0.0-py2.py3-none-any.whl#sha256=deadbeef"
       data-requires-python="&gt;=2.6" data-core-metadata="true">pbr-6.0.0-py2.py3-none-any.whl</a>
    <a href="../../pbr-6.0.0.tar.gz#sha256=cafe">pbr-6.0.0.tar.gz</a>
    <a>no href</a>
  </body>
</html>
"#;

    #[test]
    fn parse_page() {
        let url = Url::parse("https://pypi.org/simple/pbr/").unwrap();
        let page = SimpleHtml::parse(PAGE, &url).unwrap();
        assert_eq!(page.files.len(), 2);

        let wheel = &page.files[0];
        assert_eq!(wheel.filename, "pbr-6.0.0-py2.py3-none-any.whl");
        assert_eq!(wheel.hashes.sha256.as_deref(), Some("deadbeef"));
        assert_eq!(wheel.requires_python.as_deref(), Some(">=2.6"));
        assert!(wheel.has_metadata());

        let sdist = &page.files[1];
        assert_eq!(sdist.filename, "pbr-6.0.0.tar.gz");
        assert_eq!(sdist.url, "https://pypi.org/pbr-6.0.0.tar.gz");
        assert!(!sdist.has_metadata());
    }

    #[test]
    fn parse_base_tag() {
        let page = r#"<html><head><base href="https://mirror.example.com/root/"></head>
            <body><a href="pkg-1.0.tar.gz#sha256=00">pkg-1.0.tar.gz</a></body></html>"#;
        let url = Url::parse("https://pypi.org/simple/pkg/").unwrap();
        let parsed = SimpleHtml::parse(page, &url).unwrap();
        assert_eq!(
            parsed.files[0].url,
            "https://mirror.example.com/root/pkg-1.0.tar.gz"
        );
    }

    #[test]
    fn missing_hash_is_fine() {
        let page = r#"<a href="pkg-1.0.tar.gz">pkg-1.0.tar.gz</a>"#;
        let url = Url::parse("https://index.example.com/pkg/").unwrap();
        let parsed = SimpleHtml::parse(page, &url).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert!(parsed.files[0].hashes.sha256.is_none());
    }
}

//! `$name` / `${name}` template substitution for download URLs, destination
//! filenames, and env var composition.

use indexmap::IndexMap;

use crate::SettingsError;

/// Substitute `$name` and `${name}` placeholders from `values`.
///
/// An unknown placeholder is an error; a literal `$$` escapes to `$`.
pub(crate) fn substitute(
    template: &str,
    values: &IndexMap<String, String>,
) -> Result<String, SettingsError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(lookup(template, &name, values)?);
            }
            Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(lookup(template, &name, values)?);
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

fn lookup<'a>(
    template: &str,
    name: &str,
    values: &'a IndexMap<String, String>,
) -> Result<&'a str, SettingsError> {
    values
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| SettingsError::UnresolvedTemplate {
            template: template.to_string(),
            placeholder: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> IndexMap<String, String> {
        IndexMap::from([
            ("canonicalized_name".to_string(), "my-pkg".to_string()),
            ("version".to_string(), "1.2.3".to_string()),
        ])
    }

    #[test]
    fn braced_and_bare() {
        assert_eq!(
            substitute(
                "https://example.com/${canonicalized_name}/$version.tar.gz",
                &values()
            )
            .unwrap(),
            "https://example.com/my-pkg/1.2.3.tar.gz"
        );
    }

    #[test]
    fn unknown_placeholder_errors() {
        assert!(substitute("https://example.com/${oops}", &values()).is_err());
    }

    #[test]
    fn dollar_escape() {
        assert_eq!(substitute("a$$b", &values()).unwrap(), "a$b");
    }
}

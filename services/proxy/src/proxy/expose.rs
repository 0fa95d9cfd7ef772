//! Exposure annotation parsing.
//!
//! An annotation is a comma-separated list of `<url>=<port>` sections.
//! A `<url>` beginning with `/` declares a wildcard-host route for that
//! path; otherwise it is `host[/path]`. Paths lose their leading and
//! trailing slashes, and a missing path means the host's default route.
//!
//! No case or percent-encoding normalization is performed; the routing
//! table matches whatever is declared here, byte for byte.

use thiserror::Error;

use super::router::HostKey;

/// A declaration failure is fatal for the whole annotation; callers must
/// not apply a partially parsed declaration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExposeError {
    /// A section does not contain exactly one `=`.
    #[error("malformed annotation section {0:?}: expected <url>=<port>")]
    MalformedAnnotation(String),

    /// The port half of a section is not a valid port number.
    #[error("invalid port {port:?} in annotation section {section:?}")]
    InvalidPort { section: String, port: String },
}

/// One `(host, path, port)` route declaration from an annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecl {
    pub host: HostKey,
    pub path: String,
    pub port: u16,
}

/// Parse an exposure annotation into its ordered route declarations.
pub fn parse_expose(annotation: &str) -> Result<Vec<RouteDecl>, ExposeError> {
    annotation.split(',').map(parse_section).collect()
}

fn parse_section(section: &str) -> Result<RouteDecl, ExposeError> {
    let mut parts = section.split('=');
    let (url, port) = match (parts.next(), parts.next(), parts.next()) {
        (Some(url), Some(port), None) => (url, port),
        _ => return Err(ExposeError::MalformedAnnotation(section.to_string())),
    };

    let port: u16 = port.parse().map_err(|_| ExposeError::InvalidPort {
        section: section.to_string(),
        port: port.to_string(),
    })?;

    let (host, path) = if let Some(path) = url.strip_prefix('/') {
        // Path-only url: applies to any host.
        (HostKey::Wildcard, path.trim_matches('/'))
    } else {
        match url.split_once('/') {
            Some((host, path)) => (HostKey::exact(host), path.trim_matches('/')),
            None => (HostKey::exact(url), ""),
        }
    };

    Ok(RouteDecl {
        host,
        path: path.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_wildcard_sections() {
        let decls = parse_expose("svc.local/api=9000,/health=9000").unwrap();
        assert_eq!(
            decls,
            vec![
                RouteDecl {
                    host: HostKey::exact("svc.local"),
                    path: "api".to_string(),
                    port: 9000,
                },
                RouteDecl {
                    host: HostKey::Wildcard,
                    path: "health".to_string(),
                    port: 9000,
                },
            ]
        );
    }

    #[test]
    fn test_parse_host_only_declares_default_route() {
        let decls = parse_expose("svc.local=8080").unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].host, HostKey::exact("svc.local"));
        assert_eq!(decls[0].path, "");
        assert_eq!(decls[0].port, 8080);
    }

    #[test]
    fn test_parse_strips_trailing_slashes() {
        let decls = parse_expose("svc.local/api/v1/=9000").unwrap();
        assert_eq!(decls[0].path, "api/v1");

        let decls = parse_expose("/wg/=9000").unwrap();
        assert_eq!(decls[0].host, HostKey::Wildcard);
        assert_eq!(decls[0].path, "wg");
    }

    #[test]
    fn test_parse_rejects_missing_equals() {
        assert_eq!(
            parse_expose("svc.local"),
            Err(ExposeError::MalformedAnnotation("svc.local".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_double_equals() {
        assert!(matches!(
            parse_expose("svc.local=9000=extra"),
            Err(ExposeError::MalformedAnnotation(_))
        ));
    }

    #[test]
    fn test_one_bad_section_fails_the_whole_annotation() {
        assert!(parse_expose("svc.local/api=9000,broken").is_err());
    }

    #[test]
    fn test_parse_rejects_non_numeric_port() {
        assert_eq!(
            parse_expose("svc.local=web"),
            Err(ExposeError::InvalidPort {
                section: "svc.local=web".to_string(),
                port: "web".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_keeps_case_and_encoding() {
        let decls = parse_expose("SVC.Local/Api%20x=9000").unwrap();
        assert_eq!(decls[0].host, HostKey::exact("SVC.Local"));
        assert_eq!(decls[0].path, "Api%20x");
    }
}

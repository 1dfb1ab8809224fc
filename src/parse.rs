use std::str::FromStr;

use http::{
    Version,
    uri::{self, Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Creates an authority from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`; the port is required.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let authority = uri::Authority::from_str(s.trim()).std_context("Invalid authority string")?;
        let port = authority.port_u16().context("Expected authority with port")?;
        Ok(Self::new(authority.host(), port))
    }

    /// Parses `host[:port]`, using `default_port` if no port is given.
    pub fn with_default_port(s: &str, default_port: u16) -> Result<Self> {
        let authority = uri::Authority::from_str(s.trim()).std_context("Invalid authority string")?;
        let port = authority.port_u16().unwrap_or(default_port);
        Ok(Self::new(authority.host(), port))
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http` and `https` schemes are accepted.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self::new(authority.host(), port))
    }

    /// Returns the host in a form accepted by socket address resolution.
    pub(crate) fn connect_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

/// Parses an `HTTP/<digit>.<digit>` version token.
pub(crate) fn parse_version(token: &str) -> Option<Version> {
    let digits = token.strip_prefix("HTTP/")?.as_bytes();
    let [major, b'.', minor] = digits else {
        return None;
    };
    if !major.is_ascii_digit() || !minor.is_ascii_digit() {
        return None;
    }
    Some(match (major, minor) {
        (b'0', _) => Version::HTTP_09,
        (b'1', b'0') => Version::HTTP_10,
        (b'1', _) => Version::HTTP_11,
        (b'2', _) => Version::HTTP_2,
        _ => Version::HTTP_3,
    })
}

/// Returns whether `chunked` is the final transfer coding of a
/// `Transfer-Encoding` value.
pub(crate) fn is_chunked(value: &str) -> bool {
    let value = value.trim_end_matches([' ', '\t']).to_ascii_lowercase();
    match value.strip_suffix("chunked") {
        Some(prefix) => prefix.is_empty() || prefix.ends_with([' ', '\t', ':', ',']),
        None => false,
    }
}

/// Parses a `Content-Length` value.
pub(crate) fn parse_content_length(value: &str) -> Option<u64> {
    let value = value.trim_matches([' ', '\t']);
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Returns whether a comma separated `Connection` value lists `option`.
pub(crate) fn has_connection_option(value: &str, option: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(option))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_default_port() {
        let a = Authority::with_default_port(" www.example.org ", 80).unwrap();
        assert_eq!(a.to_string(), "www.example.org:80");
        let a = Authority::with_default_port("www.example.org:81", 80).unwrap();
        assert_eq!(a.port, 81);
        let a = Authority::with_default_port("[::1]:8080", 80).unwrap();
        assert_eq!(a.connect_host(), "::1");
        assert!(Authority::from_authority_str("example.org").is_err());
    }

    #[test]
    fn authority_from_absolute_uri() {
        let uri: Uri = "https://example.org/path".parse().unwrap();
        assert_eq!(Authority::from_absolute_uri(&uri).unwrap().port, 443);
        let uri: Uri = "http://example.org:8080/".parse().unwrap();
        assert_eq!(Authority::from_absolute_uri(&uri).unwrap().port, 8080);
        let uri: Uri = "ftp://example.org/".parse().unwrap();
        assert!(Authority::from_absolute_uri(&uri).is_err());
    }

    #[test]
    fn versions() {
        assert_eq!(parse_version("HTTP/1.1"), Some(Version::HTTP_11));
        assert_eq!(parse_version("HTTP/1.0"), Some(Version::HTTP_10));
        assert_eq!(parse_version("HTTPS/1.1"), None);
        assert_eq!(parse_version("http/1.1"), None);
        assert_eq!(parse_version("HTTP/1.1.2"), None);
        assert_eq!(parse_version("HTTP/1"), None);
    }

    #[test]
    fn transfer_coding() {
        assert!(is_chunked("chunked"));
        assert!(is_chunked(" gzip, Chunked  "));
        assert!(is_chunked("gzip,chunked"));
        assert!(!is_chunked("xchunked"));
        assert!(!is_chunked("chunked, gzip"));
    }

    #[test]
    fn content_length() {
        assert_eq!(parse_content_length(" 42\t"), Some(42));
        assert_eq!(parse_content_length("-1"), None);
        assert_eq!(parse_content_length("4 2"), None);
        assert_eq!(parse_content_length(""), None);
    }

    #[test]
    fn connection_options() {
        assert!(has_connection_option("Keep-Alive", "keep-alive"));
        assert!(has_connection_option("upgrade, close", "close"));
        assert!(!has_connection_option("closed", "close"));
    }
}

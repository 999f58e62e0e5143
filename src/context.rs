//! Per-request evaluation context and the narrow host capability surface.
//!
//! The engine never talks to the surrounding framework directly: the host
//! builds a [`RewriteContext`] from whatever request type it owns, hands it
//! to [`Engine::apply`](crate::Engine::apply), and reads the mutated URL or
//! finalized response back out afterwards.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use unicase::UniCase;

/// File-system probe used by `IsFile` / `IsDirectory` matchers.
///
/// The engine performs no file I/O itself; hosts supply an implementation
/// (or rely on [`DiskProbe`] for plain on-disk documents). Probe failures
/// are reported as errors and degrade to a non-match for the condition
/// that asked.
pub trait FileProbe {
    fn is_file(&self, path: &str) -> io::Result<bool>;
    fn is_dir(&self, path: &str) -> io::Result<bool>;
}

/// Probe that answers "absent" for every path.
///
/// Default for contexts whose host never wires a real probe.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProbe;

impl FileProbe for NoopProbe {
    fn is_file(&self, _path: &str) -> io::Result<bool> {
        Ok(false)
    }

    fn is_dir(&self, _path: &str) -> io::Result<bool> {
        Ok(false)
    }
}

/// Probe backed by the local file system, rooted at a document directory.
#[derive(Clone, Debug)]
pub struct DiskProbe {
    root: std::path::PathBuf,
}

impl DiskProbe {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> std::path::PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileProbe for DiskProbe {
    fn is_file(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path).is_file())
    }

    fn is_dir(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path).is_dir())
    }
}

static NOOP_PROBE: NoopProbe = NoopProbe;

/// Case-insensitive header map.
#[derive(Clone, Debug, Default)]
pub struct Headers(HashMap<UniCase<String>, String>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&UniCase::new(name.to_owned())).map(|v| v.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(UniCase::new(name.into()), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&UniCase::new(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }
}

/// Mutable per-request state threaded through one engine run.
///
/// Created fresh from host-supplied request parts, consumed entirely within
/// the handling of a single request, and discarded afterwards. The compiled
/// rule set itself is never mutated through this type.
pub struct RewriteContext<'a> {
    pub scheme: String,
    pub host: String,
    /// Request path, always with a leading slash.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: String,
    pub method: String,

    pub remote_addr: Option<String>,
    pub remote_port: Option<u16>,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,

    pub request_headers: Headers,
    pub response_headers: Headers,

    /// Pending response, populated by terminal actions.
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub body: Option<String>,
    pub aborted: bool,

    pub(crate) probe: &'a dyn FileProbe,
}

impl<'a> RewriteContext<'a> {
    /// Context for the given request line parts.
    pub fn new(scheme: &str, host: &str, path: &str, query: &str) -> Self {
        let mut path = path.to_owned();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            path,
            query: query.trim_start_matches('?').to_owned(),
            method: String::from("GET"),
            remote_addr: None,
            remote_port: None,
            local_addr: None,
            local_port: None,
            request_headers: Headers::default(),
            response_headers: Headers::default(),
            status: None,
            reason: None,
            body: None,
            aborted: false,
            probe: &NOOP_PROBE,
        }
    }

    /// Context from a full request URI such as `http://host/path?query`.
    pub fn from_uri(uri: &str) -> Self {
        let (scheme, rest) = uri.split_once("://").unwrap_or(("http", uri));
        let (authority, target) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self::new(scheme, authority, path, query)
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.set(name, value);
        self
    }

    pub fn remote(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.remote_addr = Some(addr.into());
        self.remote_port = Some(port);
        self
    }

    pub fn local(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.local_addr = Some(addr.into());
        self.local_port = Some(port);
        self
    }

    pub fn probe(mut self, probe: &'a dyn FileProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Full absolute URI, the input for globally scoped rules.
    pub fn absolute_uri(&self) -> String {
        match self.query.is_empty() {
            true => format!("{}://{}{}", self.scheme, self.host, self.path),
            false => format!("{}://{}{}?{}", self.scheme, self.host, self.path, self.query),
        }
    }

    /// Path plus query string.
    pub fn request_uri(&self) -> String {
        match self.query.is_empty() {
            true => self.path.clone(),
            false => format!("{}?{}", self.path, self.query),
        }
    }

    /// Resolve a server variable by catalog name.
    ///
    /// Names are validated at parse time, so an unknown name here simply
    /// resolves to the empty string like an absent header does.
    pub fn server_variable(&self, name: &str) -> String {
        match name {
            "CONTENT_LENGTH" => self.request_headers.get("Content-Length").unwrap_or("").into(),
            "CONTENT_TYPE" => self.request_headers.get("Content-Type").unwrap_or("").into(),
            "HTTPS" => match self.scheme.eq_ignore_ascii_case("https") {
                true => "on".into(),
                false => "off".into(),
            },
            "LOCAL_ADDR" => self.local_addr.clone().unwrap_or_default(),
            "LOCAL_PORT" => self.local_port.map(|p| p.to_string()).unwrap_or_default(),
            "QUERY_STRING" => self.query.clone(),
            "REMOTE_ADDR" => self.remote_addr.clone().unwrap_or_default(),
            "REMOTE_PORT" => self.remote_port.map(|p| p.to_string()).unwrap_or_default(),
            "REQUEST_FILENAME" => self.path.clone(),
            "REQUEST_METHOD" => self.method.clone(),
            // path only; the query string has its own accessor
            "REQUEST_URI" | "HTTP_URL" => self.path.clone(),
            "HTTP_HOST" => self.host.clone(),
            _ => {
                if let Some(header) = name.strip_prefix("HTTP_") {
                    self.request_headers
                        .get(&header.replace('_', "-"))
                        .unwrap_or("")
                        .into()
                } else if let Some(header) = name.strip_prefix("RESPONSE_") {
                    self.response_headers
                        .get(&header.replace('_', "-"))
                        .unwrap_or("")
                        .into()
                } else {
                    String::new()
                }
            }
        }
    }
}

/// Catalog check shared by both dialect parsers.
///
/// The set is closed: a name is either one of the fixed accessors below or
/// must carry the `HTTP_` / `RESPONSE_` header prefix.
pub(crate) fn is_known_variable(name: &str) -> bool {
    matches!(
        name,
        "CONTENT_LENGTH"
            | "CONTENT_TYPE"
            | "HTTPS"
            | "LOCAL_ADDR"
            | "LOCAL_PORT"
            | "QUERY_STRING"
            | "REMOTE_ADDR"
            | "REMOTE_PORT"
            | "REQUEST_FILENAME"
            | "REQUEST_METHOD"
            | "REQUEST_URI"
    ) || name.starts_with("HTTP_")
        || name.starts_with("RESPONSE_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uri() {
        let ctx = RewriteContext::from_uri("https://example.com/article/10?p=1");
        assert_eq!(ctx.scheme, "https");
        assert_eq!(ctx.host, "example.com");
        assert_eq!(ctx.path, "/article/10");
        assert_eq!(ctx.query, "p=1");
        assert_eq!(ctx.absolute_uri(), "https://example.com/article/10?p=1");
    }

    #[test]
    fn test_variables() {
        let ctx = RewriteContext::new("https", "example.com", "/a", "x=1")
            .method("POST")
            .remote("10.0.0.1", 9999)
            .header("User-Agent", "smoke/1.0");
        assert_eq!(ctx.server_variable("HTTPS"), "on");
        assert_eq!(ctx.server_variable("REQUEST_METHOD"), "POST");
        assert_eq!(ctx.server_variable("REQUEST_URI"), "/a");
        assert_eq!(ctx.server_variable("QUERY_STRING"), "x=1");
        assert_eq!(ctx.server_variable("REMOTE_PORT"), "9999");
        assert_eq!(ctx.server_variable("HTTP_USER_AGENT"), "smoke/1.0");
        assert_eq!(ctx.server_variable("HTTP_HOST"), "example.com");
    }

    #[test]
    fn test_catalog() {
        assert!(is_known_variable("QUERY_STRING"));
        assert!(is_known_variable("HTTP_X_CUSTOM"));
        assert!(is_known_variable("RESPONSE_X_CUSTOM"));
        assert!(!is_known_variable("SERVER_SOFTWARE"));
        assert!(!is_known_variable("QUERYSTRING"));
    }

    #[test]
    fn test_headers_case() {
        let mut headers = Headers::default();
        headers.set("X-Forwarded-Proto", "https");
        assert_eq!(headers.get("x-forwarded-proto"), Some("https"));
        assert_eq!(headers.get("X-FORWARDED-PROTO"), Some("https"));
        assert_eq!(headers.get("missing"), None);
    }
}

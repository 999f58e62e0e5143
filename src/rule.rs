//! The shared rule model both dialect front ends compile into.

use super::condition::ConditionSet;
use super::context::RewriteContext;
use super::error::{EvalError, ParseError};
use super::maps::RewriteMaps;
use super::matcher::MatchPrimitive;
use super::pattern::{BackReferences, Pattern};

/// What a rule tells the engine to do after its action ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleResult {
    /// Evaluate the next rule against the (possibly rewritten) URL.
    Continue,
    /// Exit the rule loop; the mutated request continues downstream.
    StopRules,
    /// Exit the loop and the whole pipeline; a response is finalized.
    EndResponse,
}

/// Where a server-variable assignment writes its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariableTarget {
    RequestHeader(String),
    ResponseHeader(String),
}

/// One `name = pattern` assignment executed after a rule matches.
#[derive(Debug)]
pub struct ServerVariableAssignment {
    pub target: VariableTarget,
    pub value: Pattern,
}

impl ServerVariableAssignment {
    /// Resolve an assignment name to its header target.
    ///
    /// Only `HTTP_*` (inbound) and `RESPONSE_*` (outbound) names are
    /// writable; underscores map to hyphens in the header name.
    pub fn target_for(name: &str) -> Result<VariableTarget, ParseError> {
        if let Some(header) = name.strip_prefix("HTTP_") {
            Ok(VariableTarget::RequestHeader(header.replace('_', "-")))
        } else if let Some(header) = name.strip_prefix("RESPONSE_") {
            Ok(VariableTarget::ResponseHeader(header.replace('_', "-")))
        } else {
            Err(ParseError::new(format!(
                "server variable '{name}' cannot be assigned; only HTTP_ and RESPONSE_ header names are writable"
            )))
        }
    }

    pub(crate) fn apply(
        &self,
        ctx: &mut RewriteContext<'_>,
        rule_refs: &BackReferences,
        cond_refs: &BackReferences,
        maps: &RewriteMaps,
    ) -> Result<(), EvalError> {
        let value = self.value.evaluate(ctx, rule_refs, cond_refs, maps)?;
        match &self.target {
            VariableTarget::RequestHeader(name) => ctx.request_headers.set(name.clone(), value),
            VariableTarget::ResponseHeader(name) => ctx.response_headers.set(name.clone(), value),
        }
        Ok(())
    }
}

/// Terminal or mutating behavior of a matched rule.
#[derive(Debug)]
pub enum Action {
    /// No mutation; disposition comes from the rule's own stop flag.
    None,
    Rewrite {
        pattern: Pattern,
        append_query: bool,
        delete_query: bool,
    },
    Redirect {
        pattern: Pattern,
        status: u16,
        append_query: bool,
        delete_query: bool,
    },
    CustomResponse {
        status: u16,
        reason: Option<String>,
        body: Option<String>,
    },
    /// Terminate the connection without a well-formed response.
    Abort,
    /// Redirect to the same URL over https, optionally on a fixed port.
    RedirectToHttps { status: u16, tls_port: Option<u16> },
    /// Redirect apex hosts to their `www.` counterpart.
    RedirectToWww { status: u16 },
}

impl Action {
    pub(crate) fn apply(
        &self,
        ctx: &mut RewriteContext<'_>,
        rule_refs: &BackReferences,
        cond_refs: &BackReferences,
        maps: &RewriteMaps,
    ) -> Result<RuleResult, EvalError> {
        match self {
            Self::None => Ok(RuleResult::Continue),
            Self::Rewrite {
                pattern,
                append_query,
                delete_query,
            } => {
                let target = evaluate_target(pattern, ctx, rule_refs, cond_refs, maps)?;
                let parts = UrlParts::split(&target);
                let query = merge_query(parts.query.as_deref(), &ctx.query, *append_query, *delete_query);
                if let Some(scheme) = parts.scheme {
                    ctx.scheme = scheme;
                }
                if let Some(host) = parts.host {
                    ctx.host = host;
                }
                ctx.path = parts.path;
                ctx.query = query;
                Ok(RuleResult::Continue)
            }
            Self::Redirect {
                pattern,
                status,
                append_query,
                delete_query,
            } => {
                let target = evaluate_target(pattern, ctx, rule_refs, cond_refs, maps)?;
                let parts = UrlParts::split(&target);
                let query = merge_query(parts.query.as_deref(), &ctx.query, *append_query, *delete_query);
                let location = parts.location(&query);
                finish_redirect(ctx, *status, location);
                Ok(RuleResult::EndResponse)
            }
            Self::CustomResponse {
                status,
                reason,
                body,
            } => {
                ctx.status = Some(*status);
                ctx.reason = reason.clone();
                ctx.body = body.clone();
                Ok(RuleResult::EndResponse)
            }
            Self::Abort => {
                ctx.aborted = true;
                Ok(RuleResult::EndResponse)
            }
            Self::RedirectToHttps { status, tls_port } => {
                let bare = ctx.host.split(':').next().unwrap_or(&ctx.host).to_owned();
                let host = match tls_port {
                    Some(443) | None => bare,
                    Some(port) => format!("{bare}:{port}"),
                };
                let location = match ctx.query.is_empty() {
                    true => format!("https://{host}{}", ctx.path),
                    false => format!("https://{host}{}?{}", ctx.path, ctx.query),
                };
                finish_redirect(ctx, *status, location);
                Ok(RuleResult::EndResponse)
            }
            Self::RedirectToWww { status } => {
                let bare = ctx.host.split(':').next().unwrap_or(&ctx.host);
                if bare.starts_with("www.") || bare.eq_ignore_ascii_case("localhost") {
                    return Ok(RuleResult::Continue);
                }
                let location = match ctx.query.is_empty() {
                    true => format!("{}://www.{}{}", ctx.scheme, ctx.host, ctx.path),
                    false => format!("{}://www.{}{}?{}", ctx.scheme, ctx.host, ctx.path, ctx.query),
                };
                finish_redirect(ctx, *status, location);
                Ok(RuleResult::EndResponse)
            }
        }
    }
}

fn evaluate_target(
    pattern: &Pattern,
    ctx: &RewriteContext<'_>,
    rule_refs: &BackReferences,
    cond_refs: &BackReferences,
    maps: &RewriteMaps,
) -> Result<String, EvalError> {
    let target = pattern.evaluate(ctx, rule_refs, cond_refs, maps)?;
    match target.is_empty() {
        true => Ok(String::from("/")),
        false => Ok(target),
    }
}

fn finish_redirect(ctx: &mut RewriteContext<'_>, status: u16, location: String) {
    ctx.status = Some(status);
    ctx.response_headers.set("Location", location);
}

/// Substitution string broken into its URL constituents.
struct UrlParts {
    scheme: Option<String>,
    host: Option<String>,
    path: String,
    query: Option<String>,
}

impl UrlParts {
    /// Split an evaluated substitution.
    ///
    /// A scheme separator makes the whole string an absolute URL that
    /// replaces scheme, host, path and query wholesale; anything else is
    /// `path[?query]` with the path made absolute.
    fn split(target: &str) -> Self {
        if let Some((scheme, rest)) = target.split_once("://") {
            let (authority, tail) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            let (path, query) = match tail.split_once('?') {
                Some((p, q)) => (p, Some(q.to_owned())),
                None => (tail, None),
            };
            return Self {
                scheme: Some(scheme.to_owned()),
                host: Some(authority.to_owned()),
                path: path.to_owned(),
                query,
            };
        }
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_owned())),
            None => (target, None),
        };
        let mut path = path.to_owned();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            scheme: None,
            host: None,
            path,
            query,
        }
    }

    /// Render a `Location` value for redirects.
    fn location(&self, query: &str) -> String {
        let mut location = match (&self.scheme, &self.host) {
            (Some(scheme), Some(host)) => format!("{scheme}://{host}{}", self.path),
            _ => self.path.clone(),
        };
        if !query.is_empty() {
            location.push('?');
            location.push_str(query);
        }
        location
    }
}

/// New query string after applying a substitution's query part.
///
/// A query authored in the substitution comes first, with the original
/// appended behind it when `append` is set; `delete` discards the
/// original outright.
fn merge_query(new: Option<&str>, original: &str, append: bool, delete: bool) -> String {
    if delete {
        return new.unwrap_or("").to_owned();
    }
    match new {
        Some(q) if append && !original.is_empty() => format!("{q}&{original}"),
        Some(q) => q.to_owned(),
        None if append => original.to_owned(),
        None => String::new(),
    }
}

/// One complete rewrite rule.
///
/// Immutable once built and owned exclusively by its [`RuleSet`]
/// (crate::RuleSet); safe to evaluate from any number of concurrent
/// request contexts.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    /// Matched against the full absolute URI instead of the path.
    pub global: bool,
    pub stop_processing: bool,
    pub initial_match: MatchPrimitive,
    pub conditions: Option<ConditionSet>,
    pub server_variables: Vec<ServerVariableAssignment>,
    pub action: Action,
}

impl Rule {
    pub fn new(name: impl Into<String>, initial_match: MatchPrimitive, action: Action) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            global: false,
            stop_processing: false,
            initial_match,
            conditions: None,
            server_variables: Vec::new(),
            action,
        }
    }

    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn stop_processing(mut self, stop: bool) -> Self {
        self.stop_processing = stop;
        self
    }

    pub fn conditions(mut self, conditions: ConditionSet) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Rule that redirects any plain-http request to its https
    /// counterpart, optionally on a fixed TLS port.
    pub fn redirect_to_https(
        status: u16,
        tls_port: Option<u16>,
        options: crate::EngineOptions,
    ) -> Result<Self, ParseError> {
        use crate::condition::{Condition, ConditionSet, LogicalGrouping};
        use crate::pattern::Segment;

        let not_https = Condition {
            input: Pattern::from_segments(vec![Segment::ServerVariable("HTTPS".into())]),
            matcher: MatchPrimitive::exact("off", true, false),
            or_next: false,
        };
        Ok(Self::new(
            "redirect to https",
            MatchPrimitive::regex("(.*)", false, false, options)?,
            Action::RedirectToHttps { status, tls_port },
        )
        .conditions(ConditionSet::new(
            LogicalGrouping::MatchAll,
            false,
            vec![not_https],
        )))
    }

    /// Rule that redirects apex hosts to their `www.` counterpart.
    pub fn redirect_to_www(status: u16, options: crate::EngineOptions) -> Result<Self, ParseError> {
        Ok(Self::new(
            "redirect to www",
            MatchPrimitive::regex("(.*)", false, false, options)?,
            Action::RedirectToWww { status },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::EngineOptions;
    use crate::pattern::parse_braces;

    fn apply(action: &Action, ctx: &mut RewriteContext<'_>, rule_refs: &[&str]) -> RuleResult {
        let refs = BackReferences::from(rule_refs.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        action
            .apply(ctx, &refs, &BackReferences::default(), &RewriteMaps::default())
            .unwrap()
    }

    fn rewrite(pattern: &str) -> Action {
        Action::Rewrite {
            pattern: parse_braces(pattern, &RewriteMaps::default()).unwrap(),
            append_query: true,
            delete_query: false,
        }
    }

    #[test]
    fn test_rewrite_splits_query() {
        let mut ctx = RewriteContext::new("http", "example.com", "/article/10/hey", "");
        let action = rewrite("article.aspx?id={R:1}&title={R:2}");
        let result = apply(&action, &mut ctx, &["article/10/hey", "10", "hey"]);
        assert_eq!(result, RuleResult::Continue);
        assert_eq!(ctx.path, "/article.aspx");
        assert_eq!(ctx.query, "id=10&title=hey");
    }

    #[test]
    fn test_rewrite_appends_original_query() {
        let mut ctx = RewriteContext::new("http", "example.com", "/a", "keep=1");
        let action = rewrite("/index?page={R:1}");
        apply(&action, &mut ctx, &["a", "b"]);
        assert_eq!(ctx.query, "page=b&keep=1");
    }

    #[test]
    fn test_rewrite_replace_query() {
        let mut ctx = RewriteContext::new("http", "example.com", "/a", "keep=1");
        let action = Action::Rewrite {
            pattern: Pattern::literal("/index?page=2"),
            append_query: false,
            delete_query: false,
        };
        apply(&action, &mut ctx, &[]);
        assert_eq!(ctx.query, "page=2");
    }

    #[test]
    fn test_rewrite_absolute_url_replaces_everything() {
        let mut ctx = RewriteContext::new("http", "example.com", "/a", "x=1");
        let action = Action::Rewrite {
            pattern: Pattern::literal("https://cdn.example.net/assets/app.js?v=2"),
            append_query: false,
            delete_query: false,
        };
        apply(&action, &mut ctx, &[]);
        assert_eq!(ctx.scheme, "https");
        assert_eq!(ctx.host, "cdn.example.net");
        assert_eq!(ctx.path, "/assets/app.js");
        assert_eq!(ctx.query, "v=2");
    }

    #[test]
    fn test_rewrite_empty_result_defaults_to_root() {
        let mut ctx = RewriteContext::new("http", "example.com", "/a", "");
        let action = Action::Rewrite {
            pattern: Pattern::literal(""),
            append_query: true,
            delete_query: false,
        };
        apply(&action, &mut ctx, &[]);
        assert_eq!(ctx.path, "/");
    }

    #[test]
    fn test_redirect_sets_location_and_ends() {
        let mut ctx = RewriteContext::new("http", "example.com", "/old", "a=b");
        let action = Action::Redirect {
            pattern: parse_braces("/new/{R:1}", &RewriteMaps::default()).unwrap(),
            status: 301,
            append_query: true,
            delete_query: false,
        };
        let result = apply(&action, &mut ctx, &["old", "thing"]);
        assert_eq!(result, RuleResult::EndResponse);
        assert_eq!(ctx.status, Some(301));
        assert_eq!(ctx.response_headers.get("Location"), Some("/new/thing?a=b"));
    }

    #[test]
    fn test_redirect_to_https_with_port() {
        let mut ctx = RewriteContext::new("http", "example.com:8080", "/login", "next=%2F");
        let action = Action::RedirectToHttps {
            status: 302,
            tls_port: Some(8443),
        };
        let result = apply(&action, &mut ctx, &[]);
        assert_eq!(result, RuleResult::EndResponse);
        assert_eq!(
            ctx.response_headers.get("Location"),
            Some("https://example.com:8443/login?next=%2F")
        );
    }

    #[test]
    fn test_redirect_to_www_skips_www_and_localhost() {
        let action = Action::RedirectToWww { status: 301 };
        let mut ctx = RewriteContext::new("http", "www.example.com", "/", "");
        assert_eq!(apply(&action, &mut ctx, &[]), RuleResult::Continue);

        let mut ctx = RewriteContext::new("http", "localhost:8080", "/", "");
        assert_eq!(apply(&action, &mut ctx, &[]), RuleResult::Continue);

        let mut ctx = RewriteContext::new("http", "example.com", "/docs", "");
        assert_eq!(apply(&action, &mut ctx, &[]), RuleResult::EndResponse);
        assert_eq!(
            ctx.response_headers.get("Location"),
            Some("http://www.example.com/docs")
        );
    }

    #[test]
    fn test_custom_response_and_abort() {
        let action = Action::CustomResponse {
            status: 403,
            reason: Some("Forbidden".into()),
            body: Some("blocked by rule".into()),
        };
        let mut ctx = RewriteContext::new("http", "example.com", "/", "");
        assert_eq!(apply(&action, &mut ctx, &[]), RuleResult::EndResponse);
        assert_eq!(ctx.status, Some(403));
        assert_eq!(ctx.body.as_deref(), Some("blocked by rule"));

        let mut ctx = RewriteContext::new("http", "example.com", "/", "");
        assert_eq!(apply(&Action::Abort, &mut ctx, &[]), RuleResult::EndResponse);
        assert!(ctx.aborted);
    }

    #[test]
    fn test_assignment_targets() {
        assert_eq!(
            ServerVariableAssignment::target_for("HTTP_X_ORIGINAL_URL").unwrap(),
            VariableTarget::RequestHeader("X-ORIGINAL-URL".into())
        );
        assert_eq!(
            ServerVariableAssignment::target_for("RESPONSE_X_POWERED_BY").unwrap(),
            VariableTarget::ResponseHeader("X-POWERED-BY".into())
        );
        assert!(ServerVariableAssignment::target_for("QUERY_STRING").is_err());
    }

    #[test]
    fn test_regex_matchers_available_for_rules() {
        // smoke-check the typical rule wiring compiles and runs
        let rule = Rule::new(
            "lowercase",
            MatchPrimitive::regex("^(.*[A-Z].*)$", false, false, EngineOptions::default()).unwrap(),
            Action::Redirect {
                pattern: parse_braces("{ToLower:{R:1}}", &RewriteMaps::default()).unwrap(),
                status: 301,
                append_query: true,
                delete_query: false,
            },
        )
        .stop_processing(true);
        assert!(rule.enabled);
        assert!(rule.stop_processing);
    }
}

//! Name mangling for tools and resources exposed across multiple upstreams.
//!
//! Tool names collide across upstreams far more often than resource URIs,
//! so every catalog entry the gateway exposes downstream is namespaced by
//! its upstream's name.

use std::sync::OnceLock;

use regex::Regex;

/// Characters allowed in a mangled tool name, matching what most MCP
/// clients will tolerate in a `tools/call` `name` field.
fn valid_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[^A-Za-z0-9_-]").unwrap())
}

fn repeated_underscore_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("_{2,}").unwrap())
}

/// Sanitize an arbitrary string into `[A-Za-z0-9_-]{1,128}`: replace
/// disallowed bytes with `_`, collapse runs of `_`, and trim leading and
/// trailing `_`/`-`.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let replaced = valid_char_re().replace_all(raw, "_");
    let collapsed = repeated_underscore_re().replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c| c == '_' || c == '-');
    let truncated: String = trimmed.chars().take(128).collect();
    if truncated.is_empty() {
        "_".to_string()
    } else {
        truncated
    }
}

/// Build the mangled tool name `<upstream>__<tool>` downstream clients see.
#[must_use]
pub fn mangle_tool_name(upstream: &str, tool: &str) -> String {
    format!("{}__{}", sanitize(upstream), sanitize(tool))
}

/// Split a mangled tool name back into `(upstream, tool)`.
///
/// Splits on the first `__` that follows the sanitized upstream name; since
/// sanitization already collapses consecutive underscores, any remaining
/// `__` in the tail belongs to the tool name, not a nested separator.
#[must_use]
pub fn demangle_tool_name(mangled: &str) -> Option<(&str, &str)> {
    mangled.split_once("__").filter(|(upstream, tool)| !upstream.is_empty() && !tool.is_empty())
}

/// Build the prefixed resource URI `<upstream>__<uri>` downstream clients
/// see. Unlike tool names, the URI tail is never sanitized: resource URIs
/// are treated as opaque strings, not parsed, by every consumer.
#[must_use]
pub fn mangle_resource_uri(upstream: &str, uri: &str) -> String {
    format!("{}__{}", sanitize(upstream), uri)
}

/// Split a mangled resource URI back into `(upstream, uri)`.
#[must_use]
pub fn demangle_resource_uri(mangled: &str) -> Option<(&str, &str)> {
    mangled.split_once("__").filter(|(upstream, uri)| !upstream.is_empty() && !uri.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_disallowed_bytes() {
        assert_eq!(sanitize("my tool!"), "my_tool");
        assert_eq!(sanitize("weather.get"), "weather_get");
    }

    #[test]
    fn sanitize_collapses_consecutive_underscores() {
        assert_eq!(sanitize("a   b"), "a_b");
    }

    #[test]
    fn sanitize_strips_leading_and_trailing_separators() {
        assert_eq!(sanitize("__weather__"), "weather");
        assert_eq!(sanitize("-weather-"), "weather");
    }

    #[test]
    fn sanitize_never_produces_empty_string() {
        assert_eq!(sanitize("!!!"), "_");
    }

    #[test]
    fn mangle_and_demangle_tool_name_round_trip() {
        let mangled = mangle_tool_name("weather-svc", "get_forecast");
        assert_eq!(mangled, "weather-svc__get_forecast");
        let (upstream, tool) = demangle_tool_name(&mangled).unwrap();
        assert_eq!(upstream, "weather-svc");
        assert_eq!(tool, "get_forecast");
    }

    #[test]
    fn demangle_tool_name_keeps_extra_separators_in_tool_half() {
        let (upstream, tool) = demangle_tool_name("svc__a__b").unwrap();
        assert_eq!(upstream, "svc");
        assert_eq!(tool, "a__b");
    }

    #[test]
    fn resource_uri_is_prefixed_but_not_sanitized() {
        let mangled = mangle_resource_uri("files", "file:///etc/passwd");
        assert_eq!(mangled, "files__file:///etc/passwd");
        let (upstream, uri) = demangle_resource_uri(&mangled).unwrap();
        assert_eq!(upstream, "files");
        assert_eq!(uri, "file:///etc/passwd");
    }
}

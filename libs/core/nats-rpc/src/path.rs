//! Mapping between path-style addresses and broker subjects.

use std::collections::BTreeMap;

pub type QueryParams = BTreeMap<String, Vec<String>>;
pub type PathParams = BTreeMap<String, String>;

const SUBJECT_SEGMENTS: usize = 3;
const LOGGABLE_SEGMENTS: usize = 4;

/// Split `url` into its path and optional query string.
pub fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Parse `a=1&a=2&b` into `{a: [1, 2], b: [""]}`.
pub fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }
    params
}

/// Query parameters of a full URL.
pub fn query_params(url: &str) -> QueryParams {
    split_query(url).1.map(parse_query).unwrap_or_default()
}

/// Non-empty path segments of `url`, query string excluded.
pub fn segments(url: &str) -> impl Iterator<Item = &str> {
    split_query(url).0.split('/').filter(|s| !s.is_empty())
}

fn leading_parts(url: &str, count: usize, separator: &str) -> String {
    segments(url).take(count).collect::<Vec<_>>().join(separator)
}

/// Default subject for a path: its first three segments joined with `.`.
///
/// `/api/x/42?from=10` maps to `api.x.42`.
pub fn url_to_subject(url: &str) -> String {
    leading_parts(url, SUBJECT_SEGMENTS, ".")
}

/// Short path prefix safe to put in logs (ids deeper in the path are dropped).
pub fn loggable_url(url: &str) -> String {
    format!("/{}", leading_parts(url, LOGGABLE_SEGMENTS, "/"))
}

/// Path prefix served by a subject: `api.users` becomes `/api/users`.
pub fn subject_base_path(subject: &str) -> String {
    let parts: Vec<&str> = subject.split('.').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Path of `topic` under the subject's base path.
pub fn subject_to_url(subject: &str, topic: &str) -> String {
    let base = subject_base_path(subject);
    let topic = topic.trim_start_matches('/');
    match (base.as_str(), topic.is_empty()) {
        (_, true) => base,
        ("/", false) => format!("/{topic}"),
        (_, false) => format!("{base}/{topic}"),
    }
}

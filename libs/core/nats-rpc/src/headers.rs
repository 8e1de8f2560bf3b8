//! Header bag carried by requests, responses and fire-and-forget messages.
//!
//! Well-known headers live in named fields; anything else goes into an ordered
//! extension multimap. Names are matched case-insensitively.
//!
//! On the wire a `Headers` value is a JSON object of `name -> [values]`. Well-known
//! headers are written first in this order: request id, origin, trace id, user info,
//! request time, response time, content type. Extensions follow in insertion order.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const REQUEST_ID: &str = "X-Request-Id";
pub const ORIGIN: &str = "X-Origin";
pub const TRACE_ID: &str = "Uber-Trace-Id";
pub const USER_INFO: &str = "X-User-Info";
pub const REQUEST_TIME: &str = "X-Request-Time";
pub const RESPONSE_TIME: &str = "X-Response-Time";
pub const CONTENT_TYPE: &str = "Content-Type";

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Wall clock in Unix nanoseconds, the unit of the request and response time headers.
pub(crate) fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Known {
    RequestId,
    Origin,
    TraceId,
    UserInfo,
    RequestTime,
    ResponseTime,
    ContentType,
}

impl Known {
    const ALL: [Known; 7] = [
        Known::RequestId,
        Known::Origin,
        Known::TraceId,
        Known::UserInfo,
        Known::RequestTime,
        Known::ResponseTime,
        Known::ContentType,
    ];

    fn name(self) -> &'static str {
        match self {
            Known::RequestId => REQUEST_ID,
            Known::Origin => ORIGIN,
            Known::TraceId => TRACE_ID,
            Known::UserInfo => USER_INFO,
            Known::RequestTime => REQUEST_TIME,
            Known::ResponseTime => RESPONSE_TIME,
            Known::ContentType => CONTENT_TYPE,
        }
    }

    fn lookup(name: &str) -> Option<Known> {
        Known::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }
}

/// Call metadata headers.
///
/// Well-known headers are single-valued: `append` on one of them replaces the
/// current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub request_id: Option<String>,
    pub origin: Option<String>,
    pub trace_id: Option<String>,
    pub user_info: Option<String>,
    pub request_time: Option<String>,
    pub response_time: Option<String>,
    pub content_type: Option<String>,
    extensions: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, known: Known) -> &Option<String> {
        match known {
            Known::RequestId => &self.request_id,
            Known::Origin => &self.origin,
            Known::TraceId => &self.trace_id,
            Known::UserInfo => &self.user_info,
            Known::RequestTime => &self.request_time,
            Known::ResponseTime => &self.response_time,
            Known::ContentType => &self.content_type,
        }
    }

    fn slot_mut(&mut self, known: Known) -> &mut Option<String> {
        match known {
            Known::RequestId => &mut self.request_id,
            Known::Origin => &mut self.origin,
            Known::TraceId => &mut self.trace_id,
            Known::UserInfo => &mut self.user_info,
            Known::RequestTime => &mut self.request_time,
            Known::ResponseTime => &mut self.response_time,
            Known::ContentType => &mut self.content_type,
        }
    }

    fn extension_index(&self, name: &str) -> Option<usize> {
        self.extensions
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// First value of a header, or `None` when absent or empty.
    pub fn get(&self, name: &str) -> Option<&str> {
        match Known::lookup(name) {
            Some(known) => self.slot(known).as_deref().filter(|v| !v.is_empty()),
            None => self
                .extension_index(name)
                .and_then(|i| self.extensions[i].1.first())
                .map(String::as_str),
        }
    }

    /// All values of a header in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        match Known::lookup(name) {
            Some(known) => self.slot(known).as_deref().into_iter().collect(),
            None => self
                .extension_index(name)
                .map(|i| self.extensions[i].1.iter().map(String::as_str).collect())
                .unwrap_or_default(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match Known::lookup(&name) {
            Some(known) => *self.slot_mut(known) = Some(value),
            None => match self.extension_index(&name) {
                Some(i) => self.extensions[i].1 = vec![value],
                None => self.extensions.push((name, vec![value])),
            },
        }
    }

    /// Add a value to `name`, keeping existing values of extension headers.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match Known::lookup(&name) {
            Some(known) => *self.slot_mut(known) = Some(value),
            None => match self.extension_index(&name) {
                Some(i) => self.extensions[i].1.push(value),
                None => self.extensions.push((name, vec![value])),
            },
        }
    }

    pub fn remove(&mut self, name: &str) {
        match Known::lookup(name) {
            Some(known) => *self.slot_mut(known) = None,
            None => {
                if let Some(i) = self.extension_index(name) {
                    self.extensions.remove(i);
                }
            }
        }
    }

    /// Copy every header of `other` into `self`, replacing values of the same name.
    pub fn merge(&mut self, other: &Headers) {
        for (name, values) in other.iter() {
            let mut values = values.into_iter();
            if let Some(first) = values.next() {
                self.set(name, first);
            }
            for value in values {
                self.append(name, value);
            }
        }
    }

    /// Iterate `(name, values)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Vec<&str>)> + '_ {
        let known = Known::ALL.into_iter().filter_map(move |k| {
            self.slot(k)
                .as_deref()
                .map(|value| (k.name(), vec![value]))
        });
        let extensions = self.extensions.iter().map(|(name, values)| {
            (
                name.as_str(),
                values.iter().map(String::as_str).collect::<Vec<_>>(),
            )
        });
        known.chain(extensions)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every header of `other` is present here with the same values.
    pub fn is_superset_of(&self, other: &Headers) -> bool {
        other
            .iter()
            .all(|(name, values)| self.get_all(name) == values)
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, values) in self.iter() {
            map.serialize_entry(name, &values)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValues {
    One(String),
    Many(Vec<String>),
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of header names to value lists")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Headers, E> {
        Ok(Headers::default())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
        let mut headers = Headers::default();
        while let Some((name, values)) = access.next_entry::<String, Option<WireValues>>()? {
            match values {
                Some(WireValues::One(value)) => headers.append(name, value),
                Some(WireValues::Many(values)) => {
                    for value in values {
                        headers.append(name.clone(), value);
                    }
                }
                None => {}
            }
        }
        Ok(headers)
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(HeadersVisitor)
    }
}

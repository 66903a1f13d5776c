//! Normalized request descriptor handed over by the HTTP glue.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the coordination layer needs to know about an incoming request.
///
/// `route` is the matched route template, e.g. `/users/:id` or
/// `/users/{id}`; `params` holds the values bound to its placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub route: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub client_address: String,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_client_address(mut self, address: impl Into<String>) -> Self {
        self.client_address = address.into();
        self
    }

    /// Lowercased HTTP method.
    pub fn method_lowercase(&self) -> String {
        self.method.to_ascii_lowercase()
    }

    /// The route template with every bound placeholder replaced by its value.
    ///
    /// Placeholders are whole path segments written as `:name`, `{name}` or
    /// `{*name}`. Segments without a bound value are kept verbatim.
    pub fn resolved_path(&self) -> String {
        self.route
            .split('/')
            .map(|segment| {
                placeholder_name(segment)
                    .and_then(|name| self.params.get(name))
                    .map(String::as_str)
                    .unwrap_or(segment)
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Query parameters folded into a map with a stable key order.
    pub fn normalized_query(&self) -> BTreeMap<String, Value> {
        normalize_query(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// The body as compact JSON text with object keys in the order the
    /// client sent them. An absent body is `null`.
    pub fn body_json(&self) -> String {
        match &self.body {
            Some(body) => body.to_string(),
            None => "null".to_string(),
        }
    }
}

fn placeholder_name(segment: &str) -> Option<&str> {
    if let Some(name) = segment.strip_prefix(':') {
        return Some(name);
    }
    segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .map(|s| s.trim_start_matches('*'))
}

/// Fold query pairs into a sorted map.
///
/// A name that occurs once maps to a string; a repeated name maps to an array
/// of its values in arrival order.
pub fn normalize_query<'a, I>(pairs: I) -> BTreeMap<String, Value>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out: BTreeMap<String, Value> = BTreeMap::new();
    for (name, value) in pairs {
        let value = Value::String(value.to_string());
        match out.get_mut(name) {
            None => {
                out.insert(name.to_string(), value);
            }
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    out
}

//! Layered header rewriting.
//!
//! # Responsibilities
//! - Represent per-layer header directives (set or remove)
//! - Merge N directive layers onto a base header set
//! - Parse directive maps from configuration files
//!
//! # Design Decisions
//! - Layers are applied lowest to highest precedence: global, upstream, per-call
//! - A later layer's decision for a name replaces every earlier decision
//! - Names are `HeaderName`s, so output keys are always lower-case
//! - Directives are validated when built; merging itself never fails

use std::collections::{BTreeMap, HashMap, HashSet};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Decision for a single header name within one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDirective {
    /// Replace every value of the header with these.
    Set(Vec<HeaderValue>),
    /// Drop the header if present.
    Remove,
}

/// One layer of header directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(
    try_from = "BTreeMap<String, DirectiveValue>",
    into = "BTreeMap<String, DirectiveValue>"
)]
pub struct HeaderDirectives {
    entries: Vec<(HeaderName, HeaderDirective)>,
}

impl HeaderDirectives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderDirective)> {
        self.entries.iter().map(|(name, directive)| (name, directive))
    }

    /// Record a directive for an already-validated name, replacing any previous one.
    pub fn insert(&mut self, name: HeaderName, directive: HeaderDirective) {
        self.entries.retain(|(existing, _)| *existing != name);
        self.entries.push((name, directive));
    }

    /// Builder form of a single-value `Set`.
    pub fn set(mut self, name: &str, value: &str) -> Result<Self, ProxyError> {
        let name = parse_name(name)?;
        let value = parse_value(&name, value)?;
        self.insert(name, HeaderDirective::Set(vec![value]));
        Ok(self)
    }

    /// Builder form of a multi-value `Set`.
    pub fn set_all<I, V>(mut self, name: &str, values: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        let name = parse_name(name)?;
        let values = values
            .into_iter()
            .map(|v| parse_value(&name, v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.insert(name, HeaderDirective::Set(values));
        Ok(self)
    }

    /// Builder form of `Remove`.
    pub fn remove(mut self, name: &str) -> Result<Self, ProxyError> {
        let name = parse_name(name)?;
        self.insert(name, HeaderDirective::Remove);
        Ok(self)
    }
}

fn parse_name(name: &str) -> Result<HeaderName, ProxyError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| ProxyError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn parse_value(name: &HeaderName, value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Config-file form of a directive: a string or list sets, `false` removes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DirectiveValue {
    One(String),
    Many(Vec<String>),
    Flag(bool),
}

impl TryFrom<BTreeMap<String, DirectiveValue>> for HeaderDirectives {
    type Error = ProxyError;

    fn try_from(raw: BTreeMap<String, DirectiveValue>) -> Result<Self, Self::Error> {
        let mut directives = HeaderDirectives::new();
        for (name, value) in raw {
            directives = match value {
                DirectiveValue::One(v) => directives.set(&name, &v)?,
                DirectiveValue::Many(vs) => directives.set_all(&name, vs)?,
                DirectiveValue::Flag(false) => directives.remove(&name)?,
                DirectiveValue::Flag(true) => {
                    return Err(ProxyError::InvalidHeader {
                        name,
                        reason: "`true` is not a header value; use a string or `false`".into(),
                    })
                }
            };
        }
        Ok(directives)
    }
}

impl From<HeaderDirectives> for BTreeMap<String, DirectiveValue> {
    fn from(directives: HeaderDirectives) -> Self {
        directives
            .entries
            .into_iter()
            .map(|(name, directive)| {
                let value = match directive {
                    HeaderDirective::Remove => DirectiveValue::Flag(false),
                    HeaderDirective::Set(values) => {
                        let mut values: Vec<String> = values
                            .iter()
                            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                            .collect();
                        if values.len() == 1 {
                            DirectiveValue::One(values.remove(0))
                        } else {
                            DirectiveValue::Many(values)
                        }
                    }
                };
                (name.as_str().to_string(), value)
            })
            .collect()
    }
}

/// Merge directive layers onto `base`.
///
/// Surviving keys carry the value of the highest layer that set them, or
/// every original value from `base` when no layer touched them. Missing
/// layers are skipped.
pub fn prepare_headers(base: &HeaderMap, layers: &[Option<&HeaderDirectives>]) -> HeaderMap {
    let mut removed: HashSet<&HeaderName> = HashSet::new();
    let mut overrides: HashMap<&HeaderName, &[HeaderValue]> = HashMap::new();

    for layer in layers.iter().flatten() {
        for (name, directive) in layer.iter() {
            match directive {
                HeaderDirective::Remove => {
                    overrides.remove(name);
                    removed.insert(name);
                }
                HeaderDirective::Set(values) => {
                    removed.remove(name);
                    overrides.insert(name, values.as_slice());
                }
            }
        }
    }

    let mut out = HeaderMap::with_capacity(base.keys_len() + overrides.len());
    for name in base.keys() {
        if removed.contains(name) || overrides.contains_key(name) {
            continue;
        }
        for value in base.get_all(name) {
            out.append(name.clone(), value.clone());
        }
    }
    for (name, values) in overrides {
        for value in values {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-base", HeaderValue::from_static("base"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn no_layers_keeps_base() {
        let out = prepare_headers(&base(), &[None, None]);
        assert_eq!(out, base());
    }

    #[test]
    fn remove_in_highest_layer_wins() {
        let global = HeaderDirectives::new().set("X-Token", "global").unwrap();
        let upstream = HeaderDirectives::new().set("x-token", "upstream").unwrap();
        let call = HeaderDirectives::new().remove("X-TOKEN").unwrap();

        let out = prepare_headers(&base(), &[Some(&global), Some(&upstream), Some(&call)]);
        assert!(!out.contains_key("x-token"));
        assert_eq!(out.get("x-base").unwrap(), "base");
    }

    #[test]
    fn highest_set_wins() {
        let global = HeaderDirectives::new().set("x-level", "global").unwrap();
        let upstream = HeaderDirectives::new().set("X-Level", "upstream").unwrap();
        let call = HeaderDirectives::new().set("X-LEVEL", "call").unwrap();

        let out = prepare_headers(&base(), &[Some(&global), Some(&upstream), Some(&call)]);
        let values: Vec<_> = out.get_all("x-level").iter().collect();
        assert_eq!(values, vec!["call"]);
    }

    #[test]
    fn later_set_restores_removed_key() {
        let global = HeaderDirectives::new().remove("x-base").unwrap();
        let call = HeaderDirectives::new().set("x-base", "again").unwrap();

        let out = prepare_headers(&base(), &[Some(&global), None, Some(&call)]);
        assert_eq!(out.get("x-base").unwrap(), "again");
    }

    #[test]
    fn set_replaces_all_base_values() {
        let layer = HeaderDirectives::new()
            .set_all("Accept", ["a/b", "c/d"])
            .unwrap();
        let out = prepare_headers(&base(), &[Some(&layer)]);
        let values: Vec<_> = out.get_all("accept").iter().collect();
        assert_eq!(values, vec!["a/b", "c/d"]);
    }

    #[test]
    fn output_keys_are_lower_case() {
        let layer = HeaderDirectives::new().set("ReqConfigLevel", "CONFIG-REQUEST").unwrap();
        let out = prepare_headers(&HeaderMap::new(), &[Some(&layer)]);
        assert!(out.keys().all(|k| k.as_str() == k.as_str().to_lowercase()));
        assert_eq!(out.get("reqconfiglevel").unwrap(), "CONFIG-REQUEST");
    }

    #[test]
    fn request_layer_scenario() {
        let global = HeaderDirectives::new()
            .set("ReqConfigLevel", "CONFIG-REQUEST")
            .unwrap()
            .set("ReqConfigLevelOverwrite", "CONFIG-REQUEST")
            .unwrap()
            .set("ReqProxyLevelClear", "CONFIG-REQUEST")
            .unwrap();
        let upstream = HeaderDirectives::new()
            .set("REQConfigLevelOverwrite", "PROXY-REQUEST-OVERWRITE")
            .unwrap()
            .remove("ReqProxyLevelClear")
            .unwrap();

        let out = prepare_headers(&HeaderMap::new(), &[Some(&global), Some(&upstream), None]);
        assert_eq!(out.get("reqconfiglevel").unwrap(), "CONFIG-REQUEST");
        assert_eq!(
            out.get("reqconfigleveloverwrite").unwrap(),
            "PROXY-REQUEST-OVERWRITE"
        );
        assert!(!out.contains_key("reqproxylevelclear"));
    }

    #[test]
    fn parses_config_form() {
        let raw = r#"
            "X-One" = "1"
            "X-Many" = ["a", "b"]
            "X-Gone" = false
        "#;
        let directives: HeaderDirectives = toml::from_str(raw).unwrap();
        assert_eq!(directives.len(), 3);

        let mut base = HeaderMap::new();
        base.insert("x-gone", HeaderValue::from_static("present"));
        let out = prepare_headers(&base, &[Some(&directives)]);
        assert_eq!(out.get("x-one").unwrap(), "1");
        assert_eq!(out.get_all("x-many").iter().count(), 2);
        assert!(!out.contains_key("x-gone"));
    }

    #[test]
    fn rejects_invalid_directives() {
        assert!(HeaderDirectives::new().set("bad name", "v").is_err());
        assert!(HeaderDirectives::new().set("x-ok", "bad\nvalue").is_err());
        assert!(toml::from_str::<HeaderDirectives>(r#""X-On" = true"#).is_err());
    }
}

//! Ordered environment variable set.
//!
//! Image defaults are declared in order and materialized into every
//! container; launch-time overrides replace values in place and append
//! new names at the end.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use relaybox_core::config::{DEFAULT_PORT, PORT_ENV};
use relaybox_core::error::{RelayError, Result};

/// Ordered name → value mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvSet {
    vars: Vec<(String, String)>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The image default: `PORT=8080`.
    pub fn with_default_port() -> Self {
        let mut env = Self::new();
        env.set(PORT_ENV, DEFAULT_PORT.to_string());
        env
    }

    /// Set a variable, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Apply `overrides` on top of this set. Overrides always win.
    pub fn overlay(&self, overrides: &EnvSet) -> EnvSet {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.set(key, value);
        }
        merged
    }

    /// `KEY=VALUE` strings, as stored in an OCI image config.
    pub fn to_env_list(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Parse `KEY=VALUE` strings. Entries without `=` are rejected.
    pub fn from_env_list<S: AsRef<str>>(list: &[S]) -> Result<Self> {
        let mut env = Self::new();
        for entry in list {
            let entry = entry.as_ref();
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                RelayError::ConfigError(format!(
                    "Invalid environment entry (expected KEY=VALUE): {}",
                    entry
                ))
            })?;
            env.set(key, value);
        }
        env.validate()?;
        Ok(env)
    }

    /// Every name must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn validate(&self) -> Result<()> {
        for (key, _) in &self.vars {
            if !is_valid_name(key) {
                return Err(RelayError::ConfigError(format!(
                    "Invalid environment variable name '{}'",
                    key
                )));
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = EnvSet::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Substitute `$NAME` and `${NAME}` references that `lookup` knows.
///
/// Unknown references and escaped `\$` are kept verbatim, so the result
/// can be expanded again once more variables are known.
pub fn expand_vars<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    substitute(s, &lookup, false)
}

/// Substitute references against `env` the way an image build does:
/// unknown names expand to the empty string and `\$` becomes `$`.
pub fn resolve_vars(s: &str, env: &EnvSet) -> String {
    substitute(s, &|name: &str| env.get(name).map(String::from), true)
}

fn substitute(s: &str, lookup: &dyn Fn(&str) -> Option<String>, resolve: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if bytes.get(i + 1) == Some(&b'$') => {
                out.push_str(&s[literal_start..i]);
                out.push_str(if resolve { "$" } else { "\\$" });
                i += 2;
                literal_start = i;
            }
            b'$' => match reference_at(s, i) {
                Some((name, end)) => {
                    let value = lookup(name).or_else(|| resolve.then(String::new));
                    if let Some(value) = value {
                        out.push_str(&s[literal_start..i]);
                        out.push_str(&value);
                        literal_start = end;
                    }
                    i = end;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    out.push_str(&s[literal_start..]);
    out
}

/// The variable name referenced at `s[dollar]` and the index just past
/// the reference.
fn reference_at(s: &str, dollar: usize) -> Option<(&str, usize)> {
    let rest = &s[dollar + 1..];
    if let Some(braced) = rest.strip_prefix('{') {
        let close = braced.find('}')?;
        let name = &braced[..close];
        return is_valid_name(name).then_some((name, dollar + close + 3));
    }

    let len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let name = &rest[..len];
    is_valid_name(name).then_some((name, dollar + 1 + len))
}

impl Serialize for EnvSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (k, v) in &self.vars {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EnvSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EnvSetVisitor;

        impl<'de> Visitor<'de> for EnvSetVisitor {
            type Value = EnvSet;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of environment variable names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<EnvSet, A::Error> {
                let mut env = EnvSet::new();
                while let Some((key, value)) = access.next_entry::<String, ScalarString>()? {
                    env.set(key, value.0);
                }
                Ok(env)
            }
        }

        deserializer.deserialize_map(EnvSetVisitor)
    }
}

/// Accepts strings, numbers and booleans (`PORT: 8080` in YAML).
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(ScalarString(s)),
            serde_json::Value::Number(n) => Ok(ScalarString(n.to_string())),
            serde_json::Value::Bool(b) => Ok(ScalarString(b.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "environment values must be scalars, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        let env = EnvSet::with_default_port();
        assert_eq!(env.get("PORT"), Some("8080"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = EnvSet::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(env.to_env_list(), vec!["A=3".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn test_overlay_override_wins() {
        let image = EnvSet::with_default_port();
        let overrides: EnvSet = [("PORT", "9090"), ("DEBUG", "1")].into_iter().collect();
        let merged = image.overlay(&overrides);
        assert_eq!(merged.get("PORT"), Some("9090"));
        assert_eq!(merged.get("DEBUG"), Some("1"));
        // image default untouched
        assert_eq!(image.get("PORT"), Some("8080"));
    }

    #[test]
    fn test_overlay_empty_keeps_defaults() {
        let merged = EnvSet::with_default_port().overlay(&EnvSet::new());
        assert_eq!(merged.get("PORT"), Some("8080"));
    }

    #[test]
    fn test_from_env_list() {
        let env = EnvSet::from_env_list(&["PORT=8080", "URL=http://x?a=1"]).unwrap();
        assert_eq!(env.get("URL"), Some("http://x?a=1"));
        assert!(EnvSet::from_env_list(&["NOEQUALS"]).is_err());
        assert!(EnvSet::from_env_list(&["1BAD=x"]).is_err());
    }

    #[test]
    fn test_validate_names() {
        assert!(is_valid_name("PORT"));
        assert!(is_valid_name("_private"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("9LIVES"));
        assert!(!is_valid_name("WITH-DASH"));
    }

    #[test]
    fn test_yaml_preserves_order_and_accepts_numbers() {
        let env: EnvSet = serde_yaml::from_str("PORT: 8080\nA: hello\nFLAG: true\n").unwrap();
        assert_eq!(
            env.to_env_list(),
            vec![
                "PORT=8080".to_string(),
                "A=hello".to_string(),
                "FLAG=true".to_string()
            ]
        );
        let rendered = serde_json::to_string(&env).unwrap();
        assert_eq!(rendered, r#"{"PORT":"8080","A":"hello","FLAG":"true"}"#);
    }

    #[test]
    fn test_expand_vars_on_name_boundaries() {
        let lookup = |name: &str| (name == "PY").then(|| "3.12".to_string());
        assert_eq!(expand_vars("python:${PY}-slim", lookup), "python:3.12-slim");
        assert_eq!(expand_vars("$PY/bin", lookup), "3.12/bin");
        // A longer name is a different variable
        assert_eq!(expand_vars("$PYTHON_VERSION", lookup), "$PYTHON_VERSION");
        assert_eq!(expand_vars("${PYTHON}", lookup), "${PYTHON}");
    }

    #[test]
    fn test_expand_vars_keeps_unknown_and_literals() {
        let lookup = |_: &str| None;
        assert_eq!(expand_vars("/opt/venv/bin:$PATH", lookup), "/opt/venv/bin:$PATH");
        assert_eq!(expand_vars("cost $5 or $", lookup), "cost $5 or $");
        assert_eq!(expand_vars("${unterminated", lookup), "${unterminated");
        assert_eq!(expand_vars(r"\$HOME", lookup), r"\$HOME");
    }

    #[test]
    fn test_resolve_vars() {
        let env: EnvSet = [("PATH", "/usr/bin"), ("HOME", "/root")].into_iter().collect();
        assert_eq!(resolve_vars("/opt/venv/bin:$PATH", &env), "/opt/venv/bin:/usr/bin");
        assert_eq!(resolve_vars("${HOME}/.cache", &env), "/root/.cache");
        assert_eq!(resolve_vars("x${MISSING}y", &env), "xy");
        assert_eq!(resolve_vars(r"\$HOME", &env), "$HOME");
        assert_eq!(resolve_vars("café $HOME", &env), "café /root");
    }
}

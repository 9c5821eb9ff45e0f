use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

/// Snapshot of environment variables.
///
/// The harness reads its fallback settings (`USC_*`, `TOUTPUT`, `LTPROOT`)
/// through this type instead of `std::env`, so parsing can be exercised
/// against a fixed set of variables and companion scripts can be launched
/// with an explicit environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Captures the current process environment. Variables whose name or
    /// value is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    /// Sets a variable, replacing any previous value.
    ///
    /// # Arguments
    /// * `key` - The variable name
    /// * `value` - The variable value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Merges `other` into this environment; `other` wins on conflicts.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Parses a variable's value.
    ///
    /// # Returns
    /// * `Option<T>` - The parsed value; `None` when the variable is unset or
    ///   does not parse (an unusable value is treated as absent)
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                debug!("ignoring unparsable {}={:?}", key, raw);
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroize;

/// Ephemeral credentials owned by a single runnable.
///
/// Values are coerced to strings on construction; `erase` wipes them in place
/// and drops the container.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Option<BTreeMap<String, String>>);

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(Some(values))
    }

    /// Coerce an arbitrary document into string credentials.
    ///
    /// Nulls are dropped; strings are kept; anything else is stored as its JSON text.
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let values = object
            .iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((key.clone(), s.clone())),
                other => Some((key.clone(), other.to_string())),
            })
            .collect();

        Self(Some(values))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.as_ref()?.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_ref().map_or(true, BTreeMap::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter().flat_map(|values| values.iter())
    }

    /// Merge more entries; existing keys win.
    pub fn extend(&mut self, other: Credentials) {
        if let Some(incoming) = other.0 {
            let values = self.0.get_or_insert_with(BTreeMap::new);
            for (key, value) in incoming {
                values.entry(key).or_insert(value);
            }
        }
    }

    pub fn erase(&mut self) {
        if let Some(mut values) = self.0.take() {
            for value in values.values_mut() {
                value.zeroize();
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(values) => f
                .debug_set()
                .entries(values.keys().map(|k| format!("{k}=***")))
                .finish(),
            None => f.write_str("{}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_values_to_strings() {
        let creds = Credentials::from_value(&json!({
            "token": "abc",
            "port": 5432,
            "scopes": ["read"],
            "unused": null
        }));

        assert_eq!(creds.get("token"), Some("abc"));
        assert_eq!(creds.get("port"), Some("5432"));
        assert_eq!(creds.get("scopes"), Some("[\"read\"]"));
        assert_eq!(creds.get("unused"), None);
    }

    #[test]
    fn erase_drops_everything() {
        let mut creds = Credentials::new(BTreeMap::from([("token".into(), "abc".into())]));
        creds.erase();
        assert!(creds.is_empty());
        assert_eq!(creds.get("token"), None);
        assert_eq!(creds, Credentials::default());
    }

    #[test]
    fn debug_output_hides_values() {
        let creds = Credentials::new(BTreeMap::from([("token".into(), "secret".into())]));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("token"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn extend_keeps_existing_keys() {
        let mut creds = Credentials::new(BTreeMap::from([("a".into(), "1".into())]));
        creds.extend(Credentials::new(BTreeMap::from([
            ("a".into(), "2".into()),
            ("b".into(), "3".into()),
        ])));
        assert_eq!(creds.get("a"), Some("1"));
        assert_eq!(creds.get("b"), Some("3"));
    }
}

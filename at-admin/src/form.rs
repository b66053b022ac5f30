// Submitted form values

//! Accessor for the values of a submitted admin form
//!
//! The request layer owns parsing; the engine only asks for values by name.

use anyhow::Result;
use std::collections::BTreeMap;

/// Name/value pairs of one form submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    values: BTreeMap<String, String>,
}

impl Form {
    /// Empty form
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mainly for tests
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    /// Set `name`, replacing any earlier value
    pub fn insert(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Parse `name=value` fields as given on the command line
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        let mut form = Self::new();
        for field in fields {
            let field = field.as_ref();
            let Some((name, value)) = field.split_once('=') else {
                anyhow::bail!("Form field must be name=value, got '{}'", field);
            };
            form.insert(name, value);
        }
        Ok(form)
    }

    /// Raw value, `None` when the field was not submitted
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value with trailing line ends removed, empty when absent
    pub fn text(&self, name: &str) -> String {
        self.get(name)
            .map(|v| v.trim_end_matches(['\r', '\n']).to_string())
            .unwrap_or_default()
    }

    /// True when the field is absent or only whitespace
    pub fn is_blank(&self, name: &str) -> bool {
        self.get(name).map_or(true, is_blank)
    }

    /// Names starting with `prefix`, in name order
    pub fn names_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.values
            .keys()
            .filter(move |k| k.starts_with(prefix))
            .map(String::as_str)
    }
}

/// Empty or whitespace-only text
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

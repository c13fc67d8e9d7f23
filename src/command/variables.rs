use crate::config::CustomVariable;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PASE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z_]\w*$").unwrap());

/// Facts the default variable set is built from
#[derive(Debug, Clone, Default)]
pub struct VariableSource<'a> {
    pub current_library: &'a str,
    pub username: &'a str,
    pub host: &'a str,
    pub home_directory: &'a str,
    pub custom_variables: &'a [CustomVariable],
}

/// Ordered `&NAME` substitutions for ILE and PASE command text.
///
/// Values may refer to other variables; every `set` re-expands the stored
/// values against the rest of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: Vec<(String, String)>,
}

impl Variables {
    pub fn new(source: &VariableSource<'_>, overrides: &BTreeMap<String, String>) -> Self {
        let mut variables = Self::default();
        for (key, value) in overrides {
            variables.set(key, value);
        }

        let current_library = variables
            .get("&CURLIB")
            .unwrap_or(source.current_library)
            .to_string();

        variables.set_default("&BUILDLIB", &current_library);
        variables.set_default("&CURLIB", &current_library);
        variables.set_default("&USERNAME", source.username);
        variables.set_default("{usrprf}", source.username);
        variables.set_default("&HOST", source.host);
        variables.set_default("{host}", source.host);
        variables.set_default("&HOME", source.home_directory);
        variables.set_default("&WORKDIR", source.home_directory);

        for custom in source.custom_variables {
            variables.set_default(&format!("&{}", custom.name.to_uppercase()), &custom.value);
        }

        variables
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }

        for index in 0..self.entries.len() {
            let key = self.entries[index].0.clone();
            let expanded = self.expand_except(&self.entries[index].1, Some(&key));
            self.entries[index].1 = expanded;
        }
    }

    fn set_default(&mut self, key: &str, value: &str) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    /// Replace every known variable in `text`. Longer names go first so
    /// `&LIBLS` is never mistaken for `&LIBL`.
    pub fn expand(&self, text: &str) -> String {
        self.expand_except(text, None)
    }

    fn expand_except(&self, text: &str, skip: Option<&str>) -> String {
        let mut keys: Vec<&(String, String)> = self
            .entries
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != skip)
            .collect();
        keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        keys.into_iter()
            .fold(text.to_string(), |acc, (key, value)| acc.replace(key.as_str(), value))
    }

    /// Variables usable as shell environment names, `&` stripped
    pub fn to_pase_variables(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.trim_start_matches('&').to_string(), v.clone()))
            .filter(|(k, _)| PASE_NAME.is_match(k))
            .collect()
    }
}

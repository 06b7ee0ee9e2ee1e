use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

/// A set of `key=value` labels, also used as an equality-based selector.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether these labels satisfy every requirement of `selector`.
    /// An empty selector matches everything.
    pub fn matches(&self, selector: &Labels) -> bool {
        selector
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Labels(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self
            .0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        write!(f, "{}", pairs.join(","))
    }
}

impl FromStr for Labels {
    type Err = Error;

    /// Parse a selector of the form `k1=v1,k2==v2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = Labels::new();
        for requirement in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            if requirement.contains("!=") {
                return Err(anyhow!(
                    "unsupported selector requirement \"{}\": only equality is supported",
                    requirement
                ));
            }
            let (key, value) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
                .ok_or_else(|| anyhow!("invalid selector requirement \"{}\"", requirement))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() {
                return Err(anyhow!("empty label key in \"{}\"", requirement));
            }
            if value.contains('=') {
                return Err(anyhow!("invalid selector requirement \"{}\"", requirement));
            }
            labels.insert(key, value);
        }
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selector() {
        let labels: Labels = "app=web, tier==frontend".parse().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("frontend"));
        assert_eq!(labels.to_string(), "app=web,tier=frontend");
    }

    #[test]
    fn reject_malformed_selector() {
        assert!("app".parse::<Labels>().is_err());
        assert!("=web".parse::<Labels>().is_err());
        assert!("app!=web".parse::<Labels>().is_err());
        assert!("app=a=b".parse::<Labels>().is_err());
    }

    #[test]
    fn selector_requires_every_pair() {
        let pod: Labels = [("app", "web"), ("tier", "frontend")].into_iter().collect();
        let selector: Labels = [("app", "web")].into_iter().collect();
        let other: Labels = [("app", "web"), ("tier", "backend")].into_iter().collect();
        assert!(pod.matches(&selector));
        assert!(pod.matches(&Labels::new()));
        assert!(!pod.matches(&other));
    }
}

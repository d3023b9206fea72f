use std::fmt;

use kube::Resource;

/// Names of the objects that reference a shared, unowned resource.
///
/// Stored on the shared resource as a comma-joined annotation value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Members(Vec<String>);

impl Members {
    pub fn parse(value: &str) -> Self {
        let mut members = Members::default();
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            members.add(name);
        }
        members
    }

    /// Reads the annotation `key` from `obj`; missing means empty.
    pub fn from_annotation<K: Resource>(obj: &K, key: &str) -> Self {
        obj.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|v| Self::parse(v))
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// Returns false when `name` was already a member.
    pub fn add(&mut self, name: &str) -> bool {
        if self.contains(name) {
            return false;
        }
        self.0.push(name.to_string());
        true
    }

    /// Returns false when `name` was not a member.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|n| n != name);
        before != self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Writes the set back as annotation `key` on `obj`.
    pub fn store_on<K: Resource>(&self, obj: &mut K, key: &str) {
        obj.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), self.to_string());
    }
}

impl fmt::Display for Members {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;

    #[test]
    fn exact_names_not_substrings() {
        let m = Members::parse("sq-search-10,other");
        assert!(m.contains("sq-search-10"));
        assert!(!m.contains("sq-search-1"));
    }

    #[test]
    fn add_and_remove_keep_order() {
        let mut m = Members::parse("a,b");
        assert!(m.add("c"));
        assert!(!m.add("a"));
        assert_eq!(m.to_string(), "a,b,c");
        assert!(m.remove("b"));
        assert!(!m.remove("b"));
        assert_eq!(m.to_string(), "a,c");
    }

    #[test]
    fn empty_segments_are_ignored() {
        assert_eq!(Members::parse(",a,,b,").to_string(), "a,b");
        assert!(Members::parse("").is_empty());
    }

    #[test]
    fn round_trips_through_annotation() {
        let mut secret = Secret::default();
        let key = "sonarqube.sonarsource.parflesh.github.io/database";
        assert!(Members::from_annotation(&secret, key).is_empty());

        let mut m = Members::default();
        m.add("sq");
        m.store_on(&mut secret, key);
        let m = Members::from_annotation(&secret, key);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec!["sq"]);
    }
}

use std::collections::{BTreeSet, HashMap};

/// Longest tool name providers accept.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Bijection between catalog names (`toolset.tool`) and the names presented
/// to a model.
///
/// A tool is presented by its leaf name. When several tools share a leaf,
/// each of them is presented by its full path joined with `_`; any collision
/// that remains after that gets a numeric suffix. Names are restricted to
/// `[A-Za-z0-9_-]` and at most [`MAX_TOOL_NAME_LEN`] characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolNameMap {
    to_sanitized: HashMap<String, String>,
    to_canonical: HashMap<String, String>,
}

impl ToolNameMap {
    pub fn new<I, S>(canonical_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = canonical_names.into_iter().map(Into::into).collect();

        let mut leaf_counts: HashMap<String, usize> = HashMap::new();
        for name in &names {
            *leaf_counts.entry(clean(leaf(name))).or_default() += 1;
        }

        let mut map = Self::default();
        for name in names {
            let leaf_name = clean(leaf(&name));
            let base = if leaf_counts.get(&leaf_name).copied().unwrap_or(0) > 1 {
                clean(&name.replace('.', "_"))
            } else {
                leaf_name
            };
            let sanitized = map.unique(base);
            map.to_canonical.insert(sanitized.clone(), name.clone());
            map.to_sanitized.insert(name, sanitized);
        }
        map
    }

    fn unique(&self, base: String) -> String {
        if !self.to_canonical.contains_key(&base) {
            return base;
        }
        (2usize..)
            .map(|n| {
                let suffix = format!("_{n}");
                let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len());
                let stem: String = base.chars().take(keep).collect();
                format!("{stem}{suffix}")
            })
            .find(|candidate| !self.to_canonical.contains_key(candidate))
            .unwrap_or(base)
    }

    /// Name to present to the model for a catalog tool.
    pub fn sanitized(&self, canonical: &str) -> Option<&str> {
        self.to_sanitized.get(canonical).map(String::as_str)
    }

    /// Catalog name for a name the model replied with.
    pub fn canonical(&self, sanitized: &str) -> Option<&str> {
        self.to_canonical.get(sanitized).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.to_sanitized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_sanitized.is_empty()
    }
}

fn leaf(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn clean(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["todos.list"], "todos.list", "list")]
    #[case(&["todos.list", "orders.list"], "todos.list", "todos_list")]
    #[case(&["todos.list", "orders.list"], "orders.list", "orders_list")]
    #[case(&["todos.list", "orders.cancel"], "orders.cancel", "cancel")]
    #[case(&["web.fetch page"], "web.fetch page", "fetch_page")]
    #[case(&["q.a_b_c", "a_b.c", "x.c"], "a_b.c", "a_b_c")]
    #[case(&["q.a_b_c", "a_b.c", "x.c"], "q.a_b_c", "a_b_c_2")]
    fn sanitizes_names(#[case] names: &[&str], #[case] canonical: &str, #[case] expected: &str) {
        let map = ToolNameMap::new(names.iter().copied());
        assert_eq!(map.sanitized(canonical), Some(expected));
        assert_eq!(map.canonical(expected), Some(canonical));
    }

    #[test]
    fn long_names_are_truncated_with_room_for_suffix() {
        let long = "x".repeat(80);
        let map = ToolNameMap::new([format!("a.{long}"), format!("b.{long}")]);
        for canonical in [format!("a.{long}"), format!("b.{long}")] {
            let sanitized = map.sanitized(&canonical).unwrap();
            assert!(sanitized.len() <= MAX_TOOL_NAME_LEN);
        }
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let map = ToolNameMap::new(["todos.list"]);
        assert_eq!(map.canonical("todos_list"), None);
        assert_eq!(map.sanitized("list"), None);
    }

    proptest! {
        #[test]
        fn mapping_is_a_bijection(names in prop::collection::btree_set("[a-z]{1,3}\\.[a-z .]{1,70}", 1..12)) {
            let map = ToolNameMap::new(names.iter().cloned());
            prop_assert_eq!(map.len(), names.len());
            for name in &names {
                let sanitized = map.sanitized(name).unwrap();
                prop_assert!(sanitized.len() <= MAX_TOOL_NAME_LEN);
                prop_assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
                prop_assert_eq!(map.canonical(sanitized), Some(name.as_str()));
            }
        }
    }
}

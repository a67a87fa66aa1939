//! Name search over the snapshot.
//!
//! The string table is reduced to the matching entries first, then every
//! node is checked against that set. No index is kept between searches.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::aggregates::NodePredicate;
use crate::snapshot::{HeapSnapshot, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchConfig {
    pub query: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
}

impl SearchConfig {
    pub fn new(query: impl Into<String>) -> Self {
        SearchConfig {
            query: query.into(),
            ..SearchConfig::default()
        }
    }
}

/// Indexes of the strings matching the query.
fn matching_strings(strings: &[String], config: &SearchConfig) -> Result<Vec<bool>> {
    if !config.is_regex && config.case_sensitive {
        return Ok(strings.iter().map(|s| s.contains(&config.query)).collect());
    }
    let pattern = if config.is_regex {
        config.query.clone()
    } else {
        regex::escape(&config.query)
    };
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(!config.case_sensitive)
        .build()?;
    Ok(strings.iter().map(|s| regex.is_match(s)).collect())
}

/// Ids of nodes whose name matches, in node order.
pub fn search(
    snapshot: &HeapSnapshot,
    config: &SearchConfig,
    predicate: &NodePredicate,
) -> Result<Vec<u32>> {
    if config.query.is_empty() {
        return Ok(Vec::new());
    }
    let graph = snapshot.graph();
    let matches = matching_strings(graph.strings(), config)?;
    if !matches.contains(&true) {
        return Ok(Vec::new());
    }
    let policy = snapshot.policy();
    Ok(graph
        .nodes()
        .filter(|&node| matches.get(node.name_index() as usize).copied().unwrap_or(false))
        .filter(|&node| policy.node_filter(node) && predicate.matches(node))
        .map(|node| node.id())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::NodeFilter;
    use crate::snapshot::SnapshotError;
    use crate::testing::SnapshotBuilder;

    fn names() -> SnapshotBuilder {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        for (i, name) in ["EventEmitter", "emitter", "Buffer", "eventLoop", "EventEmitter"]
            .iter()
            .enumerate()
        {
            let node = b.node("object", name, 3 + 2 * i as u32, 8);
            b.edge(root, "element", &(i + 1).to_string(), node);
        }
        b
    }

    #[test]
    fn substring_is_case_sensitive_when_asked() {
        let snapshot = names().build();
        let mut config = SearchConfig::new("Emitter");
        config.case_sensitive = true;
        let ids = snapshot.search(&config, &NodeFilter::default()).unwrap();
        assert_eq!(ids, vec![3, 11]);
    }

    #[test]
    fn plain_text_is_case_insensitive_by_default() {
        let snapshot = names().build();
        let ids = snapshot
            .search(&SearchConfig::new("emitter"), &NodeFilter::default())
            .unwrap();
        assert_eq!(ids, vec![3, 5, 11]);
        // Regex metacharacters in plain text match literally.
        let ids = snapshot
            .search(&SearchConfig::new("(root"), &NodeFilter::default())
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn regex_queries() {
        let snapshot = names().build();
        let config = SearchConfig {
            query: "^event".to_string(),
            case_sensitive: true,
            is_regex: true,
        };
        let ids = snapshot.search(&config, &NodeFilter::default()).unwrap();
        assert_eq!(ids, vec![9]);

        let bad = SearchConfig {
            query: "(".to_string(),
            case_sensitive: true,
            is_regex: true,
        };
        assert!(matches!(
            snapshot.search(&bad, &NodeFilter::default()),
            Err(SnapshotError::InvalidRegex(_))
        ));
    }

    #[test]
    fn empty_query_and_no_match_return_nothing() {
        let snapshot = names().build();
        let none = snapshot
            .search(&SearchConfig::new(""), &NodeFilter::default())
            .unwrap();
        assert!(none.is_empty());
        let none = snapshot
            .search(&SearchConfig::new("nothing like it"), &NodeFilter::default())
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn filtered_and_repeatable() {
        let snapshot = names().build();
        let filter = NodeFilter {
            min_node_id: Some(3),
            max_node_id: Some(11),
            allocation_node_id: None,
        };
        let config = SearchConfig::new("emitter");
        let first = snapshot.search(&config, &filter).unwrap();
        let second = snapshot.search(&config, &filter).unwrap();
        assert_eq!(first, vec![5, 11]);
        assert_eq!(first, second);
    }
}

//! Dependency Oracle: read-only queries against the pre-built dependency
//! tree produced by an external collaborator and serialized to JSON.
//!
//! The tree itself is not built here (out of scope); this module only loads
//! and queries it rather than constructing it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::DepTreeError;

/// One dependency relation kind, named exactly as `runscript.c` names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    INeed,
    IUse,
    IAfter,
    IBefore,
    IProvide,
    NeedsMe,
    UsesMe,
    BeforeMe,
    Broken,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::INeed => "ineed",
            Relation::IUse => "iuse",
            Relation::IAfter => "iafter",
            Relation::IBefore => "ibefore",
            Relation::IProvide => "iprovide",
            Relation::NeedsMe => "needsme",
            Relation::UsesMe => "usesme",
            Relation::BeforeMe => "beforeme",
            Relation::Broken => "broken",
        }
    }
}

/// Query options for `depends()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Follow edges transitively rather than one hop.
    pub trace: bool,
    /// Treat a referenced-but-absent node as an error rather than skipping it.
    pub strict: bool,
    /// Bias tie-breaks toward a runlevel that is starting.
    pub start: bool,
    /// Bias tie-breaks toward a runlevel that is stopping.
    pub stop: bool,
}

#[derive(Debug, Deserialize, Clone)]
struct RawNode {
    #[serde(default)]
    ineed: Vec<String>,
    #[serde(default)]
    iuse: Vec<String>,
    #[serde(default)]
    iafter: Vec<String>,
    #[serde(default)]
    ibefore: Vec<String>,
    #[serde(default)]
    iprovide: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTree {
    #[serde(flatten)]
    nodes: HashMap<String, RawNode>,
}

/// A loaded, queryable dependency graph.
#[derive(Debug, Default, Clone)]
pub struct DepTree {
    nodes: HashMap<String, RawNode>,
    /// Reverse edges derived at load time so `needsme`/`usesme`/`beforeme`
    /// are O(1) lookups rather than a full scan per query.
    needsme: HashMap<String, Vec<String>>,
    usesme: HashMap<String, Vec<String>>,
    beforeme: HashMap<String, Vec<String>>,
}

impl DepTree {
    /// Loads the serialized dependency tree from `path`.
    pub fn load(path: &Path) -> Result<Self, DepTreeError> {
        let raw = fs::read_to_string(path)?;
        let parsed: RawTree = serde_json::from_str(&raw)?;
        Ok(Self::from_raw(parsed))
    }

    fn from_raw(raw: RawTree) -> Self {
        let mut needsme: HashMap<String, Vec<String>> = HashMap::new();
        let mut usesme: HashMap<String, Vec<String>> = HashMap::new();
        let mut beforeme: HashMap<String, Vec<String>> = HashMap::new();

        for (svc, node) in &raw.nodes {
            for dep in &node.ineed {
                needsme.entry(dep.clone()).or_default().push(svc.clone());
            }
            for dep in &node.iuse {
                usesme.entry(dep.clone()).or_default().push(svc.clone());
            }
            for dep in &node.ibefore {
                beforeme.entry(dep.clone()).or_default().push(svc.clone());
            }
        }

        Self {
            nodes: raw.nodes,
            needsme,
            usesme,
            beforeme,
        }
    }

    fn one_hop(&self, relation: Relation, svc: &str) -> Vec<String> {
        match relation {
            Relation::INeed => self.nodes.get(svc).map(|n| n.ineed.clone()).unwrap_or_default(),
            Relation::IUse => self.nodes.get(svc).map(|n| n.iuse.clone()).unwrap_or_default(),
            Relation::IAfter => self.nodes.get(svc).map(|n| n.iafter.clone()).unwrap_or_default(),
            Relation::IBefore => self.nodes.get(svc).map(|n| n.ibefore.clone()).unwrap_or_default(),
            Relation::IProvide => self.nodes.get(svc).map(|n| n.iprovide.clone()).unwrap_or_default(),
            Relation::NeedsMe => self.needsme.get(svc).cloned().unwrap_or_default(),
            Relation::UsesMe => self.usesme.get(svc).cloned().unwrap_or_default(),
            Relation::BeforeMe => self.beforeme.get(svc).cloned().unwrap_or_default(),
            Relation::Broken => self.broken_one(svc),
        }
    }

    fn broken_one(&self, svc: &str) -> Vec<String> {
        let Some(node) = self.nodes.get(svc) else {
            return Vec::new();
        };
        node.ineed
            .iter()
            .filter(|dep| !self.nodes.contains_key(*dep))
            .cloned()
            .collect()
    }

    /// `depend(tree, relation, svc) -> [svc]`: one-hop lookup.
    pub fn depend(&self, relation: Relation, svc: &str) -> Vec<String> {
        self.one_hop(relation, svc)
    }

    /// `keywords(tree, svc) -> [string]`.
    pub fn keywords(&self, svc: &str) -> Vec<String> {
        self.nodes
            .get(svc)
            .map(|n| n.keywords.clone())
            .unwrap_or_default()
    }

    /// `depends(tree, relations, roots, options) -> [svc]`: svcs reachable
    /// via any of `relations` from `roots`, in (reverse-)topological
    /// discovery order. When `options.trace` is unset, only one hop is taken.
    pub fn depends(
        &self,
        relations: &[Relation],
        roots: &[String],
        options: Options,
    ) -> Result<Vec<String>, DepTreeError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();

        while let Some(svc) = queue.pop_front() {
            for relation in relations {
                if *relation != Relation::Broken && options.strict && !self.nodes.contains_key(&svc)
                {
                    return Err(DepTreeError::UnknownService(svc.clone()));
                }
                for next in self.one_hop(*relation, &svc) {
                    if seen.insert(next.clone()) {
                        order.push(next.clone());
                        if options.trace {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DepTree {
        let json = serde_json::json!({
            "svc": {"ineed": ["db"], "iuse": ["cache"], "iprovide": ["alias"]},
            "db": {"iafter": ["svc"]},
        });
        DepTree::from_raw(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn one_hop_ineed() {
        let tree = sample();
        assert_eq!(tree.depend(Relation::INeed, "svc"), vec!["db".to_string()]);
    }

    #[test]
    fn reverse_needsme_derived() {
        let tree = sample();
        assert_eq!(tree.depend(Relation::NeedsMe, "db"), vec!["svc".to_string()]);
    }

    #[test]
    fn broken_reports_missing_hard_dep() {
        let json = serde_json::json!({"svc": {"ineed": ["ghost"]}});
        let tree = DepTree::from_raw(serde_json::from_value(json).unwrap());
        assert_eq!(tree.depend(Relation::Broken, "svc"), vec!["ghost".to_string()]);
    }

    #[test]
    fn depends_traces_transitively() {
        let json = serde_json::json!({
            "a": {"ineed": ["b"]},
            "b": {"ineed": ["c"]},
            "c": {},
        });
        let tree = DepTree::from_raw(serde_json::from_value(json).unwrap());
        let out = tree
            .depends(
                &[Relation::INeed],
                &["a".to_string()],
                Options {
                    trace: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out, vec!["b".to_string(), "c".to_string()]);
    }
}

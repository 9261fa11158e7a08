use crate::Error;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// One node of a granularity graph. In the abstract graph the id names a
/// granularity kind and `kind` is unset; in the instance graph the id names
/// a concrete region and `kind` names the granularity it inhabits.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub shape: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct Link {
    source: String,
    target: String,
    /// Per-variable aggregator overrides for this refinement edge.
    #[serde(default)]
    a: Option<BTreeMap<String, String>>,
    /// Per-variable disaggregator overrides for this refinement edge.
    #[serde(default)]
    d: Option<BTreeMap<String, String>>,
}

// Node-link document as emitted by the offline graph builder. Builder
// metadata (`graph`, `directed`, `multigraph`) is ignored.
#[derive(Debug, Deserialize)]
struct GraphFile {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Clone, Default)]
struct EdgeHints {
    agg: BTreeMap<String, String>,
    dagg: BTreeMap<String, String>,
}

/// A directed acyclic granularity graph: either the abstract graph of
/// granularity kinds, or the instance graph of concrete regions.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    hints: HashMap<(String, String), EdgeHints>,
    by_kind: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: GraphFile = serde_json::from_slice(&bytes).map_err(|source| Error::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_file(file)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        let file: GraphFile = serde_json::from_value(value).map_err(|source| Error::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        Self::from_file(file)
    }

    fn from_file(file: GraphFile) -> Result<Self, Error> {
        let mut graph = Self::default();

        for node in file.nodes {
            if let Some(area) = node.area {
                if area < 0.0 {
                    return Err(Error::NegativeArea { id: node.id, area });
                }
            }
            if let Some(kind) = &node.kind {
                graph
                    .by_kind
                    .entry(kind.clone())
                    .or_default()
                    .push(node.id.clone());
            }
            if graph.nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(Error::DuplicateNode(node.id));
            }
        }
        for link in file.links {
            for end in [&link.source, &link.target] {
                if !graph.nodes.contains_key(end) {
                    return Err(Error::UnknownLinkNode(end.clone()));
                }
            }
            graph
                .children
                .entry(link.source.clone())
                .or_default()
                .push(link.target.clone());
            graph
                .parents
                .entry(link.target.clone())
                .or_default()
                .push(link.source.clone());
            graph.hints.insert(
                (link.source, link.target),
                EdgeHints {
                    agg: link.a.unwrap_or_default(),
                    dagg: link.d.unwrap_or_default(),
                },
            );
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn area(&self, id: &str) -> Option<f64> {
        self.nodes.get(id).and_then(|n| n.area)
    }

    pub fn set_area(&mut self, id: &str, area: f64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.area = Some(area);
        }
    }

    /// Immediate refinements (contained regions) of `id`.
    pub fn successors(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Immediate containing nodes of `id`.
    pub fn ancestors(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instances_of_kind(&self, kind: &str) -> &[String] {
        self.by_kind.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Children of `id` inhabiting granularity `kind`.
    pub fn children_of_kind<'s>(
        &'s self,
        id: &str,
        kind: &'s str,
    ) -> impl Iterator<Item = &'s Node> + 's {
        self.successors(id)
            .iter()
            .filter_map(move |child| self.nodes.get(child))
            .filter(move |node| node.kind.as_deref() == Some(kind))
    }

    /// The unique parent of `id` at granularity `kind`. Zero parents is a
    /// valid outcome (the caller skips the instance); more than one breaks
    /// the containment invariant and is an error.
    pub fn parent_of_kind(&self, id: &str, kind: &str) -> Result<Option<&Node>, Error> {
        let mut it = self
            .ancestors(id)
            .iter()
            .filter_map(|parent| self.nodes.get(parent))
            .filter(|node| node.kind.as_deref() == Some(kind));

        let first = it.next();
        let extra = it.count();
        if extra > 0 {
            return Err(Error::AmbiguousParent {
                instance: id.to_string(),
                kind: kind.to_string(),
                count: extra + 1,
            });
        }
        Ok(first)
    }

    pub fn has_path(&self, from: &str, to: &str) -> bool {
        self.shortest_path(from, to).is_some()
    }

    /// Fewest-hops directed path from `from` to `to`, inclusive of both ends.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        pathfinding::directed::bfs::bfs(
            &from.to_string(),
            |node| self.successors(node).to_vec(),
            |node| node.as_str() == to,
        )
    }

    /// Aggregator override declared on the abstract edge coarse -> fine for
    /// `variable`, if any.
    pub fn edge_aggregator(&self, coarse: &str, fine: &str, variable: &str) -> Option<&str> {
        self.hints
            .get(&(coarse.to_string(), fine.to_string()))
            .and_then(|h| h.agg.get(variable))
            .map(String::as_str)
    }

    pub fn edge_disaggregator(&self, coarse: &str, fine: &str, variable: &str) -> Option<&str> {
        self.hints
            .get(&(coarse.to_string(), fine.to_string()))
            .and_then(|h| h.dagg.get(variable))
            .map(String::as_str)
    }
}

//! Control-flow automaton: the program representation the engine explores.
//!
//! Parsing source programs into a CFA is an external concern. This module only
//! defines the shape the engine consumes: nodes grouped into functions, typed
//! edges, the loop structure, and a reverse-postorder numbering used by the
//! topological waitlist.
//!
//! # Example
//!
//! ```
//! use cpa_rs::cfa::CfaBuilder;
//!
//! let mut b = CfaBuilder::new("main");
//! let (entry, exit) = b.function("main");
//! let mid = b.node("main");
//! b.statement(entry, mid, "x = 0");
//! b.assume(mid, exit, true, "x == 0");
//! let cfa = b.build().unwrap();
//!
//! assert_eq!(cfa.main_entry(), entry);
//! assert_eq!(cfa.leaving_edges(entry).count(), 1);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use indexmap::IndexMap;

use crate::error::{CpaError, Result};
use crate::types::{EdgeId, LoopId, NodeId};

/// What an edge does, as far as the engine is concerned.
///
/// The concrete operation is left to domains, which interpret
/// [`CfaEdge::description`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    Blank,
    Statement,
    Assume {
        truth: bool,
    },
    /// Call of a defined function; goes to the callee's entry node.
    FunctionCall {
        callee: String,
        summary_edge: EdgeId,
    },
    /// Return from a callee's exit node to the return site.
    FunctionReturn,
    /// Call of an undefined (external) function, from call site to return site.
    ExternalCall {
        callee: String,
    },
    /// Summary edge from a call site to its return site. Not a leaving edge.
    CallToReturn {
        callee: String,
    },
}

#[derive(Debug, Clone)]
pub struct CfaEdge {
    pub id: EdgeId,
    pub predecessor: NodeId,
    pub successor: NodeId,
    pub kind: EdgeKind,
    pub description: String,
}

impl fmt::Display for CfaEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} [{}]",
            self.id, self.predecessor, self.successor, self.description
        )
    }
}

#[derive(Debug, Clone)]
pub struct CfaNode {
    pub id: NodeId,
    pub function: String,
    leaving: Vec<EdgeId>,
    entering: Vec<EdgeId>,
    summary_leaving: Option<EdgeId>,
    reverse_postorder: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub entry: NodeId,
    pub exit: NodeId,
}

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub head: NodeId,
    pub nodes: BTreeSet<NodeId>,
    /// Edges from outside the loop into the loop head.
    pub entering_edges: Vec<EdgeId>,
    /// Edges from a loop node to a node outside the loop.
    pub exit_edges: Vec<EdgeId>,
}

impl Loop {
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

#[derive(Debug, Clone)]
pub struct Cfa {
    nodes: Vec<CfaNode>,
    edges: Vec<CfaEdge>,
    functions: IndexMap<String, FunctionInfo>,
    main: String,
    loops: Vec<Loop>,
    loop_heads: HashMap<NodeId, LoopId>,
}

impl Cfa {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> &CfaNode {
        &self.nodes[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &CfaEdge {
        &self.edges[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CfaNode> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &CfaEdge> {
        self.edges.iter()
    }

    /// Ordinary outgoing edges of `node` (summary edges excluded).
    pub fn leaving_edges(&self, node: NodeId) -> impl Iterator<Item = &CfaEdge> {
        self.node(node).leaving.iter().map(|&e| self.edge(e))
    }

    pub fn entering_edges(&self, node: NodeId) -> impl Iterator<Item = &CfaEdge> {
        self.node(node).entering.iter().map(|&e| self.edge(e))
    }

    /// The call-to-return summary edge leaving a call site, if any.
    pub fn summary_edge_of(&self, node: NodeId) -> Option<&CfaEdge> {
        self.node(node).summary_leaving.map(|e| self.edge(e))
    }

    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values()
    }

    pub fn function_of(&self, node: NodeId) -> &str {
        &self.node(node).function
    }

    pub fn main_function(&self) -> &FunctionInfo {
        &self.functions[&self.main]
    }

    pub fn main_entry(&self) -> NodeId {
        self.main_function().entry
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loop_info(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    pub fn loop_with_head(&self, head: NodeId) -> Option<&Loop> {
        self.loop_heads.get(&head).map(|&id| self.loop_info(id))
    }

    /// Returns the loop that `edge` enters from outside, if any.
    pub fn entered_loop(&self, edge: &CfaEdge) -> Option<&Loop> {
        let l = self.loop_with_head(edge.successor)?;
        (!l.contains(edge.predecessor)).then_some(l)
    }

    /// Returns the loop whose head `edge` jumps back to from inside, if any.
    pub fn back_edge_loop(&self, edge: &CfaEdge) -> Option<&Loop> {
        let l = self.loop_with_head(edge.successor)?;
        l.contains(edge.predecessor).then_some(l)
    }

    /// Position of `node` in reverse postorder (entry nodes come first).
    pub fn reverse_postorder(&self, node: NodeId) -> u32 {
        self.node(node).reverse_postorder
    }

    /// Names of the functions called (directly) from `function`, in edge order.
    pub fn callees(&self, function: &str) -> Vec<&str> {
        let mut result: Vec<&str> = Vec::new();
        for edge in &self.edges {
            if self.node(edge.predecessor).function != function {
                continue;
            }
            let callee = match &edge.kind {
                EdgeKind::FunctionCall { callee, .. } => callee.as_str(),
                EdgeKind::ExternalCall { callee } => callee.as_str(),
                _ => continue,
            };
            if !result.contains(&callee) {
                result.push(callee);
            }
        }
        result
    }
}

/// Incremental CFA construction.
#[derive(Debug)]
pub struct CfaBuilder {
    main: String,
    nodes: Vec<String>,
    edges: Vec<CfaEdge>,
    functions: IndexMap<String, FunctionInfo>,
    loops: Vec<(NodeId, BTreeSet<NodeId>)>,
    pending_calls: Vec<(EdgeId, String, NodeId)>,
}

impl CfaBuilder {
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            functions: IndexMap::new(),
            loops: Vec::new(),
            pending_calls: Vec::new(),
        }
    }

    /// Adds a fresh node belonging to `function`.
    pub fn node(&mut self, function: &str) -> NodeId {
        let id = NodeId::new(self.nodes.len() as u32);
        self.nodes.push(function.to_string());
        id
    }

    /// Declares a function and returns its `(entry, exit)` nodes.
    pub fn function(&mut self, name: &str) -> (NodeId, NodeId) {
        let entry = self.node(name);
        let exit = self.node(name);
        self.functions.insert(
            name.to_string(),
            FunctionInfo {
                name: name.to_string(),
                entry,
                exit,
            },
        );
        (entry, exit)
    }

    pub fn edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        kind: EdgeKind,
        description: impl Into<String>,
    ) -> EdgeId {
        let id = EdgeId::new(self.edges.len() as u32);
        self.edges.push(CfaEdge {
            id,
            predecessor: from,
            successor: to,
            kind,
            description: description.into(),
        });
        id
    }

    pub fn blank(&mut self, from: NodeId, to: NodeId) -> EdgeId {
        self.edge(from, to, EdgeKind::Blank, "")
    }

    pub fn statement(&mut self, from: NodeId, to: NodeId, description: &str) -> EdgeId {
        self.edge(from, to, EdgeKind::Statement, description)
    }

    pub fn assume(&mut self, from: NodeId, to: NodeId, truth: bool, description: &str) -> EdgeId {
        self.edge(from, to, EdgeKind::Assume { truth }, description)
    }

    /// Adds a call of `callee` at `call_site` returning to `return_site`.
    ///
    /// If `callee` is declared (before or after this call) it becomes a
    /// `FunctionCall` edge plus summary and return edges; otherwise it is an
    /// `ExternalCall` edge. Returns the edge leaving the call site.
    pub fn call(&mut self, call_site: NodeId, return_site: NodeId, callee: &str) -> EdgeId {
        // Resolved in `build`, since the callee may be declared later.
        let id = self.edge(
            call_site,
            return_site,
            EdgeKind::ExternalCall {
                callee: callee.to_string(),
            },
            format!("{}()", callee),
        );
        self.pending_calls
            .push((id, callee.to_string(), return_site));
        id
    }

    /// Declares a loop with the given head and body nodes (head included implicitly).
    pub fn add_loop(&mut self, head: NodeId, nodes: impl IntoIterator<Item = NodeId>) -> LoopId {
        let id = LoopId::new(self.loops.len() as u32);
        let mut set: BTreeSet<NodeId> = nodes.into_iter().collect();
        set.insert(head);
        self.loops.push((head, set));
        id
    }

    pub fn build(mut self) -> Result<Cfa> {
        if !self.functions.contains_key(&self.main) {
            return Err(CpaError::config(format!(
                "entry function '{}' is not defined",
                self.main
            )));
        }
        for edge in &self.edges {
            for n in [edge.predecessor, edge.successor] {
                if n.index() >= self.nodes.len() {
                    return Err(CpaError::config(format!("{} refers to unknown {}", edge.id, n)));
                }
            }
        }
        for (i, (head, body)) in self.loops.iter().enumerate() {
            if let Some(n) = body.iter().chain([head]).find(|n| n.index() >= self.nodes.len()) {
                return Err(CpaError::config(format!("{} refers to unknown {}", LoopId::new(i as u32), n)));
            }
        }

        // Resolve calls of defined functions.
        for (call_edge, callee, return_site) in std::mem::take(&mut self.pending_calls) {
            let Some(info) = self.functions.get(&callee).cloned() else {
                continue;
            };
            let call_site = self.edges[call_edge.index()].predecessor;
            let summary_edge = EdgeId::new(self.edges.len() as u32);
            self.edges.push(CfaEdge {
                id: summary_edge,
                predecessor: call_site,
                successor: return_site,
                kind: EdgeKind::CallToReturn {
                    callee: callee.clone(),
                },
                description: format!("summary {}()", callee),
            });
            let e = &mut self.edges[call_edge.index()];
            e.successor = info.entry;
            e.kind = EdgeKind::FunctionCall {
                callee: callee.clone(),
                summary_edge,
            };
            let return_edge = EdgeId::new(self.edges.len() as u32);
            self.edges.push(CfaEdge {
                id: return_edge,
                predecessor: info.exit,
                successor: return_site,
                kind: EdgeKind::FunctionReturn,
                description: format!("return from {}()", callee),
            });
        }

        let mut nodes: Vec<CfaNode> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, function)| CfaNode {
                id: NodeId::new(i as u32),
                function: function.clone(),
                leaving: Vec::new(),
                entering: Vec::new(),
                summary_leaving: None,
                reverse_postorder: 0,
            })
            .collect();
        for edge in &self.edges {
            if let EdgeKind::CallToReturn { .. } = edge.kind {
                nodes[edge.predecessor.index()].summary_leaving = Some(edge.id);
            } else {
                nodes[edge.predecessor.index()].leaving.push(edge.id);
                nodes[edge.successor.index()].entering.push(edge.id);
            }
        }

        let mut loops = Vec::with_capacity(self.loops.len());
        let mut loop_heads = HashMap::new();
        for (i, (head, body)) in self.loops.into_iter().enumerate() {
            let id = LoopId::new(i as u32);
            if loop_heads.insert(head, id).is_some() {
                return Err(CpaError::config(format!("{} heads two loops", head)));
            }
            let entering_edges = nodes[head.index()]
                .entering
                .iter()
                .copied()
                .filter(|e| !body.contains(&self.edges[e.index()].predecessor))
                .collect();
            // Calls leave the loop's nodes without leaving the loop.
            let exit_edges = body
                .iter()
                .flat_map(|n| nodes[n.index()].leaving.iter().copied())
                .filter(|e| {
                    let edge = &self.edges[e.index()];
                    !body.contains(&edge.successor) && !matches!(edge.kind, EdgeKind::FunctionCall { .. })
                })
                .collect();
            loops.push(Loop {
                id,
                head,
                nodes: body,
                entering_edges,
                exit_edges,
            });
        }

        let mut cfa = Cfa {
            nodes,
            edges: self.edges,
            functions: self.functions,
            main: self.main,
            loops,
            loop_heads,
        };
        cfa.number_reverse_postorder();
        Ok(cfa)
    }
}

impl Cfa {
    fn number_reverse_postorder(&mut self) {
        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut postorder: Vec<NodeId> = Vec::with_capacity(n);

        let mut roots = vec![self.main_entry()];
        roots.extend(self.functions.values().map(|f| f.entry));
        roots.extend(self.nodes.iter().map(|node| node.id));

        for root in roots {
            if visited[root.index()] {
                continue;
            }
            visited[root.index()] = true;
            // (node, next child position)
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            while let Some((node, pos)) = stack.pop() {
                let successors: Vec<NodeId> = self.successors_for_numbering(node);
                if pos < successors.len() {
                    stack.push((node, pos + 1));
                    let next = successors[pos];
                    if !visited[next.index()] {
                        visited[next.index()] = true;
                        stack.push((next, 0));
                    }
                } else {
                    postorder.push(node);
                }
            }
        }

        for (i, node) in postorder.iter().rev().enumerate() {
            self.nodes[node.index()].reverse_postorder = i as u32;
        }
    }

    fn successors_for_numbering(&self, node: NodeId) -> Vec<NodeId> {
        let n = self.node(node);
        n.leaving
            .iter()
            .chain(n.summary_leaving.iter())
            .map(|&e| self.edge(e).successor)
            .collect()
    }
}

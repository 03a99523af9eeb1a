//! Pass registration and the rewrite driver.
//!
//! Each registered pass is applied once, in registration order. Candidate
//! roots are visited in topological order; nodes created by a callback are
//! queued and visited after the original nodes so new structure can match
//! too. A callback mutates the graph through [`RewriteContext`] and asks
//! for the matched root to be replaced; the replacement is applied only
//! when the callback returns `Ok(true)`.

use super::matcher::{Captures, Matcher};
use super::pattern::Pattern;
use crate::error::ForgeResult;
use crate::ir::{Graph, NodeId, Output};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info_span};

pub type Callback = Box<dyn Fn(&mut RewriteContext<'_>, &Captures) -> ForgeResult<bool> + Send + Sync>;

/// Mutable view handed to pass callbacks.
pub struct RewriteContext<'g> {
    graph: &'g mut Graph,
    root: NodeId,
    replacement: Option<NodeId>,
}

impl<'g> RewriteContext<'g> {
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Redirect every output of the matched root to `node` on success.
    pub fn replace_root(&mut self, node: NodeId) {
        self.replacement = Some(node);
    }
}

/// Copy runtime info from every `from` node into each `to` node.
///
/// Provenance (the friendly names of the sources and their own fused names)
/// is always carried; tags are carried only when [`RuntimeTag::is_copyable`]
/// says so. Tags already present on a target win.
///
/// [`RuntimeTag::is_copyable`]: crate::ir::RuntimeTag::is_copyable
pub fn copy_runtime_info(graph: &mut Graph, from: &[NodeId], to: &[NodeId]) {
    let mut merged = crate::ir::RtInfo::new();
    for id in from {
        if let Some(node) = graph.node(*id) {
            merged.add_fused_name(node.name.clone());
            for name in node.rt_info.fused_names() {
                merged.add_fused_name(name.clone());
            }
            for (tag, state) in node.rt_info.tags() {
                if tag.is_copyable() && merged.state(tag).is_none() {
                    match state {
                        crate::ir::TagState::Enabled => merged.enable(tag),
                        crate::ir::TagState::Disabled => merged.disable(tag),
                    };
                }
            }
        }
    }
    for id in to {
        if let Some(node) = graph.node_mut(*id) {
            node.rt_info.merge_from(&merged);
        }
    }
}

pub struct MatcherPass {
    name: String,
    pattern: Pattern,
    callback: Callback,
}

impl fmt::Debug for MatcherPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatcherPass").field("name", &self.name).finish()
    }
}

/// Statistics from one rewrite run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RewriteStats {
    /// Pattern matches that reached the callback.
    pub matches: usize,
    /// Callbacks that returned `Ok(true)`.
    pub applied: usize,
    /// Roots replaced by a new node.
    pub replaced: usize,
    /// Nodes dropped by dead-node elimination afterwards.
    pub dead_removed: usize,
}

impl RewriteStats {
    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.dead_removed == 0
    }

    pub fn absorb(&mut self, other: &RewriteStats) {
        self.matches += other.matches;
        self.applied += other.applied;
        self.replaced += other.replaced;
        self.dead_removed += other.dead_removed;
    }
}

impl fmt::Display for RewriteStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rewrite: {} matches, {} applied, {} replaced, {} dead removed",
            self.matches, self.applied, self.replaced, self.dead_removed
        )
    }
}

#[derive(Debug, Default)]
pub struct GraphRewrite {
    passes: Vec<MatcherPass>,
}

impl GraphRewrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pass<F>(&mut self, name: &str, pattern: Pattern, callback: F) -> &mut Self
    where
        F: Fn(&mut RewriteContext<'_>, &Captures) -> ForgeResult<bool> + Send + Sync + 'static,
    {
        self.passes.push(MatcherPass {
            name: name.to_string(),
            pattern,
            callback: Box::new(callback),
        });
        self
    }

    /// Append every pass of `other` after the passes registered so far.
    pub fn extend(&mut self, other: GraphRewrite) -> &mut Self {
        self.passes.extend(other.passes);
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        let mut stats = RewriteStats::default();
        for pass in &self.passes {
            let pass_stats = run_pass(pass, graph)?;
            debug!(pass = %pass.name, %pass_stats, "pass finished");
            stats.absorb(&pass_stats);
        }
        stats.dead_removed += graph.remove_dead_nodes();
        Ok(stats)
    }
}

/// A whole-graph transformation.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_on_graph(&self, graph: &mut Graph) -> ForgeResult<RewriteStats>;
}

/// Ordered list of passes run one after another.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn GraphPass>>,
}

impl fmt::Debug for PassManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.passes.iter().map(|p| p.name()))
            .finish()
    }
}

impl PassManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GraphPass + 'static>(&mut self, pass: P) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&self, graph: &mut Graph) -> ForgeResult<RewriteStats> {
        let mut stats = RewriteStats::default();
        for pass in &self.passes {
            let pass_stats = pass.run_on_graph(graph)?;
            debug!(pass = pass.name(), %pass_stats, "graph pass finished");
            stats.absorb(&pass_stats);
        }
        Ok(stats)
    }
}

fn run_pass(pass: &MatcherPass, graph: &mut Graph) -> ForgeResult<RewriteStats> {
    let _span = info_span!("rewrite_pass", pass = %pass.name).entered();
    let mut stats = RewriteStats::default();
    let root_kinds = pass.pattern.root_kinds();
    let matcher = Matcher::new(&pass.pattern);

    let mut queue: VecDeque<NodeId> = graph.topological_order()?.into();
    while let Some(id) = queue.pop_front() {
        let kind = match graph.kind(id) {
            Some(k) => k,
            None => continue,
        };
        if let Some(kinds) = &root_kinds {
            if !kinds.contains(&kind) {
                continue;
            }
        }
        let mut captures = match matcher.match_output(graph, Output::from(id)) {
            Some(c) => c,
            None => continue,
        };
        captures.set_pass(&pass.name);
        stats.matches += 1;

        let first_new = graph.next_id();
        // A callback may build nodes or retag the graph before it decides to
        // decline; a declined match leaves no trace.
        let snapshot = graph.clone();
        let mut ctx = RewriteContext {
            graph,
            root: id,
            replacement: None,
        };
        let applied = (pass.callback)(&mut ctx, &captures)?;
        let replacement = ctx.replacement;
        if !applied {
            *graph = snapshot;
            continue;
        }
        stats.applied += 1;
        if let Some(new) = replacement {
            if new != id {
                graph.replace_node(id, new)?;
                stats.replaced += 1;
            }
        }
        let created: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|n| n.index() >= first_new.index())
            .collect();
        queue.extend(created);
    }
    Ok(stats)
}

//! Interprocedural method summaries
//!
//! A summary records, per reference parameter, how far the parameter escapes
//! inside the method, whether it may be returned, and whether it reaches a
//! virtual call. Summaries are keyed by `MethodKey` and published once into a
//! process-wide cache shared by every compilation thread. The first published
//! summary for a key wins; later publishers receive the canonical copy.

use super::cng::{CnGNodeId, ConnectionGraph, EdgeKind, EscState, NodeKind};
use super::error::{EscapeError, EscapeResult};
use crate::ir::{IrFunction, MethodKey};
use fxhash::{FxHashMap, FxHashSet};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SUMMARY_MAGIC: [u8; 4] = *b"ESUM";
const SUMMARY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEscape {
    /// Parameter position, counting the receiver of instance methods as 0
    pub index: usize,
    pub state: EscState,
    /// The parameter may be the method's return value
    pub returned: bool,
    /// The parameter reaches a virtual call inside the method
    pub virtual_call: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalleeMethodInfo {
    pub key: MethodKey,
    /// Reference parameters only, in position order
    pub params: Vec<ParamEscape>,
    /// `NoEscape` when every returned object is allocated by the method and
    /// does not escape otherwise
    pub return_state: EscState,
    /// The method locks its receiver, either by being synchronized or with
    /// an explicit monitor
    pub monitor_on_this: bool,
}

impl CalleeMethodInfo {
    pub fn param(&self, index: usize) -> Option<&ParamEscape> {
        self.params.iter().find(|p| p.index == index)
    }
}

impl fmt::Display for CalleeMethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.key, self.return_state)?;
        for p in &self.params {
            write!(f, " p{}={}", p.index, p.state)?;
            if p.returned {
                f.write_str("+ret")?;
            }
            if p.virtual_call {
                f.write_str("+virt")?;
            }
        }
        if self.monitor_on_this {
            f.write_str(" [locks this]")?;
        }
        Ok(())
    }
}

/// Summarize a method from its propagated connection graph
pub fn summarize(key: MethodKey, function: &IrFunction, graph: &ConnectionGraph) -> CalleeMethodInfo {
    let mut reverse: FxHashMap<CnGNodeId, Vec<(CnGNodeId, EdgeKind)>> = FxHashMap::default();
    for id in graph.node_ids() {
        for edge in graph.edges_from(id) {
            reverse.entry(edge.to).or_default().push((id, edge.kind));
        }
    }

    let exits: Vec<CnGNodeId> = graph
        .node_ids()
        .filter(|id| {
            let node = graph.node(*id);
            node.kind == NodeKind::ExitVal && !node.thrown
        })
        .collect();
    let from_exits = reachable(graph, &exits);

    let mut params: Vec<ParamEscape> = graph
        .node_ids()
        .filter_map(|id| {
            let node = graph.node(id);
            if node.kind != NodeKind::DefArg {
                return None;
            }
            let index = node.arg_index?;
            let region = param_region(graph, &reverse, id);
            let state = if stored_outside(graph, &reverse, &region) {
                EscState::GlobalEscape
            } else {
                region
                    .iter()
                    .map(|n| graph.node(*n).state())
                    .fold(EscState::NoEscape, EscState::meet)
            };
            Some(ParamEscape {
                index,
                state,
                returned: from_exits.contains(&id),
                virtual_call: region.iter().any(|n| graph.node(*n).virtual_call),
            })
        })
        .collect();
    params.sort_by_key(|p| p.index);

    let returns_fresh = from_exits.iter().all(|id| {
        let node = graph.node(*id);
        !node.kind.is_object_like()
            || (node.kind == NodeKind::Object && !node.state().is_global())
    });
    let return_state = if returns_fresh {
        EscState::NoEscape
    } else {
        EscState::GlobalEscape
    };

    let this = if function.is_static { None } else { function.this_reg() };
    let explicit_lock = this.is_some_and(|this| {
        function.cfg.blocks.values().any(|block| {
            block
                .instructions
                .iter()
                .any(|inst| inst.plain_monitor() == Some((this, true)))
        })
    });

    CalleeMethodInfo {
        key,
        params,
        return_state,
        monitor_on_this: function.is_synchronized || explicit_lock,
    }
}

fn reachable(graph: &ConnectionGraph, roots: &[CnGNodeId]) -> FxHashSet<CnGNodeId> {
    let mut seen = FxHashSet::default();
    let mut stack = roots.to_vec();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            stack.extend(graph.edges_from(id).iter().map(|t| t.to));
        }
    }
    seen
}

/// Nodes standing for a parameter and the structure hanging off it: the
/// parameter, its field slots, values loaded from those slots and merges or
/// casts of any of these. Objects stored into the slots are not included.
fn param_region(
    graph: &ConnectionGraph,
    reverse: &FxHashMap<CnGNodeId, Vec<(CnGNodeId, EdgeKind)>>,
    param: CnGNodeId,
) -> FxHashSet<CnGNodeId> {
    let mut region = FxHashSet::default();
    let mut queue = VecDeque::from([param]);
    while let Some(id) = queue.pop_front() {
        if !region.insert(id) {
            continue;
        }
        queue.extend(graph.targets(id, EdgeKind::Field));
        for &(from, kind) in reverse.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let holder = graph.node(from);
            let include = match kind {
                EdgeKind::Point => graph.node(id).kind.is_field(),
                EdgeKind::Defer => holder.kind == NodeKind::Local || holder.is_rename(),
                EdgeKind::Field => false,
            };
            if include {
                queue.push_back(from);
            }
        }
    }
    region
}

/// Whether part of a parameter's region is stored into a slot the caller can
/// still reach afterwards: a field of another parameter or of anything else
/// that outlives the method. The caller only sees the slot it passed, so the
/// store has to count as a global escape.
fn stored_outside(
    graph: &ConnectionGraph,
    reverse: &FxHashMap<CnGNodeId, Vec<(CnGNodeId, EdgeKind)>>,
    region: &FxHashSet<CnGNodeId>,
) -> bool {
    region.iter().any(|id| {
        reverse
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .any(|&(from, kind)| {
                let holder = graph.node(from);
                kind == EdgeKind::Defer
                    && holder.kind.is_field()
                    && !region.contains(&from)
                    && (holder.out_escaped || holder.state().is_global())
            })
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
    pub inserts: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} summaries, {} hits, {} misses, {} inserts",
            self.entries, self.hits, self.misses, self.inserts
        )
    }
}

#[derive(Serialize, Deserialize)]
struct SummaryFile {
    magic: [u8; 4],
    version: u32,
    entries: Vec<CalleeMethodInfo>,
}

/// Thread-safe summary cache
#[derive(Debug, Default)]
pub struct SummaryCache {
    entries: RwLock<HashMap<MethodKey, Arc<CalleeMethodInfo>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    inserts: AtomicUsize,
}

lazy_static! {
    static ref GLOBAL_CACHE: Arc<SummaryCache> = Arc::new(SummaryCache::new());
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache
    pub fn global() -> Arc<SummaryCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    pub fn get(&self, key: &MethodKey) -> Option<Arc<CalleeMethodInfo>> {
        let found = self.entries.read().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Publish a summary unless one already exists for its key. Returns the
    /// summary readers will see.
    pub fn publish(&self, info: CalleeMethodInfo) -> Arc<CalleeMethodInfo> {
        if let Some(existing) = self.entries.read().get(&info.key) {
            return Arc::clone(existing);
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(info.key.clone()).or_insert_with(|| {
            self.inserts.fetch_add(1, Ordering::Relaxed);
            Arc::new(info)
        });
        Arc::clone(entry)
    }

    /// Cached summary for `key`, or the result of `compute` published under
    /// it. Nothing is published when `compute` fails.
    pub fn get_or_compute(
        &self,
        key: &MethodKey,
        compute: impl FnOnce() -> Option<CalleeMethodInfo>,
    ) -> Option<Arc<CalleeMethodInfo>> {
        if let Some(found) = self.get(key) {
            return Some(found);
        }
        compute().map(|info| self.publish(info))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }

    /// All summaries, ordered by key
    pub fn snapshot(&self) -> Vec<Arc<CalleeMethodInfo>> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn save(&self, path: &Path) -> EscapeResult<()> {
        let file = SummaryFile {
            magic: SUMMARY_MAGIC,
            version: SUMMARY_VERSION,
            entries: self.snapshot().iter().map(|s| (**s).clone()).collect(),
        };
        let bytes = postcard::to_allocvec(&file)?;
        std::fs::write(path, bytes).map_err(|source| EscapeError::SummaryIo {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("saved {} summaries to {}", file.entries.len(), path.display());
        Ok(())
    }

    /// Publish every summary stored at `path`. Returns how many were new.
    pub fn load(&self, path: &Path) -> EscapeResult<usize> {
        let bytes = std::fs::read(path).map_err(|source| EscapeError::SummaryIo {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SummaryFile = postcard::from_bytes(&bytes)?;
        if file.magic != SUMMARY_MAGIC {
            return Err(EscapeError::SummaryFormat("bad magic".to_string()));
        }
        if file.version != SUMMARY_VERSION {
            return Err(EscapeError::SummaryFormat(format!(
                "unsupported version {}",
                file.version
            )));
        }
        let before = self.len();
        for info in file.entries {
            self.publish(info);
        }
        Ok(self.len() - before)
    }

    pub fn to_json(&self) -> EscapeResult<String> {
        let all: Vec<CalleeMethodInfo> = self.snapshot().iter().map(|s| (**s).clone()).collect();
        serde_json::to_string_pretty(&all).map_err(|e| EscapeError::SummaryFormat(e.to_string()))
    }
}

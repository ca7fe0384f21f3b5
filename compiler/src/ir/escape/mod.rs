//! Escape analysis
//!
//! Builds a connection graph for each method, propagates escape states over
//! it, publishes an interprocedural summary, and then uses the results to
//! remove or guard monitors and to replace object fields by scalars.
//!
//! Analysis of a method may recursively analyze its direct callees (up to
//! `EscapeOptions::max_depth`) to obtain their summaries. Nested analyses never
//! transform their body; only the outermost method is rewritten.

pub mod cng;
pub mod error;
pub mod graph_builder;
pub mod interproc;
pub mod monitors;
pub mod options;
pub mod propagate;
pub mod scalar_replace;
pub mod summary;

pub use cng::{CnGNodeId, ConnectionGraph, EdgeKind, EscState, NodeKind};
pub use error::{EscapeError, EscapeResult};
pub use graph_builder::{build_graph, BuiltGraph, CallRecord, CallTarget};
pub use monitors::MonitorStats;
pub use options::EscapeOptions;
pub use propagate::{propagate, CallOracle, PropagationTrace};
pub use scalar_replace::ScalarStats;
pub use summary::{CacheStats, CalleeMethodInfo, ParamEscape, SummaryCache};

use super::loop_analysis::{estimate_block_frequencies, DominatorTree, LoopNestInfo};
use super::optimization::{OptimizationPass, OptimizationResult};
use super::ssa::{SsaRepair, SsaRepairStats, VarPromotion};
use super::{BytecodeRepository, IrFunction, IrId, IrModule, MethodKey, MethodSource};
use interproc::SummaryOracle;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything an analysis at any depth shares
#[derive(Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub cache: &'a SummaryCache,
    pub source: &'a dyn MethodSource,
    pub options: &'a EscapeOptions,
    pub ssa: &'a dyn SsaRepair,
}

/// Escape information about one reference-producing value
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReport {
    pub value: IrId,
    pub node: CnGNodeId,
    pub kind: NodeKind,
    pub state: EscState,
    pub out_escaped: bool,
    pub virtual_call: bool,
    pub loop_created: bool,
}

#[derive(Debug, Clone)]
pub struct EscapeReport {
    pub method: String,
    pub depth: usize,
    /// Allocations, call results, loads, caught values and parameters
    pub objects: Vec<ObjectReport>,
    /// State of every tracked register, copies included
    pub states: BTreeMap<IrId, EscState>,
    pub summary: Arc<CalleeMethodInfo>,
    pub monitors: MonitorStats,
    pub scalar: ScalarStats,
    pub ssa: Option<SsaRepairStats>,
    pub trace: PropagationTrace,
}

impl EscapeReport {
    pub fn object(&self, value: IrId) -> Option<&ObjectReport> {
        self.objects.iter().find(|o| o.value == value)
    }

    pub fn state_of(&self, value: IrId) -> Option<EscState> {
        self.states.get(&value).copied()
    }

    /// Whether any transform rewrote the method
    pub fn changed(&self) -> bool {
        self.monitors.changed() || self.scalar.changed()
    }
}

/// Analyzer for one method at one recursion depth
pub struct EscAnalyzer<'a> {
    ctx: AnalysisContext<'a>,
    depth: usize,
}

impl<'a> EscAnalyzer<'a> {
    pub fn new(ctx: AnalysisContext<'a>, depth: usize) -> Self {
        Self { ctx, depth }
    }

    /// Analyze `function` and publish its summary. At depth 0 the enabled
    /// transforms are applied as well. On error the body may be partially
    /// rewritten; callers keep a copy to restore.
    pub fn analyze(&self, function: &mut IrFunction) -> EscapeResult<EscapeReport> {
        let registry = self.ctx.source.registry();
        function.cfg.rebuild_predecessors();
        let domtree = DominatorTree::compute(function);
        let loops = LoopNestInfo::analyze(function, &domtree);

        let mut built = build_graph(function, registry)?;
        let mut oracle = SummaryOracle::new(self.ctx, self.depth);
        let trace = propagate(&mut built, &mut oracle, &|block| loops.in_loop(block));

        let key = registry
            .method_key(function.method)
            .unwrap_or_else(|| MethodKey::new("", function.name.clone(), ""));
        let summary = self
            .ctx
            .cache
            .publish(summary::summarize(key, function, &built.graph));

        let graph = &built.graph;
        let states = graph
            .values()
            .into_iter()
            .map(|(value, node)| (value, graph.node(node).state()))
            .collect();
        let objects = graph
            .nodes()
            .iter()
            .filter(|n| {
                n.kind.is_object_like()
                    || matches!(n.kind, NodeKind::DefArg | NodeKind::CatchVal)
            })
            .filter_map(|n| {
                Some(ObjectReport {
                    value: n.value?,
                    node: n.id,
                    kind: n.kind,
                    state: n.state(),
                    out_escaped: n.out_escaped,
                    virtual_call: n.virtual_call,
                    loop_created: n.loop_created,
                })
            })
            .collect();

        let mut report = EscapeReport {
            method: function.name.clone(),
            depth: self.depth,
            objects,
            states,
            summary,
            monitors: MonitorStats::default(),
            scalar: ScalarStats::default(),
            ssa: None,
            trace,
        };

        if self.depth == 0 {
            self.transform(function, &built, &mut report)?;
        }
        debug!(
            "{} at depth {}: {} nodes, {}",
            function.name,
            self.depth,
            built.graph.len(),
            report.summary
        );
        Ok(report)
    }

    fn transform(
        &self,
        function: &mut IrFunction,
        built: &BuiltGraph,
        report: &mut EscapeReport,
    ) -> EscapeResult<()> {
        let options = self.ctx.options;
        let registry = self.ctx.source.registry();

        if options.sync_removal {
            report.monitors = monitors::eliminate_monitors(function, &built.graph, &self.ctx)?;
        }

        if options.scalar_replacement {
            function.cfg.rebuild_predecessors();
            let domtree = DominatorTree::compute(function);
            let loops = LoopNestInfo::analyze(function, &domtree);
            estimate_block_frequencies(function, &loops);
            report.scalar =
                scalar_replace::replace_scalars(function, &built.graph, options, registry)?;
        }

        if report.changed() || !function.vars.is_empty() {
            function.cfg.rebuild_predecessors();
            report.ssa = Some(self.ctx.ssa.repair(function));
        }

        function
            .verify()
            .map_err(|e| EscapeError::failure(function.name.clone(), e))
    }
}

/// Module pass running escape analysis and its transforms on every method
pub struct EscapeAnalysisPass {
    options: EscapeOptions,
    cache: Arc<SummaryCache>,
    reports: Vec<EscapeReport>,
}

impl EscapeAnalysisPass {
    /// Pass sharing the process-wide summary cache
    pub fn new(options: EscapeOptions) -> Self {
        Self::with_cache(options, SummaryCache::global())
    }

    pub fn with_cache(options: EscapeOptions, cache: Arc<SummaryCache>) -> Self {
        Self {
            options,
            cache,
            reports: Vec::new(),
        }
    }

    pub fn cache(&self) -> &Arc<SummaryCache> {
        &self.cache
    }

    /// Reports of the most recent run, in module order
    pub fn reports(&self) -> &[EscapeReport] {
        &self.reports
    }

    pub fn take_reports(&mut self) -> Vec<EscapeReport> {
        std::mem::take(&mut self.reports)
    }
}

impl OptimizationPass for EscapeAnalysisPass {
    fn name(&self) -> &'static str {
        "escape-analysis"
    }

    fn run_on_module(&mut self, module: &mut IrModule) -> OptimizationResult {
        // Callees are always analyzed from their untransformed bodies
        let repository = BytecodeRepository::capture(module);
        let ssa = VarPromotion;
        let ctx = AnalysisContext {
            cache: &self.cache,
            source: &repository,
            options: &self.options,
            ssa: &ssa,
        };

        let outcomes: Vec<EscapeResult<EscapeReport>> = module
            .functions
            .par_iter_mut()
            .map(|(_, function)| {
                let span = tracing::debug_span!("escape", method = %function.name);
                let _enter = span.enter();
                let original = function.clone();
                let outcome = EscAnalyzer::new(ctx, 0).analyze(function);
                if let Err(e) = &outcome {
                    warn!("{}: {}, keeping unoptimized body", original.name, e);
                    *function = original;
                }
                outcome
            })
            .collect();

        let mut result = OptimizationResult::unchanged();
        self.reports.clear();
        for outcome in outcomes {
            let report = match outcome {
                Ok(report) => report,
                Err(_) => {
                    result.add_stat("methods_failed", 1);
                    continue;
                }
            };
            let m = &report.monitors;
            let s = &report.scalar;
            if report.changed() {
                result.modified = true;
                info!(
                    "{}: {} monitors removed, {} guarded, {} objects scalarized, {} final fields cached",
                    report.method,
                    m.removed,
                    m.this_guarded + m.virtual_guarded,
                    s.local + s.escaped,
                    s.final_fields
                );
            }
            result.instructions_eliminated += m.removed + s.instructions_removed;
            result.blocks_eliminated += m.blocks_removed;
            result.add_stat("monitors_removed", m.removed);
            result.add_stat("monitors_guarded", m.this_guarded + m.virtual_guarded);
            result.add_stat("lock_flags_saved", m.save_flag_calls);
            result.add_stat("objects_scalarized", s.local + s.escaped);
            result.add_stat("final_fields_cached", s.final_fields);
            self.reports.push(report);
        }
        debug!("summary cache: {}", self.cache.stats());
        result
    }
}

//! Callee summaries on demand
//!
//! A direct call to an analyzable method is resolved against the summary
//! cache. On a miss the callee body is translated afresh from the method
//! source and analyzed one level deeper, without transforms, which publishes
//! its summary. Past the configured depth the callee is left unsummarized and
//! its arguments escape.

use super::propagate::CallOracle;
use super::summary::CalleeMethodInfo;
use super::{AnalysisContext, EscAnalyzer};
use crate::ir::MethodId;
use log::{debug, warn};
use std::sync::Arc;

/// Summary of `method` for an analysis running at `depth`
pub fn callee_summary(
    ctx: AnalysisContext<'_>,
    depth: usize,
    method: MethodId,
) -> Option<Arc<CalleeMethodInfo>> {
    let registry = ctx.source.registry();
    let desc = registry.method(method)?;
    if !desc.is_analyzable() {
        return None;
    }
    let key = registry.method_key(method)?;
    if let Some(found) = ctx.cache.get(&key) {
        return Some(found);
    }
    if depth + 1 > ctx.options.max_depth {
        debug!("{}: depth limit {} reached", key, ctx.options.max_depth);
        return None;
    }
    let Some(mut body) = ctx.source.translate(method) else {
        debug!("{}: no body available", key);
        return None;
    };

    let span = tracing::debug_span!("callee", method = %key, depth = depth + 1);
    let _enter = span.enter();
    match EscAnalyzer::new(ctx, depth + 1).analyze(&mut body) {
        Ok(report) => Some(report.summary),
        Err(e) => {
            warn!("no summary for {}: {}", key, e);
            None
        }
    }
}

/// Call oracle backed by the summary cache and nested analyses
pub struct SummaryOracle<'a> {
    ctx: AnalysisContext<'a>,
    depth: usize,
}

impl<'a> SummaryOracle<'a> {
    pub fn new(ctx: AnalysisContext<'a>, depth: usize) -> Self {
        Self { ctx, depth }
    }
}

impl CallOracle for SummaryOracle<'_> {
    fn is_opaque(&self, method: MethodId) -> bool {
        self.ctx
            .source
            .registry()
            .method(method)
            .map(|desc| !desc.is_analyzable())
            .unwrap_or(true)
    }

    fn summary(&mut self, method: MethodId) -> Option<Arc<CalleeMethodInfo>> {
        callee_summary(self.ctx, self.depth, method)
    }
}

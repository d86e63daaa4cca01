//! Conflict resolution
//!
//! Each cycle the driver collects one [`ConflictItem`] per production whose
//! token delta is non-empty and asks the strategy to pick at most one to
//! fire.
//!
//! `first-match` picks the first item in declaration order. The
//! `stratified-manual` strategy walks a stratum cursor that never moves
//! backwards within a run: it fires items from the lowest still-open
//! stratum and, once a stratum yields nothing, abandons it for the rest of
//! the run, even if later activations would re-enable its productions.
//! Abandoning strata is what keeps default-logic rule sets from chattering:
//! the withdrawal a higher stratum provokes in a lower one is deliberately
//! never replayed.

#![forbid(unsafe_code)]

use tracing::warn;

use crate::matcher::{ProdId, TokenDelta};
use crate::rules::RuleBook;
use crate::wme::Sym;

pub struct ConflictItem {
    pub prod: ProdId,
    pub name: Sym,
    pub delta: TokenDelta,
}

pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Re-arm per-run state; called at the start of every run.
    fn reset(&mut self) {}

    /// Pick the index of the item to fire, or `None` to stop the run.
    fn select(&mut self, conflict: &[ConflictItem], rules: &RuleBook) -> Option<usize>;
}

/// Fire the first activated production in declaration order.
pub struct FirstMatch;

impl Strategy for FirstMatch {
    fn name(&self) -> &'static str {
        "first-match"
    }

    fn select(&mut self, conflict: &[ConflictItem], _rules: &RuleBook) -> Option<usize> {
        if conflict.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

/// Monotonic stratum cursor; see the module docs.
pub struct StratifiedManual {
    cursor: usize,
}

impl StratifiedManual {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Default for StratifiedManual {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for StratifiedManual {
    fn name(&self) -> &'static str {
        "stratified-manual"
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn select(&mut self, conflict: &[ConflictItem], rules: &RuleBook) -> Option<usize> {
        loop {
            if self.cursor >= rules.stratum_count() {
                return None;
            }
            let hit = conflict
                .iter()
                .position(|item| rules.stratum_of(item.name) == Some(self.cursor));
            if hit.is_some() {
                return hit;
            }
            self.cursor += 1;
        }
    }
}

/// Names accepted by [`choose`], in registry order.
pub const STRATEGY_NAMES: [&str; 2] = ["first-match", "stratified-manual"];

/// Resolve a user-supplied strategy name by case-insensitive prefix
/// matching. Unknown or ambiguous names fall back to first-match with a
/// warning.
pub fn choose(name: &str) -> Box<dyn Strategy> {
    let wanted = name.to_ascii_lowercase();
    let hits: Vec<&str> = STRATEGY_NAMES
        .iter()
        .copied()
        .filter(|n| n.starts_with(&wanted))
        .collect();
    match hits.as_slice() {
        ["first-match"] => Box::new(FirstMatch),
        ["stratified-manual"] => Box::new(StratifiedManual::new()),
        [] => {
            warn!("unknown strategy `{name}`; falling back to first-match");
            Box::new(FirstMatch)
        }
        _ => {
            warn!("ambiguous strategy `{name}`; falling back to first-match");
            Box::new(FirstMatch)
        }
    }
}

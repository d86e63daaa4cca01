//! Crate root: public surface and core invariants
//!
//! `retort` is a forward-chaining production-rule reasoner built from three
//! cooperating subsystems on top of an in-crate pattern matcher:
//!
//! - **Truth maintenance.** Every fact in working memory carries the
//!   non-empty set of reasons keeping it alive: axiomatic, derived by a
//!   rule firing, or derived by defuzzification. Withdrawing the last
//!   reason removes the fact, which can cascade through the rules that
//!   depended on it.
//! - **A cycle driver with pluggable conflict resolution.** Each cycle
//!   fires at most one production. The `stratified-manual` strategy walks
//!   rule strata with a cursor that never moves backwards within a run,
//!   which is what keeps default-logic rule sets from oscillating.
//! - **A fuzzy layer.** Tokens carry a membership degree conjoined from
//!   their fuzzy members, rule disjunctions aggregate the degree of derived
//!   fuzzy facts, and reversible two-sided sigmoid kinds defuzzify into
//!   crisp numeric facts that are themselves truth-maintained.
//!
//! ## Invariants
//!
//! - A WME is in working memory iff its justification record exists iff at
//!   least one justification remains.
//! - WMEs and tokens are compared by identity, never structurally, and are
//!   never deep-copied by the core.
//! - The stratum cursor is monotonically non-decreasing within a run.
//! - The reasoner is single-threaded and synchronous; cascading removals
//!   are deferred to the next cycle rather than chased recursively.
//!
//! Violations of the data model (a fact with no record where one is
//! expected) are reported as warnings and execution continues; the only
//! fatal errors are parse errors and duplicate rule names.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Working-memory elements, tokens, and identity wrappers.
pub mod wme;
/// Surface syntax: clauses and directives.
pub mod parse;
/// Advisory schema registry.
pub mod schema;
/// Fuzzy systems, kinds, variables, and crisp formatting.
pub mod fuzzy;
/// Pattern-matching engine: working memory, productions, token deltas.
pub mod matcher;
/// Justification sum type and store.
pub mod justify;
/// Rule inventory and stratification.
pub mod rules;
/// Conflict-resolution strategies.
pub mod resolve;
/// Cycle driver, truth maintenance, and the fuzzy glue.
pub mod engine;
/// Interactive command loop.
pub mod shell;
/// Chat-assisted query translation.
pub mod chat;

pub use crate::engine::{Reasoner, RunOutcome, CYCLE_LIMIT};
pub use crate::fuzzy::FuzzySystem;
pub use crate::justify::Justification;
pub use crate::resolve::{FirstMatch, Strategy, StratifiedManual};
pub use crate::wme::{Interner, Sym, Token, Wme};

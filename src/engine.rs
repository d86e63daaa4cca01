//! Cycle driver and truth maintenance
//!
//! [`Reasoner`] is the explicit context every core operation runs against:
//! it owns the interner, the matcher, the justification store, the rule
//! book, the conflict-resolution strategy, the schema registry, and the
//! fuzzy operator choice. There is no ambient state.
//!
//! ## The loop
//!
//! A run executes up to [`CYCLE_LIMIT`] cycles. Each cycle builds the
//! conflict set (one peeked token delta per production, empty deltas
//! skipped), asks the strategy to pick at most one item, and applies it:
//! commit the delta with a single `will_fire`, process withdrawn tokens
//! **before** asserted ones, update justifications, and defuzzify once
//! after the firing's assertions. Cascading removals inside the matcher
//! are never chased recursively; their token deltas surface in the next
//! cycle's conflict set.
//!
//! The interaction being managed: firing a rule asserts a fact, the fact
//! can invalidate a negative condition, the invalidated condition withdraws
//! a justification, withdrawing the last justification removes the fact,
//! and the removal perturbs fuzzy aggregation. The stratified strategy
//! arbitrates so this settles instead of oscillating; under first-match a
//! default-logic rule set genuinely does not converge, which the cycle
//! limit turns into a report rather than a hang.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use crate::fuzzy::{self, FuzzyKind, FuzzySystem, FuzzyVariable};
use crate::justify::{Justification, JustificationStore};
use crate::matcher::{Bindings, CondKind, Condition, Field, Matcher, Pattern};
use crate::parse::{self, Clause, Directive, Item, ParseError};
use crate::resolve::{ConflictItem, Strategy};
use crate::rules::{DuplicateRule, RuleBook};
use crate::schema::{SchemaEntry, SchemaRegistry};
use crate::wme::{Interner, Sym, Token, Wme, WmeRef};

/// Fixed cycle limit per run; exceeding it is a non-convergence report.
pub const CYCLE_LIMIT: usize = 100;

/// Crisp values closer than this to the re-derived value are not replaced.
const CRISP_TOLERANCE: f64 = 1e-6;

#[derive(Copy, Clone, Debug)]
pub struct RunOutcome {
    /// Number of cycles that fired a production.
    pub cycles: usize,
    /// False when the cycle limit was exceeded.
    pub converged: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    DuplicateRule(#[from] DuplicateRule),
}

pub struct Reasoner {
    syms: Interner,
    matcher: Matcher,
    store: JustificationStore,
    rules: RuleBook,
    strategy: Box<dyn Strategy>,
    schemas: SchemaRegistry,
    fuzzy_system: FuzzySystem,
    kinds: HashMap<Sym, Rc<FuzzyKind>>,
    nondeterministic: bool,
    auto_name: usize,
    last_run: Option<RunOutcome>,
}

impl Reasoner {
    pub fn new(strategy: Box<dyn Strategy>, schema_check: bool) -> Self {
        Self {
            syms: Interner::default(),
            matcher: Matcher::new(),
            store: JustificationStore::new(),
            rules: RuleBook::new(),
            strategy,
            schemas: SchemaRegistry::new(schema_check),
            fuzzy_system: FuzzySystem::default(),
            kinds: HashMap::new(),
            nondeterministic: false,
            auto_name: 0,
            last_run: None,
        }
    }

    pub fn symbols(&self) -> &Interner {
        &self.syms
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.last_run
    }

    /// True once any production with a negative or existential condition
    /// has been compiled; such rule sets admit more than one fixed point.
    pub fn is_nondeterministic(&self) -> bool {
        self.nondeterministic
    }

    // ============================== loading ==============================

    /// Parse and execute a source text: directives take effect immediately,
    /// the clauses between them run as a batch (asserts and declarations in
    /// order, a run to fixed point, then the batch's queries). Query
    /// answers go to stdout.
    pub fn load(&mut self, text: &str) -> Result<(), LoadError> {
        let items = parse::parse_source(text, &mut self.syms)?;
        let mut dirty = false;
        let mut queries: Vec<(Vec<Condition>, Vec<Sym>)> = Vec::new();
        for item in items {
            match item {
                Item::Clause(Clause::Fact { id, attr, val }) => {
                    self.assert_axiomatic(id, attr, val);
                    dirty = true;
                }
                Item::Clause(Clause::Production { name, lhs, rhs }) => {
                    self.compile_production(name, lhs, rhs)?;
                    dirty = true;
                }
                Item::Clause(Clause::Query { lhs, vars }) => queries.push((lhs, vars)),
                Item::Directive(d) => {
                    self.flush_batch(&mut dirty, &mut queries);
                    self.apply_directive(d);
                }
            }
        }
        self.flush_batch(&mut dirty, &mut queries);
        Ok(())
    }

    /// Parse program text against this reasoner's interner without
    /// executing it.
    pub fn parse_items(&mut self, text: &str) -> Result<Vec<Item>, ParseError> {
        parse::parse_source(text, &mut self.syms)
    }

    fn flush_batch(&mut self, dirty: &mut bool, queries: &mut Vec<(Vec<Condition>, Vec<Sym>)>) {
        if *dirty {
            self.defuzzify();
            self.run();
            self.defuzzify();
            *dirty = false;
        }
        for (lhs, vars) in queries.drain(..) {
            println!("{}", self.answer_query(&lhs, &vars));
        }
    }

    fn apply_directive(&mut self, d: Directive) {
        match d {
            Directive::Stratum => self.rules.open_stratum(),
            Directive::SchemaCheck(on) => self.schemas.set_enabled(on),
            Directive::Schema { id, attr, val, description } => {
                self.schemas.add(SchemaEntry { id, attr, val, description });
            }
            Directive::FuzzySystem(sys) => self.fuzzy_system = sys,
            Directive::FuzzyKind(kind) => {
                if !kind.is_reversible() {
                    warn!(
                        "fuzzy kind `{}` is not reversible (needs exactly two \
                         opposite-slope sigmoids); defuzzification will skip it",
                        self.syms.resolve(&kind.name)
                    );
                }
                self.kinds.insert(kind.name, Rc::new(kind));
            }
            Directive::FuzzyVar { name, kind } => match self.kinds.get(&kind) {
                Some(k) => {
                    self.matcher.add_fuzzy_variable(FuzzyVariable { name, kind: k.clone() })
                }
                None => warn!(
                    "unknown fuzzy kind `{}`; ignoring variable `{}`",
                    self.syms.resolve(&kind),
                    self.syms.resolve(&name)
                ),
            },
        }
    }

    /// Assert a ground triple with an axiomatic justification. A numeric
    /// value on a registered fuzzy variable is additionally fuzzified.
    pub fn assert_axiomatic(&mut self, id: Sym, attr: Sym, val: Sym) {
        self.schemas.check(id, attr, val, &self.syms);
        let pattern = Pattern([Field::Const(id), Field::Const(attr), Field::Const(val)]);
        let (added, existing) = self.matcher.add_wmes_from_patterns(&[pattern], None, None);
        let Some(w) = added.into_iter().chain(existing).next() else {
            return;
        };
        self.store.record(&w, Justification::Axiomatic);
        if !w.is_fuzzy() && self.matcher.get_fuzzy_variable(attr).is_some() {
            if let Some(x) = fuzzy::parse_crisp(self.syms.resolve(&val)) {
                self.fuzzify(&w, x);
            }
        }
    }

    /// Expand a crisp numeric assertion on a fuzzy variable into one fuzzy
    /// WME per value of the kind, each justified by the crisp source.
    fn fuzzify(&mut self, crisp: &Rc<Wme>, x: f64) {
        let Some(var) = self.matcher.get_fuzzy_variable(crisp.attr).cloned() else {
            return;
        };
        for def in var.kind.values.iter() {
            let mu = def.membership(x);
            let pattern = Pattern([
                Field::Const(crisp.id),
                Field::Const(crisp.attr),
                Field::Const(def.name),
            ]);
            let (added, existing) =
                self.matcher.add_wmes_from_patterns(&[pattern], None, Some(mu));
            for w in &added {
                self.store
                    .record(w, Justification::Membership { sources: vec![crisp.clone()] });
            }
            for w in &existing {
                self.store
                    .record(w, Justification::Membership { sources: vec![crisp.clone()] });
                if w.is_fuzzy() {
                    let mut visited = HashSet::new();
                    self.propagate_degree(w, &mut visited);
                }
            }
        }
    }

    fn compile_production(
        &mut self,
        name: Option<Sym>,
        lhs: Vec<Condition>,
        rhs: Option<Pattern>,
    ) -> Result<(), DuplicateRule> {
        let name = match name {
            Some(n) => n,
            None => loop {
                self.auto_name += 1;
                let candidate = self.syms.get_or_intern(format!("P{}", self.auto_name));
                if self.rules.get_by_name(candidate).is_none() {
                    break candidate;
                }
            },
        };
        if lhs.iter().any(|c| c.kind != CondKind::Positive) {
            self.nondeterministic = true;
        }
        let prod = self.matcher.add_production(lhs.clone(), name);
        let name_text = self.syms.resolve(&name).to_string();
        self.rules.add(name, &name_text, lhs, rhs, prod)
    }

    // ================================ run ================================

    /// Drive fire–assert–retract cycles to a fixed point or the cycle
    /// limit. The strategy is re-armed at the start of every run.
    pub fn run(&mut self) -> RunOutcome {
        self.strategy.reset();
        let mut fired = 0usize;
        let mut converged = false;
        for cycle in 1..=CYCLE_LIMIT {
            let conflict = self.build_conflict_set();
            if conflict.is_empty() {
                converged = true;
                break;
            }
            let Some(i) = self.strategy.select(&conflict, &self.rules) else {
                converged = true;
                break;
            };
            let item = conflict
                .into_iter()
                .nth(i)
                .expect("strategy returned an index into the conflict set");
            trace!(cycle, rule = self.syms.resolve(&item.name), "firing");
            self.apply(item);
            fired = cycle;
        }
        if !converged {
            warn!("cycle limit ({CYCLE_LIMIT}) exceeded; run did not converge");
        }
        if self.nondeterministic {
            info!(
                "rule set contains negative or existential conditions; \
                 a non-deterministic fixed point cannot be ruled out"
            );
        }
        let outcome = RunOutcome { cycles: fired, converged };
        self.last_run = Some(outcome);
        outcome
    }

    fn build_conflict_set(&mut self) -> Vec<ConflictItem> {
        let prods: Vec<_> = self.rules.specs().iter().map(|s| (s.prod, s.name)).collect();
        let mut items = Vec::new();
        for (prod, name) in prods {
            let delta = self.matcher.can_fire(prod);
            if !delta.is_empty() {
                items.push(ConflictItem { prod, name, delta });
            }
        }
        items
    }

    /// Fire one conflict item: commit its delta, withdraw first, assert
    /// second, defuzzify once after the assertions.
    fn apply(&mut self, item: ConflictItem) {
        let delta = self.matcher.will_fire(item.prod);

        for t in &delta.to_remove {
            let emptied = self.store.withdraw_production(item.name, t);
            for w in emptied {
                trace!(wme = %w.render(&self.syms), "last justification withdrawn");
                self.matcher.remove_wme(&w);
                self.store.remove_record(&w);
            }
        }

        let Some(rhs) = self.rules.get_by_name(item.name).and_then(|s| s.rhs.clone()) else {
            return;
        };
        let locations = self.matcher.variable_locations(item.prod).clone();
        for t in &delta.to_add {
            let mut bindings = Bindings::new();
            for (var, (ci, fi)) in &locations {
                if let Some(w) = t.wmes.get(*ci) {
                    bindings.insert(*var, w.field(*fi));
                }
            }
            let mu = self.token_mu(t);
            let (added, existing) = self.matcher.add_wmes_from_patterns(
                std::slice::from_ref(&rhs),
                Some(&bindings),
                mu,
            );
            for w in added.iter().chain(existing.iter()) {
                self.schemas.check(w.id, w.attr, w.val, &self.syms);
            }
            for w in &added {
                self.store
                    .record(w, Justification::Production { rule: item.name, token: t.clone() });
            }
            for w in &existing {
                self.store
                    .record(w, Justification::Production { rule: item.name, token: t.clone() });
                if w.is_fuzzy() {
                    let mut visited = HashSet::new();
                    self.propagate_degree(w, &mut visited);
                }
            }
        }
        self.defuzzify();
    }

    // ============================ fuzzy layer ============================

    /// Conjunction over the token's fuzzy members; `None` when it has none.
    fn token_mu(&self, t: &Rc<Token>) -> Option<f64> {
        let degrees: Vec<f64> = t.wmes.iter().filter_map(|w| w.mu()).collect();
        if degrees.is_empty() {
            None
        } else {
            Some(self.fuzzy_system.conjunction(&degrees))
        }
    }

    /// Membership a fuzzification reason contributes: the sigmoid of the
    /// crisp source value under this WME's own fuzzy value.
    fn fuzzified_mu(&self, w: &Wme, crisp: &Wme) -> Option<f64> {
        let var = self.matcher.get_fuzzy_variable(w.attr)?;
        let def = var.kind.value(w.val)?;
        let x = fuzzy::parse_crisp(self.syms.resolve(&crisp.val))?;
        Some(def.membership(x))
    }

    /// Recompute a fuzzy WME's degree as the disjunction over its
    /// justifications' degrees, then cascade into fuzzy WMEs supported by
    /// tokens that contain it. The visited set breaks re-entry.
    fn propagate_degree(&self, w: &Rc<Wme>, visited: &mut HashSet<WmeRef>) {
        if !visited.insert(WmeRef(w.clone())) {
            return;
        }
        if !self.store.has_record(w) {
            warn!(
                "no justification record for {} during degree propagation",
                w.render(&self.syms)
            );
            return;
        }
        let mut degrees = Vec::new();
        for j in self.store.justifications_of(w) {
            match j {
                Justification::Production { token, .. } => {
                    if let Some(mu) = self.token_mu(token) {
                        degrees.push(mu);
                    }
                }
                Justification::Membership { sources } if j.is_fuzzification() => {
                    if let Some(mu) = self.fuzzified_mu(w, &sources[0]) {
                        degrees.push(mu);
                    }
                }
                _ => {}
            }
        }
        if !degrees.is_empty() {
            w.set_mu(self.fuzzy_system.disjunction(&degrees));
        }

        let dependents: Vec<Rc<Wme>> = self
            .store
            .iter()
            .filter(|(wref, _)| wref.0.is_fuzzy() && !Rc::ptr_eq(&wref.0, w))
            .filter(|(_, justs)| {
                justs.iter().any(|j| {
                    matches!(j, Justification::Production { token, .. }
                        if token.wmes.iter().any(|x| Rc::ptr_eq(x, w)))
                })
            })
            .map(|(wref, _)| wref.0.clone())
            .collect();
        for d in dependents {
            self.propagate_degree(&d, visited);
        }
    }

    /// For every registered (reversible) fuzzy variable: group the live
    /// fuzzy WMEs by id, average the inverse sigmoids, replace a single
    /// deviating crisp WME, and assert the re-derived crisp value with a
    /// membership justification over the group.
    fn defuzzify(&mut self) {
        struct Plan {
            id: Sym,
            attr: Sym,
            members: Vec<Rc<Wme>>,
            xstar: f64,
            crisp: Vec<Rc<Wme>>,
        }

        let mut plans: Vec<Plan> = Vec::new();
        let vars: Vec<FuzzyVariable> = self.matcher.fuzzy_variables().to_vec();
        for var in &vars {
            if !var.kind.is_reversible() {
                debug!(
                    "skipping defuzzification of `{}`: kind is not reversible",
                    self.syms.resolve(&var.name)
                );
                continue;
            }
            let mut order: Vec<Sym> = Vec::new();
            let mut groups: HashMap<Sym, Vec<Rc<Wme>>> = HashMap::new();
            for w in self.matcher.working_memory() {
                if w.attr == var.name && w.is_fuzzy() {
                    groups
                        .entry(w.id)
                        .or_insert_with(|| {
                            order.push(w.id);
                            Vec::new()
                        })
                        .push(w.clone());
                }
            }
            for id in order {
                let members = groups.remove(&id).expect("group recorded in order");
                let mut xs = Vec::with_capacity(members.len());
                for m in &members {
                    match var.kind.value(m.val) {
                        Some(def) => xs.push(def.inverse(m.mu().unwrap_or(1.0))),
                        None => warn!(
                            "{} names no value of fuzzy kind `{}`",
                            m.render(&self.syms),
                            self.syms.resolve(&var.kind.name)
                        ),
                    }
                }
                if xs.is_empty() {
                    continue;
                }
                let xstar = xs.iter().sum::<f64>() / xs.len() as f64;
                let crisp: Vec<Rc<Wme>> = self
                    .matcher
                    .working_memory()
                    .iter()
                    .filter(|w| {
                        w.id == id
                            && w.attr == var.name
                            && !w.is_fuzzy()
                            && fuzzy::parse_crisp(self.syms.resolve(&w.val)).is_some()
                    })
                    .cloned()
                    .collect();
                plans.push(Plan { id, attr: var.name, members, xstar, crisp });
            }
        }

        for plan in plans {
            if plan.crisp.len() > 1 {
                warn!(
                    "multiple crisp values for ({} {}); replacing none of them",
                    self.syms.resolve(&plan.id),
                    self.syms.resolve(&plan.attr)
                );
            } else if let [old] = plan.crisp.as_slice() {
                let n = fuzzy::parse_crisp(self.syms.resolve(&old.val))
                    .expect("crisp candidates parse as numbers");
                if (n - plan.xstar).abs() >= CRISP_TOLERANCE {
                    self.retract_wme_and_memberships(old);
                }
            }
            let val = self.syms.get_or_intern(fuzzy::format_crisp(plan.xstar));
            let pattern =
                Pattern([Field::Const(plan.id), Field::Const(plan.attr), Field::Const(val)]);
            let (added, existing) = self.matcher.add_wmes_from_patterns(&[pattern], None, None);
            if let Some(w) = added.into_iter().chain(existing).next() {
                self.store
                    .record(&w, Justification::Membership { sources: plan.members });
            }
        }
    }

    /// Discard a WME's membership justifications; when none remain the WME
    /// leaves working memory too.
    fn retract_wme_and_memberships(&mut self, w: &Rc<Wme>) {
        let empty = self
            .store
            .withdraw(w, |j| matches!(j, Justification::Membership { .. }));
        if empty {
            trace!(wme = %w.render(&self.syms), "replaced by defuzzification");
            self.matcher.remove_wme(w);
            self.store.remove_record(w);
        }
    }

    // ========================== interactive ops ==========================

    pub fn lookup_fact(&self, id: &str, attr: &str, val: &str) -> Option<Rc<Wme>> {
        let id = self.syms.get(id)?;
        let attr = self.syms.get(attr)?;
        let val = self.syms.get(val)?;
        self.matcher.lookup(id, attr, val)
    }

    /// Withdraw one axiomatic or defuzzification justification from a fact
    /// and re-stabilize the knowledge base.
    pub fn retract(&mut self, id: &str, attr: &str, val: &str) {
        let Some(w) = self.lookup_fact(id, attr, val) else {
            warn!("no such fact ({id} {attr} {val})");
            return;
        };
        match self.store.remove_first_retractable(&w) {
            None => {
                warn!(
                    "({id} {attr} {val}) has only production-derived \
                     justifications; refusing to retract"
                );
                return;
            }
            Some(true) => {
                self.matcher.remove_wme(&w);
                self.store.remove_record(&w);
            }
            Some(false) => {}
        }
        self.defuzzify();
        self.run();
        self.defuzzify();
    }

    /// Drop all of working memory and the justification store; productions,
    /// strata, schemas, and the fuzzy registry survive.
    pub fn clear(&mut self) {
        self.matcher.clear_working_memory();
        self.store.clear();
    }

    // ============================== queries ==============================

    pub fn answer_query(&self, lhs: &[Condition], vars: &[Sym]) -> String {
        let rows = self.matcher.query(lhs, vars);
        if rows.is_empty() {
            return "No.".to_string();
        }
        let mut out = String::from("Yes.");
        for (i, row) in rows.iter().enumerate() {
            for v in vars {
                if let Some(val) = row.get(v) {
                    out.push_str(&format!(
                        "\n{}||{}:{}",
                        i + 1,
                        self.syms.resolve(v),
                        self.syms.resolve(val)
                    ));
                }
            }
        }
        out
    }

    // ============================== explain ==============================

    /// Render the justification tree of a fact. Each node is a
    /// justification; its children are the supporting WMEs. A `(*)` leaf
    /// is a back-reference to a WME already on the path.
    pub fn explain(&self, id: &str, attr: &str, val: &str) -> String {
        let Some(w) = self.lookup_fact(id, attr, val) else {
            return format!("No such fact ({id} {attr} {val}).");
        };
        let mut out = w.render(&self.syms);
        let mut path = HashSet::new();
        path.insert(WmeRef(w.clone()));
        self.explain_wme(&mut out, "", &w, &mut path);
        out
    }

    fn explain_wme(&self, out: &mut String, prefix: &str, w: &Rc<Wme>, path: &mut HashSet<WmeRef>) {
        let justs: Vec<Justification> = self.store.justifications_of(w).cloned().collect();
        if justs.is_empty() {
            warn!("no justification record for {} during explain", w.render(&self.syms));
            return;
        }
        for (i, j) in justs.iter().enumerate() {
            let last = i + 1 == justs.len();
            let branch = if last { "└─ " } else { "├─ " };
            let cont = if last { "   " } else { "│  " };
            match j {
                Justification::Axiomatic => {
                    out.push_str(&format!("\n{prefix}{branch}[Axiomatic]"));
                }
                Justification::Membership { sources } if j.is_fuzzification() => {
                    out.push_str(&format!(
                        "\n{prefix}{branch}[Fuzzification of: {}]",
                        sources[0].render(&self.syms)
                    ));
                }
                Justification::Production { rule, token } => {
                    out.push_str(&format!(
                        "\n{prefix}{branch}rule {}",
                        self.syms.resolve(rule)
                    ));
                    self.explain_children(out, &format!("{prefix}{cont}"), &token.wmes, path);
                }
                Justification::Membership { sources } => {
                    out.push_str(&format!("\n{prefix}{branch}defuzzification"));
                    self.explain_children(out, &format!("{prefix}{cont}"), sources, path);
                }
            }
        }
    }

    fn explain_children(
        &self,
        out: &mut String,
        prefix: &str,
        wmes: &[Rc<Wme>],
        path: &mut HashSet<WmeRef>,
    ) {
        for (i, w) in wmes.iter().enumerate() {
            let last = i + 1 == wmes.len();
            let branch = if last { "└─ " } else { "├─ " };
            let cont = if last { "   " } else { "│  " };
            if path.contains(&WmeRef(w.clone())) {
                out.push_str(&format!("\n{prefix}{branch}{} (*)", w.render(&self.syms)));
            } else {
                out.push_str(&format!("\n{prefix}{branch}{}", w.render(&self.syms)));
                path.insert(WmeRef(w.clone()));
                self.explain_wme(out, &format!("{prefix}{cont}"), w, path);
                path.remove(&WmeRef(w.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve;

    fn reasoner(strategy: &str) -> Reasoner {
        Reasoner::new(resolve::choose(strategy), false)
    }

    fn has(r: &Reasoner, id: &str, attr: &str, val: &str) -> bool {
        r.lookup_fact(id, attr, val).is_some()
    }

    const BIRD_FACTS: &str = "(duck is-a bird)\n\
                              (robbin is-a bird)\n\
                              (dodo is-a bird)\n\
                              (duck fly can)\n\
                              (dodo fly cannot)\n";

    #[test]
    fn default_logic_stabilizes_under_stratification() {
        let mut r = reasoner("stratified-manual");
        let src = format!(
            "{BIRD_FACTS}\
             #stratum\n\
             (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))\n\
             #stratum\n\
             (fly: (<s> fly-prepare can) -> (<s> fly can))\n"
        );
        r.load(&src).unwrap();

        assert!(has(&r, "robbin", "fly", "can"));
        assert!(has(&r, "robbin", "fly-prepare", "can"));
        assert!(!has(&r, "duck", "fly-prepare", "can"));
        assert!(!has(&r, "dodo", "fly", "can"));
        let outcome = r.last_outcome().unwrap();
        assert!(outcome.converged, "stratified run must reach a fixed point");
        assert!(r.is_nondeterministic());
    }

    #[test]
    fn default_logic_oscillates_under_first_match() {
        let mut r = reasoner("first-match");
        let src = format!(
            "{BIRD_FACTS}\
             (fly: (<s> is-a bird) -(<s> fly _) -> (<s> fly can))\n"
        );
        r.load(&src).unwrap();

        let outcome = r.last_outcome().unwrap();
        assert!(!outcome.converged, "first-match must hit the cycle limit");
        assert_eq!(outcome.cycles, CYCLE_LIMIT);
        // The derivation never touches the other birds.
        assert!(has(&r, "duck", "fly", "can"));
        assert!(!has(&r, "dodo", "fly", "can"));
    }

    #[test]
    fn retracting_an_axiom_cascades() {
        let mut r = reasoner("stratified-manual");
        let src = format!(
            "{BIRD_FACTS}\
             #stratum\n\
             (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))\n\
             #stratum\n\
             (fly: (<s> fly-prepare can) -> (<s> fly can))\n"
        );
        r.load(&src).unwrap();
        assert!(has(&r, "robbin", "fly", "can"));

        r.retract("robbin", "is-a", "bird");
        assert!(!has(&r, "robbin", "is-a", "bird"));
        assert!(!has(&r, "robbin", "fly-prepare", "can"));
        assert!(!has(&r, "robbin", "fly", "can"));
        assert!(r.last_outcome().unwrap().converged);

        // duck's flying ability was axiomatic, not derived.
        r.retract("duck", "is-a", "bird");
        assert!(!has(&r, "duck", "is-a", "bird"));
        assert!(has(&r, "duck", "fly", "can"));
    }

    #[test]
    fn derived_facts_refuse_direct_retraction() {
        let mut r = reasoner("stratified-manual");
        let src = format!(
            "{BIRD_FACTS}\
             #stratum\n\
             (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))\n"
        );
        r.load(&src).unwrap();
        assert!(has(&r, "robbin", "fly-prepare", "can"));
        r.retract("robbin", "fly-prepare", "can");
        assert!(has(&r, "robbin", "fly-prepare", "can"));
    }

    #[test]
    fn axiomatic_asserts_are_counted() {
        let mut r = reasoner("first-match");
        r.load("(duck is-a bird)\n(duck is-a bird)\n").unwrap();
        let w = r.lookup_fact("duck", "is-a", "bird").unwrap();
        assert_eq!(r.store.justifications_of(&w).count(), 2);

        r.retract("duck", "is-a", "bird");
        assert!(has(&r, "duck", "is-a", "bird"));
        r.retract("duck", "is-a", "bird");
        assert!(!has(&r, "duck", "is-a", "bird"));
        assert!(r.store.is_empty());
    }

    const TIP_SETUP: &str = "\
        #fuzzy kind excellent-poor excellent:sigmoid 8 0.5, poor:sigmoid -8 0.5\n\
        #fuzzy kind small-big big:sigmoid 6 0.5, small:sigmoid -6 0.5\n\
        #fuzzy var food excellent-poor\n\
        #fuzzy var service excellent-poor\n\
        #fuzzy var tip small-big\n\
        (B1 food 0.3)\n\
        (B1 service 0.9)\n";

    fn sig(a: f64, c: f64, x: f64) -> f64 {
        1.0 / (1.0 + (-a * (x - c)).exp())
    }

    #[test]
    fn fuzzification_creates_justified_fuzzy_wmes() {
        let mut r = reasoner("first-match");
        r.load(TIP_SETUP).unwrap();

        let w = r.lookup_fact("B1", "food", "excellent").unwrap();
        assert!((w.mu().unwrap() - sig(8.0, 0.5, 0.3)).abs() < 1e-12);
        let w = r.lookup_fact("B1", "food", "poor").unwrap();
        assert!((w.mu().unwrap() - sig(-8.0, 0.5, 0.3)).abs() < 1e-12);

        // The fuzzification reason points back at the crisp source.
        let crisp = r.lookup_fact("B1", "food", "0.3").unwrap();
        let fuzzy = r.lookup_fact("B1", "food", "excellent").unwrap();
        assert!(r.store.justifications_of(&fuzzy).any(|j| {
            matches!(j, Justification::Membership { sources }
                if sources.len() == 1 && Rc::ptr_eq(&sources[0], &crisp))
        }));
    }

    #[test]
    fn min_max_inference_and_defuzzification() {
        let mut r = reasoner("first-match");
        let src = format!(
            "#fuzzy system min-max\n\
             {TIP_SETUP}\
             (tip-rule: (<x> food excellent) (<x> service excellent) -> (<x> tip big))\n"
        );
        r.load(&src).unwrap();

        let mu_expected = sig(8.0, 0.5, 0.3).min(sig(8.0, 0.5, 0.9));
        let tip = r.lookup_fact("B1", "tip", "big").unwrap();
        assert!((tip.mu().unwrap() - mu_expected).abs() < 1e-12);

        // x = c − ln(1/μ − 1)/a for the single asserted tip value.
        let x_expected = 0.5 - (1.0 / mu_expected - 1.0).ln() / 6.0;
        let crisp = r
            .lookup_fact("B1", "tip", &fuzzy::format_crisp(x_expected))
            .expect("defuzzified crisp tip");
        assert!(r.store.justifications_of(&crisp).any(|j| {
            matches!(j, Justification::Membership { sources } if sources.len() == 1)
        }));
    }

    #[test]
    fn defuzzification_recovers_the_crisp_mean() {
        // Both fuzzy values of a reversible kind asserted: the crisp value
        // is the mean of the two inverse sigmoids, which round-trips to
        // the original assertion.
        let mut r = reasoner("first-match");
        r.load(TIP_SETUP).unwrap();

        let crisp = r.lookup_fact("B1", "food", "0.3").unwrap();
        // Axiomatic plus the membership reason defuzzification appended.
        assert_eq!(r.store.justifications_of(&crisp).count(), 2);
        assert!(r.store.justifications_of(&crisp).any(|j| {
            matches!(j, Justification::Membership { sources } if sources.len() == 2)
        }));
        // No near-duplicate crisp WME appeared.
        let food = r.symbols().get("food").unwrap();
        let b1 = r.symbols().get("B1").unwrap();
        let crisp_count = r
            .matcher
            .working_memory()
            .iter()
            .filter(|w| w.id == b1 && w.attr == food && !w.is_fuzzy())
            .count();
        assert_eq!(crisp_count, 1);
    }

    #[test]
    fn multiplicative_disjunction_across_rules() {
        let mut r = reasoner("first-match");
        let src = format!(
            "#fuzzy system multiplicative\n\
             {TIP_SETUP}\
             (tip-rule: (<x> food excellent) (<x> service excellent) -> (<x> tip big))\n\
             (tip-rule2: (<x> food poor) -> (<x> tip big))\n"
        );
        r.load(&src).unwrap();

        let mu1 = sig(8.0, 0.5, 0.3) * sig(8.0, 0.5, 0.9);
        let mu2 = sig(-8.0, 0.5, 0.3);
        let expected = 1.0 - (1.0 - mu1) * (1.0 - mu2);
        let tip = r.lookup_fact("B1", "tip", "big").unwrap();
        assert!((tip.mu().unwrap() - expected).abs() < 1e-12);

        // The crisp tip tracked the degree change: the value derived from
        // the first firing alone was replaced by the aggregate.
        let x_new = 0.5 - (1.0 / expected - 1.0).ln() / 6.0;
        assert!(r.lookup_fact("B1", "tip", &fuzzy::format_crisp(x_new)).is_some());
        let x_old = 0.5 - (1.0 / mu1 - 1.0).ln() / 6.0;
        assert!(r.lookup_fact("B1", "tip", &fuzzy::format_crisp(x_old)).is_none());
    }

    #[test]
    fn existential_conditions_gate_without_binding() {
        let mut r = reasoner("first-match");
        r.load(
            "(duck is-a bird)\n\
             (pond has water)\n\
             (habitat: (<s> is-a bird) +(pond has _) -> (<s> lives-near pond))\n",
        )
        .unwrap();
        assert!(has(&r, "duck", "lives-near", "pond"));
        assert!(r.is_nondeterministic());

        let w = r.lookup_fact("duck", "lives-near", "pond").unwrap();
        let j = r.store.justifications_of(&w).next().unwrap();
        let Justification::Production { token, .. } = j else {
            panic!("expected a production justification");
        };
        assert_eq!(token.wmes.len(), 1);
    }

    #[test]
    fn schema_mismatch_warns_but_asserts() {
        let mut r = reasoner("first-match");
        r.load(
            "#schemacheck on\n\
             #schema _ fly can birds that can fly\n\
             (duck fly canitreally)\n",
        )
        .unwrap();
        assert!(has(&r, "duck", "fly", "canitreally"));
    }

    #[test]
    fn every_live_wme_has_a_justification() {
        let mut r = reasoner("stratified-manual");
        let src = format!(
            "{BIRD_FACTS}\
             #stratum\n\
             (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))\n\
             #stratum\n\
             (fly: (<s> fly-prepare can) -> (<s> fly can))\n"
        );
        r.load(&src).unwrap();
        for w in r.matcher.working_memory() {
            assert!(
                r.store.justifications_of(w).count() >= 1,
                "{} lacks a justification",
                w.render(r.symbols())
            );
        }
        assert_eq!(r.store.len(), r.matcher.working_memory().len());
    }

    #[test]
    fn queries_list_bindings() {
        let mut r = reasoner("first-match");
        r.load(
            "(duck is-a bird)\n\
             (robbin is-a bird)\n\
             (stone is-a mineral)\n",
        )
        .unwrap();
        let items =
            parse::parse_source("((<x> is-a bird) -> <x>)", &mut r.syms).unwrap();
        let Item::Clause(Clause::Query { lhs, vars }) = &items[0] else {
            panic!("expected query");
        };
        let answer = r.answer_query(lhs, vars);
        assert!(answer.starts_with("Yes."));
        assert!(answer.contains("1||x:duck"));
        assert!(answer.contains("2||x:robbin"));
        assert!(!answer.contains("stone"));

        let items = parse::parse_source("((<x> is-a fish) -> <x>)", &mut r.syms).unwrap();
        let Item::Clause(Clause::Query { lhs, vars }) = &items[0] else {
            panic!("expected query");
        };
        assert_eq!(r.answer_query(lhs, vars), "No.");
    }

    #[test]
    fn explain_walks_the_justification_tree() {
        let mut r = reasoner("stratified-manual");
        let src = format!(
            "{BIRD_FACTS}\
             #stratum\n\
             (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))\n\
             #stratum\n\
             (fly: (<s> fly-prepare can) -> (<s> fly can))\n"
        );
        r.load(&src).unwrap();

        let tree = r.explain("robbin", "fly", "can");
        assert!(tree.starts_with("(robbin fly can)"));
        assert!(tree.contains("rule fly"));
        assert!(tree.contains("rule prepare"));
        assert!(tree.contains("[Axiomatic]"));
        assert!(tree.contains("└─"));

        assert!(r.explain("no", "such", "fact").starts_with("No such fact"));
    }

    #[test]
    fn explain_marks_fuzzification_leaves() {
        let mut r = reasoner("first-match");
        r.load(TIP_SETUP).unwrap();
        let tree = r.explain("B1", "food", "excellent");
        assert!(tree.contains("[Fuzzification of: (B1 food 0.3)]"));
    }

    #[test]
    fn clear_keeps_rules_but_drops_facts() {
        let mut r = reasoner("first-match");
        r.load("(duck is-a bird)\n(r1: (<s> is-a bird) -> (<s> kind animal))\n")
            .unwrap();
        assert!(has(&r, "duck", "kind", "animal"));

        r.clear();
        assert!(r.matcher.working_memory().is_empty());
        assert!(r.store.is_empty());

        // The same rule fires again on freshly asserted facts.
        r.load("(goose is-a bird)\n").unwrap();
        assert!(has(&r, "goose", "kind", "animal"));
    }

    #[test]
    fn duplicate_rule_names_fail_the_load() {
        let mut r = reasoner("first-match");
        let err = r.load(
            "(same: (<s> is-a bird) -> (<s> fly can))\n\
             #stratum\n\
             (same: (<s> is-a fish) -> (<s> swim can))\n",
        );
        assert!(matches!(err, Err(LoadError::DuplicateRule(_))));
    }
}

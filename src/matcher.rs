//! Pattern-matching engine
//!
//! The reasoner sits on top of a matching engine that owns working memory,
//! compiles productions from condition lists, and reports **token deltas**:
//! which LHS bindings appeared and which disappeared since a production last
//! committed. This implementation favors correctness over indexing
//! cleverness: matches are recomputed per call with a naive join and
//! diffed against the committed token set.
//!
//! ## Peek vs commit
//!
//! [`Matcher::can_fire`] computes the delta without committing; the driver
//! uses it to build the conflict set. [`Matcher::will_fire`] recomputes,
//! commits, and returns the delta; the driver calls it exactly once for the
//! selected item. A per-production identity cache guarantees both calls
//! hand back the *same* `Rc<Token>` for the same binding, so justifications
//! recorded from a peeked delta remain identity-equal to the committed one.
//!
//! Removing a WME does not touch committed tokens; the resulting
//! `to_remove` deltas surface at the next peek or commit, which is how
//! cascades are deferred to the following cycle instead of recursing.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::warn;

use crate::fuzzy::FuzzyVariable;
use crate::wme::{Sym, Token, Wme};

/// One field of a pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Const(Sym),
    Var(Sym),
    Wild,
}

/// A three-field pattern over `(id, attr, val)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern(pub [Field; 3]);

/// How a condition constrains the match.
///
/// Positive conditions extend the binding environment and contribute their
/// WME to the token. Negative conditions prune environments for which any
/// WME matches; existential conditions prune those for which none does.
/// Neither of the latter contributes a WME to the token.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CondKind {
    Positive,
    Negative,
    Existential,
}

#[derive(Clone, Debug)]
pub struct Condition {
    pub kind: CondKind,
    pub pattern: Pattern,
}

/// Variable environment built up across a condition list.
pub type Bindings = HashMap<Sym, Sym>;

/// Handle for a compiled production.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProdId(pub usize);

/// Tokens that appeared / disappeared relative to the committed set.
#[derive(Debug, Default)]
pub struct TokenDelta {
    pub to_add: Vec<Rc<Token>>,
    pub to_remove: Vec<Rc<Token>>,
}

impl TokenDelta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

type SeqKey = Vec<usize>;

fn seq_key(wmes: &[Rc<Wme>]) -> SeqKey {
    wmes.iter().map(|w| Rc::as_ptr(w) as usize).collect()
}

struct ProdNode {
    name: Sym,
    lhs: Vec<Condition>,
    /// First occurrence of each variable: (positive-condition index within
    /// the token, field index). Used to bind RHS patterns from a token.
    locations: HashMap<Sym, (usize, usize)>,
    committed: Vec<Rc<Token>>,
    /// Identity cache over *currently matched* bindings, committed or not.
    known: HashMap<SeqKey, Rc<Token>>,
}

pub struct Matcher {
    wm: Vec<Rc<Wme>>,
    index: HashMap<(Sym, Sym, Sym), Rc<Wme>>,
    /// Alpha memory: live WMEs grouped by attribute, insertion-ordered.
    by_attr: HashMap<Sym, Vec<Rc<Wme>>>,
    prods: Vec<ProdNode>,
    fuzzy_vars: Vec<FuzzyVariable>,
    fuzzy_by_attr: HashMap<Sym, usize>,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            wm: Vec::new(),
            index: HashMap::new(),
            by_attr: HashMap::new(),
            prods: Vec::new(),
            fuzzy_vars: Vec::new(),
            fuzzy_by_attr: HashMap::new(),
        }
    }

    // ------------------------------ registry ------------------------------

    /// Register a fuzzy variable; later registrations replace earlier ones
    /// for the same attribute.
    pub fn add_fuzzy_variable(&mut self, var: FuzzyVariable) {
        if let Some(&i) = self.fuzzy_by_attr.get(&var.name) {
            self.fuzzy_vars[i] = var;
        } else {
            self.fuzzy_by_attr.insert(var.name, self.fuzzy_vars.len());
            self.fuzzy_vars.push(var);
        }
    }

    pub fn get_fuzzy_variable(&self, attr: Sym) -> Option<&FuzzyVariable> {
        self.fuzzy_by_attr.get(&attr).map(|&i| &self.fuzzy_vars[i])
    }

    /// Registered fuzzy variables in registration order.
    pub fn fuzzy_variables(&self) -> &[FuzzyVariable] {
        &self.fuzzy_vars
    }

    // --------------------------- working memory ---------------------------

    /// Working memory in insertion order.
    pub fn working_memory(&self) -> &[Rc<Wme>] {
        &self.wm
    }

    pub fn lookup(&self, id: Sym, attr: Sym, val: Sym) -> Option<Rc<Wme>> {
        self.index.get(&(id, attr, val)).cloned()
    }

    /// Materialize ground WMEs from `patterns`, substituting `bindings` for
    /// variables. Returns the newly interned WMEs and the ones that were
    /// already live, disjointly. A pattern whose attr names a registered
    /// fuzzy variable and whose val names one of that kind's values becomes
    /// a fuzzy WME carrying `mu` (default 1.0).
    pub fn add_wmes_from_patterns(
        &mut self,
        patterns: &[Pattern],
        bindings: Option<&Bindings>,
        mu: Option<f64>,
    ) -> (Vec<Rc<Wme>>, Vec<Rc<Wme>>) {
        let mut added = Vec::new();
        let mut existing = Vec::new();
        'next: for pat in patterns {
            let mut triple = [None; 3];
            for (i, field) in pat.0.iter().enumerate() {
                triple[i] = match field {
                    Field::Const(s) => Some(*s),
                    Field::Var(v) => match bindings.and_then(|b| b.get(v)) {
                        Some(s) => Some(*s),
                        None => {
                            warn!("unbound variable in assertion pattern; skipping");
                            continue 'next;
                        }
                    },
                    Field::Wild => {
                        warn!("wildcard in assertion pattern; skipping");
                        continue 'next;
                    }
                };
            }
            let (id, attr, val) = (triple[0].unwrap(), triple[1].unwrap(), triple[2].unwrap());
            if let Some(w) = self.index.get(&(id, attr, val)) {
                existing.push(w.clone());
                continue;
            }
            let fuzzy = self
                .get_fuzzy_variable(attr)
                .map_or(false, |v| v.kind.value(val).is_some());
            let w = Rc::new(if fuzzy {
                Wme::fuzzy(id, attr, val, mu.unwrap_or(1.0))
            } else {
                Wme::crisp(id, attr, val)
            });
            self.index.insert((id, attr, val), w.clone());
            self.by_attr.entry(attr).or_default().push(w.clone());
            self.wm.push(w.clone());
            added.push(w);
        }
        (added, existing)
    }

    /// Drop a WME from working memory. Committed tokens that contain it are
    /// left alone; the deltas show up at the next peek or commit.
    pub fn remove_wme(&mut self, w: &Rc<Wme>) {
        self.index.remove(&w.triple());
        if let Some(bucket) = self.by_attr.get_mut(&w.attr) {
            bucket.retain(|x| !Rc::ptr_eq(x, w));
        }
        self.wm.retain(|x| !Rc::ptr_eq(x, w));
    }

    /// Drop all WMEs and every production's match state; productions and
    /// the fuzzy registry stay.
    pub fn clear_working_memory(&mut self) {
        self.wm.clear();
        self.index.clear();
        self.by_attr.clear();
        for node in &mut self.prods {
            node.committed.clear();
            node.known.clear();
        }
    }

    /// Candidate WMEs for a pattern: the attribute's alpha memory when the
    /// attr field is resolvable, otherwise all of working memory.
    fn candidates(&self, pattern: &Pattern, bindings: &Bindings) -> &[Rc<Wme>] {
        let attr = match &pattern.0[1] {
            Field::Const(s) => Some(*s),
            Field::Var(v) => bindings.get(v).copied(),
            Field::Wild => None,
        };
        match attr {
            Some(a) => self.by_attr.get(&a).map_or(&[], Vec::as_slice),
            None => &self.wm,
        }
    }

    // ----------------------------- productions ----------------------------

    pub fn add_production(&mut self, lhs: Vec<Condition>, name: Sym) -> ProdId {
        let mut locations = HashMap::new();
        let mut pos = 0usize;
        for cond in &lhs {
            if cond.kind != CondKind::Positive {
                continue;
            }
            for (fi, field) in cond.pattern.0.iter().enumerate() {
                if let Field::Var(v) = field {
                    locations.entry(*v).or_insert((pos, fi));
                }
            }
            pos += 1;
        }
        self.prods.push(ProdNode {
            name,
            lhs,
            locations,
            committed: Vec::new(),
            known: HashMap::new(),
        });
        ProdId(self.prods.len() - 1)
    }

    pub fn production_name(&self, p: ProdId) -> Sym {
        self.prods[p.0].name
    }

    pub fn variable_locations(&self, p: ProdId) -> &HashMap<Sym, (usize, usize)> {
        &self.prods[p.0].locations
    }

    /// Peek at the token delta without committing.
    pub fn can_fire(&mut self, p: ProdId) -> TokenDelta {
        self.delta(p, false)
    }

    /// Commit the current match set and return the delta.
    pub fn will_fire(&mut self, p: ProdId) -> TokenDelta {
        self.delta(p, true)
    }

    fn delta(&mut self, p: ProdId, commit: bool) -> TokenDelta {
        let seqs: Vec<Vec<Rc<Wme>>> = self
            .match_envs(&self.prods[p.0].lhs)
            .into_iter()
            .map(|(_, tok)| tok)
            .collect();

        let node = &mut self.prods[p.0];
        let mut current_keys: HashSet<SeqKey> = HashSet::with_capacity(seqs.len());
        let mut current: Vec<Rc<Token>> = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let key = seq_key(&seq);
            let tok = node
                .known
                .entry(key.clone())
                .or_insert_with(|| Rc::new(Token { wmes: seq }))
                .clone();
            current_keys.insert(key);
            current.push(tok);
        }

        let committed_keys: HashSet<SeqKey> =
            node.committed.iter().map(|t| seq_key(&t.wmes)).collect();

        let to_add = current
            .iter()
            .filter(|t| !committed_keys.contains(&seq_key(&t.wmes)))
            .cloned()
            .collect();
        let to_remove = node
            .committed
            .iter()
            .filter(|t| !current_keys.contains(&seq_key(&t.wmes)))
            .cloned()
            .collect();

        if commit {
            node.committed = current;
            node.known.retain(|k, _| current_keys.contains(k));
        }
        TokenDelta { to_add, to_remove }
    }

    // ------------------------------ matching ------------------------------

    fn try_match(pattern: &Pattern, w: &Wme, bindings: &Bindings) -> Option<Bindings> {
        let mut out: Option<Bindings> = None;
        for (i, field) in pattern.0.iter().enumerate() {
            let actual = w.field(i);
            match field {
                Field::Wild => {}
                Field::Const(s) => {
                    if *s != actual {
                        return None;
                    }
                }
                Field::Var(v) => {
                    let env = out.as_ref().unwrap_or(bindings);
                    match env.get(v) {
                        Some(bound) => {
                            if *bound != actual {
                                return None;
                            }
                        }
                        None => {
                            out.get_or_insert_with(|| bindings.clone()).insert(*v, actual);
                        }
                    }
                }
            }
        }
        Some(out.unwrap_or_else(|| bindings.clone()))
    }

    fn match_envs(&self, conds: &[Condition]) -> Vec<(Bindings, Vec<Rc<Wme>>)> {
        let mut envs: Vec<(Bindings, Vec<Rc<Wme>>)> = vec![(Bindings::new(), Vec::new())];
        for cond in conds {
            match cond.kind {
                CondKind::Positive => {
                    let mut next = Vec::new();
                    for (bind, tok) in &envs {
                        for w in self.candidates(&cond.pattern, bind) {
                            if let Some(extended) = Self::try_match(&cond.pattern, w, bind) {
                                let mut tok = tok.clone();
                                tok.push(w.clone());
                                next.push((extended, tok));
                            }
                        }
                    }
                    envs = next;
                }
                CondKind::Negative => {
                    envs.retain(|(bind, _)| {
                        !self
                            .candidates(&cond.pattern, bind)
                            .iter()
                            .any(|w| Self::try_match(&cond.pattern, w, bind).is_some())
                    });
                }
                CondKind::Existential => {
                    envs.retain(|(bind, _)| {
                        self.candidates(&cond.pattern, bind)
                            .iter()
                            .any(|w| Self::try_match(&cond.pattern, w, bind).is_some())
                    });
                }
            }
            if envs.is_empty() {
                break;
            }
        }
        envs
    }

    /// Evaluate a condition list and project the requested variables.
    /// Unbound variables are omitted from the result maps.
    pub fn query(&self, conds: &[Condition], vars: &[Sym]) -> Vec<Bindings> {
        self.match_envs(conds)
            .into_iter()
            .map(|(bind, _)| {
                vars.iter()
                    .filter_map(|v| bind.get(v).map(|s| (*v, *s)))
                    .collect()
            })
            .collect()
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wme::Interner;

    fn pat(syms: &mut Interner, spec: [&str; 3]) -> Pattern {
        Pattern(spec.map(|f| match f {
            "_" => Field::Wild,
            v if v.starts_with('<') => {
                Field::Var(syms.get_or_intern(v.trim_matches(|c| c == '<' || c == '>')))
            }
            c => Field::Const(syms.get_or_intern(c)),
        }))
    }

    fn cond(syms: &mut Interner, kind: CondKind, spec: [&str; 3]) -> Condition {
        Condition { kind, pattern: pat(syms, spec) }
    }

    fn assert_fact(m: &mut Matcher, syms: &mut Interner, spec: [&str; 3]) -> Rc<Wme> {
        let p = pat(syms, spec);
        let (added, existing) = m.add_wmes_from_patterns(&[p], None, None);
        added.into_iter().chain(existing).next().unwrap()
    }

    #[test]
    fn delta_tracks_additions_and_removals() {
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        assert_fact(&mut m, &mut syms, ["duck", "is-a", "bird"]);
        let p = m.add_production(
            vec![cond(&mut syms, CondKind::Positive, ["<s>", "is-a", "bird"])],
            syms.get_or_intern("r"),
        );

        let d = m.can_fire(p);
        assert_eq!(d.to_add.len(), 1);
        assert!(d.to_remove.is_empty());

        // Peek twice: same token identity both times.
        let d2 = m.can_fire(p);
        assert!(Rc::ptr_eq(&d.to_add[0], &d2.to_add[0]));

        // Commit, then the delta drains.
        let d3 = m.will_fire(p);
        assert!(Rc::ptr_eq(&d.to_add[0], &d3.to_add[0]));
        assert!(m.can_fire(p).is_empty());

        // Removal shows up as to_remove on the next peek.
        let w = m.lookup(
            syms.get_or_intern("duck"),
            syms.get_or_intern("is-a"),
            syms.get_or_intern("bird"),
        )
        .unwrap();
        m.remove_wme(&w);
        let d4 = m.can_fire(p);
        assert!(d4.to_add.is_empty());
        assert_eq!(d4.to_remove.len(), 1);
        assert!(Rc::ptr_eq(&d4.to_remove[0], &d3.to_add[0]));
    }

    #[test]
    fn negative_conditions_prune_and_release() {
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        assert_fact(&mut m, &mut syms, ["duck", "is-a", "bird"]);
        assert_fact(&mut m, &mut syms, ["robbin", "is-a", "bird"]);
        let blocker = assert_fact(&mut m, &mut syms, ["duck", "fly", "can"]);

        let p = m.add_production(
            vec![
                cond(&mut syms, CondKind::Positive, ["<s>", "is-a", "bird"]),
                cond(&mut syms, CondKind::Negative, ["<s>", "fly", "_"]),
            ],
            syms.get_or_intern("r"),
        );
        let d = m.will_fire(p);
        assert_eq!(d.to_add.len(), 1);
        let robbin = syms.get_or_intern("robbin");
        assert_eq!(d.to_add[0].wmes[0].id, robbin);

        // Dropping the blocker re-admits duck.
        m.remove_wme(&blocker);
        let d2 = m.will_fire(p);
        assert_eq!(d2.to_add.len(), 1);
        assert_eq!(d2.to_add[0].wmes[0].id, syms.get_or_intern("duck"));
        assert!(d2.to_remove.is_empty());
    }

    #[test]
    fn existential_conditions_filter_without_extending() {
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        assert_fact(&mut m, &mut syms, ["duck", "is-a", "bird"]);

        let conds = vec![
            cond(&mut syms, CondKind::Positive, ["<s>", "is-a", "bird"]),
            cond(&mut syms, CondKind::Existential, ["<s>", "likes", "water"]),
        ];
        let s = syms.get_or_intern("s");
        assert!(m.query(&conds, &[s]).is_empty());

        assert_fact(&mut m, &mut syms, ["duck", "likes", "water"]);
        let rows = m.query(&conds, &[s]);
        assert_eq!(rows.len(), 1);

        // The gating WME does not join into the token.
        let p = m.add_production(conds, syms.get_or_intern("r"));
        let d = m.will_fire(p);
        assert_eq!(d.to_add.len(), 1);
        assert_eq!(d.to_add[0].wmes.len(), 1);
    }

    #[test]
    fn wildcard_attribute_falls_back_to_full_scan() {
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        assert_fact(&mut m, &mut syms, ["duck", "fly", "can"]);
        assert_fact(&mut m, &mut syms, ["duck", "swim", "can"]);
        assert_fact(&mut m, &mut syms, ["duck", "sing", "cannot"]);

        let conds = vec![cond(&mut syms, CondKind::Positive, ["duck", "_", "can"])];
        assert_eq!(m.query(&conds, &[]).len(), 2);
    }

    #[test]
    fn join_binds_across_conditions() {
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        assert_fact(&mut m, &mut syms, ["B1", "food", "good"]);
        assert_fact(&mut m, &mut syms, ["B1", "service", "good"]);
        assert_fact(&mut m, &mut syms, ["B2", "food", "good"]);

        let conds = vec![
            cond(&mut syms, CondKind::Positive, ["<x>", "food", "good"]),
            cond(&mut syms, CondKind::Positive, ["<x>", "service", "good"]),
        ];
        let x = syms.get_or_intern("x");
        let rows = m.query(&conds, &[x]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][&x], syms.get_or_intern("B1"));
    }

    #[test]
    fn materialization_dedups_and_detects_fuzzy() {
        use crate::fuzzy::{FuzzyKind, FuzzyValueDef, FuzzyVariable};
        let mut syms = Interner::default();
        let mut m = Matcher::new();
        let tip = syms.get_or_intern("tip");
        let big = syms.get_or_intern("big");
        let small = syms.get_or_intern("small");
        m.add_fuzzy_variable(FuzzyVariable {
            name: tip,
            kind: Rc::new(FuzzyKind {
                name: syms.get_or_intern("small-big"),
                values: vec![
                    FuzzyValueDef { name: big, a: 6.0, c: 0.5 },
                    FuzzyValueDef { name: small, a: -6.0, c: 0.5 },
                ],
            }),
        });

        let p = pat(&mut syms, ["B1", "tip", "big"]);
        let (added, existing) = m.add_wmes_from_patterns(&[p.clone()], None, Some(0.4));
        assert_eq!((added.len(), existing.len()), (1, 0));
        assert_eq!(added[0].mu(), Some(0.4));

        let (added2, existing2) = m.add_wmes_from_patterns(&[p], None, Some(0.9));
        assert_eq!((added2.len(), existing2.len()), (0, 1));
        // Existing WMEs keep their degree; propagation is the caller's job.
        assert_eq!(existing2[0].mu(), Some(0.4));

        // Numeric value on a fuzzy attribute is still a crisp WME.
        let q = pat(&mut syms, ["B1", "tip", "0.25"]);
        let (added3, _) = m.add_wmes_from_patterns(&[q], None, None);
        assert!(!added3[0].is_fuzzy());
    }
}

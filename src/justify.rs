//! Justification store
//!
//! Every live WME owns a record of the reasons keeping it alive. A reason
//! is one of three kinds:
//!
//! - **Axiomatic**: asserted directly by the program text or an
//!   interactive command.
//! - **Production-derived**: identified by `(rule-name, supporting
//!   token)`; equality is rule name plus token identity.
//! - **Membership-derived**: identified by the ordered set of source WMEs
//!   whose degrees were combined. Defuzzification records the fuzzy group
//!   it averaged; fuzzification records the single crisp WME it expanded.
//!
//! The record's list is a multiset with one asymmetry: axiomatic entries
//! repeat (asserting the same fact twice leaves two reasons, and one
//! retraction still leaves the fact alive), while derived entries are
//! deduplicated by payload equality. The store's key set is exactly the
//! matcher's working memory; whoever empties a record must also remove the
//! WME from the matcher and then prune the record.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::rc::Rc;

use crate::wme::{Sym, Token, Wme, WmeRef};

#[derive(Clone, Debug)]
pub enum Justification {
    Axiomatic,
    Production { rule: Sym, token: Rc<Token> },
    Membership { sources: Vec<Rc<Wme>> },
}

impl Justification {
    /// Kind-and-payload equality: production entries compare by rule name
    /// and token identity, membership entries by source identity sequence.
    pub fn same_as(&self, other: &Justification) -> bool {
        match (self, other) {
            (Justification::Axiomatic, Justification::Axiomatic) => true,
            (
                Justification::Production { rule: r1, token: t1 },
                Justification::Production { rule: r2, token: t2 },
            ) => r1 == r2 && Rc::ptr_eq(t1, t2),
            (
                Justification::Membership { sources: s1 },
                Justification::Membership { sources: s2 },
            ) => {
                s1.len() == s2.len()
                    && s1.iter().zip(s2).all(|(a, b)| Rc::ptr_eq(a, b))
            }
            _ => false,
        }
    }

    /// Only axiomatic and membership-derived reasons may be withdrawn by
    /// the user; production-derived ones belong to the TMS.
    pub fn is_retractable(&self) -> bool {
        !matches!(self, Justification::Production { .. })
    }

    /// True when this is a fuzzification record: a membership reason whose
    /// payload is a single crisp WME.
    pub fn is_fuzzification(&self) -> bool {
        matches!(self, Justification::Membership { sources }
            if sources.len() == 1 && !sources[0].is_fuzzy())
    }
}

#[derive(Default)]
pub struct JustificationStore {
    records: HashMap<WmeRef, Vec<Justification>>,
}

impl JustificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a reason to a WME, creating the record if absent. Derived
    /// reasons equal to one already present are dropped; axiomatic reasons
    /// accumulate.
    pub fn record(&mut self, wme: &Rc<Wme>, justification: Justification) {
        let entry = self.records.entry(WmeRef(wme.clone())).or_default();
        let duplicate = !matches!(justification, Justification::Axiomatic)
            && entry.iter().any(|j| j.same_as(&justification));
        if !duplicate {
            entry.push(justification);
        }
    }

    /// Remove every reason satisfying `pred`; returns whether the record is
    /// now empty. The caller is responsible for removing an emptied WME
    /// from the matcher and then calling [`Self::remove_record`].
    pub fn withdraw(&mut self, wme: &Rc<Wme>, pred: impl Fn(&Justification) -> bool) -> bool {
        match self.records.get_mut(&WmeRef(wme.clone())) {
            Some(justs) => {
                justs.retain(|j| !pred(j));
                justs.is_empty()
            }
            None => false,
        }
    }

    /// Delete the production-derived reason `(rule, token)` from every
    /// record that holds it; returns the WMEs whose record became empty.
    pub fn withdraw_production(&mut self, rule: Sym, token: &Rc<Token>) -> Vec<Rc<Wme>> {
        let mut emptied = Vec::new();
        for (wref, justs) in self.records.iter_mut() {
            let before = justs.len();
            justs.retain(|j| {
                !matches!(j, Justification::Production { rule: r, token: t }
                    if *r == rule && Rc::ptr_eq(t, token))
            });
            if justs.is_empty() && before > 0 {
                emptied.push(wref.0.clone());
            }
        }
        emptied
    }

    /// First axiomatic or membership reason, if any.
    pub fn find_retractable(&self, wme: &Rc<Wme>) -> Option<&Justification> {
        self.justifications_of(wme).find(|j| j.is_retractable())
    }

    /// Remove one retractable reason (a single instance). `None` when the
    /// WME has only production-derived reasons; otherwise whether the
    /// record is now empty.
    pub fn remove_first_retractable(&mut self, wme: &Rc<Wme>) -> Option<bool> {
        let justs = self.records.get_mut(&WmeRef(wme.clone()))?;
        let i = justs.iter().position(|j| j.is_retractable())?;
        justs.remove(i);
        Some(justs.is_empty())
    }

    pub fn justifications_of(&self, wme: &Rc<Wme>) -> impl Iterator<Item = &Justification> {
        self.records
            .get(&WmeRef(wme.clone()))
            .into_iter()
            .flatten()
    }

    pub fn has_record(&self, wme: &Rc<Wme>) -> bool {
        self.records.contains_key(&WmeRef(wme.clone()))
    }

    pub fn remove_record(&mut self, wme: &Rc<Wme>) {
        self.records.remove(&WmeRef(wme.clone()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WmeRef, &Vec<Justification>)> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

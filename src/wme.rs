//! Working-memory elements and their identity discipline
//!
//! A working-memory element (WME) is a triple `(id, attr, val)` of interned
//! symbols. A *fuzzy* WME additionally carries a membership degree μ ∈ [0,1]
//! that is mutable in place (degree propagation rewrites it while the WME
//! stays live in the matcher and the justification store).
//!
//! ## Identity
//!
//! WMEs and tokens are shared by reference between the matcher, the
//! justification store, and conflict items. Both are compared **by
//! identity** (`Rc` pointer equality), never structurally; [`WmeRef`] and
//! [`TokenRef`] are thin wrappers giving that identity `Eq`/`Hash` so the
//! store can key on it. A WME is deallocated only after both the matcher's
//! table and the store's record drop it.

#![forbid(unsafe_code)]

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Interned symbol; every WME field is one of these.
pub type Sym = lasso::Spur;

/// The process-wide string interner.
pub type Interner = lasso::Rodeo;

/// A triple fact. `mu` is `Some` for fuzzy WMEs and fixed at creation;
/// only the degree inside is ever rewritten.
#[derive(Debug)]
pub struct Wme {
    pub id: Sym,
    pub attr: Sym,
    pub val: Sym,
    mu: Option<Cell<f64>>,
}

impl Wme {
    pub fn crisp(id: Sym, attr: Sym, val: Sym) -> Self {
        Self { id, attr, val, mu: None }
    }

    pub fn fuzzy(id: Sym, attr: Sym, val: Sym, mu: f64) -> Self {
        Self { id, attr, val, mu: Some(Cell::new(mu)) }
    }

    #[inline]
    pub fn is_fuzzy(&self) -> bool {
        self.mu.is_some()
    }

    /// Current membership degree, `None` for crisp WMEs.
    #[inline]
    pub fn mu(&self) -> Option<f64> {
        self.mu.as_ref().map(Cell::get)
    }

    /// Rewrite the degree. No-op (with a debug assertion) on crisp WMEs.
    pub fn set_mu(&self, mu: f64) {
        debug_assert!(self.mu.is_some(), "set_mu on a crisp WME");
        if let Some(cell) = &self.mu {
            cell.set(mu.clamp(0.0, 1.0));
        }
    }

    #[inline]
    pub fn triple(&self) -> (Sym, Sym, Sym) {
        (self.id, self.attr, self.val)
    }

    /// Field access by position: 0 = id, 1 = attr, 2 = val.
    #[inline]
    pub fn field(&self, i: usize) -> Sym {
        match i {
            0 => self.id,
            1 => self.attr,
            _ => self.val,
        }
    }

    /// Human-readable rendering, used by explain output and warnings.
    pub fn render(&self, syms: &Interner) -> String {
        let (i, a, v) = (syms.resolve(&self.id), syms.resolve(&self.attr), syms.resolve(&self.val));
        match self.mu() {
            Some(mu) => format!("({i} {a} {v} μ={mu:.3})"),
            None => format!("({i} {a} {v})"),
        }
    }
}

/// One binding of a production's left-hand side: the ordered WMEs matched by
/// its positive conditions. Produced and owned by the matcher; everything
/// downstream holds it by identity.
#[derive(Debug)]
pub struct Token {
    pub wmes: Vec<Rc<Wme>>,
}

/// Identity handle for a WME (pointer equality and hashing).
#[derive(Clone, Debug)]
pub struct WmeRef(pub Rc<Wme>);

impl PartialEq for WmeRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WmeRef {}
impl Hash for WmeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Identity handle for a token.
#[derive(Clone, Debug)]
pub struct TokenRef(pub Rc<Token>);

impl PartialEq for TokenRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TokenRef {}
impl Hash for TokenRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_not_structure() {
        let mut syms = Interner::default();
        let (a, b, c) = (
            syms.get_or_intern("a"),
            syms.get_or_intern("b"),
            syms.get_or_intern("c"),
        );
        let w1 = Rc::new(Wme::crisp(a, b, c));
        let w2 = Rc::new(Wme::crisp(a, b, c));
        assert_ne!(WmeRef(w1.clone()), WmeRef(w2.clone()));
        assert_eq!(WmeRef(w1.clone()), WmeRef(w1.clone()));

        let mut set = HashSet::new();
        set.insert(WmeRef(w1));
        assert!(!set.contains(&WmeRef(w2)));
    }

    #[test]
    fn degree_is_mutable_in_place() {
        let mut syms = Interner::default();
        let s = syms.get_or_intern("x");
        let w = Wme::fuzzy(s, s, s, 0.25);
        assert_eq!(w.mu(), Some(0.25));
        w.set_mu(0.75);
        assert_eq!(w.mu(), Some(0.75));
        w.set_mu(1.5);
        assert_eq!(w.mu(), Some(1.0));
    }
}

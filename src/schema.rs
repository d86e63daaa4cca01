//! Schema checking
//!
//! Schemas describe the permitted shapes of WMEs per attribute. Checking is
//! advisory only: a mismatch produces a warning and the fact is asserted
//! anyway. Attributes with no registered schema pass silently.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use tracing::warn;

use crate::wme::{Interner, Sym};

#[derive(Clone, Debug)]
pub struct SchemaEntry {
    /// `None` means unconstrained.
    pub id: Option<Sym>,
    pub attr: Sym,
    /// `None` means unconstrained.
    pub val: Option<Sym>,
    pub description: String,
}

#[derive(Default)]
pub struct SchemaRegistry {
    enabled: bool,
    entries: Vec<SchemaEntry>,
    by_attr: HashMap<Sym, Vec<usize>>,
}

impl SchemaRegistry {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, ..Default::default() }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&mut self, entry: SchemaEntry) {
        self.by_attr.entry(entry.attr).or_default().push(self.entries.len());
        self.entries.push(entry);
    }

    /// Validate a triple against the schemas registered for its attribute.
    /// Returns whether it passed; a failure has already been warned about.
    pub fn check(&self, id: Sym, attr: Sym, val: Sym, syms: &Interner) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(indices) = self.by_attr.get(&attr) else {
            return true;
        };
        let ok = indices.iter().any(|&i| {
            let e = &self.entries[i];
            e.id.map_or(true, |s| s == id) && e.val.map_or(true, |s| s == val)
        });
        if !ok {
            warn!(
                "({} {} {}) matches no registered schema for attribute `{}`",
                syms.resolve(&id),
                syms.resolve(&attr),
                syms.resolve(&val),
                syms.resolve(&attr),
            );
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatches_warn_but_only_when_enabled() {
        let mut syms = Interner::default();
        let fly = syms.get_or_intern("fly");
        let can = syms.get_or_intern("can");
        let duck = syms.get_or_intern("duck");
        let nope = syms.get_or_intern("canitreally");

        let mut reg = SchemaRegistry::new(true);
        reg.add(SchemaEntry { id: None, attr: fly, val: Some(can), description: String::new() });

        assert!(reg.check(duck, fly, can, &syms));
        assert!(!reg.check(duck, fly, nope, &syms));

        // Unknown attribute: nothing to validate against.
        let other = syms.get_or_intern("is-a");
        assert!(reg.check(duck, other, can, &syms));

        reg.set_enabled(false);
        assert!(reg.check(duck, fly, nope, &syms));
    }

    #[test]
    fn constrained_id() {
        let mut syms = Interner::default();
        let fly = syms.get_or_intern("fly");
        let duck = syms.get_or_intern("duck");
        let dodo = syms.get_or_intern("dodo");
        let can = syms.get_or_intern("can");

        let mut reg = SchemaRegistry::new(true);
        reg.add(SchemaEntry {
            id: Some(duck),
            attr: fly,
            val: None,
            description: "only ducks".to_string(),
        });
        assert!(reg.check(duck, fly, can, &syms));
        assert!(!reg.check(dodo, fly, can, &syms));
    }
}

//! Rule inventory and stratification
//!
//! Productions arrive in source order, interleaved with stratum boundaries.
//! The book keeps a current-stratum cursor (starting at 0, bumped by each
//! boundary); every production lands in the stratum that was open when it
//! was declared, and in the global list in declaration order. Rule names
//! are unique across all strata; a duplicate is a fatal load error.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::matcher::{Condition, Pattern, ProdId};
use crate::wme::Sym;

#[derive(Debug, thiserror::Error)]
#[error("duplicate rule name `{0}`")]
pub struct DuplicateRule(pub String);

#[derive(Clone, Debug)]
pub struct ProductionSpec {
    pub name: Sym,
    pub lhs: Vec<Condition>,
    pub rhs: Option<Pattern>,
    pub stratum: usize,
    pub prod: ProdId,
}

pub struct RuleBook {
    specs: Vec<ProductionSpec>,
    strata: Vec<Vec<usize>>,
    by_name: HashMap<Sym, usize>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self { specs: Vec::new(), strata: vec![Vec::new()], by_name: HashMap::new() }
    }

    /// Index of the stratum currently open for declarations.
    pub fn current_stratum(&self) -> usize {
        self.strata.len() - 1
    }

    pub fn open_stratum(&mut self) {
        self.strata.push(Vec::new());
    }

    pub fn stratum_count(&self) -> usize {
        self.strata.len()
    }

    /// Append a production to the currently open stratum.
    pub fn add(
        &mut self,
        name: Sym,
        name_text: &str,
        lhs: Vec<Condition>,
        rhs: Option<Pattern>,
        prod: ProdId,
    ) -> Result<(), DuplicateRule> {
        if self.by_name.contains_key(&name) {
            return Err(DuplicateRule(name_text.to_string()));
        }
        let stratum = self.current_stratum();
        let idx = self.specs.len();
        self.specs.push(ProductionSpec { name, lhs, rhs, stratum, prod });
        self.strata[stratum].push(idx);
        self.by_name.insert(name, idx);
        Ok(())
    }

    /// All productions in declaration order.
    pub fn specs(&self) -> &[ProductionSpec] {
        &self.specs
    }

    pub fn get_by_name(&self, name: Sym) -> Option<&ProductionSpec> {
        self.by_name.get(&name).map(|&i| &self.specs[i])
    }

    pub fn stratum_of(&self, name: Sym) -> Option<usize> {
        self.get_by_name(name).map(|s| s.stratum)
    }
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new()
    }
}

//! Logic facade: tri-state evaluation, the fact base, and the contract the
//! symbolic engine fulfils for the runtime.
//!
//! The full rule engine lives outside this crate; the runtime only needs a
//! constant-folding evaluator (comparisons between constants are decidable,
//! anything symbolic is not) and a place to park facts received alongside
//! constraint requests.

use std::sync::{Arc, Mutex};

use crate::expr::{BinaryOpKind, Expr, FnCall};
use crate::recipe::RecipeDef;
use crate::value::apply_binary;

/// Three-valued truth: symbolic operands make a comparison undecidable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tribool {
    True,
    False,
    Indeterminate,
}

impl Tribool {
    pub fn is_true(self) -> bool {
        self == Tribool::True
    }

    pub fn is_indeterminate(self) -> bool {
        self == Tribool::Indeterminate
    }

    /// Kleene conjunction.
    pub fn and(self, other: Tribool) -> Tribool {
        match (self, other) {
            (Tribool::False, _) | (_, Tribool::False) => Tribool::False,
            (Tribool::True, Tribool::True) => Tribool::True,
            _ => Tribool::Indeterminate,
        }
    }

    /// Kleene disjunction.
    pub fn or(self, other: Tribool) -> Tribool {
        match (self, other) {
            (Tribool::True, _) | (_, Tribool::True) => Tribool::True,
            (Tribool::False, Tribool::False) => Tribool::False,
            _ => Tribool::Indeterminate,
        }
    }
}

impl From<bool> for Tribool {
    fn from(b: bool) -> Self {
        if b { Tribool::True } else { Tribool::False }
    }
}

/// Constant-folds an expression without touching any agent state.
///
/// Only constant-on-constant comparisons (and boolean combinations of them)
/// produce a decidable result; variables and function calls are symbolic
/// here and yield `Indeterminate`.
pub fn fold(expr: &Expr) -> Tribool {
    match expr {
        Expr::Const(v) => match v.as_bool() {
            Some(b) => b.into(),
            None => Tribool::Indeterminate,
        },
        Expr::Binary { op, left, right } => match op {
            BinaryOpKind::And => fold(left).and(fold(right)),
            BinaryOpKind::Or => fold(left).or(fold(right)),
            BinaryOpKind::Eq
            | BinaryOpKind::Neq
            | BinaryOpKind::Lt
            | BinaryOpKind::Lte
            | BinaryOpKind::Gt
            | BinaryOpKind::Gte => match (left.as_const(), right.as_const()) {
                (Some(l), Some(r)) => match apply_binary(*op, l, r) {
                    Ok(v) => v.as_bool().map(Tribool::from).unwrap_or(Tribool::Indeterminate),
                    Err(_) => Tribool::Indeterminate,
                },
                _ => Tribool::Indeterminate,
            },
            _ => Tribool::Indeterminate,
        },
        _ => Tribool::Indeterminate,
    }
}

/// Working set of facts, grouped by function name.
#[derive(Debug, Default)]
pub struct FactBase {
    facts: Mutex<Vec<(FnCall, String)>>,
}

impl FactBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fact with its origin. Duplicates are kept once.
    pub fn add(&self, fact: FnCall, origin: &str) -> bool {
        let mut facts = self.facts.lock().expect("fact base poisoned");
        if facts.iter().any(|(f, _)| *f == fact) {
            return false;
        }
        facts.push((fact, origin.to_string()));
        true
    }

    /// True if the fact is present verbatim, false if a same-named fact with
    /// different arguments is, indeterminate otherwise.
    pub fn matches(&self, fact: &FnCall) -> Tribool {
        let facts = self.facts.lock().expect("fact base poisoned");
        if facts.iter().any(|(f, _)| f == fact) {
            return Tribool::True;
        }
        if facts.iter().any(|(f, _)| f.name == fact.name) {
            return Tribool::False;
        }
        Tribool::Indeterminate
    }

    pub fn len(&self) -> usize {
        self.facts.lock().expect("fact base poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contract the symbolic engine fulfils for an agent.
///
/// `select_recipe` answers the question "which recipe fires for this goal";
/// the runtime does not care how the answer is computed.
pub trait LogicEngine: Send + Sync {
    fn add_fact(&self, fact: Expr, origin: &str);

    fn select_recipe(&self, goal: &Expr, unify: &[(Expr, Expr)]) -> Option<Arc<RecipeDef>>;

    fn evaluate(&self, expr: &Expr) -> Tribool;
}

/// Table-driven engine: recipes are keyed by the goal's head symbol.
///
/// Enough for generated agents whose recipes are selected by constraint
/// shape; a richer engine can be swapped in behind the same trait.
#[derive(Default)]
pub struct RecipeTable {
    recipes: Mutex<Vec<(String, Arc<RecipeDef>)>>,
    facts: FactBase,
}

impl RecipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Head symbol a goal is indexed under: the function name of a call, or
    /// the target variable of an equality constraint.
    pub fn goal_key(goal: &Expr) -> Option<String> {
        match goal {
            Expr::Call(f) => Some(f.name.clone()),
            Expr::Binary {
                op: BinaryOpKind::Eq,
                left,
                ..
            } => match left.as_ref() {
                Expr::Var(r) => Some(r.var.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn install(&self, key: impl Into<String>, recipe: Arc<RecipeDef>) {
        self.recipes
            .lock()
            .expect("recipe table poisoned")
            .push((key.into(), recipe));
    }

    pub fn facts(&self) -> &FactBase {
        &self.facts
    }
}

impl LogicEngine for RecipeTable {
    fn add_fact(&self, fact: Expr, origin: &str) {
        if let Expr::Call(f) = fact {
            self.facts.add(f, origin);
        }
    }

    fn select_recipe(&self, goal: &Expr, _unify: &[(Expr, Expr)]) -> Option<Arc<RecipeDef>> {
        let key = Self::goal_key(goal)?;
        self.recipes
            .lock()
            .expect("recipe table poisoned")
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, r)| r.clone())
    }

    fn evaluate(&self, expr: &Expr) -> Tribool {
        match expr {
            Expr::Call(f) => self.facts.matches(f),
            other => fold(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn constant_comparisons_are_decidable() {
        assert_eq!(fold(&Expr::eq(Expr::int(7), Expr::int(7))), Tribool::True);
        assert_eq!(fold(&Expr::lt(Expr::int(9), Expr::int(7))), Tribool::False);
    }

    #[test]
    fn symbolic_operands_are_indeterminate() {
        let e = Expr::eq(Expr::var("x"), Expr::int(7));
        assert_eq!(fold(&e), Tribool::Indeterminate);
    }

    #[test]
    fn kleene_combinations() {
        let decidable = Expr::eq(Expr::int(1), Expr::int(1));
        let symbolic = Expr::eq(Expr::var("x"), Expr::int(1));

        assert_eq!(
            fold(&Expr::and(decidable.clone(), symbolic.clone())),
            Tribool::Indeterminate
        );
        // A false conjunct decides the conjunction regardless of the rest.
        let falsy = Expr::eq(Expr::int(1), Expr::int(2));
        assert_eq!(fold(&Expr::and(falsy.clone(), symbolic.clone())), Tribool::False);
        assert_eq!(
            fold(&Expr::binary(BinaryOpKind::Or, decidable, symbolic)),
            Tribool::True
        );
    }

    #[test]
    fn fact_base_three_way_match() {
        let base = FactBase::new();
        base.add(FnCall::new("at", vec![Expr::str("dock")]), "pos");

        assert_eq!(
            base.matches(&FnCall::new("at", vec![Expr::str("dock")])),
            Tribool::True
        );
        assert_eq!(
            base.matches(&FnCall::new("at", vec![Expr::str("lab")])),
            Tribool::False
        );
        assert_eq!(
            base.matches(&FnCall::new("holds", vec![])),
            Tribool::Indeterminate
        );
    }

    #[test]
    fn duplicate_facts_are_kept_once() {
        let base = FactBase::new();
        assert!(base.add(FnCall::new("at", vec![]), "a"));
        assert!(!base.add(FnCall::new("at", vec![]), "b"));
        assert_eq!(base.len(), 1);
    }
}

//! Scope mask engine: pure predicates deciding whether a policy row reaches
//! an administrative unit on a given date.

use chrono::NaiveDate;
use panel_schema::{AdminUnit, PolicyRecord, PolicyScope, ADM_SLOTS};

/// How a policy scope relates to an analysis unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRelation {
    /// The scope includes the whole unit.
    Covers,
    /// The scope names a strict sub-region of the unit.
    SubRegion,
    /// The scope names a different branch of the hierarchy.
    Disjoint,
}

pub fn relation(unit: &AdminUnit, scope: &PolicyScope) -> ScopeRelation {
    for (level, name) in unit.names().iter().enumerate() {
        if !scope.name_at(level).admits(name) {
            return ScopeRelation::Disjoint;
        }
    }
    if scope.specificity_level() > unit.level() {
        ScopeRelation::SubRegion
    } else {
        ScopeRelation::Covers
    }
}

/// Temporal and scope containment. Rows scoped below `unit` never apply to it.
pub fn applies(unit: &AdminUnit, policy: &PolicyRecord, date: NaiveDate) -> bool {
    policy.is_active_on(date) && relation(unit, &policy.scope) == ScopeRelation::Covers
}

/// True when every unit reached by `inner` is also reached by `outer`.
pub fn is_contained_in(inner: &PolicyScope, outer: &PolicyScope) -> bool {
    (0..ADM_SLOTS).all(|level| {
        let outer_name = outer.name_at(level);
        outer_name.is_all() || outer_name == inner.name_at(level)
    })
}

/// Rows of `category` active on `date` that either cover `unit` or target one
/// of its sub-regions. This is the candidate set the aggregator resolves.
pub fn collect_applicable<'p>(
    unit: &AdminUnit,
    date: NaiveDate,
    category: &str,
    policies: &'p [PolicyRecord],
) -> Vec<&'p PolicyRecord> {
    policies
        .iter()
        .filter(|policy| {
            policy.category == category
                && policy.is_active_on(date)
                && relation(unit, &policy.scope) != ScopeRelation::Disjoint
        })
        .collect()
}

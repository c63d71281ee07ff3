//! Deterministic bundle execution order.
//!
//! Kahn's algorithm over `depends_on` edges between present bundles. Among
//! bundles that are ready at the same time, the document's `bundle_order`
//! hint wins, then the wire name. When only cyclic bundles remain, every
//! bundle on a cycle is emitted, flagged, and treated as resolved so its
//! dependents still get an ordered slot.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::bundle::BundleKind;

/// Result of ordering the bundles of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    /// Every present bundle, dependencies first
    pub order: Vec<BundleKind>,
    /// Bundles that sit on a dependency cycle
    pub cyclic: BTreeSet<BundleKind>,
}

type ReadyKey = (usize, &'static str, BundleKind);

fn ready_key(kind: BundleKind, hint: &impl Fn(BundleKind) -> Option<usize>) -> ReadyKey {
    (hint(kind).unwrap_or(usize::MAX), kind.wire_name(), kind)
}

/// Order `deps` (bundle → its dependencies). Dependencies on bundles that
/// are not keys of `deps` are ignored.
pub fn execution_order(
    deps: &BTreeMap<BundleKind, Vec<BundleKind>>,
    hint: impl Fn(BundleKind) -> Option<usize>,
) -> Ordering {
    // dependency -> dependents, restricted to present bundles
    let mut downstream: BTreeMap<BundleKind, Vec<BundleKind>> = BTreeMap::new();
    let mut in_degree: BTreeMap<BundleKind, usize> = deps.keys().map(|k| (*k, 0)).collect();
    for (&kind, upstream) in deps {
        for dep in upstream {
            if deps.contains_key(dep) {
                downstream.entry(*dep).or_default().push(kind);
                *in_degree.entry(kind).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<ReadyKey> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(kind, _)| ready_key(*kind, &hint))
        .collect();
    let mut done: BTreeSet<BundleKind> = BTreeSet::new();
    let mut result = Ordering::default();

    let resolve = |kind: BundleKind,
                       in_degree: &mut BTreeMap<BundleKind, usize>,
                       ready: &mut BTreeSet<ReadyKey>| {
        for dependent in downstream.get(&kind).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                if *deg > 0 {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(ready_key(*dependent, &hint));
                    }
                }
            }
        }
    };

    while done.len() < in_degree.len() {
        if let Some(next) = ready.pop_first() {
            let kind = next.2;
            if !done.insert(kind) {
                continue;
            }
            result.order.push(kind);
            resolve(kind, &mut in_degree, &mut ready);
            continue;
        }

        // Stuck: everything left waits on a cycle.
        let remaining: BTreeSet<BundleKind> = in_degree
            .keys()
            .filter(|k| !done.contains(*k))
            .copied()
            .collect();
        let mut on_cycle: Vec<ReadyKey> = remaining
            .iter()
            .filter(|k| reaches(**k, **k, &downstream, &remaining))
            .map(|k| ready_key(*k, &hint))
            .collect();
        on_cycle.sort();
        if on_cycle.is_empty() {
            break;
        }
        for (_, _, kind) in on_cycle {
            done.insert(kind);
            result.cyclic.insert(kind);
            result.order.push(kind);
            in_degree.insert(kind, 0);
            resolve(kind, &mut in_degree, &mut ready);
        }
    }
    result
}

/// Whether `to` is reachable from `from` through at least one edge, staying
/// inside `within`.
fn reaches(
    from: BundleKind,
    to: BundleKind,
    downstream: &BTreeMap<BundleKind, Vec<BundleKind>>,
    within: &BTreeSet<BundleKind>,
) -> bool {
    let mut stack: Vec<BundleKind> = downstream.get(&from).cloned().unwrap_or_default();
    let mut seen = BTreeSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !within.contains(&node) || !seen.insert(node) {
            continue;
        }
        stack.extend(downstream.get(&node).into_iter().flatten().copied());
    }
    false
}

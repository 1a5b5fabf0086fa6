//! Call tree reconstruction
//!
//! Calls arrive as a flat parent-pointer map. [`topological_sort`] orders them
//! children-before-parents, tolerating parents that were never recorded (external roots)
//! and cycles; [`CallTree`] builds the navigable tree on top of it.

use crate::call::Call;
use std::collections::{HashMap, HashSet};

/// Order call ids so that every call appears after all of its descendants.
///
/// `parents` maps each call id to its parent id. Parents that are not keys are treated as
/// already resolved, making their children roots. Ids that can never be resolved (cycles)
/// are emitted as one extra level. Ids within a level are sorted, so the output is
/// deterministic.
pub fn topological_sort(parents: &HashMap<String, Option<String>>) -> Vec<String> {
    let mut resolved: HashSet<&str> = parents
        .values()
        .flatten()
        .map(String::as_str)
        .filter(|parent| !parents.contains_key(*parent))
        .collect();
    let mut pending: HashSet<&str> = parents.keys().map(String::as_str).collect();
    let mut levels: Vec<Vec<&str>> = Vec::new();

    while !pending.is_empty() {
        let mut level: Vec<&str> = pending
            .iter()
            .copied()
            .filter(|id| match &parents[*id] {
                None => true,
                Some(parent) => resolved.contains(parent.as_str()),
            })
            .collect();

        if level.is_empty() {
            // Only cycles are left
            level = pending.drain().collect();
        } else {
            for id in &level {
                pending.remove(id);
            }
        }

        level.sort_unstable();
        resolved.extend(level.iter().copied());
        levels.push(level);
    }

    levels
        .into_iter()
        .rev()
        .flatten()
        .map(str::to_string)
        .collect()
}

/// A set of calls arranged by parent linkage
#[derive(Debug, Clone)]
pub struct CallTree {
    calls: HashMap<String, Call>,
    children: HashMap<String, Vec<String>>,
    roots: Vec<String>,
    order: Vec<String>,
}

impl CallTree {
    pub fn new(calls: impl IntoIterator<Item = Call>) -> Self {
        let calls: HashMap<String, Call> = calls.into_iter().map(|c| (c.id.clone(), c)).collect();

        let parents: HashMap<String, Option<String>> = calls
            .values()
            .map(|c| (c.id.clone(), c.parent_id.clone()))
            .collect();
        let order = topological_sort(&parents);

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots = Vec::new();
        for call in calls.values() {
            match call.parent_id.as_deref().filter(|p| calls.contains_key(*p)) {
                Some(parent) => children
                    .entry(parent.to_string())
                    .or_default()
                    .push(call.id.clone()),
                None => roots.push(call.id.clone()),
            }
        }

        let by_start = |a: &String, b: &String| {
            let (ca, cb) = (&calls[a], &calls[b]);
            ca.started_at.cmp(&cb.started_at).then_with(|| a.cmp(b))
        };
        roots.sort_by(by_start);
        for siblings in children.values_mut() {
            siblings.sort_by(by_start);
        }

        Self {
            calls,
            children,
            roots,
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn get(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    /// Calls with no recorded parent, by start time
    pub fn roots(&self) -> impl Iterator<Item = &Call> {
        self.roots.iter().map(|id| &self.calls[id])
    }

    /// Direct children of a call, by start time
    pub fn children(&self, call_id: &str) -> impl Iterator<Item = &Call> {
        self.children
            .get(call_id)
            .into_iter()
            .flatten()
            .map(|id| &self.calls[id])
    }

    /// Number of recorded ancestors; roots have depth 0
    pub fn depth(&self, call_id: &str) -> Option<usize> {
        let mut call = self.calls.get(call_id)?;
        let mut seen = HashSet::from([call_id]);
        let mut depth = 0;

        while let Some(parent) = call.parent_id.as_deref().and_then(|p| self.calls.get(p)) {
            if !seen.insert(parent.id.as_str()) {
                break;
            }
            depth += 1;
            call = parent;
        }
        Some(depth)
    }

    /// Every call, children before their parents
    pub fn deepest_first(&self) -> impl Iterator<Item = &Call> {
        self.order.iter().map(|id| &self.calls[id])
    }

    /// Calls not reachable from any root (members of parent cycles)
    pub fn detached(&self) -> Vec<&Call> {
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.roots.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                if let Some(children) = self.children.get(id) {
                    stack.extend(children.iter().map(String::as_str));
                }
            }
        }

        self.order
            .iter()
            .filter(|id| !reachable.contains(id.as_str()))
            .map(|id| &self.calls[id])
            .collect()
    }

    /// Fold values bottom-up: each call's value is `leaf(call)` merged with the values
    /// of its children.
    pub fn fold_up<T, L, M>(&self, leaf: L, mut merge: M) -> HashMap<String, T>
    where
        T: Clone,
        L: Fn(&Call) -> T,
        M: FnMut(&mut T, &T),
    {
        let mut values: HashMap<String, T> = HashMap::with_capacity(self.calls.len());
        for call in self.deepest_first() {
            let mut value = leaf(call);
            for child in self.children.get(&call.id).into_iter().flatten() {
                // Cycle members may not have been folded yet
                if let Some(child_value) = values.get(child) {
                    merge(&mut value, child_value);
                }
            }
            values.insert(call.id.clone(), value);
        }
        values
    }
}

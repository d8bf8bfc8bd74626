use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::definition::{DeclaredView, QualifiedName};
use crate::error::{ViewSyncError, ViewSyncResult};

/// Dependency graph over one set of declared views
///
/// Edges point from a view to the views it reads from. A dependency naming
/// something outside the set (a base table, an unregistered view, a view
/// filtered out of this run) is treated as already satisfied.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<QualifiedName>,
    index: HashMap<QualifiedName, usize>,
    /// in-set dependencies of each node
    dependencies: Vec<Vec<usize>>,
    /// in-set dependants of each node
    dependants: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Nodes and edges, with node position as the declaration order
    pub fn new<'a, I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (&'a QualifiedName, &'a BTreeSet<QualifiedName>)>,
    {
        let nodes: Vec<_> = nodes.into_iter().collect();
        let names: Vec<QualifiedName> = nodes.iter().map(|(name, _)| (*name).clone()).collect();
        let index: HashMap<QualifiedName, usize> =
            names.iter().enumerate().map(|(i, name)| (name.clone(), i)).collect();

        let mut dependencies = vec![Vec::new(); names.len()];
        let mut dependants = vec![Vec::new(); names.len()];
        for (i, (_, deps)) in nodes.iter().enumerate() {
            for dep in deps.iter() {
                if let Some(&j) = index.get(dep) {
                    dependencies[i].push(j);
                    dependants[j].push(i);
                }
            }
        }

        Self {
            names,
            index,
            dependencies,
            dependants,
        }
    }

    pub fn from_views<'a>(views: impl IntoIterator<Item = &'a DeclaredView>) -> Self {
        Self::new(views.into_iter().map(|v| (&v.name, &v.dependencies)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Dependencies before dependants; ties broken by declaration order
    ///
    /// ALGORITHM: Kahn's algorithm with a min-heap on declaration position,
    /// which makes the result a pure function of the input.
    ///
    /// # Errors
    /// `CyclicDependency` naming the members of one cycle, first member
    /// repeated at the end
    pub fn build_order(&self) -> ViewSyncResult<Vec<QualifiedName>> {
        Ok(self.sorted_indices()?.into_iter().map(|i| self.names[i].clone()).collect())
    }

    /// Exact reverse of `build_order`: dependants before their dependencies
    pub fn teardown_order(&self) -> ViewSyncResult<Vec<QualifiedName>> {
        let mut order = self.build_order()?;
        order.reverse();
        Ok(order)
    }

    /// Everything that transitively reads from `name`, in build order
    pub fn dependants_of(&self, name: &QualifiedName) -> ViewSyncResult<Vec<QualifiedName>> {
        self.reachable(name, &self.dependants)
    }

    /// Everything `name` transitively reads from, in build order
    pub fn dependencies_of(&self, name: &QualifiedName) -> ViewSyncResult<Vec<QualifiedName>> {
        self.reachable(name, &self.dependencies)
    }

    fn reachable(&self, name: &QualifiedName, edges: &[Vec<usize>]) -> ViewSyncResult<Vec<QualifiedName>> {
        let start = *self.index.get(name).ok_or_else(|| ViewSyncError::NotRegistered {
            name: name.to_string(),
        })?;

        let mut seen = vec![false; self.names.len()];
        let mut stack = edges[start].clone();
        while let Some(i) = stack.pop() {
            if !seen[i] {
                seen[i] = true;
                stack.extend(edges[i].iter().copied());
            }
        }
        seen[start] = false;

        Ok(self
            .sorted_indices()?
            .into_iter()
            .filter(|&i| seen[i])
            .map(|i| self.names[i].clone())
            .collect())
    }

    fn sorted_indices(&self) -> ViewSyncResult<Vec<usize>> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &k in &self.dependants[i] {
                pending[k] -= 1;
                if pending[k] == 0 {
                    ready.push(Reverse(k));
                }
            }
        }

        if order.len() < self.names.len() {
            return Err(ViewSyncError::CyclicDependency {
                cycle: self.find_cycle(&pending),
            });
        }
        Ok(order)
    }

    /// Walk unresolved edges from the earliest stuck node until a node repeats.
    ///
    /// Every stuck node has at least one stuck dependency, so the walk always
    /// closes.
    fn find_cycle(&self, pending: &[usize]) -> Vec<String> {
        let stuck = |i: usize| pending[i] > 0;
        let Some(start) = (0..self.names.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut position = HashMap::from([(start, 0usize)]);
        let mut current = start;
        loop {
            let Some(next) = self.dependencies[current].iter().copied().filter(|&j| stuck(j)).min() else {
                break;
            };
            if let Some(&at) = position.get(&next) {
                let mut cycle: Vec<String> = path[at..].iter().map(|&i| self.names[i].to_string()).collect();
                cycle.push(self.names[next].to_string());
                return cycle;
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter().map(|&i| self.names[i].to_string()).collect()
    }
}

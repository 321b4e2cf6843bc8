//! In-run grouping of candidates that describe the same offer.

use crate::matcher::{Candidate, DedupMatcher};

/// Union-find over candidate indices.
#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = index;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns false when both were already in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }
}

/// Group candidates by transitive match.
///
/// Members of each cluster are in input order, and clusters are ordered by their first
/// member, so the first index of a cluster is also its earliest sighting.
pub fn cluster_candidates(candidates: &[Candidate], matcher: &DedupMatcher) -> Vec<Vec<usize>> {
    let mut sets = DisjointSet::new(candidates.len());
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            if sets.find(i) == sets.find(j) {
                continue;
            }
            if matcher.compare_candidates(&candidates[i], &candidates[j]).is_some() {
                sets.union(i, j);
            }
        }
    }

    let mut slot_of_root: Vec<Option<usize>> = vec![None; candidates.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for index in 0..candidates.len() {
        let root = sets.find(index);
        match slot_of_root[root] {
            Some(slot) => clusters[slot].push(index),
            None => {
                slot_of_root[root] = Some(clusters.len());
                clusters.push(vec![index]);
            }
        }
    }
    clusters
}

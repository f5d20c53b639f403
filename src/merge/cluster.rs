//! Per-frame clustering of annotations and quorum resolution.

use crate::dataset::{Annotation, BBox};
use std::collections::{HashMap, HashSet};

/// Disjoint sets over `0..n` with path compression and union by rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    pub fn union(&mut self, x: usize, y: usize) {
        let (root_x, root_y) = (self.find(x), self.find(y));
        if root_x == root_y {
            return;
        }
        match self.rank[root_x].cmp(&self.rank[root_y]) {
            std::cmp::Ordering::Greater => self.parent[root_y] = root_x,
            std::cmp::Ordering::Less => self.parent[root_x] = root_y,
            std::cmp::Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
    }

    /// Members of every set, ordered by their smallest element.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut index: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for x in 0..self.parent.len() {
            let root = self.find(x);
            let slot = *index.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(x);
        }
        groups
    }
}

/// Group annotations into connected components of the "same label and
/// distance <= `max_distance`" graph. Returns indices into `annotations`.
pub fn cluster(annotations: &[Annotation], max_distance: f64) -> Vec<Vec<usize>> {
    let mut sets = UnionFind::new(annotations.len());
    for (i, a) in annotations.iter().enumerate() {
        for (j, b) in annotations.iter().enumerate().skip(i + 1) {
            if a.label_id == b.label_id && a.bbox.distance(&b.bbox) <= max_distance {
                sets.union(i, j);
            }
        }
    }
    sets.groups()
}

/// Number of distinct sources contributing to a cluster.
pub fn support(members: &[&Annotation]) -> usize {
    members
        .iter()
        .filter_map(|ann| ann.source_id)
        .collect::<HashSet<_>>()
        .len()
}

/// Collapse a cluster into one annotation: mean box, mean confidence,
/// majority occlusion, group kept only when unanimous.
pub fn resolve(members: &[&Annotation]) -> Option<Annotation> {
    let first = members.first()?;
    let n = members.len() as f64;

    let (mut x, mut y, mut w, mut h, mut confidence) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let mut occluded_votes = 0usize;
    for ann in members {
        x += ann.bbox.x;
        y += ann.bbox.y;
        w += ann.bbox.w;
        h += ann.bbox.h;
        confidence += ann.confidence;
        if ann.occluded {
            occluded_votes += 1;
        }
    }

    let group_id = first
        .group_id
        .filter(|group| members.iter().all(|ann| ann.group_id == Some(*group)));

    Some(Annotation {
        label_id: first.label_id,
        bbox: BBox::new(x / n, y / n, w / n, h / n),
        occluded: occluded_votes * 2 > members.len(),
        group_id,
        confidence: confidence / n,
        source_id: None,
    })
}

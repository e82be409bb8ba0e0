//! Redundancy report construction.
//!
//! Turns a flat list of [`SimilarityMatch`]es into clusters of redundant
//! units. Clusters are the connected components of the match graph (computed
//! with union-find), so `a ~ b` and `b ~ c` put `a`, `b`, and `c` together
//! even when `a` and `c` never matched directly.
//!
//! Within a cluster the unit indexed earliest is the canonical consolidation
//! target. Each other member is scored against that canonical unit: by their
//! direct match when one exists, otherwise by the weakest link on the
//! strongest chain of matches joining them. Only a direct match at or above
//! the merge cutoff earns [`SuggestedAction::Merge`]. Everything else,
//! including a member reached purely through transitivity, gets
//! [`SuggestedAction::Review`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{SimilarityMatch, UnitRef};

/// Default score at or above which a member is suggested for merging.
pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Merge,
    Review,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub unit: UnitRef,
    pub score: f32,
    pub action: SuggestedAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub canonical: UnitRef,
    pub members: Vec<ClusterMember>,
}

impl Cluster {
    /// Identities of the canonical unit and all members.
    pub fn identities(&self) -> Vec<&str> {
        std::iter::once(self.canonical.identity.as_str())
            .chain(self.members.iter().map(|m| m.unit.identity.as_str()))
            .collect()
    }
}

/// A unit that could not be analysed during a corpus run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub source_file: String,
    /// `None` when the whole document failed before segmentation.
    pub source_index: Option<usize>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundancyReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub scope: String,
    pub threshold: f32,
    pub merge_threshold: f32,
    /// Documents whose units were all analysed before the run ended.
    pub files_analyzed: usize,
    pub units_analyzed: usize,
    pub cancelled: bool,
    pub clusters: Vec<Cluster>,
    pub failures: Vec<UnitFailure>,
}

impl RedundancyReport {
    /// Cluster containing `identity`, if any.
    pub fn cluster_of(&self, identity: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.identities().contains(&identity))
    }

    /// Number of non-canonical units across all clusters.
    pub fn redundant_units(&self) -> usize {
        self.clusters.iter().map(|c| c.members.len()).sum()
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            files_analyzed: self.files_analyzed,
            units_analyzed: self.units_analyzed,
            redundant_units: self.redundant_units(),
            clusters: self.clusters.len(),
            failures: self.failures.len(),
            cancelled: self.cancelled,
        }
    }
}

/// Headline counts of a [`RedundancyReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub files_analyzed: usize,
    pub units_analyzed: usize,
    pub redundant_units: usize,
    pub clusters: usize,
    pub failures: usize,
    pub cancelled: bool,
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Build a report from matches. Matches scoring below `threshold` are ignored.
pub fn build_report(
    matches: &[SimilarityMatch],
    scope: &str,
    threshold: f32,
    merge_threshold: f32,
) -> RedundancyReport {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut nodes: Vec<UnitRef> = Vec::new();
    // Strongest score per unordered pair; two-pass runs report each pair twice.
    let mut edges: HashMap<(usize, usize), f32> = HashMap::new();

    let mut node_for = |unit: &UnitRef| -> usize {
        let id = match index.get(unit.identity.as_str()) {
            Some(&id) => id,
            None => {
                nodes.push(unit.clone());
                let id = nodes.len() - 1;
                index.insert(unit.identity.clone(), id);
                id
            }
        };
        // The same unit may be seen unindexed (as a query) and indexed.
        if nodes[id].indexed_at.is_none() && unit.indexed_at.is_some() {
            nodes[id] = unit.clone();
        }
        id
    };

    for m in matches {
        if m.score < threshold || m.query.identity == m.candidate.identity {
            continue;
        }
        let q = node_for(&m.query);
        let c = node_for(&m.candidate);
        let score = edges.entry((q.min(c), q.max(c))).or_insert(m.score);
        *score = score.max(m.score);
    }

    let mut sets = DisjointSet::new(nodes.len());
    let mut adjacency: HashMap<usize, Vec<(usize, f32)>> = HashMap::new();
    for (&(a, b), &score) in &edges {
        sets.union(a, b);
        adjacency.entry(a).or_default().push((b, score));
        adjacency.entry(b).or_default().push((a, score));
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for id in 0..nodes.len() {
        groups.entry(sets.find(id)).or_default().push(id);
    }

    let mut clusters: Vec<Cluster> = groups
        .into_values()
        .filter(|g| g.len() > 1)
        .map(|mut group| {
            group.sort_by(|&a, &b| nodes[a].age_key().cmp(&nodes[b].age_key()));
            let canon = group[0];
            let widths = widest_paths(canon, &adjacency);
            let members = group[1..]
                .iter()
                .map(|&id| {
                    let direct = edges.get(&(canon.min(id), canon.max(id))).copied();
                    let score = direct
                        .or_else(|| widths.get(&id).copied())
                        .unwrap_or(0.0);
                    let action = match direct {
                        Some(s) if s >= merge_threshold => SuggestedAction::Merge,
                        _ => SuggestedAction::Review,
                    };
                    ClusterMember {
                        unit: nodes[id].clone(),
                        score,
                        action,
                    }
                })
                .collect();
            Cluster {
                canonical: nodes[canon].clone(),
                members,
            }
        })
        .collect();
    clusters.sort_by(|a, b| a.canonical.age_key().cmp(&b.canonical.age_key()));

    RedundancyReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        generated_at: Utc::now(),
        scope: scope.to_string(),
        threshold,
        merge_threshold,
        files_analyzed: 0,
        units_analyzed: 0,
        cancelled: false,
        clusters,
        failures: Vec::new(),
    }
}

/// Maximin path strength from `source` to every node reachable from it.
fn widest_paths(source: usize, adjacency: &HashMap<usize, Vec<(usize, f32)>>) -> HashMap<usize, f32> {
    let mut width: HashMap<usize, f32> = HashMap::from([(source, f32::INFINITY)]);
    let mut settled: HashSet<usize> = HashSet::new();
    loop {
        let next = width
            .iter()
            .filter(|(id, _)| !settled.contains(*id))
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(&id, &w)| (id, w));
        let Some((id, w)) = next else { break };
        settled.insert(id);
        for &(to, score) in adjacency.get(&id).into_iter().flatten() {
            if settled.contains(&to) {
                continue;
            }
            let through = w.min(score);
            let slot = width.entry(to).or_insert(f32::NEG_INFINITY);
            if through > *slot {
                *slot = through;
            }
        }
    }
    width
}

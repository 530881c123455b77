use petgraph::algo::{connected_components, is_isomorphic_matching};
use petgraph::graph::{NodeIndex, UnGraph};

use crate::core::chemistry::{BondCutoffs, BondingRule};
use crate::core::domain::{Geometry, ADSORBATE_TAG};
use crate::core::error::{PipelineError, Result};
use crate::core::spatial;

/// Vertex of a bond graph: one atom in fingerprint scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondNode {
    pub symbol: String,
    pub tag: u32,
    /// Position of the atom in the source geometry.
    pub atom_index: usize,
}

/// Cheap isomorphism invariants used to bucket graphs before the full test.
///
/// Each entry is (species, degree, sorted neighbour species); the sorted
/// list of entries subsumes atom count, species multiset and degree sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphInvariants {
    pub node_count: usize,
    pub edge_count: usize,
    pub environments: Vec<(String, usize, Vec<String>)>,
}

/// Bonding topology of one structure: atoms as vertices, an edge wherever
/// the interatomic distance is below the species-pair cutoff.
#[derive(Debug, Clone)]
pub struct BondGraph {
    graph: UnGraph<BondNode, ()>,
    invariants: GraphInvariants,
}

impl BondGraph {
    pub fn graph(&self) -> &UnGraph<BondNode, ()> {
        &self.graph
    }

    pub fn invariants(&self) -> &GraphInvariants {
        &self.invariants
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Structural equivalence: a species-preserving bijection of vertices
    /// that preserves adjacency.
    pub fn is_equivalent(&self, other: &BondGraph) -> bool {
        self.invariants == other.invariants
            && is_isomorphic_matching(
                &self.graph,
                &other.graph,
                |a: &BondNode, b: &BondNode| a.symbol == b.symbol,
                |_: &(), _: &()| true,
            )
    }

    /// Whether the adsorbate atoms form one joined nanocluster. Two
    /// adsorbate atoms are joined when their shortest bond path is at most
    /// two, i.e. directly bonded or sharing a neighbour.
    pub fn is_adsorbate_joined(&self) -> bool {
        let adsorbate: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.graph[n].tag == ADSORBATE_TAG)
            .collect();
        if adsorbate.len() <= 1 {
            return true;
        }

        let neighbours: Vec<Vec<NodeIndex>> = adsorbate
            .iter()
            .map(|&n| {
                let mut v: Vec<NodeIndex> = self.graph.neighbors(n).collect();
                v.sort();
                v
            })
            .collect();

        let mut joined = UnGraph::<(), ()>::with_capacity(adsorbate.len(), 0);
        let local: Vec<NodeIndex> = adsorbate.iter().map(|_| joined.add_node(())).collect();

        for i in 0..adsorbate.len() {
            for j in (i + 1)..adsorbate.len() {
                let bonded = neighbours[i].binary_search(&adsorbate[j]).is_ok();
                let shared = neighbours[i].iter().any(|n| neighbours[j].binary_search(n).is_ok());
                if bonded || shared {
                    joined.add_edge(local[i], local[j], ());
                }
            }
        }

        connected_components(&joined) == 1
    }
}

/// Builds the bond graph of `geometry` under `rule`.
///
/// Deterministic: identical geometry always gives an identical graph.
/// Fails on malformed geometry (no atoms, non-finite coordinates, nothing in
/// fingerprint scope) or a species without a cutoff.
pub fn fingerprint(geometry: &Geometry, cutoffs: &BondCutoffs, rule: &BondingRule) -> Result<BondGraph> {
    geometry.validate()?;

    let mut graph = UnGraph::<BondNode, ()>::default();
    let mut species_ids = Vec::new();
    let mut nodes = Vec::new();

    for (i, atom) in geometry.atoms.iter().enumerate() {
        if atom.tag > rule.max_tag {
            continue;
        }
        let id = cutoffs
            .species_index(&atom.symbol)
            .ok_or_else(|| PipelineError::config(format!("no bond cutoff for species '{}'", atom.symbol)))?;
        species_ids.push(id);
        nodes.push(graph.add_node(BondNode {
            symbol: atom.symbol.clone(),
            tag: atom.tag,
            atom_index: i,
        }));
    }

    if nodes.is_empty() {
        return Err(PipelineError::config(format!(
            "no atoms with tag <= {} to fingerprint",
            rule.max_tag
        )));
    }

    let lattice = geometry.lattice.as_ref();
    for a in 0..nodes.len() {
        for b in (a + 1)..nodes.len() {
            let pa = &geometry.atoms[graph[nodes[a]].atom_index].position;
            let pb = &geometry.atoms[graph[nodes[b]].atom_index].position;
            let dist_sq = spatial::distance_sq(pa, pb, lattice);
            if dist_sq < cutoffs.get_cutoff_sq(species_ids[a], species_ids[b]) {
                graph.add_edge(nodes[a], nodes[b], ());
            }
        }
    }

    let invariants = invariants_of(&graph);
    Ok(BondGraph { graph, invariants })
}

fn invariants_of(graph: &UnGraph<BondNode, ()>) -> GraphInvariants {
    let mut environments: Vec<(String, usize, Vec<String>)> = graph
        .node_indices()
        .map(|n| {
            let mut around: Vec<String> = graph.neighbors(n).map(|m| graph[m].symbol.clone()).collect();
            around.sort();
            (graph[n].symbol.clone(), around.len(), around)
        })
        .collect();
    environments.sort();

    GraphInvariants {
        node_count: graph.node_count(),
        edge_count: graph.edge_count(),
        environments,
    }
}

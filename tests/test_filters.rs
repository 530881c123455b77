mod common;

use cluster_funnel::analysis::filters::{energy_filter, graph_filter, joined_filter};
use cluster_funnel::core::chemistry::BondingRule;
use std::collections::HashMap;

use cluster_funnel::core::domain::{Atom, Geometry, Structure};
use cluster_funnel::core::error::PipelineError;
use cluster_funnel::core::spatial;
use common::*;
use nalgebra::Point3;
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn rule() -> BondingRule {
    BondingRule::new(TOLERANCE)
}

// --- Energy Filter ---

#[test]
fn test_energy_window() {
    let records: Vec<_> = [-10.0, -9.5, -9.0, -8.0, -7.0]
        .into_iter()
        .map(|e| evaluated(linear(), e))
        .collect();

    let kept = energy_filter(&records, 1.0).unwrap();
    let energies: Vec<f64> = kept.iter().filter_map(|r| r.energy()).collect();
    assert_eq!(energies, vec![-10.0, -9.5, -9.0]);

    // Boundary is inclusive
    let kept = energy_filter(&records, 2.0).unwrap();
    assert_eq!(kept.len(), 4);
}

#[test]
fn test_energy_filter_rejects_bad_input() {
    let records = vec![evaluated(linear(), -10.0)];
    assert!(matches!(energy_filter(&records, -0.1), Err(PipelineError::Configuration(_))));
    assert!(matches!(energy_filter(&records, f64::NAN), Err(PipelineError::Configuration(_))));

    let records = vec![evaluated(linear(), -10.0), record(triangle(), None)];
    assert!(matches!(energy_filter(&records, 1.0), Err(PipelineError::Configuration(_))));
}

#[test]
fn test_energy_filter_empty() {
    assert!(energy_filter(&[], 1.0).unwrap().is_empty());
}

proptest! {
    #[test]
    fn prop_energy_filter_keeps_exactly_the_window(
        energies in prop::collection::vec(-20.0f64..0.0, 1..20),
        threshold in 0.0f64..5.0,
    ) {
        let records: Vec<_> = energies.iter().map(|&e| evaluated(linear(), e)).collect();
        let kept = energy_filter(&records, threshold).unwrap();

        let e_min = energies.iter().copied().fold(f64::INFINITY, f64::min);
        let expected = energies.iter().filter(|&&e| e <= e_min + threshold).count();
        prop_assert_eq!(kept.len(), expected);
        for r in &kept {
            prop_assert!(r.energy().unwrap() <= e_min + threshold);
        }
    }
}

// --- Graph Filter ---

#[test]
fn test_graph_filter_keeps_lowest_energy() {
    let low = evaluated(linear(), -10.0);
    let high = evaluated(linear_perturbed(), -9.8);
    let rmsd = spatial::rmsd(low.geometry(), high.geometry()).unwrap();
    assert!((rmsd - 0.3).abs() < 1e-9);

    let kept = graph_filter(&[high, low.clone()], &rule()).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].id(), low.id());
    assert_eq!(kept[0].energy(), Some(-10.0));
}

#[test]
fn test_graph_filter_keeps_distinct_topologies() {
    let records = vec![
        evaluated(triangle(), -9.5),
        evaluated(linear(), -10.0),
        evaluated(linear_perturbed(), -9.8),
        evaluated(triangle(), -8.0),
    ];
    let kept = graph_filter(&records, &rule()).unwrap();
    let energies: Vec<f64> = kept.iter().filter_map(|r| r.energy()).collect();
    assert_eq!(energies, vec![-10.0, -9.5]);
}

#[test]
fn test_graph_filter_idempotent_and_order_independent() {
    let records = vec![
        evaluated(triangle(), -9.5),
        evaluated(linear(), -9.0),
        evaluated(linear_perturbed(), -9.0),
        evaluated(triangle(), -9.5),
        record(split(), None),
    ];

    let once = graph_filter(&records, &rule()).unwrap();
    let twice = graph_filter(&once, &rule()).unwrap();
    assert_eq!(once, twice);

    let mut reversed = records.clone();
    reversed.reverse();
    let from_reversed = graph_filter(&reversed, &rule()).unwrap();
    let ids: Vec<_> = once.iter().map(|r| r.id()).collect();
    let ids_rev: Vec<_> = from_reversed.iter().map(|r| r.id()).collect();
    assert_eq!(ids, ids_rev);
}

#[test]
fn test_graph_filter_errors() {
    let records = vec![evaluated(linear(), -1.0), record(Geometry::new(vec![], None), None)];
    assert!(matches!(graph_filter(&records, &rule()), Err(PipelineError::Configuration(_))));

    // No radius for a made-up element
    let records = vec![evaluated(geometry(&[("Xx", [0.0, 0.0, 0.0])]), -1.0)];
    assert!(graph_filter(&records, &rule()).is_err());

    assert!(graph_filter(&[], &rule()).unwrap().is_empty());
}

#[test]
fn test_joined_filter() {
    let records = vec![
        evaluated(linear(), -10.0),
        evaluated(split(), -11.0),
        evaluated(triangle(), -9.0),
    ];
    let kept = joined_filter(&records, &rule()).unwrap();
    let energies: Vec<f64> = kept.iter().filter_map(|r| r.energy()).collect();
    assert_eq!(energies, vec![-10.0, -9.0]);
}

/// One of the three Cu2O topologies, every atom nudged along z by up to
/// 0.05 Å, which never changes a bond.
fn shaped(shape: usize, jitter: &[f64; 3]) -> Geometry {
    let mut g = match shape {
        0 => linear(),
        1 => triangle(),
        _ => split(),
    };
    for (atom, dz) in g.atoms.iter_mut().zip(jitter) {
        atom.position.z += dz;
    }
    g
}

proptest! {
    #[test]
    fn prop_graph_filter_keeps_lowest_per_class(
        items in prop::collection::vec((0usize..3, -4i32..0, prop::array::uniform3(0.0f64..0.05)), 1..12),
        seed in any::<u64>(),
    ) {
        // Integer energies force plenty of ties
        let records: Vec<Structure> = items
            .iter()
            .map(|(shape, e, jitter)| evaluated(shaped(*shape, jitter), *e as f64))
            .collect();
        let class_of: HashMap<_, usize> = records.iter().zip(&items).map(|(r, it)| (r.id(), it.0)).collect();

        let kept = graph_filter(&records, &rule()).unwrap();

        let mut classes: Vec<usize> = kept.iter().map(|r| class_of[&r.id()]).collect();
        classes.sort_unstable();
        let mut expected: Vec<usize> = items.iter().map(|it| it.0).collect();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(classes, expected);

        for r in &kept {
            let class = class_of[&r.id()];
            let lowest = items.iter().filter(|it| it.0 == class).map(|it| it.1).min().unwrap();
            prop_assert_eq!(r.energy(), Some(lowest as f64));
        }

        prop_assert_eq!(&graph_filter(&kept, &rule()).unwrap(), &kept);

        let mut shuffled = records.clone();
        shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let ids: Vec<_> = kept.iter().map(|r| r.id()).collect();
        let ids_shuffled: Vec<_> = graph_filter(&shuffled, &rule()).unwrap().iter().map(|r| r.id()).collect();
        prop_assert_eq!(ids, ids_shuffled);
    }
}

#[test]
fn test_joined_through_surface_atom() {
    // Two adsorbed Cu 4 Å apart, both bonded to the Cu between them
    let bridged = |middle_tag| {
        Geometry::new(
            vec![
                Atom::new("Cu", Point3::new(0.0, 0.0, 1.0), 0),
                Atom::new("Cu", Point3::new(4.0, 0.0, 1.0), 0),
                Atom::new("Cu", Point3::new(2.0, 0.0, 0.0), middle_tag),
            ],
            None,
        )
    };
    let on_top_layer = evaluated(bridged(1), -10.0);
    let on_deep_layer = evaluated(bridged(2), -9.0);

    let kept = joined_filter(&[on_top_layer.clone(), on_deep_layer], &rule()).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].id(), on_top_layer.id());
}

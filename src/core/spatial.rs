use nalgebra::Point3;

use crate::core::domain::{Geometry, Lattice};

/// Calculates the squared distance between two points.
/// If `lattice` is provided, applies the Minimum Image Convention on its
/// periodic axes.
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, lattice: Option<&Lattice>) -> f64 {
    match lattice {
        Some(lat) => {
            let d_cart = p2 - p1;
            let mut d_frac = lat.inverse * d_cart;

            // Wrap periodic fractional components to [-0.5, 0.5]
            for axis in 0..3 {
                if lat.pbc[axis] {
                    d_frac[axis] -= d_frac[axis].round();
                }
            }

            let d_mic = lat.vectors * d_frac;
            d_mic.norm_squared()
        }
        None => nalgebra::distance_squared(p1, p2),
    }
}

/// Root-mean-square displacement between two geometries with the same atom
/// ordering, without superposition. `None` if the atom counts differ.
pub fn rmsd(a: &Geometry, b: &Geometry) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let lattice = a.lattice.as_ref();
    let sum: f64 = a
        .atoms
        .iter()
        .zip(&b.atoms)
        .map(|(x, y)| distance_sq(&x.position, &y.position, lattice))
        .sum();
    Some((sum / a.len() as f64).sqrt())
}

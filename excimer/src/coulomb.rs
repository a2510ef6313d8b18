//! Electrostatics: the pairwise Coulomb potential cache and the uniform
//! internal potential.
//!
//! The cache stores, per site, the potential (in eV per unit positive
//! charge) produced by every registered carrier within the Coulomb cutoff.
//! Moving a carrier touches only sites within the cutoff of its old and new
//! positions, which keeps the per-event cost bounded by the cutoff volume.

use crate::lattice::{shell_offsets, Lattice, SiteId, SiteType};
use crate::particle::{Charge, Particle, Registry};
use crate::rates::COULOMB_EV_NM;

/// Incrementally maintained Coulomb potential over the lattice.
#[derive(Clone, Debug)]
pub struct CoulombField {
    potential: Vec<f64>,
    offsets: Vec<([i64; 3], f64)>,
    cutoff_nm: f64,
    internal_potential: f64,
    dielectric_donor: f64,
    dielectric_acceptor: f64,
}

impl CoulombField {
    /// Creates an empty field for `lattice` with the given cutoff in site
    /// units, internal potential Φ in V, and per-material relative
    /// permittivities.
    #[must_use]
    pub fn new(
        lattice: &Lattice,
        cutoff: u32,
        internal_potential: f64,
        dielectric_donor: f64,
        dielectric_acceptor: f64,
    ) -> Self {
        let spacing = lattice.geometry().unit_size;
        let offsets = shell_offsets(cutoff)
            .into_iter()
            .map(|offset| {
                #[allow(clippy::cast_precision_loss)]
                let r = ((offset[0] * offset[0] + offset[1] * offset[1] + offset[2] * offset[2])
                    as f64)
                    .sqrt()
                    * spacing;
                (offset, r)
            })
            .collect();
        Self {
            potential: vec![0.0; lattice.len()],
            offsets,
            cutoff_nm: f64::from(cutoff) * spacing,
            internal_potential,
            dielectric_donor,
            dielectric_acceptor,
        }
    }

    fn dielectric(&self, ty: SiteType) -> f64 {
        match ty {
            SiteType::Donor => self.dielectric_donor,
            SiteType::Acceptor => self.dielectric_acceptor,
        }
    }

    /// Registers a carrier of the given charge at `site`.
    pub fn insert(&mut self, lattice: &Lattice, site: SiteId, charge: Charge) {
        self.accumulate(lattice, site, charge.sign());
    }

    /// Unregisters a carrier of the given charge at `site`.
    pub fn remove(&mut self, lattice: &Lattice, site: SiteId, charge: Charge) {
        self.accumulate(lattice, site, -charge.sign());
    }

    /// Moves a registered carrier from `from` to `to`.
    pub fn shift(&mut self, lattice: &Lattice, from: SiteId, to: SiteId, charge: Charge) {
        self.remove(lattice, from, charge);
        self.insert(lattice, to, charge);
    }

    fn accumulate(&mut self, lattice: &Lattice, site: SiteId, sign: f64) {
        for &(offset, r) in &self.offsets {
            if let Some(target) = lattice.offset(site, offset) {
                self.potential[target.index()] +=
                    sign * COULOMB_EV_NM / (self.dielectric(lattice.site(target).ty) * r);
            }
        }
    }

    /// Coulomb potential at `site` from every registered carrier, in eV per
    /// unit positive charge.
    #[must_use]
    pub fn potential(&self, site: SiteId) -> f64 {
        self.potential[site.index()]
    }

    /// Potential at `site` excluding the contribution of a carrier of
    /// charge `charge` sitting at `own_site`. Used when a carrier evaluates
    /// one of its own hop targets.
    #[must_use]
    pub fn potential_excluding(
        &self,
        lattice: &Lattice,
        site: SiteId,
        own_site: SiteId,
        charge: Charge,
    ) -> f64 {
        let mut value = self.potential(site);
        let r = lattice.distance(own_site, site);
        if r > 0.0 && self.within_cutoff(lattice, own_site, site) {
            value -= charge.sign() * COULOMB_EV_NM
                / (self.dielectric(lattice.site(site).ty) * r);
        }
        value
    }

    fn within_cutoff(&self, lattice: &Lattice, a: SiteId, b: SiteId) -> bool {
        lattice.distance(a, b) <= self.cutoff_nm * (1.0 + 1.0e-12)
    }

    /// Magnitude of the pair interaction energy e²/(4πε₀ε_r r) between
    /// sites `a` and `b`, evaluated with the permittivity at `b`.
    #[must_use]
    pub fn pair_energy(&self, lattice: &Lattice, a: SiteId, b: SiteId) -> f64 {
        let r = lattice.distance(a, b);
        COULOMB_EV_NM / (self.dielectric(lattice.site(b).ty) * r)
    }

    /// Linear internal-potential contribution Φ·z/H at `site`, in eV per
    /// unit positive charge.
    #[must_use]
    pub fn field_term(&self, lattice: &Lattice, site: SiteId) -> f64 {
        let z = crate::convert::f64_from_usize(lattice.coords(site)[2]);
        let height = crate::convert::f64_from_usize(lattice.geometry().dims[2]);
        self.internal_potential * z / height
    }

    /// The configured internal potential Φ in V.
    #[must_use]
    pub fn internal_potential(&self) -> f64 {
        self.internal_potential
    }

    /// Rebuilds the potential from scratch for every live polaron. The
    /// incremental cache must agree with this at all times; it is used by
    /// tests and the invariant checks.
    #[must_use]
    pub fn recomputed(&self, lattice: &Lattice, registry: &Registry) -> Vec<f64> {
        let mut fresh = Self {
            potential: vec![0.0; self.potential.len()],
            offsets: self.offsets.clone(),
            cutoff_nm: self.cutoff_nm,
            internal_potential: self.internal_potential,
            dielectric_donor: self.dielectric_donor,
            dielectric_acceptor: self.dielectric_acceptor,
        };
        for (_, particle) in registry.iter() {
            if let Particle::Polaron(polaron) = particle {
                fresh.insert(lattice, polaron.site, polaron.charge);
            }
        }
        fresh.potential
    }

    /// Maximum absolute deviation between the cached and freshly recomputed
    /// potentials.
    #[must_use]
    pub fn drift(&self, lattice: &Lattice, registry: &Registry) -> f64 {
        self.recomputed(lattice, registry)
            .iter()
            .zip(&self.potential)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lattice::Geometry;
    use crate::particle::Polaron;
    use float_cmp::assert_approx_eq;

    fn lattice() -> Lattice {
        Lattice::new(
            Geometry {
                dims: [10, 10, 10],
                periodic: [false; 3],
                unit_size: 1.0,
            },
            SiteType::Donor,
        )
    }

    #[test]
    fn insert_then_remove_restores_zero_field() {
        let lattice = lattice();
        let mut field = CoulombField::new(&lattice, 3, 0.0, 3.5, 3.5);
        let a = lattice.site_at([2, 2, 2]);
        let b = lattice.site_at([6, 6, 6]);
        field.insert(&lattice, a, Charge::Hole);
        field.insert(&lattice, b, Charge::Electron);
        field.remove(&lattice, a, Charge::Hole);
        field.remove(&lattice, b, Charge::Electron);
        assert!(field.potential.iter().all(|&p| p.abs() < 1e-15));
    }

    #[test]
    fn incremental_shift_matches_recomputation() {
        let lattice = lattice();
        let mut registry = Registry::new();
        let mut field = CoulombField::new(&lattice, 4, 0.0, 3.5, 3.5);

        let start = lattice.site_at([4, 4, 4]);
        let id = registry.insert(Particle::Polaron(Polaron {
            charge: Charge::Hole,
            created_at: 0.0,
            site: start,
            displacement: [0.0; 3],
            pair_tag: None,
        }));
        field.insert(&lattice, start, Charge::Hole);

        let hops = [[5, 4, 4], [5, 5, 4], [5, 5, 5], [4, 5, 5]];
        let mut here = start;
        for coords in hops {
            let next = lattice.site_at(coords);
            field.shift(&lattice, here, next, Charge::Hole);
            if let Particle::Polaron(p) = registry.get_mut(id).unwrap() {
                p.site = next;
            }
            here = next;
        }

        assert!(field.drift(&lattice, &registry) < 1e-12);
    }

    #[test]
    fn hole_raises_and_electron_lowers_the_potential() {
        let lattice = lattice();
        let mut field = CoulombField::new(&lattice, 3, 0.0, 3.5, 3.5);
        let probe = lattice.site_at([5, 5, 5]);
        field.insert(&lattice, lattice.site_at([5, 5, 6]), Charge::Hole);
        assert!(field.potential(probe) > 0.0);
        assert_approx_eq!(f64, field.potential(probe), COULOMB_EV_NM / 3.5, ulps = 4);
        field.insert(&lattice, lattice.site_at([5, 5, 4]), Charge::Electron);
        assert!(field.potential(probe).abs() < 1e-15);
    }

    #[test]
    fn self_exclusion_removes_own_contribution() {
        let lattice = lattice();
        let mut field = CoulombField::new(&lattice, 3, 0.0, 3.5, 3.5);
        let own = lattice.site_at([5, 5, 5]);
        let target = lattice.site_at([5, 5, 6]);
        field.insert(&lattice, own, Charge::Hole);
        assert!(field.potential(target) > 0.0);
        assert!(field.potential_excluding(&lattice, target, own, Charge::Hole).abs() < 1e-15);
    }

    #[test]
    fn field_term_is_linear_in_z() {
        let lattice = lattice();
        let field = CoulombField::new(&lattice, 3, 1.0, 3.5, 3.5);
        let low = field.field_term(&lattice, lattice.site_at([0, 0, 0]));
        let mid = field.field_term(&lattice, lattice.site_at([0, 0, 5]));
        assert_approx_eq!(f64, low, 0.0);
        assert_approx_eq!(f64, mid, 0.5);
    }
}

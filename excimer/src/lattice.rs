//! The 3D site lattice the particles live on.
//!
//! Site topology (coordinates, type) is fixed at construction; site energy
//! is fixed once disorder is applied; occupancy changes on every hop. All
//! distances are computed in discrete site units and converted to nm with
//! the unit cell spacing, applying the minimum-image convention on periodic
//! axes.

use crate::particle::ParticleId;

/// Material type of a site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SiteType {
    /// Electron-donating phase.
    Donor,
    /// Electron-accepting phase.
    Acceptor,
}

/// Flat index into the lattice site arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct SiteId(u32);

impl SiteId {
    /// Builds an id from a flat index.
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Flat index of this site.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One lattice site.
#[derive(Clone, Debug)]
pub struct Site {
    /// Material type.
    pub ty: SiteType,
    /// Static energetic disorder contribution in eV, fixed once the
    /// disorder generator has run.
    pub energy: f64,
    /// The particle sitting on this site, if any. At most one.
    pub occupant: Option<ParticleId>,
}

/// Dimensions, spacing, and boundary policy of a lattice.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// Number of sites along x, y, z.
    pub dims: [usize; 3],
    /// Per-axis periodic boundary flags.
    pub periodic: [bool; 3],
    /// Unit cell spacing in nm.
    pub unit_size: f64,
}

/// The site grid.
#[derive(Clone, Debug)]
pub struct Lattice {
    geometry: Geometry,
    sites: Vec<Site>,
}

impl Lattice {
    /// Creates a lattice with every site of the given type and zero energy.
    #[must_use]
    pub fn new(geometry: Geometry, ty: SiteType) -> Self {
        let n = geometry.dims.iter().product();
        Self {
            geometry,
            sites: vec![
                Site {
                    ty,
                    energy: 0.0,
                    occupant: None,
                };
                n
            ],
        }
    }

    /// The lattice geometry.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Returns `true` for a zero-volume lattice (never constructed by a
    /// validated parameter set).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Film volume in cm³.
    #[must_use]
    pub fn volume_cm3(&self) -> f64 {
        let a_cm = self.geometry.unit_size * 1.0e-7;
        crate::convert::f64_from_usize(self.len()) * a_cm * a_cm * a_cm
    }

    /// Id of the site at integer coordinates.
    ///
    /// # Panics
    ///
    /// Panics when a coordinate lies outside the lattice dimensions.
    #[must_use]
    pub fn site_at(&self, coords: [usize; 3]) -> SiteId {
        let [l, w, h] = self.geometry.dims;
        assert!(
            coords[0] < l && coords[1] < w && coords[2] < h,
            "coordinates {coords:?} outside lattice of dimensions {:?}",
            self.geometry.dims
        );
        SiteId(u32::try_from((coords[0] * w + coords[1]) * h + coords[2]).unwrap())
    }

    /// Integer coordinates of a site.
    #[must_use]
    pub fn coords(&self, id: SiteId) -> [usize; 3] {
        let [_, w, h] = self.geometry.dims;
        let index = id.index();
        [index / (w * h), (index / h) % w, index % h]
    }

    /// Shared site access.
    #[must_use]
    pub fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.index()]
    }

    /// Mutable site access.
    pub fn site_mut(&mut self, id: SiteId) -> &mut Site {
        &mut self.sites[id.index()]
    }

    /// The site reached from `id` by the discrete offset, or `None` when the
    /// offset leaves the lattice across a non-periodic boundary.
    #[must_use]
    pub fn offset(&self, id: SiteId, delta: [i64; 3]) -> Option<SiteId> {
        let coords = self.coords(id);
        let mut target = [0_usize; 3];
        for axis in 0..3 {
            let dim = i64::try_from(self.geometry.dims[axis]).unwrap();
            let c = i64::try_from(coords[axis]).unwrap() + delta[axis];
            if self.geometry.periodic[axis] {
                target[axis] = usize::try_from(c.rem_euclid(dim)).unwrap();
            } else if (0..dim).contains(&c) {
                target[axis] = usize::try_from(c).unwrap();
            } else {
                return None;
            }
        }
        Some(self.site_at(target))
    }

    /// Signed real-space displacement from `src` to `dst` in nm, using the
    /// minimum-image convention on periodic axes.
    #[must_use]
    pub fn displacement(&self, src: SiteId, dst: SiteId) -> [f64; 3] {
        let from = self.coords(src);
        let to = self.coords(dst);
        let mut out = [0.0; 3];
        for axis in 0..3 {
            let dim = i64::try_from(self.geometry.dims[axis]).unwrap();
            let mut delta = i64::try_from(to[axis]).unwrap() - i64::try_from(from[axis]).unwrap();
            if self.geometry.periodic[axis] {
                if 2 * delta > dim {
                    delta -= dim;
                } else if 2 * delta < -dim {
                    delta += dim;
                }
            }
            #[allow(clippy::cast_precision_loss)]
            {
                out[axis] = delta as f64 * self.geometry.unit_size;
            }
        }
        out
    }

    /// Real-space distance from `src` to `dst` in nm.
    #[must_use]
    pub fn distance(&self, src: SiteId, dst: SiteId) -> f64 {
        let [dx, dy, dz] = self.displacement(src, dst);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// All sites within `cutoff` site units of `id`, excluding `id` itself.
    /// Sites beyond a non-periodic boundary are absent, not reflected.
    pub fn neighbors_within(&self, id: SiteId, cutoff: u32) -> impl Iterator<Item = SiteId> + '_ {
        shell_offsets(cutoff)
            .into_iter()
            .filter_map(move |offset| self.offset(id, offset))
            .filter(move |&neighbor| neighbor != id)
    }

    /// Returns `true` when `id` sits on a non-periodic face of the given
    /// axis (0 = x, 1 = y, 2 = z).
    #[must_use]
    pub fn is_boundary(&self, id: SiteId, axis: usize) -> bool {
        if self.geometry.periodic[axis] {
            return false;
        }
        let c = self.coords(id)[axis];
        c == 0 || c + 1 == self.geometry.dims[axis]
    }

    /// Returns `true` when stepping `dz` sites along z from `id` leaves the
    /// film across a non-periodic z face, i.e. into an electrode.
    #[must_use]
    pub fn exits_through_electrode(&self, id: SiteId, dz: i64) -> bool {
        if self.geometry.periodic[2] {
            return false;
        }
        let z = i64::try_from(self.coords(id)[2]).unwrap() + dz;
        !(0..i64::try_from(self.geometry.dims[2]).unwrap()).contains(&z)
    }

    /// Iterates over all site ids.
    pub fn ids(&self) -> impl Iterator<Item = SiteId> {
        (0..u32::try_from(self.len()).unwrap()).map(SiteId)
    }
}

/// All discrete offsets `(dx,dy,dz) ≠ 0` whose length does not exceed
/// `cutoff` site units. Cutoffs are inclusive in real distance but computed
/// in site units.
#[must_use]
pub fn shell_offsets(cutoff: u32) -> Vec<[i64; 3]> {
    let c = i64::from(cutoff);
    let limit = c * c;
    let mut offsets = Vec::new();
    for dx in -c..=c {
        for dy in -c..=c {
            for dz in -c..=c {
                if (dx != 0 || dy != 0 || dz != 0) && dx * dx + dy * dy + dz * dz <= limit {
                    offsets.push([dx, dy, dz]);
                }
            }
        }
    }
    offsets
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn cube(periodic: bool) -> Lattice {
        Lattice::new(
            Geometry {
                dims: [4, 4, 4],
                periodic: [periodic; 3],
                unit_size: 1.0,
            },
            SiteType::Donor,
        )
    }

    #[test]
    fn coords_round_trip() {
        let lattice = cube(true);
        for id in lattice.ids() {
            assert_eq!(lattice.site_at(lattice.coords(id)), id);
        }
    }

    #[test]
    fn offsets_wrap_only_on_periodic_axes() {
        let periodic = cube(true);
        let open = cube(false);
        let corner = periodic.site_at([0, 0, 0]);

        let wrapped = periodic.offset(corner, [-1, 0, 0]).unwrap();
        assert_eq!(periodic.coords(wrapped), [3, 0, 0]);

        assert!(open.offset(corner, [-1, 0, 0]).is_none());
        assert!(open.offset(corner, [1, 0, 0]).is_some());
    }

    #[test]
    fn minimum_image_displacement() {
        let lattice = cube(true);
        let a = lattice.site_at([0, 0, 0]);
        let b = lattice.site_at([3, 0, 0]);
        // 3 sites to the right is 1 site to the left under minimum image
        let [dx, dy, dz] = lattice.displacement(a, b);
        assert_approx_eq!(f64, dx, -1.0);
        assert_approx_eq!(f64, dy, 0.0);
        assert_approx_eq!(f64, dz, 0.0);

        let open = cube(false);
        let [dx, _, _] = open.displacement(a, b);
        assert_approx_eq!(f64, dx, 3.0);
    }

    #[test]
    fn shell_offsets_match_known_counts() {
        // nearest neighbors only
        assert_eq!(shell_offsets(1).len(), 6);
        // 3x3x3 cube minus center minus the 8 corners at distance sqrt(3) > 2? no:
        // within radius 2: all 26 of the unit cube plus 6 at distance 2
        let two = shell_offsets(2);
        assert!(two.contains(&[2, 0, 0]));
        assert!(!two.contains(&[2, 2, 0]));
        assert_eq!(two.len(), 32);
    }

    #[test]
    fn neighbors_are_clipped_at_open_boundaries() {
        let open = cube(false);
        let corner = open.site_at([0, 0, 0]);
        let center = open.site_at([2, 2, 2]);
        assert_eq!(open.neighbors_within(corner, 1).count(), 3);
        assert_eq!(open.neighbors_within(center, 1).count(), 6);

        let periodic = cube(true);
        assert_eq!(periodic.neighbors_within(corner, 1).count(), 6);
    }

    #[test]
    fn boundary_faces_require_open_axes() {
        let open = cube(false);
        assert!(open.is_boundary(open.site_at([0, 1, 1]), 0));
        assert!(open.is_boundary(open.site_at([3, 1, 1]), 0));
        assert!(!open.is_boundary(open.site_at([1, 1, 1]), 0));
        assert!(open.is_boundary(open.site_at([1, 1, 3]), 2));

        let periodic = cube(true);
        assert!(!periodic.is_boundary(periodic.site_at([0, 0, 0]), 0));
    }

    #[test]
    fn electrode_exits_only_on_open_z() {
        let open = cube(false);
        let bottom = open.site_at([1, 1, 0]);
        let top = open.site_at([1, 1, 3]);
        assert!(open.exits_through_electrode(bottom, -1));
        assert!(open.exits_through_electrode(top, 1));
        assert!(!open.exits_through_electrode(top, -1));

        let periodic = cube(true);
        assert!(!periodic.exits_through_electrode(periodic.site_at([1, 1, 3]), 1));
    }

    #[test]
    fn volume_follows_unit_size() {
        let lattice = Lattice::new(
            Geometry {
                dims: [10, 10, 10],
                periodic: [true; 3],
                unit_size: 1.0,
            },
            SiteType::Donor,
        );
        // 1000 sites of (1 nm)^3 = 1e-18 cm^3
        assert_approx_eq!(f64, lattice.volume_cm3(), 1.0e-18, epsilon = 1e-30);
    }
}

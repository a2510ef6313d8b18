//! Observable accumulators: event counters and logarithmically binned
//! transients.

use crate::convert;
use crate::error::{Error, Result};

/// Running totals of every particle fate, kept per trajectory.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    /// Excitons created, total.
    pub excitons_created: u64,
    /// Excitons created on donor sites.
    pub excitons_created_donor: u64,
    /// Excitons created on acceptor sites.
    pub excitons_created_acceptor: u64,
    /// Excitons split into geminate polaron pairs.
    pub excitons_dissociated: u64,
    /// Singlets relaxed to the ground state.
    pub singlets_recombined: u64,
    /// Triplets relaxed to the ground state.
    pub triplets_recombined: u64,
    /// Excitons lost to singlet-singlet annihilation.
    pub singlet_singlet_annihilations: u64,
    /// Excitons lost to singlet-triplet annihilation.
    pub singlet_triplet_annihilations: u64,
    /// Excitons lost to triplet-triplet annihilation.
    pub triplet_triplet_annihilations: u64,
    /// Excitons lost to singlet-polaron annihilation.
    pub singlet_polaron_annihilations: u64,
    /// Excitons lost to triplet-polaron annihilation.
    pub triplet_polaron_annihilations: u64,
    /// Singlet→triplet intersystem crossings.
    pub intersystem_crossings: u64,
    /// Triplet→singlet reverse intersystem crossings.
    pub reverse_intersystem_crossings: u64,
    /// Electrons created.
    pub electrons_created: u64,
    /// Holes created.
    pub holes_created: u64,
    /// Electrons collected at an electrode.
    pub electrons_collected: u64,
    /// Holes collected at an electrode.
    pub holes_collected: u64,
    /// Recombinations of geminate pairs.
    pub geminate_recombinations: u64,
    /// Recombinations of non-geminate pairs.
    pub bimolecular_recombinations: u64,
}

impl Counters {
    /// Adds another worker's counters into this one.
    pub fn add(&mut self, other: &Self) {
        self.excitons_created += other.excitons_created;
        self.excitons_created_donor += other.excitons_created_donor;
        self.excitons_created_acceptor += other.excitons_created_acceptor;
        self.excitons_dissociated += other.excitons_dissociated;
        self.singlets_recombined += other.singlets_recombined;
        self.triplets_recombined += other.triplets_recombined;
        self.singlet_singlet_annihilations += other.singlet_singlet_annihilations;
        self.singlet_triplet_annihilations += other.singlet_triplet_annihilations;
        self.triplet_triplet_annihilations += other.triplet_triplet_annihilations;
        self.singlet_polaron_annihilations += other.singlet_polaron_annihilations;
        self.triplet_polaron_annihilations += other.triplet_polaron_annihilations;
        self.intersystem_crossings += other.intersystem_crossings;
        self.reverse_intersystem_crossings += other.reverse_intersystem_crossings;
        self.electrons_created += other.electrons_created;
        self.holes_created += other.holes_created;
        self.electrons_collected += other.electrons_collected;
        self.holes_collected += other.holes_collected;
        self.geminate_recombinations += other.geminate_recombinations;
        self.bimolecular_recombinations += other.bimolecular_recombinations;
    }

    /// Excitons whose fate has been decided so far: dissociated, relaxed,
    /// or annihilated. Together with the live exciton count this must equal
    /// `excitons_created`.
    #[must_use]
    pub fn excitons_consumed(&self) -> u64 {
        self.excitons_dissociated
            + self.singlets_recombined
            + self.triplets_recombined
            + self.singlet_singlet_annihilations
            + self.singlet_triplet_annihilations
            + self.triplet_triplet_annihilations
            + self.singlet_polaron_annihilations
            + self.triplet_polaron_annihilations
    }
}

/// Logarithmically spaced time axis `t_i = t_start · 10^(i/ppd)`.
#[derive(Clone, Debug)]
pub struct LogTimeGrid {
    start: f64,
    pts_per_decade: usize,
    times: Vec<f64>,
}

impl LogTimeGrid {
    /// Builds a grid spanning `[start, end)` with `pts_per_decade` bins per
    /// decade.
    ///
    /// # Errors
    ///
    /// Fails when the bounds are not positive and increasing or when
    /// `pts_per_decade` is zero.
    pub fn new(start: f64, end: f64, pts_per_decade: usize) -> Result<Self> {
        if !(start > 0.0 && end > start) {
            return Err(Error::parameter(
                "transient window",
                format!("bad bounds [{start}, {end})"),
            ));
        }
        if pts_per_decade == 0 {
            return Err(Error::parameter("pts_per_decade", "must be positive"));
        }
        let decades = (end / start).log10();
        // the nudge keeps an exact whole-decade span from gaining a bin
        let bins = convert::usize_from_f64(
            (decades * convert::f64_from_usize(pts_per_decade) - 1.0e-9).ceil(),
        );
        let times = (0..bins)
            .map(|i| {
                start
                    * 10.0_f64
                        .powf(convert::f64_from_usize(i) / convert::f64_from_usize(pts_per_decade))
            })
            .collect();
        Ok(Self {
            start,
            pts_per_decade,
            times,
        })
    }

    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns `true` for a grid without bins (never built by `new`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Left edges of all bins in s.
    #[must_use]
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Bin index of time `t`, or `None` when `t` lies outside the grid.
    #[must_use]
    pub fn index(&self, t: f64) -> Option<usize> {
        if t < self.start {
            return None;
        }
        // the nudge keeps exact decade edges from rounding into the bin below
        let index = convert::usize_from_f64(
            ((t / self.start).log10() * convert::f64_from_usize(self.pts_per_decade) + 1.0e-9)
                .floor(),
        );
        (index < self.times.len()).then_some(index)
    }
}

/// Instantaneous state of a trajectory, snapshotted into dynamics bins.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Live singlet count.
    pub singlets: u64,
    /// Live triplet count.
    pub triplets: u64,
    /// Live electron count.
    pub electrons: u64,
    /// Live hole count.
    pub holes: u64,
    /// Summed exciton energies in eV.
    pub exciton_energy: f64,
    /// Summed electron energies in eV.
    pub electron_energy: f64,
    /// Summed hole energies in eV.
    pub hole_energy: f64,
    /// Summed exciton squared displacements in cm².
    pub exciton_msd: f64,
    /// Summed electron squared displacements in cm².
    pub electron_msd: f64,
    /// Summed hole squared displacements in cm².
    pub hole_msd: f64,
}

/// Population/energy/MSD traces on a log time grid, filled by snapshotting
/// whenever the simulation clock first enters a bin.
#[derive(Clone, Debug)]
pub struct DynamicsTransient {
    grid: LogTimeGrid,
    next_bin: usize,
    /// Per-bin snapshots; a bin keeps the state seen when it was entered.
    pub bins: Vec<Snapshot>,
}

impl DynamicsTransient {
    /// Creates an empty transient over `grid`.
    #[must_use]
    pub fn new(grid: LogTimeGrid) -> Self {
        let bins = vec![Snapshot::default(); grid.len()];
        Self {
            grid,
            next_bin: 0,
            bins,
        }
    }

    /// The time axis.
    #[must_use]
    pub fn grid(&self) -> &LogTimeGrid {
        &self.grid
    }

    /// Records `snapshot` into every bin entered by advancing the clock to
    /// `t`. The snapshot describes the state that existed while time passed
    /// through those bins.
    pub fn advance(&mut self, t: f64, snapshot: Snapshot) {
        let last = match self.grid.index(t) {
            Some(bin) => bin,
            None if t >= self.grid.start => self.grid.len().saturating_sub(1),
            None => return,
        };
        while self.next_bin <= last {
            self.bins[self.next_bin] = snapshot;
            self.next_bin += 1;
        }
    }
}

/// Per-bin accumulation of carrier hops for time-of-flight photocurrent
/// transients. Entries are added per executed polaron hop, with times taken
/// relative to the start of the transient cycle.
#[derive(Clone, Debug)]
pub struct TofTransient {
    grid: LogTimeGrid,
    /// Hop count per bin.
    pub counts: Vec<u64>,
    /// Summed carrier energy per bin in eV.
    pub energies: Vec<f64>,
    /// Summed signed carrier displacement along z per bin, in cm.
    pub displacement_z: Vec<f64>,
}

impl TofTransient {
    /// Creates an empty transient over `grid`.
    #[must_use]
    pub fn new(grid: LogTimeGrid) -> Self {
        let n = grid.len();
        Self {
            grid,
            counts: vec![0; n],
            energies: vec![0.0; n],
            displacement_z: vec![0.0; n],
        }
    }

    /// The time axis.
    #[must_use]
    pub fn grid(&self) -> &LogTimeGrid {
        &self.grid
    }

    /// Accumulates one executed hop at cycle time `t`: the carrier's energy
    /// in eV and its signed z displacement in cm.
    pub fn record_hop(&mut self, t: f64, energy: f64, dz_cm: f64) {
        if let Some(bin) = self.grid.index(t) {
            self.counts[bin] += 1;
            self.energies[bin] += energy;
            self.displacement_z[bin] += dz_cm;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn grid_spans_the_requested_decades() {
        let grid = LogTimeGrid::new(1.0e-9, 1.0e-6, 10).unwrap();
        assert_eq!(grid.len(), 30);
        assert_approx_eq!(f64, grid.times()[0], 1.0e-9, ulps = 2);
        assert_approx_eq!(f64, grid.times()[10], 1.0e-8, epsilon = 1e-22);
    }

    #[test]
    fn grid_index_brackets_bin_edges() {
        let grid = LogTimeGrid::new(1.0e-9, 1.0e-6, 10).unwrap();
        assert_eq!(grid.index(0.5e-9), None);
        assert_eq!(grid.index(1.0e-9), Some(0));
        assert_eq!(grid.index(1.05e-9), Some(0));
        assert_eq!(grid.index(1.0e-8), Some(10));
        assert_eq!(grid.index(9.9e-7), Some(29));
        assert_eq!(grid.index(1.1e-6), None);
    }

    #[test]
    fn grid_rejects_bad_bounds() {
        assert!(LogTimeGrid::new(0.0, 1.0, 10).is_err());
        assert!(LogTimeGrid::new(1.0, 0.5, 10).is_err());
        assert!(LogTimeGrid::new(1.0e-9, 1.0e-6, 0).is_err());
    }

    #[test]
    fn dynamics_bins_fill_once_on_entry() {
        let grid = LogTimeGrid::new(1.0, 100.0, 2).unwrap();
        let mut transient = DynamicsTransient::new(grid);
        let early = Snapshot {
            singlets: 5,
            ..Snapshot::default()
        };
        let late = Snapshot {
            singlets: 2,
            ..Snapshot::default()
        };
        transient.advance(1.5, early);
        // bins 0 (t=1) entered; re-advancing inside the same bin changes nothing
        transient.advance(1.7, late);
        assert_eq!(transient.bins[0].singlets, 5);
        transient.advance(40.0, late);
        assert_eq!(transient.bins[1].singlets, 2);
        assert_eq!(transient.bins[2].singlets, 2);
        assert_eq!(transient.bins[3].singlets, 2);
    }

    #[test]
    fn dynamics_past_the_window_fills_remaining_bins() {
        let grid = LogTimeGrid::new(1.0, 100.0, 1).unwrap();
        let mut transient = DynamicsTransient::new(grid);
        let snap = Snapshot {
            triplets: 3,
            ..Snapshot::default()
        };
        transient.advance(1.0e6, snap);
        assert!(transient.bins.iter().all(|b| b.triplets == 3));
    }

    #[test]
    fn tof_hops_accumulate_in_their_bin() {
        let grid = LogTimeGrid::new(1.0e-9, 1.0e-6, 5).unwrap();
        let mut transient = TofTransient::new(grid);
        transient.record_hop(2.0e-9, -3.5, 1.0e-7);
        transient.record_hop(2.1e-9, -3.6, 1.0e-7);
        transient.record_hop(5.0e-7, -3.7, -1.0e-7);
        let bin = transient.grid().index(2.0e-9).unwrap();
        assert_eq!(transient.counts[bin], 2);
        assert_approx_eq!(f64, transient.energies[bin], -7.1, ulps = 4);
        assert_approx_eq!(f64, transient.displacement_z[bin], 2.0e-7, ulps = 4);
        // out-of-window hops are dropped
        transient.record_hop(2.0e-6, -1.0, 1.0e-7);
        let total: u64 = transient.counts.iter().sum();
        assert_eq!(total, 3);
    }
}
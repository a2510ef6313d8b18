//! Parallel trajectory workers and cross-worker reduction.
//!
//! Workers are independent: each owns its lattice, disorder realization,
//! Coulomb cache, and RNG (seeded from the master seed plus the rank).
//! Every `rendezvous_interval` executed events a worker publishes progress
//! and checks the shared abort flag; a worker that errors raises the flag
//! so its peers stop at their next rendezvous. The parallel iterator's
//! implicit join is the barrier between the simulation and reduction
//! phases.

use crate::params::{Morphology, Parameters};
use crate::simulation::Simulation;
use crate::transient::{Counters, DynamicsTransient, TofTransient};
use itertools::Itertools;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default number of executed events between rendezvous points.
pub const DEFAULT_RENDEZVOUS_INTERVAL: u64 = 500_000;

/// Cross-worker run settings.
#[derive(Clone, Copy, Debug)]
pub struct RunConfig {
    /// Number of independent trajectories.
    pub n_workers: usize,
    /// Master seed; worker `rank` uses `master_seed + rank`.
    pub master_seed: u64,
    /// Executed events between rendezvous points.
    pub rendezvous_interval: u64,
}

/// Everything a finished (or aborted) worker hands to the reducer.
#[derive(Clone, Debug)]
pub struct TrajectoryReport {
    /// Worker rank.
    pub rank: usize,
    /// Whether the driver's stop condition was reached.
    pub finished: bool,
    /// Runtime or startup error, when the trajectory failed. Errored
    /// workers are excluded from observable reductions.
    pub error: Option<String>,
    /// Wall-clock time spent simulating.
    pub elapsed: Duration,
    /// Final simulated time in s.
    pub simulated_time: f64,
    /// Events executed.
    pub events_executed: u64,
    /// Event counters.
    pub counters: Counters,
    /// Per-exciton diffusion lengths in nm.
    pub diffusion_lengths: Vec<f64>,
    /// Per-carrier transit times in s.
    pub transit_times: Vec<f64>,
    /// Completed time-of-flight cycles.
    pub n_transient_cycles: usize,
    /// Time-of-flight transient, when running ToF.
    pub tof_transient: Option<TofTransient>,
    /// Dynamics transient, when running dynamics.
    pub dynamics_transient: Option<DynamicsTransient>,
    /// Collected-electron counts per (x, y) column.
    pub electron_extraction: Vec<u64>,
    /// Collected-hole counts per (x, y) column.
    pub hole_extraction: Vec<u64>,
}

/// Runs `cfg.n_workers` independent trajectories in parallel and returns
/// their reports ordered by rank. `morphologies[rank]`, when present, is
/// the imported film for that worker.
#[must_use]
pub fn run_trajectories(
    params: &Parameters,
    morphologies: &[Option<Morphology>],
    cfg: &RunConfig,
) -> Vec<TrajectoryReport> {
    let abort = AtomicBool::new(false);
    (0..cfg.n_workers)
        .into_par_iter()
        .map(|rank| {
            run_one(
                params,
                morphologies.get(rank).and_then(Option::as_ref),
                rank,
                cfg,
                &abort,
            )
        })
        .collect()
}

fn run_one(
    params: &Parameters,
    morphology: Option<&Morphology>,
    rank: usize,
    cfg: &RunConfig,
    abort: &AtomicBool,
) -> TrajectoryReport {
    let start = Instant::now();
    let seed = cfg.master_seed.wrapping_add(rank as u64);
    let interval = cfg.rendezvous_interval.max(1);

    let mut sim = match Simulation::new(params, seed, morphology) {
        Ok(sim) => sim,
        Err(error) => {
            abort.store(true, Ordering::Relaxed);
            warn!(rank, %error, "trajectory failed to initialize");
            return TrajectoryReport {
                rank,
                finished: false,
                error: Some(error.to_string()),
                elapsed: start.elapsed(),
                simulated_time: 0.0,
                events_executed: 0,
                counters: Counters::default(),
                diffusion_lengths: Vec::new(),
                transit_times: Vec::new(),
                n_transient_cycles: 0,
                tof_transient: None,
                dynamics_transient: None,
                electron_extraction: Vec::new(),
                hole_extraction: Vec::new(),
            };
        }
    };

    let mut finished = false;
    loop {
        if sim.is_finished() {
            finished = true;
            break;
        }
        if let Err(error) = sim.execute_next_event() {
            // the message is recorded on the simulator; peers abort at
            // their next rendezvous
            abort.store(true, Ordering::Relaxed);
            warn!(rank, %error, "trajectory stopped on error");
            break;
        }
        if sim.events_executed() % interval == 0 {
            info!(
                rank,
                events = sim.events_executed(),
                simulated_time = sim.time(),
                particles = sim.registry().len(),
                "rendezvous"
            );
            if abort.load(Ordering::Relaxed) {
                warn!(rank, "cooperative abort");
                break;
            }
        }
    }

    TrajectoryReport {
        rank,
        finished,
        error: sim.error_message().map(str::to_owned),
        elapsed: start.elapsed(),
        simulated_time: sim.time(),
        events_executed: sim.events_executed(),
        counters: *sim.counters(),
        diffusion_lengths: sim.diffusion_lengths().to_vec(),
        transit_times: sim.transit_times().to_vec(),
        n_transient_cycles: sim.n_transient_cycles(),
        tof_transient: sim.tof_transient().cloned(),
        dynamics_transient: sim.dynamics_transient().cloned(),
        electron_extraction: sim.electron_extraction_map().to_vec(),
        hole_extraction: sim.hole_extraction_map().to_vec(),
    }
}

/// Element-wise sum of equal-length vectors.
///
/// # Panics
///
/// Panics when the lengths differ; reduced vectors share one time grid.
pub fn sum_vectors(acc: &mut [f64], other: &[f64]) {
    for (a, b) in acc.iter_mut().zip_eq(other) {
        *a += b;
    }
}

/// Element-wise sum of equal-length count vectors.
///
/// # Panics
///
/// Panics when the lengths differ; reduced vectors share one time grid.
pub fn sum_counts(acc: &mut [u64], other: &[u64]) {
    for (a, b) in acc.iter_mut().zip_eq(other) {
        *a += b;
    }
}

/// Concatenation of variable-length per-worker vectors.
#[must_use]
pub fn gather(vectors: impl IntoIterator<Item = Vec<f64>>) -> Vec<f64> {
    vectors.into_iter().flatten().collect()
}

/// Arithmetic mean; NaN for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / crate::convert::f64_from_usize(values.len())
}

/// Sample standard deviation; NaN for fewer than two values.
#[must_use]
pub fn stdev(values: &[f64]) -> f64 {
    let m = mean(values);
    let n = crate::convert::f64_from_usize(values.len());
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n - 1.0)).sqrt()
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::io::Cursor;

    fn diffusion_params(n_tests: usize) -> Parameters {
        let file = crate::params::test::sample_file()
            .replace("10 / n tests", &format!("{n_tests} / n tests"));
        Parameters::from_reader(Cursor::new(file)).unwrap()
    }

    #[test]
    fn reductions_sum_and_gather() {
        let mut acc = vec![1.0, 2.0, 3.0];
        sum_vectors(&mut acc, &[0.5, 0.5, 0.5]);
        assert_eq!(acc, vec![1.5, 2.5, 3.5]);

        let mut counts = vec![1_u64, 2];
        sum_counts(&mut counts, &[3, 4]);
        assert_eq!(counts, vec![4, 6]);

        let gathered = gather(vec![vec![1.0], vec![], vec![2.0, 3.0]]);
        assert_eq!(gathered, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn mean_and_stdev_match_hand_values() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_approx_eq!(f64, mean(&values), 5.0);
        assert_approx_eq!(f64, stdev(&values), (32.0_f64 / 7.0).sqrt(), ulps = 4);
    }

    #[test]
    fn workers_are_deterministic_and_rank_seeded() {
        let params = diffusion_params(5);
        let cfg = RunConfig {
            n_workers: 2,
            master_seed: 7,
            rendezvous_interval: 1000,
        };
        let first = run_trajectories(&params, &[], &cfg);
        let second = run_trajectories(&params, &[], &cfg);
        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert!(a.finished && a.error.is_none());
            assert_eq!(a.events_executed, b.events_executed);
            assert_eq!(a.diffusion_lengths, b.diffusion_lengths);
            assert_eq!(a.simulated_time.to_bits(), b.simulated_time.to_bits());
        }
        // different ranks see different seeds
        assert_ne!(first[0].diffusion_lengths, first[1].diffusion_lengths);
    }

    #[test]
    fn startup_failure_is_reported_in_band() {
        let mut params = diffusion_params(2);
        // a zero-field ToF setup is a driver misconfiguration
        params.test.mode = crate::params::TestMode::TimeOfFlight {
            polaron_type: crate::particle::Charge::Electron,
            initial_polarons: 4,
            transient_start: 1.0e-9,
            transient_end: 1.0e-5,
            pts_per_decade: 10,
        };
        params.internal_potential = 0.0;
        params.geometry.periodic = [true, true, false];
        let cfg = RunConfig {
            n_workers: 1,
            master_seed: 1,
            rendezvous_interval: 1000,
        };
        let reports = run_trajectories(&params, &[], &cfg);
        assert!(!reports[0].finished);
        assert!(reports[0].error.as_deref().unwrap().contains("internal_potential"));
    }
}

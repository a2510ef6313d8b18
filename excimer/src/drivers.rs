//! Experiment drivers: initial conditions, termination criteria, and the
//! per-mode progress state the scheduler consults.

use crate::error::{Error, Result};
use crate::params::{Parameters, TestMode};
use crate::particle::Charge;
use crate::transient::Counters;

/// Mode-specific driver state. The scheduler owns one driver per
/// trajectory, seeds particles according to it, and asks `is_finished`
/// after every executed event.
#[derive(Clone, Copy, Debug)]
pub enum Driver {
    /// Seed one singlet at a time; measure displacement at relaxation.
    ExcitonDiffusion {
        /// Excitons to consume in total.
        n_tests: usize,
        /// Excitons consumed so far.
        completed: usize,
    },
    /// Drift an injected carrier packet across the film.
    TimeOfFlight {
        /// Injected carrier type.
        polaron_type: Charge,
        /// Carriers injected per cycle.
        initial_polarons: usize,
        /// Transient window start in s.
        transient_start: f64,
        /// Transient window end in s; carriers alive past it expire.
        transient_end: f64,
        /// Log bins per decade.
        pts_per_decade: usize,
        /// Number of transient cycles to run.
        cycles_total: usize,
        /// Cycles finished so far.
        cycles_done: usize,
        /// Absolute start time of the running cycle.
        cycle_start: f64,
    },
    /// Steady photogeneration with charge extraction.
    Iqe {
        /// Excitons to generate before shutting generation off.
        target_excitons: usize,
        /// Hard stop on simulated time in s.
        time_cutoff: f64,
    },
    /// Instantaneous excitation, free decay, optional extraction.
    Dynamics {
        /// Allow polarons to leave through the z faces.
        extraction: bool,
        /// Transient window end in s; the run stops there.
        transient_end: f64,
    },
}

impl Driver {
    /// Builds the driver for the configured test, rejecting configurations
    /// the experiment cannot run under.
    ///
    /// # Errors
    ///
    /// Time-of-flight without a collecting electrode (periodic z) or
    /// without a driving field (zero internal potential) is a
    /// misconfiguration and is rejected here.
    pub fn from_params(params: &Parameters) -> Result<Self> {
        match params.test.mode {
            TestMode::ExcitonDiffusion => Ok(Self::ExcitonDiffusion {
                n_tests: params.test.n_tests,
                completed: 0,
            }),
            TestMode::TimeOfFlight {
                polaron_type,
                initial_polarons,
                transient_start,
                transient_end,
                pts_per_decade,
            } => {
                if params.geometry.periodic[2] {
                    return Err(Error::parameter(
                        "enable_periodic_z",
                        "time-of-flight needs non-periodic z faces to collect carriers",
                    ));
                }
                if params.internal_potential == 0.0 {
                    return Err(Error::parameter(
                        "internal_potential",
                        "time-of-flight transit is undefined without a driving field",
                    ));
                }
                let cycles_total = params.test.n_tests.div_ceil(initial_polarons).max(1);
                Ok(Self::TimeOfFlight {
                    polaron_type,
                    initial_polarons,
                    transient_start,
                    transient_end,
                    pts_per_decade,
                    cycles_total,
                    cycles_done: 0,
                    cycle_start: 0.0,
                })
            }
            TestMode::Iqe { time_cutoff } => {
                if params.geometry.periodic[2] {
                    return Err(Error::parameter(
                        "enable_periodic_z",
                        "the IQE test needs non-periodic z faces to extract charges",
                    ));
                }
                Ok(Self::Iqe {
                    target_excitons: params.test.n_tests,
                    time_cutoff,
                })
            }
            TestMode::Dynamics {
                extraction,
                transient_end,
                ..
            } => Ok(Self::Dynamics {
                extraction,
                transient_end,
            }),
        }
    }

    /// Stop condition, consulted by the scheduler loop after every event.
    #[must_use]
    pub fn is_finished(&self, counters: &Counters, live_particles: usize, time: f64) -> bool {
        match *self {
            Self::ExcitonDiffusion {
                n_tests, completed, ..
            } => completed >= n_tests && live_particles == 0,
            Self::TimeOfFlight {
                cycles_total,
                cycles_done,
                ..
            } => cycles_done >= cycles_total && live_particles == 0,
            Self::Iqe {
                target_excitons,
                time_cutoff,
            } => {
                time >= time_cutoff
                    || (counters.excitons_created >= target_excitons as u64 && live_particles == 0)
            }
            Self::Dynamics { transient_end, .. } => live_particles == 0 || time >= transient_end,
        }
    }

    /// Whether polarons may hop out through the z faces in this mode.
    #[must_use]
    pub fn allows_extraction(&self) -> bool {
        match *self {
            Self::TimeOfFlight { .. } | Self::Iqe { .. } => true,
            Self::Dynamics { extraction, .. } => extraction,
            Self::ExcitonDiffusion { .. } => false,
        }
    }

    /// Whether photogeneration events are active given the progress so far.
    #[must_use]
    pub fn generation_active(&self, counters: &Counters) -> bool {
        match *self {
            Self::Iqe {
                target_excitons, ..
            } => counters.excitons_created < target_excitons as u64,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::Parameters;
    use std::io::Cursor;

    fn sample_params() -> Parameters {
        Parameters::from_reader(Cursor::new(crate::params::test::sample_file())).unwrap()
    }

    #[test]
    fn diffusion_driver_finishes_when_tests_are_consumed() {
        let driver = Driver::ExcitonDiffusion {
            n_tests: 3,
            completed: 3,
        };
        let counters = Counters::default();
        assert!(driver.is_finished(&counters, 0, 1.0));
        assert!(!driver.is_finished(&counters, 1, 1.0));
    }

    #[test]
    fn tof_rejects_periodic_z() {
        let mut params = sample_params();
        params.test.mode = TestMode::TimeOfFlight {
            polaron_type: Charge::Electron,
            initial_polarons: 10,
            transient_start: 1.0e-9,
            transient_end: 1.0e-5,
            pts_per_decade: 10,
        };
        params.internal_potential = 1.0;
        params.geometry.periodic = [true, true, true];
        assert!(Driver::from_params(&params).is_err());
    }

    #[test]
    fn tof_rejects_zero_field() {
        let mut params = sample_params();
        params.test.mode = TestMode::TimeOfFlight {
            polaron_type: Charge::Electron,
            initial_polarons: 10,
            transient_start: 1.0e-9,
            transient_end: 1.0e-5,
            pts_per_decade: 10,
        };
        params.internal_potential = 0.0;
        params.geometry.periodic = [true, true, false];
        assert!(Driver::from_params(&params).is_err());
    }

    #[test]
    fn tof_cycle_count_covers_the_requested_tests() {
        let mut params = sample_params();
        params.test.n_tests = 25;
        params.test.mode = TestMode::TimeOfFlight {
            polaron_type: Charge::Hole,
            initial_polarons: 10,
            transient_start: 1.0e-9,
            transient_end: 1.0e-5,
            pts_per_decade: 10,
        };
        params.internal_potential = 1.0;
        params.geometry.periodic = [true, true, false];
        let driver = Driver::from_params(&params).unwrap();
        let Driver::TimeOfFlight { cycles_total, .. } = driver else {
            unreachable!();
        };
        assert_eq!(cycles_total, 3);
    }

    #[test]
    fn iqe_stops_at_the_time_cutoff() {
        let driver = Driver::Iqe {
            target_excitons: 1000,
            time_cutoff: 1.0e-4,
        };
        let counters = Counters::default();
        assert!(!driver.is_finished(&counters, 5, 1.0e-5));
        assert!(driver.is_finished(&counters, 5, 1.0e-4));
    }

    #[test]
    fn extraction_follows_the_mode() {
        assert!(Driver::Iqe {
            target_excitons: 1,
            time_cutoff: 1.0,
        }
        .allows_extraction());
        assert!(!Driver::ExcitonDiffusion {
            n_tests: 1,
            completed: 0,
        }
        .allows_extraction());
        assert!(Driver::Dynamics {
            extraction: true,
            transient_end: 1.0,
        }
        .allows_extraction());
        assert!(!Driver::Dynamics {
            extraction: false,
            transient_end: 1.0,
        }
        .allows_extraction());
    }
}

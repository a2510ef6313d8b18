//! Parameter file loading and validation, plus morphology import.
//!
//! The parameter file is line oriented: lines starting with `--` or `##`
//! are comments, and each active line carries one value as the leading
//! token before a `/`. Values appear in a fixed order; the reader consumes
//! them sequentially and reports the parameter name it was expecting when
//! something is missing or malformed.

use crate::disorder::{Correlation, DisorderModel, Kernel};
use crate::error::{Error, Result};
use crate::lattice::{Geometry, SiteType};
use crate::particle::Charge;
use crate::rates::HoppingModel;
use std::io::BufRead;
use std::path::PathBuf;

/// Event bookkeeping algorithm selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmcAlgorithm {
    /// Keep an event per kind and target; never resample survivors.
    FirstReaction,
    /// Keep the per-kind minimum; recompute only particles near the last
    /// executed event.
    SelectiveRecalc,
    /// Keep the per-kind minimum; recompute every particle each step.
    FullRecalc,
}

/// Scheduler configuration.
#[derive(Clone, Copy, Debug)]
pub struct KmcConfig {
    /// Selected algorithm.
    pub algorithm: KmcAlgorithm,
    /// Radius in site units of the neighborhood considered changed after an
    /// event execution.
    pub recalc_cutoff: u32,
}

/// Film architecture built when no morphology is imported.
#[derive(Clone, Copy, Debug)]
pub enum Architecture {
    /// Single-phase film of donor sites.
    Neat,
    /// Donor slab below an acceptor slab along z.
    Bilayer {
        /// Donor slab thickness in sites.
        thickness_donor: usize,
        /// Acceptor slab thickness in sites.
        thickness_acceptor: usize,
    },
    /// Uncorrelated random mixture.
    RandomBlend {
        /// Acceptor site fraction in [0,1].
        acceptor_conc: f64,
    },
}

/// Morphology input selection.
#[derive(Clone, Debug)]
pub enum MorphologyImport {
    /// Build the film from [`Architecture`] instead.
    None,
    /// One file shared by every worker.
    Single(PathBuf),
    /// An indexed set `prefix#suffix`; workers are dealt shuffled members.
    Set {
        /// Filename format containing a single `#` placeholder.
        format: String,
        /// Number of morphologies to test.
        n_test_morphologies: usize,
        /// Size of the available set.
        set_size: usize,
    },
}

/// A donor/acceptor pair of values selected by site type.
#[derive(Clone, Copy, Debug)]
pub struct PairByType {
    /// Value used on donor sites.
    pub donor: f64,
    /// Value used on acceptor sites.
    pub acceptor: f64,
}

impl PairByType {
    /// Value for the given site type.
    #[must_use]
    pub fn for_type(self, ty: SiteType) -> f64 {
        match ty {
            SiteType::Donor => self.donor,
            SiteType::Acceptor => self.acceptor,
        }
    }
}

/// Which experiment the trajectory runs.
#[derive(Clone, Copy, Debug)]
pub enum TestMode {
    /// Single-exciton random walks until relaxation.
    ExcitonDiffusion,
    /// Carrier packet drift across the film under the internal field.
    TimeOfFlight {
        /// Carrier type injected.
        polaron_type: Charge,
        /// Carriers injected per transient cycle.
        initial_polarons: usize,
        /// Transient window start in s.
        transient_start: f64,
        /// Transient window end in s.
        transient_end: f64,
        /// Log bins per decade.
        pts_per_decade: usize,
    },
    /// Steady photoexcitation with charge extraction.
    Iqe {
        /// Wall-clock limit on simulated time in s.
        time_cutoff: f64,
    },
    /// Instantaneous excitation followed by free decay.
    Dynamics {
        /// Allow polaron extraction through the z faces mid-run.
        extraction: bool,
        /// Initial exciton concentration in 1/cm³.
        initial_conc: f64,
        /// Transient window start in s.
        transient_start: f64,
        /// Transient window end in s.
        transient_end: f64,
        /// Log bins per decade.
        pts_per_decade: usize,
    },
}

/// Experiment selection and shared test knobs.
#[derive(Clone, Copy, Debug)]
pub struct TestConfig {
    /// Per-test repetition count (excitons for diffusion/IQE, collected
    /// carriers for ToF).
    pub n_tests: usize,
    /// Selected experiment.
    pub mode: TestMode,
    /// Write (x, y, count) extraction maps for collected carriers.
    pub extraction_map_output: bool,
}

/// Exciton process parameters.
#[derive(Clone, Copy, Debug)]
pub struct ExcitonConfig {
    /// Photogeneration rate per material in 1/(cm³ s).
    pub generation_rate: PairByType,
    /// Singlet lifetime in s.
    pub singlet_lifetime: PairByType,
    /// Triplet lifetime in s.
    pub triplet_lifetime: PairByType,
    /// Förster hop attempt rate in 1/s.
    pub singlet_hop_prefactor: PairByType,
    /// Singlet inverse localization length in 1/nm.
    pub singlet_localization: PairByType,
    /// Dexter hop attempt rate in 1/s.
    pub triplet_hop_prefactor: PairByType,
    /// Triplet inverse localization length in 1/nm.
    pub triplet_localization: PairByType,
    /// Use Förster-type distance dependence for triplet annihilation.
    pub fret_triplet_annihilation: bool,
    /// Exciton-exciton annihilation prefactor in 1/s.
    pub exciton_exciton_annihilation: PairByType,
    /// Exciton-polaron annihilation prefactor in 1/s.
    pub exciton_polaron_annihilation: PairByType,
    /// Exciton transfer/annihilation cutoff in site units.
    pub fret_cutoff: u32,
    /// Exciton binding energy in eV.
    pub binding_energy: PairByType,
    /// Dissociation attempt rate in 1/s.
    pub dissociation_prefactor: PairByType,
    /// Dissociation cutoff in site units.
    pub dissociation_cutoff: u32,
    /// Intersystem crossing rate in 1/s.
    pub isc_prefactor: PairByType,
    /// Reverse intersystem crossing attempt rate in 1/s.
    pub risc_prefactor: PairByType,
    /// Singlet-triplet energy splitting in eV.
    pub singlet_triplet_gap: PairByType,
    /// Probability that a triplet-triplet fusion event yields a singlet;
    /// the spin-statistical value is 1/9.
    pub triplet_fusion_singlet_fraction: f64,
}

/// Polaron process parameters.
#[derive(Clone, Copy, Debug)]
pub struct PolaronConfig {
    /// Forbid hops onto the opposite phase.
    pub phase_restriction: bool,
    /// Hop attempt rate in 1/s.
    pub hop_prefactor: PairByType,
    /// Inverse localization length in 1/nm.
    pub localization: PairByType,
    /// Rate law for polaron hops.
    pub hopping_model: HoppingModel,
    /// Marcus reorganization energy in eV.
    pub reorganization: PairByType,
    /// Recombination attempt rate in 1/s.
    pub recombination_prefactor: f64,
    /// Hop cutoff in site units.
    pub hopping_cutoff: u32,
    /// Gaussian delocalization length in nm, when enabled.
    pub gaussian_delocalization: Option<f64>,
}

/// Band energies, disorder, and electrostatics.
#[derive(Clone, Copy, Debug)]
pub struct EnergeticsConfig {
    /// HOMO depth below vacuum in eV (positive).
    pub homo: PairByType,
    /// LUMO depth below vacuum in eV (positive).
    pub lumo: PairByType,
    /// Density of states for site energies.
    pub disorder: DisorderModel,
    /// Optional spatial correlation of the disorder.
    pub correlation: Option<Correlation>,
    /// Relative permittivity.
    pub dielectric: PairByType,
    /// Coulomb interaction cutoff in site units.
    pub coulomb_cutoff: u32,
}

/// The full, plain-data parameter set. It is deep-copied into the simulator
/// at init; the simulator owns all mutable state thereafter.
#[derive(Clone, Debug)]
pub struct Parameters {
    /// Scheduler selection.
    pub kmc: KmcConfig,
    /// Lattice geometry (dimensions, periodicity, spacing).
    pub geometry: Geometry,
    /// Temperature in K.
    pub temperature: f64,
    /// Internal potential Φ in V across the film along z.
    pub internal_potential: f64,
    /// Film architecture.
    pub architecture: Architecture,
    /// Morphology import selection.
    pub morphology: MorphologyImport,
    /// Experiment selection.
    pub test: TestConfig,
    /// Exciton parameters.
    pub exciton: ExcitonConfig,
    /// Polaron parameters.
    pub polaron: PolaronConfig,
    /// Energetics parameters.
    pub energetics: EnergeticsConfig,
}

struct TokenReader {
    values: Vec<String>,
    position: usize,
}

impl TokenReader {
    fn from_lines(reader: impl BufRead) -> Result<Self> {
        let mut values = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| Error::parameter("file", e.to_string()))?;
            if line.starts_with("--") || line.starts_with("##") {
                continue;
            }
            let token = line.split('/').next().unwrap_or("").trim().to_owned();
            if !token.is_empty() {
                values.push(token);
            }
        }
        Ok(Self {
            values,
            position: 0,
        })
    }

    fn take(&mut self, name: &str) -> Result<&str> {
        let value = self
            .values
            .get(self.position)
            .ok_or_else(|| Error::parameter(name, "missing value"))?;
        self.position += 1;
        Ok(value)
    }

    fn take_bool(&mut self, name: &str) -> Result<bool> {
        match self.take(name)? {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(Error::parameter(name, format!("expected true/false, got '{other}'"))),
        }
    }

    fn take_f64(&mut self, name: &str) -> Result<f64> {
        let token = self.take(name)?;
        token
            .parse()
            .map_err(|_| Error::parameter(name, format!("bad numeric value '{token}'")))
    }

    fn take_usize(&mut self, name: &str) -> Result<usize> {
        let token = self.take(name)?;
        token
            .parse()
            .map_err(|_| Error::parameter(name, format!("bad integer value '{token}'")))
    }

    fn take_u32(&mut self, name: &str) -> Result<u32> {
        let token = self.take(name)?;
        token
            .parse()
            .map_err(|_| Error::parameter(name, format!("bad integer value '{token}'")))
    }

    fn take_pair(&mut self, name: &str) -> Result<PairByType> {
        Ok(PairByType {
            donor: self.take_f64(&format!("{name}_donor"))?,
            acceptor: self.take_f64(&format!("{name}_acceptor"))?,
        })
    }
}

impl Parameters {
    /// Reads a parameter file, consuming values in the fixed documented
    /// order, then validates the result.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Parameter`] naming the first missing, malformed,
    /// or inconsistent entry.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut r = TokenReader::from_lines(reader)?;

        // KMC algorithm
        let enable_frm = r.take_bool("enable_first_reaction_method")?;
        let enable_selective = r.take_bool("enable_selective_recalc")?;
        let recalc_cutoff = r.take_u32("recalc_cutoff")?;
        let enable_full = r.take_bool("enable_full_recalc")?;
        let algorithm = match (enable_frm, enable_selective, enable_full) {
            (true, false, false) => KmcAlgorithm::FirstReaction,
            (false, true, false) => KmcAlgorithm::SelectiveRecalc,
            (false, false, true) => KmcAlgorithm::FullRecalc,
            _ => {
                return Err(Error::parameter(
                    "kmc_algorithm",
                    "exactly one of FRM, selective recalculation, and full recalculation must be enabled",
                ))
            }
        };

        // Geometry
        let periodic = [
            r.take_bool("enable_periodic_x")?,
            r.take_bool("enable_periodic_y")?,
            r.take_bool("enable_periodic_z")?,
        ];
        let dims = [
            r.take_usize("length")?,
            r.take_usize("width")?,
            r.take_usize("height")?,
        ];
        let unit_size = r.take_f64("unit_size")?;
        let temperature = r.take_f64("temperature")?;
        let internal_potential = r.take_f64("internal_potential")?;

        // Architecture
        let enable_neat = r.take_bool("enable_neat")?;
        let enable_bilayer = r.take_bool("enable_bilayer")?;
        let thickness_donor = r.take_usize("thickness_donor")?;
        let thickness_acceptor = r.take_usize("thickness_acceptor")?;
        let enable_blend = r.take_bool("enable_random_blend")?;
        let acceptor_conc = r.take_f64("acceptor_conc")?;
        let architecture = match (enable_neat, enable_bilayer, enable_blend) {
            (true, false, false) => Architecture::Neat,
            (false, true, false) => Architecture::Bilayer {
                thickness_donor,
                thickness_acceptor,
            },
            (false, false, true) => Architecture::RandomBlend { acceptor_conc },
            _ => {
                return Err(Error::parameter(
                    "architecture",
                    "exactly one of neat, bilayer, and random blend must be enabled",
                ))
            }
        };

        // Morphology import
        let import_single = r.take_bool("enable_import_morphology_single")?;
        let morphology_filename = r.take("morphology_filename")?.to_owned();
        let import_set = r.take_bool("enable_import_morphology_set")?;
        let set_format = r.take("morphology_set_format")?.to_owned();
        let n_test_morphologies = r.take_usize("n_test_morphologies")?;
        let set_size = r.take_usize("n_morphology_set_size")?;
        let morphology = match (import_single, import_set) {
            (false, false) => MorphologyImport::None,
            (true, false) => MorphologyImport::Single(PathBuf::from(morphology_filename)),
            (false, true) => MorphologyImport::Set {
                format: set_format,
                n_test_morphologies,
                set_size,
            },
            (true, true) => {
                return Err(Error::parameter(
                    "morphology_import",
                    "single-file and set import are mutually exclusive",
                ))
            }
        };

        // Tests
        let n_tests = r.take_usize("n_tests")?;
        let enable_diffusion = r.take_bool("enable_exciton_diffusion_test")?;
        let enable_tof = r.take_bool("enable_tof_test")?;
        let polaron_type = match r.take("tof_polaron_type")? {
            "electron" => Charge::Electron,
            "hole" => Charge::Hole,
            other => {
                return Err(Error::parameter(
                    "tof_polaron_type",
                    format!("expected electron or hole, got '{other}'"),
                ))
            }
        };
        let tof_initial_polarons = r.take_usize("tof_initial_polarons")?;
        let tof_transient_start = r.take_f64("tof_transient_start")?;
        let tof_transient_end = r.take_f64("tof_transient_end")?;
        let tof_pts_per_decade = r.take_usize("tof_pnts_per_decade")?;
        let enable_iqe = r.take_bool("enable_iqe_test")?;
        let iqe_time_cutoff = r.take_f64("iqe_time_cutoff")?;
        let extraction_map_output = r.take_bool("enable_extraction_map_output")?;
        let enable_dynamics = r.take_bool("enable_dynamics_test")?;
        let dynamics_extraction = r.take_bool("enable_dynamics_extraction")?;
        let dynamics_initial_conc = r.take_f64("dynamics_initial_exciton_conc")?;
        let dynamics_transient_start = r.take_f64("dynamics_transient_start")?;
        let dynamics_transient_end = r.take_f64("dynamics_transient_end")?;
        let dynamics_pts_per_decade = r.take_usize("dynamics_pnts_per_decade")?;
        let mode = match (enable_diffusion, enable_tof, enable_iqe, enable_dynamics) {
            (true, false, false, false) => TestMode::ExcitonDiffusion,
            (false, true, false, false) => TestMode::TimeOfFlight {
                polaron_type,
                initial_polarons: tof_initial_polarons,
                transient_start: tof_transient_start,
                transient_end: tof_transient_end,
                pts_per_decade: tof_pts_per_decade,
            },
            (false, false, true, false) => TestMode::Iqe {
                time_cutoff: iqe_time_cutoff,
            },
            (false, false, false, true) => TestMode::Dynamics {
                extraction: dynamics_extraction,
                initial_conc: dynamics_initial_conc,
                transient_start: dynamics_transient_start,
                transient_end: dynamics_transient_end,
                pts_per_decade: dynamics_pts_per_decade,
            },
            _ => {
                return Err(Error::parameter(
                    "test_selection",
                    "exactly one test must be enabled",
                ))
            }
        };

        // Exciton parameters
        let generation_rate = r.take_pair("exciton_generation_rate")?;
        let singlet_lifetime = r.take_pair("singlet_lifetime")?;
        let triplet_lifetime = r.take_pair("triplet_lifetime")?;
        let singlet_hop_prefactor = r.take_pair("r_singlet_hopping")?;
        let singlet_localization = r.take_pair("singlet_localization")?;
        let triplet_hop_prefactor = r.take_pair("r_triplet_hopping")?;
        let triplet_localization = r.take_pair("triplet_localization")?;
        let fret_triplet_annihilation = r.take_bool("enable_fret_triplet_annihilation")?;
        let exciton_exciton_annihilation = r.take_pair("r_exciton_exciton_annihilation")?;
        let exciton_polaron_annihilation = r.take_pair("r_exciton_polaron_annihilation")?;
        let fret_cutoff = r.take_u32("fret_cutoff")?;
        let binding_energy = r.take_pair("e_exciton_binding")?;
        let dissociation_prefactor = r.take_pair("r_exciton_dissociation")?;
        let dissociation_cutoff = r.take_u32("exciton_dissociation_cutoff")?;
        let isc_prefactor = r.take_pair("r_exciton_isc")?;
        let risc_prefactor = r.take_pair("r_exciton_risc")?;
        let singlet_triplet_gap = r.take_pair("e_exciton_st")?;

        // Polaron parameters
        let phase_restriction = r.take_bool("enable_phase_restriction")?;
        let hop_prefactor = r.take_pair("r_polaron_hopping")?;
        let localization = r.take_pair("polaron_localization")?;
        let enable_miller = r.take_bool("enable_miller_abrahams")?;
        let enable_marcus = r.take_bool("enable_marcus")?;
        let hopping_model = match (enable_miller, enable_marcus) {
            (true, false) => HoppingModel::MillerAbrahams,
            (false, true) => HoppingModel::Marcus,
            _ => {
                return Err(Error::parameter(
                    "polaron_hopping_model",
                    "exactly one of Miller-Abrahams and Marcus must be enabled",
                ))
            }
        };
        let reorganization = r.take_pair("reorganization")?;
        let recombination_prefactor = r.take_f64("r_polaron_recombination")?;
        let hopping_cutoff = r.take_u32("polaron_hopping_cutoff")?;
        let enable_delocalization = r.take_bool("enable_gaussian_polaron_delocalization")?;
        let delocalization_length = r.take_f64("polaron_delocalization_length")?;

        // Energetics
        let homo_donor = r.take_f64("homo_donor")?;
        let lumo_donor = r.take_f64("lumo_donor")?;
        let homo_acceptor = r.take_f64("homo_acceptor")?;
        let lumo_acceptor = r.take_f64("lumo_acceptor")?;
        let enable_gaussian_dos = r.take_bool("enable_gaussian_dos")?;
        let energy_stdev = r.take_pair("energy_stdev")?;
        let enable_exponential_dos = r.take_bool("enable_exponential_dos")?;
        let energy_urbach = r.take_pair("energy_urbach")?;
        let disorder = match (enable_gaussian_dos, enable_exponential_dos) {
            (false, false) => DisorderModel::None,
            (true, false) => DisorderModel::Gaussian {
                stdev_donor: energy_stdev.donor,
                stdev_acceptor: energy_stdev.acceptor,
            },
            (false, true) => DisorderModel::Exponential {
                urbach_donor: energy_urbach.donor,
                urbach_acceptor: energy_urbach.acceptor,
            },
            (true, true) => {
                return Err(Error::parameter(
                    "dos_selection",
                    "Gaussian and exponential DOS are mutually exclusive",
                ))
            }
        };
        let enable_correlated = r.take_bool("enable_correlated_disorder")?;
        let correlation_length = r.take_f64("disorder_correlation_length")?;
        let enable_gaussian_kernel = r.take_bool("enable_gaussian_kernel")?;
        let enable_power_kernel = r.take_bool("enable_power_kernel")?;
        let power_kernel_exponent = r.take_u32("power_kernel_exponent")?;
        let correlation = if enable_correlated {
            let kernel = match (enable_gaussian_kernel, enable_power_kernel) {
                (true, false) => Kernel::Gaussian,
                (false, true) => Kernel::Power {
                    exponent: power_kernel_exponent,
                },
                _ => {
                    return Err(Error::parameter(
                        "correlation_kernel",
                        "exactly one of the Gaussian and power kernels must be enabled",
                    ))
                }
            };
            Some(Correlation {
                length: correlation_length,
                kernel,
            })
        } else {
            None
        };
        let dielectric = r.take_pair("dielectric")?;
        let coulomb_cutoff = r.take_u32("coulomb_cutoff")?;

        let params = Self {
            kmc: KmcConfig {
                algorithm,
                recalc_cutoff,
            },
            geometry: Geometry {
                dims,
                periodic,
                unit_size,
            },
            temperature,
            internal_potential,
            architecture,
            morphology,
            test: TestConfig {
                n_tests,
                mode,
                extraction_map_output,
            },
            exciton: ExcitonConfig {
                generation_rate,
                singlet_lifetime,
                triplet_lifetime,
                singlet_hop_prefactor,
                singlet_localization,
                triplet_hop_prefactor,
                triplet_localization,
                fret_triplet_annihilation,
                exciton_exciton_annihilation,
                exciton_polaron_annihilation,
                fret_cutoff,
                binding_energy,
                dissociation_prefactor,
                dissociation_cutoff,
                isc_prefactor,
                risc_prefactor,
                singlet_triplet_gap,
                triplet_fusion_singlet_fraction: 1.0 / 9.0,
            },
            polaron: PolaronConfig {
                phase_restriction,
                hop_prefactor,
                localization,
                hopping_model,
                reorganization,
                recombination_prefactor,
                hopping_cutoff,
                gaussian_delocalization: enable_delocalization.then_some(delocalization_length),
            },
            energetics: EnergeticsConfig {
                homo: PairByType {
                    donor: homo_donor,
                    acceptor: homo_acceptor,
                },
                lumo: PairByType {
                    donor: lumo_donor,
                    acceptor: lumo_acceptor,
                },
                disorder,
                correlation,
                dielectric,
                coulomb_cutoff,
            },
        };
        params.validate()?;
        Ok(params)
    }

    /// Cross-field consistency checks beyond per-token parsing.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Parameter`] naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        let [l, w, h] = self.geometry.dims;
        if l == 0 || w == 0 || h == 0 {
            return Err(Error::parameter("dimensions", "all must be positive"));
        }
        if self.geometry.unit_size <= 0.0 {
            return Err(Error::parameter("unit_size", "must be positive"));
        }
        if self.temperature <= 0.0 {
            return Err(Error::parameter("temperature", "must be positive"));
        }
        if self.kmc.recalc_cutoff == 0 {
            return Err(Error::parameter("recalc_cutoff", "must be at least 1"));
        }
        match self.architecture {
            Architecture::Bilayer {
                thickness_donor,
                thickness_acceptor,
            } => {
                if thickness_donor + thickness_acceptor != h {
                    return Err(Error::parameter(
                        "bilayer_thickness",
                        format!(
                            "donor ({thickness_donor}) plus acceptor ({thickness_acceptor}) slabs must fill the film height ({h})"
                        ),
                    ));
                }
            }
            Architecture::RandomBlend { acceptor_conc } => {
                if !(0.0..=1.0).contains(&acceptor_conc) {
                    return Err(Error::parameter("acceptor_conc", "must lie in [0,1]"));
                }
            }
            Architecture::Neat => {}
        }
        if let MorphologyImport::Set {
            format,
            n_test_morphologies,
            set_size,
        } = &self.morphology
        {
            if !format.contains('#') {
                return Err(Error::parameter(
                    "morphology_set_format",
                    "format must contain a '#' placeholder",
                ));
            }
            if n_test_morphologies > set_size {
                return Err(Error::parameter(
                    "n_test_morphologies",
                    "cannot exceed the morphology set size",
                ));
            }
        }
        if self.test.n_tests == 0 {
            return Err(Error::parameter("n_tests", "must be positive"));
        }
        match self.test.mode {
            TestMode::TimeOfFlight {
                initial_polarons,
                transient_start,
                transient_end,
                pts_per_decade,
                ..
            } => {
                if initial_polarons == 0 {
                    return Err(Error::parameter("tof_initial_polarons", "must be positive"));
                }
                check_window("tof_transient", transient_start, transient_end, pts_per_decade)?;
            }
            TestMode::Dynamics {
                initial_conc,
                transient_start,
                transient_end,
                pts_per_decade,
                ..
            } => {
                if initial_conc <= 0.0 {
                    return Err(Error::parameter(
                        "dynamics_initial_exciton_conc",
                        "must be positive",
                    ));
                }
                check_window(
                    "dynamics_transient",
                    transient_start,
                    transient_end,
                    pts_per_decade,
                )?;
            }
            TestMode::Iqe { time_cutoff } => {
                if time_cutoff <= 0.0 {
                    return Err(Error::parameter("iqe_time_cutoff", "must be positive"));
                }
                if self.exciton.generation_rate.donor <= 0.0
                    && self.exciton.generation_rate.acceptor <= 0.0
                {
                    return Err(Error::parameter(
                        "exciton_generation_rate",
                        "the IQE test needs a positive photogeneration rate",
                    ));
                }
            }
            TestMode::ExcitonDiffusion => {}
        }
        for (name, value) in [
            ("singlet_lifetime_donor", self.exciton.singlet_lifetime.donor),
            ("singlet_lifetime_acceptor", self.exciton.singlet_lifetime.acceptor),
            ("triplet_lifetime_donor", self.exciton.triplet_lifetime.donor),
            ("triplet_lifetime_acceptor", self.exciton.triplet_lifetime.acceptor),
        ] {
            if value <= 0.0 {
                return Err(Error::parameter(name, "must be positive"));
            }
        }
        for (name, value) in [
            ("fret_cutoff", self.exciton.fret_cutoff),
            ("exciton_dissociation_cutoff", self.exciton.dissociation_cutoff),
            ("polaron_hopping_cutoff", self.polaron.hopping_cutoff),
            ("coulomb_cutoff", self.energetics.coulomb_cutoff),
        ] {
            if value == 0 {
                return Err(Error::parameter(name, "must be at least 1"));
            }
        }
        if self.polaron.hopping_model == HoppingModel::Marcus
            && (self.polaron.reorganization.donor <= 0.0
                || self.polaron.reorganization.acceptor <= 0.0)
        {
            return Err(Error::parameter(
                "reorganization",
                "Marcus hopping needs positive reorganization energies",
            ));
        }
        if let Some(length) = self.polaron.gaussian_delocalization {
            if length <= 0.0 {
                return Err(Error::parameter(
                    "polaron_delocalization_length",
                    "must be positive",
                ));
            }
        }
        match self.energetics.disorder {
            DisorderModel::Gaussian {
                stdev_donor,
                stdev_acceptor,
            } => {
                if stdev_donor < 0.0 || stdev_acceptor < 0.0 {
                    return Err(Error::parameter("energy_stdev", "must be non-negative"));
                }
            }
            DisorderModel::Exponential {
                urbach_donor,
                urbach_acceptor,
            } => {
                if urbach_donor < 0.0 || urbach_acceptor < 0.0 {
                    return Err(Error::parameter("energy_urbach", "must be non-negative"));
                }
            }
            DisorderModel::None => {}
        }
        if let Some(correlation) = self.energetics.correlation {
            if correlation.length <= 0.0 {
                return Err(Error::parameter(
                    "disorder_correlation_length",
                    "must be positive",
                ));
            }
            if let Kernel::Power { exponent } = correlation.kernel {
                if exponent == 0 {
                    return Err(Error::parameter("power_kernel_exponent", "must be at least 1"));
                }
            }
        }
        if self.energetics.dielectric.donor <= 0.0 || self.energetics.dielectric.acceptor <= 0.0 {
            return Err(Error::parameter("dielectric", "must be positive"));
        }
        Ok(())
    }

    /// Largest interaction cutoff of any process, in site units. The
    /// invalidation neighborhood after an event execution must cover it.
    #[must_use]
    pub fn max_process_cutoff(&self) -> u32 {
        self.exciton
            .fret_cutoff
            .max(self.exciton.dissociation_cutoff)
            .max(self.polaron.hopping_cutoff)
            .max(self.energetics.coulomb_cutoff)
    }
}

fn check_window(name: &str, start: f64, end: f64, pts_per_decade: usize) -> Result<()> {
    if !(start > 0.0 && end > start) {
        return Err(Error::parameter(
            name,
            format!("window [{start}, {end}) must be positive and increasing"),
        ));
    }
    if pts_per_decade == 0 {
        return Err(Error::parameter(name, "points per decade must be positive"));
    }
    Ok(())
}

/// An imported film morphology: per-site type and optional energy override,
/// in site-index order.
#[derive(Clone, Debug)]
pub struct Morphology {
    /// Lattice dimensions the file was written for.
    pub dims: [usize; 3],
    /// Per-site records in flat x-major order.
    pub sites: Vec<(SiteType, Option<f64>)>,
}

/// Reads a morphology file: a `L W H` header line followed by one record
/// per site, `d` or `a` optionally followed by `,energy`. Comment lines
/// start with `--` or `##`.
///
/// # Errors
///
/// Returns [`Error::Morphology`] on malformed records or a site count that
/// does not match the header.
pub fn read_morphology(reader: impl BufRead) -> Result<Morphology> {
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::Morphology(e.to_string()))?;
        if line.starts_with("--") || line.starts_with("##") || line.trim().is_empty() {
            continue;
        }
        lines.push(line.trim().to_owned());
    }
    let mut it = lines.into_iter();
    let header = it.next().ok_or_else(|| Error::Morphology("empty file".into()))?;
    let dims: Vec<usize> = header
        .split_whitespace()
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Morphology(format!("bad header '{header}'")))?;
    let &[l, w, h] = dims.as_slice() else {
        return Err(Error::Morphology(format!("bad header '{header}'")));
    };

    let mut sites = Vec::with_capacity(l * w * h);
    for record in it {
        let (ty_token, energy_token) = match record.split_once(',') {
            Some((ty, energy)) => (ty.trim(), Some(energy.trim())),
            None => (record.as_str(), None),
        };
        let ty = match ty_token {
            "d" => SiteType::Donor,
            "a" => SiteType::Acceptor,
            other => return Err(Error::Morphology(format!("bad site type '{other}'"))),
        };
        let energy = match energy_token {
            Some(token) => Some(
                token
                    .parse()
                    .map_err(|_| Error::Morphology(format!("bad site energy '{token}'")))?,
            ),
            None => None,
        };
        sites.push((ty, energy));
    }
    if sites.len() != l * w * h {
        return Err(Error::Morphology(format!(
            "expected {} site records, found {}",
            l * w * h,
            sites.len()
        )));
    }
    Ok(Morphology {
        dims: [l, w, h],
        sites,
    })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::io::Cursor;

    /// A complete, valid parameter file for a small exciton diffusion run.
    pub(crate) fn sample_file() -> String {
        let lines: Vec<String> = vec![
            "## KMC algorithm".into(),
            "false / enable first reaction method".into(),
            "true / enable selective recalculation".into(),
            "3 / recalculation cutoff".into(),
            "false / enable full recalculation".into(),
            "-- geometry".into(),
            "true / periodic x".into(),
            "true / periodic y".into(),
            "true / periodic z".into(),
            "16 / length".into(),
            "16 / width".into(),
            "16 / height".into(),
            "1.0 / unit size (nm)".into(),
            "300 / temperature (K)".into(),
            "0 / internal potential (V)".into(),
            "-- architecture".into(),
            "true / neat".into(),
            "false / bilayer".into(),
            "8 / donor thickness".into(),
            "8 / acceptor thickness".into(),
            "false / random blend".into(),
            "0.5 / acceptor concentration".into(),
            "-- morphology import".into(),
            "false / import single morphology".into(),
            "none / morphology filename".into(),
            "false / import morphology set".into(),
            "morph_#.txt / morphology set format".into(),
            "1 / n test morphologies".into(),
            "1 / morphology set size".into(),
            "-- tests".into(),
            "10 / n tests".into(),
            "true / exciton diffusion test".into(),
            "false / ToF test".into(),
            "electron / ToF polaron type".into(),
            "20 / ToF initial polarons".into(),
            "1e-9 / ToF transient start".into(),
            "1e-5 / ToF transient end".into(),
            "10 / ToF points per decade".into(),
            "false / IQE test".into(),
            "1e-4 / IQE time cutoff".into(),
            "false / extraction map output".into(),
            "false / dynamics test".into(),
            "false / dynamics extraction".into(),
            "1e17 / dynamics initial exciton concentration".into(),
            "1e-10 / dynamics transient start".into(),
            "1e-6 / dynamics transient end".into(),
            "10 / dynamics points per decade".into(),
            "-- exciton parameters".into(),
            "1e22 / generation rate donor".into(),
            "1e22 / generation rate acceptor".into(),
            "1e-9 / singlet lifetime donor".into(),
            "1e-9 / singlet lifetime acceptor".into(),
            "1e-6 / triplet lifetime donor".into(),
            "1e-6 / triplet lifetime acceptor".into(),
            "1e12 / singlet hopping donor".into(),
            "1e12 / singlet hopping acceptor".into(),
            "1.0 / singlet localization donor".into(),
            "1.0 / singlet localization acceptor".into(),
            "1e11 / triplet hopping donor".into(),
            "1e11 / triplet hopping acceptor".into(),
            "2.0 / triplet localization donor".into(),
            "2.0 / triplet localization acceptor".into(),
            "false / FRET triplet annihilation".into(),
            "1e12 / exciton-exciton annihilation donor".into(),
            "1e12 / exciton-exciton annihilation acceptor".into(),
            "1e12 / exciton-polaron annihilation donor".into(),
            "1e12 / exciton-polaron annihilation acceptor".into(),
            "2 / FRET cutoff".into(),
            "0.3 / binding energy donor".into(),
            "0.3 / binding energy acceptor".into(),
            "1e14 / dissociation rate donor".into(),
            "1e14 / dissociation rate acceptor".into(),
            "1 / dissociation cutoff".into(),
            "0 / ISC donor".into(),
            "0 / ISC acceptor".into(),
            "0 / RISC donor".into(),
            "0 / RISC acceptor".into(),
            "0.7 / E_ST donor".into(),
            "0.7 / E_ST acceptor".into(),
            "-- polaron parameters".into(),
            "false / phase restriction".into(),
            "1e12 / polaron hopping donor".into(),
            "1e12 / polaron hopping acceptor".into(),
            "2.0 / polaron localization donor".into(),
            "2.0 / polaron localization acceptor".into(),
            "true / Miller-Abrahams".into(),
            "false / Marcus".into(),
            "0.2 / reorganization donor".into(),
            "0.2 / reorganization acceptor".into(),
            "1e12 / recombination rate".into(),
            "2 / polaron hopping cutoff".into(),
            "false / gaussian delocalization".into(),
            "1.5 / delocalization length".into(),
            "-- energetics".into(),
            "5.3 / HOMO donor".into(),
            "3.0 / LUMO donor".into(),
            "5.6 / HOMO acceptor".into(),
            "3.9 / LUMO acceptor".into(),
            "false / gaussian DOS".into(),
            "0.05 / energy stdev donor".into(),
            "0.05 / energy stdev acceptor".into(),
            "false / exponential DOS".into(),
            "0.025 / urbach energy donor".into(),
            "0.025 / urbach energy acceptor".into(),
            "false / correlated disorder".into(),
            "3.0 / correlation length".into(),
            "false / gaussian kernel".into(),
            "false / power kernel".into(),
            "2 / power kernel exponent".into(),
            "3.5 / dielectric donor".into(),
            "3.5 / dielectric acceptor".into(),
            "3 / coulomb cutoff".into(),
        ];
        lines.join("\n")
    }

    #[test]
    fn sample_file_parses() {
        let params = Parameters::from_reader(Cursor::new(sample_file())).unwrap();
        assert_eq!(params.kmc.algorithm, KmcAlgorithm::SelectiveRecalc);
        assert_eq!(params.geometry.dims, [16, 16, 16]);
        assert!(matches!(params.architecture, Architecture::Neat));
        assert!(matches!(params.test.mode, TestMode::ExcitonDiffusion));
        assert_eq!(params.test.n_tests, 10);
        assert!(matches!(params.energetics.disorder, DisorderModel::None));
        assert_eq!(params.max_process_cutoff(), 3);
    }

    #[test]
    fn missing_value_names_the_parameter() {
        let mut file = sample_file();
        // drop the last line (coulomb cutoff)
        file.truncate(file.rfind('\n').unwrap());
        let err = Parameters::from_reader(Cursor::new(file)).unwrap_err();
        assert!(err.to_string().contains("coulomb_cutoff"));
    }

    #[test]
    fn bad_numeric_is_rejected() {
        let file = sample_file().replace("300 / temperature (K)", "warm / temperature (K)");
        let err = Parameters::from_reader(Cursor::new(file)).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn conflicting_algorithms_are_rejected() {
        let file = sample_file().replace(
            "false / enable first reaction method",
            "true / enable first reaction method",
        );
        let err = Parameters::from_reader(Cursor::new(file)).unwrap_err();
        assert!(err.to_string().contains("kmc_algorithm"));
    }

    #[test]
    fn conflicting_dos_is_rejected() {
        let file = sample_file()
            .replace("false / gaussian DOS", "true / gaussian DOS")
            .replace("false / exponential DOS", "true / exponential DOS");
        let err = Parameters::from_reader(Cursor::new(file)).unwrap_err();
        assert!(err.to_string().contains("dos_selection"));
    }

    #[test]
    fn bilayer_slabs_must_fill_the_film() {
        let file = sample_file()
            .replace("true / neat", "false / neat")
            .replace("false / bilayer", "true / bilayer")
            .replace("8 / donor thickness", "5 / donor thickness");
        let err = Parameters::from_reader(Cursor::new(file)).unwrap_err();
        assert!(err.to_string().contains("bilayer_thickness"));
    }

    #[test]
    fn morphology_round_trip() {
        let text = "## test morphology\n2 1 2\nd\nd,-0.05\na\na,0.02\n";
        let morphology = read_morphology(Cursor::new(text)).unwrap();
        assert_eq!(morphology.dims, [2, 1, 2]);
        assert_eq!(morphology.sites.len(), 4);
        assert_eq!(morphology.sites[0], (SiteType::Donor, None));
        assert_eq!(morphology.sites[1], (SiteType::Donor, Some(-0.05)));
        assert_eq!(morphology.sites[3], (SiteType::Acceptor, Some(0.02)));
    }

    #[test]
    fn morphology_site_count_must_match_header() {
        let text = "2 1 2\nd\nd\n";
        assert!(read_morphology(Cursor::new(text)).is_err());
    }
}

use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use excimer::disorder::{DisorderModel, Kernel};
use excimer::params::{Architecture, KmcAlgorithm, MorphologyImport, TestMode};
use excimer::particle::Charge;
use excimer::rates::HoppingModel;
use prettytable::row;
use std::path::PathBuf;
use std::process::ExitCode;

/// Validate a parameter file and display the configuration it selects.
#[derive(Parser)]
pub struct Opts {
    /// Path to the parameter file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let params = helpers::read_parameters(&self.input)?;

        let mut table = helpers::create_table();
        table.set_titles(row![c => "parameter", "value"]);

        let algorithm = match params.kmc.algorithm {
            KmcAlgorithm::FirstReaction => "first reaction".to_owned(),
            KmcAlgorithm::SelectiveRecalc => {
                format!("selective recalculation (cutoff {})", params.kmc.recalc_cutoff)
            }
            KmcAlgorithm::FullRecalc => "full recalculation".to_owned(),
        };
        table.add_row(row!["KMC algorithm", algorithm]);

        let [l, w, h] = params.geometry.dims;
        table.add_row(row![
            "lattice",
            format!("{l} x {w} x {h}, a = {} nm", params.geometry.unit_size)
        ]);
        let [px, py, pz] = params.geometry.periodic;
        table.add_row(row!["periodic", format!("x: {px}, y: {py}, z: {pz}")]);
        table.add_row(row!["temperature", format!("{} K", params.temperature)]);
        table.add_row(row![
            "internal potential",
            format!("{} V", params.internal_potential)
        ]);

        let architecture = match params.architecture {
            Architecture::Neat => "neat".to_owned(),
            Architecture::Bilayer {
                thickness_donor,
                thickness_acceptor,
            } => format!("bilayer ({thickness_donor} donor / {thickness_acceptor} acceptor)"),
            Architecture::RandomBlend { acceptor_conc } => {
                format!("random blend ({acceptor_conc} acceptor)")
            }
        };
        table.add_row(row!["architecture", architecture]);

        let morphology = match &params.morphology {
            MorphologyImport::None => "none".to_owned(),
            MorphologyImport::Single(path) => path.display().to_string(),
            MorphologyImport::Set {
                format,
                n_test_morphologies,
                set_size,
            } => format!("{format} ({n_test_morphologies} of {set_size})"),
        };
        table.add_row(row!["morphology import", morphology]);

        let test = match params.test.mode {
            TestMode::ExcitonDiffusion => {
                format!("exciton diffusion ({} excitons)", params.test.n_tests)
            }
            TestMode::TimeOfFlight {
                polaron_type,
                initial_polarons,
                ..
            } => {
                let carrier = match polaron_type {
                    Charge::Electron => "electron",
                    Charge::Hole => "hole",
                };
                format!("time-of-flight ({initial_polarons} {carrier}s per cycle)")
            }
            TestMode::Iqe { time_cutoff } => format!("IQE (cutoff {time_cutoff} s)"),
            TestMode::Dynamics { initial_conc, .. } => {
                format!("dynamics ({initial_conc} cm^-3)")
            }
        };
        table.add_row(row!["test", test]);

        let disorder = match params.energetics.disorder {
            DisorderModel::None => "none".to_owned(),
            DisorderModel::Gaussian {
                stdev_donor,
                stdev_acceptor,
            } => format!("Gaussian ({stdev_donor} / {stdev_acceptor} eV)"),
            DisorderModel::Exponential {
                urbach_donor,
                urbach_acceptor,
            } => format!("exponential ({urbach_donor} / {urbach_acceptor} eV)"),
        };
        table.add_row(row!["energetic disorder", disorder]);
        if let Some(correlation) = params.energetics.correlation {
            let kernel = match correlation.kernel {
                Kernel::Gaussian => "Gaussian kernel".to_owned(),
                Kernel::Power { exponent } => format!("power kernel (n = {exponent})"),
            };
            table.add_row(row![
                "correlated disorder",
                format!("lambda = {} nm, {kernel}", correlation.length)
            ]);
        }

        let hopping = match params.polaron.hopping_model {
            HoppingModel::MillerAbrahams => "Miller-Abrahams",
            HoppingModel::Marcus => "Marcus",
        };
        table.add_row(row!["polaron hopping", hopping]);
        table.add_row(row![
            "cutoffs (sites)",
            format!(
                "FRET {}, dissociation {}, polaron {}, Coulomb {}",
                params.exciton.fret_cutoff,
                params.exciton.dissociation_cutoff,
                params.polaron.hopping_cutoff,
                params.energetics.coulomb_cutoff
            )
        ]);

        table.printstd();
        println!("'{}' is a valid parameter file", self.input.display());

        Ok(ExitCode::SUCCESS)
    }
}

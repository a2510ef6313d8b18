use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use excimer::params::{Morphology, MorphologyImport, Parameters, TestMode};
use excimer::particle::Charge;
use excimer::rates::ELEMENTARY_CHARGE;
use excimer::transient::Counters;
use excimer::worker::{self, RunConfig, TrajectoryReport};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

/// Run the simulation described by a parameter file.
#[derive(Parser)]
pub struct Opts {
    /// Path to the parameter file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Directory the results and summary files are written into.
    #[arg(default_value = ".", long, value_hint = ValueHint::DirPath, value_name = "DIR")]
    output_dir: PathBuf,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        if cfg.workers == 0 {
            bail!("at least one worker is required");
        }
        let start = Instant::now();
        let params = helpers::read_parameters(&self.input)?;
        let morphologies = assign_morphologies(&params, cfg)?;

        let run_cfg = RunConfig {
            n_workers: cfg.workers,
            master_seed: cfg.seed,
            rendezvous_interval: cfg.rendezvous,
        };
        let reports = worker::run_trajectories(&params, &morphologies, &run_cfg);

        for report in &reports {
            self.write_results_file(&params, report)?;
        }
        if params.test.extraction_map_output {
            for report in &reports {
                self.write_extraction_maps(&params, report)?;
            }
        }
        self.write_summary(&params, &reports, start)?;

        // a simulation abort is reported in-band; only startup failures
        // exit non-zero
        Ok(ExitCode::SUCCESS)
    }
}

fn assign_morphologies(
    params: &Parameters,
    cfg: &GlobalConfiguration,
) -> Result<Vec<Option<Morphology>>> {
    match &params.morphology {
        MorphologyImport::None => Ok(vec![None; cfg.workers]),
        MorphologyImport::Single(path) => {
            let morphology = helpers::read_morphology(path)?;
            Ok(vec![Some(morphology); cfg.workers])
        }
        MorphologyImport::Set {
            format,
            n_test_morphologies,
            set_size,
        } => {
            if *n_test_morphologies == 0 {
                bail!("the morphology set selects no members");
            }
            if *n_test_morphologies > cfg.workers {
                bail!(
                    "the number of workers ({}) cannot be less than the number of morphologies tested ({})",
                    cfg.workers,
                    n_test_morphologies
                );
            }
            // select members from the set, then deal them across workers,
            // reshuffling whenever a full lap starts
            let mut rng = Pcg64::seed_from_u64(cfg.seed);
            let mut members: Vec<usize> = (0..*set_size).collect();
            members.shuffle(&mut rng);
            let mut selected = members[..*n_test_morphologies].to_vec();

            let (prefix, suffix) = format
                .split_once('#')
                .context("morphology set format is missing its '#' placeholder")?;
            let mut assignment = Vec::with_capacity(cfg.workers);
            for rank in 0..cfg.workers {
                let slot = rank % selected.len();
                if slot == 0 {
                    selected.shuffle(&mut rng);
                }
                let path = format!("{prefix}{}{suffix}", selected[slot]);
                assignment.push(Some(helpers::read_morphology(Path::new(&path))?));
            }
            Ok(assignment)
        }
    }
}

fn percent(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = numerator as f64 / denominator as f64;
    100.0 * ratio
}

fn mobilities(params: &Parameters, transit_times: &[f64]) -> Vec<f64> {
    let thickness = film_thickness_cm(params);
    let field = params.internal_potential.abs() / thickness;
    transit_times.iter().map(|t| thickness / (field * t)).collect()
}

fn film_thickness_cm(params: &Parameters) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let h = params.geometry.dims[2] as f64;
    h * params.geometry.unit_size * 1.0e-7
}

fn volume_cm3(params: &Parameters) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let sites = (params.geometry.dims[0] * params.geometry.dims[1] * params.geometry.dims[2]) as f64;
    let a_cm = params.geometry.unit_size * 1.0e-7;
    sites * a_cm * a_cm * a_cm
}

fn carrier_name(charge: Charge) -> &'static str {
    match charge {
        Charge::Electron => "electron",
        Charge::Hole => "hole",
    }
}

impl Opts {
    fn write_results_file(&self, params: &Parameters, report: &TrajectoryReport) -> Result<()> {
        let path = self.output_dir.join(format!("results{}.txt", report.rank));
        let mut file = helpers::create_output_file(&path)?;
        writeln!(file, "excimer v{} results:", env!("CARGO_PKG_VERSION"))?;
        writeln!(
            file,
            "Calculation time elapsed is {} minutes.",
            report.elapsed.as_secs_f64() / 60.0
        )?;
        writeln!(file, "{} seconds have been simulated.", report.simulated_time)?;
        writeln!(file, "{} events have been executed.", report.events_executed)?;

        if let Some(error) = &report.error {
            writeln!(file, "An error occurred during the simulation:")?;
            writeln!(file, "{error}")?;
            return Ok(());
        }

        let counters = &report.counters;
        match params.test.mode {
            TestMode::ExcitonDiffusion => {
                writeln!(file, "Exciton diffusion test results:")?;
                writeln!(file, "{} excitons have been created.", counters.excitons_created)?;
                writeln!(
                    file,
                    "Exciton diffusion length is {} +/- {} nm.",
                    worker::mean(&report.diffusion_lengths),
                    worker::stdev(&report.diffusion_lengths)
                )?;
            }
            TestMode::TimeOfFlight { polaron_type, .. } => {
                writeln!(file, "Time-of-flight charge transport test results:")?;
                let (collected, created) = match polaron_type {
                    Charge::Electron => (counters.electrons_collected, counters.electrons_created),
                    Charge::Hole => (counters.holes_collected, counters.holes_created),
                };
                writeln!(
                    file,
                    "{} of {} {}s have been collected.",
                    collected,
                    created,
                    carrier_name(polaron_type)
                )?;
                let mobility = mobilities(params, &report.transit_times);
                writeln!(
                    file,
                    "Transit time is {} +/- {} s.",
                    worker::mean(&report.transit_times),
                    worker::stdev(&report.transit_times)
                )?;
                writeln!(
                    file,
                    "Charge carrier mobility is {} +/- {} cm^2 V^-1 s^-1.",
                    worker::mean(&mobility),
                    worker::stdev(&mobility)
                )?;
            }
            TestMode::Dynamics { .. } => {
                writeln!(file, "Dynamics test results:")?;
                writeln!(
                    file,
                    "{} initial excitons were created.",
                    counters.excitons_created
                )?;
            }
            TestMode::Iqe { .. } => {
                writeln!(file, "Internal quantum efficiency test results:")?;
                writeln!(file, "{} excitons have been created.", counters.excitons_created)?;
            }
        }

        if matches!(params.test.mode, TestMode::Iqe { .. } | TestMode::Dynamics { .. }) {
            write_loss_fractions(&mut file, counters, "")?;
        }
        if matches!(params.test.mode, TestMode::Iqe { .. }) {
            writeln!(
                file,
                "IQE = {}% with an internal potential of {} V.",
                percent(
                    counters.electrons_collected + counters.holes_collected,
                    2 * counters.excitons_created
                ),
                params.internal_potential
            )?;
        }
        Ok(())
    }

    fn write_extraction_maps(&self, params: &Parameters, report: &TrajectoryReport) -> Result<()> {
        if report.error.is_some() {
            return Ok(());
        }
        match params.test.mode {
            TestMode::TimeOfFlight { polaron_type, .. } => {
                let map = match polaron_type {
                    Charge::Electron => &report.electron_extraction,
                    Charge::Hole => &report.hole_extraction,
                };
                self.write_extraction_map(
                    params,
                    map,
                    &format!("Charge_extraction_map{}.txt", report.rank),
                )?;
            }
            TestMode::Iqe { .. } => {
                self.write_extraction_map(
                    params,
                    &report.electron_extraction,
                    &format!("Electron_extraction_map{}.txt", report.rank),
                )?;
                self.write_extraction_map(
                    params,
                    &report.hole_extraction,
                    &format!("Hole_extraction_map{}.txt", report.rank),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_extraction_map(&self, params: &Parameters, map: &[u64], name: &str) -> Result<()> {
        let path = self.output_dir.join(name);
        let mut file = helpers::create_output_file(&path)?;
        writeln!(file, "X Position,Y Position,Extraction Count")?;
        let width = params.geometry.dims[1];
        for (index, count) in map.iter().enumerate() {
            if *count > 0 {
                writeln!(file, "{},{},{}", index / width, index % width, count)?;
            }
        }
        Ok(())
    }

    fn write_summary(
        &self,
        params: &Parameters,
        reports: &[TrajectoryReport],
        start: Instant,
    ) -> Result<()> {
        let path = self.output_dir.join("analysis_summary.txt");
        let mut file = helpers::create_output_file(&path)?;
        writeln!(file, "excimer v{} results summary:", env!("CARGO_PKG_VERSION"))?;
        writeln!(file, "Simulation was performed on {} workers.", reports.len())?;
        let elapsed_sum: f64 = reports.iter().map(|r| r.elapsed.as_secs_f64()).sum();
        #[allow(clippy::cast_precision_loss)]
        let workers = reports.len() as f64;
        writeln!(
            file,
            "Average calculation time was {} minutes.",
            elapsed_sum / (60.0 * workers)
        )?;
        writeln!(
            file,
            "Total wall-clock time was {} minutes.",
            start.elapsed().as_secs_f64() / 60.0
        )?;

        if reports.iter().any(|r| r.error.is_some()) {
            writeln!(file)?;
            writeln!(file, "An error occurred on one or more workers:")?;
            for report in reports {
                if let Some(error) = &report.error {
                    writeln!(file, "{}: {}", report.rank, error)?;
                }
            }
            // errored trajectories are excluded, so no reductions are
            // written at all
            return Ok(());
        }

        let mut totals = Counters::default();
        for report in reports {
            totals.add(&report.counters);
        }

        match params.test.mode {
            TestMode::ExcitonDiffusion => {
                let lengths = worker::gather(reports.iter().map(|r| r.diffusion_lengths.clone()));
                writeln!(file, "Overall exciton diffusion test results:")?;
                writeln!(file, "{} total excitons tested.", lengths.len())?;
                writeln!(
                    file,
                    "Exciton diffusion length is {} +/- {} nm.",
                    worker::mean(&lengths),
                    worker::stdev(&lengths)
                )?;
            }
            TestMode::TimeOfFlight { polaron_type, .. } => {
                self.write_tof_outputs(params, reports, &mut file, polaron_type, &totals)?;
            }
            TestMode::Dynamics { .. } => {
                self.write_dynamics_transients(params, reports)?;
                writeln!(file, "Overall dynamics test results:")?;
                write_overall_counters(&mut file, &totals)?;
            }
            TestMode::Iqe { .. } => {
                writeln!(file, "Overall internal quantum efficiency test results:")?;
                write_overall_counters(&mut file, &totals)?;
                writeln!(
                    file,
                    "IQE = {}% with an internal potential of {} V.",
                    percent(
                        totals.electrons_collected + totals.holes_collected,
                        2 * totals.excitons_created
                    ),
                    params.internal_potential
                )?;
            }
        }
        Ok(())
    }

    fn write_tof_outputs(
        &self,
        params: &Parameters,
        reports: &[TrajectoryReport],
        summary: &mut impl Write,
        polaron_type: Charge,
        totals: &Counters,
    ) -> Result<()> {
        let transit_times = worker::gather(reports.iter().map(|r| r.transit_times.clone()));
        let mobility = mobilities(params, &transit_times);
        let field = params.internal_potential.abs() / film_thickness_cm(params);
        let cycles_sum: usize = reports.iter().map(|r| r.n_transient_cycles).sum();

        let path = self.output_dir.join("ToF_results.txt");
        let mut file = helpers::create_output_file(&path)?;
        writeln!(
            file,
            "Electric Field (V/cm),Transit Time Avg (s),Transit Time Stdev (s),Mobility Avg (cm^2 V^-1 s^-1),Mobility Stdev (cm^2 V^-1 s^-1)"
        )?;
        writeln!(
            file,
            "{},{},{},{},{}",
            field,
            worker::mean(&transit_times),
            worker::stdev(&transit_times),
            worker::mean(&mobility),
            worker::stdev(&mobility)
        )?;

        // summed transients over all workers and cycles
        if let Some(first) = reports.iter().find_map(|r| r.tof_transient.as_ref()) {
            let times = first.grid().times().to_vec();
            let bins = times.len();
            let mut counts = vec![0_u64; bins];
            let mut energies = vec![0.0_f64; bins];
            let mut displacement = vec![0.0_f64; bins];
            for report in reports {
                if let Some(transient) = &report.tof_transient {
                    worker::sum_counts(&mut counts, &transient.counts);
                    worker::sum_vectors(&mut energies, &transient.energies);
                    worker::sum_vectors(&mut displacement, &transient.displacement_z);
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let volume_total = cycles_sum as f64 * volume_cm3(params);
            let path = self.output_dir.join("ToF_average_transients.txt");
            let mut file = helpers::create_output_file(&path)?;
            writeln!(
                file,
                "Time (s),Current (mA cm^-2),Average Mobility (cm^2 V^-1 s^-1),Average Energy (eV),Carrier Density (cm^-3)"
            )?;
            for bin in 0..bins {
                let width = bin_width(&times, bin);
                #[allow(clippy::cast_precision_loss)]
                let count = counts[bin] as f64;
                let time = times[bin];
                let current = 1000.0 * ELEMENTARY_CHARGE * displacement[bin] / (width * volume_total);
                if counts[bin] == 0 {
                    writeln!(file, "{time},0,NaN,NaN,0")?;
                    continue;
                }
                let avg_mobility = displacement[bin] / (width * count * field);
                let density = count / volume_total;
                #[allow(clippy::cast_precision_loss)]
                if count > 5.0 * cycles_sum as f64 {
                    writeln!(
                        file,
                        "{time},{current},{avg_mobility},{},{density}",
                        energies[bin] / count
                    )?;
                } else {
                    writeln!(file, "{time},{current},{avg_mobility},NaN,{density}")?;
                }
            }

            // transit time distribution over the same time axis
            let attempts = match polaron_type {
                Charge::Electron => totals.electrons_created,
                Charge::Hole => totals.holes_created,
            };
            let mut distribution = vec![0_u64; bins];
            for &transit in &transit_times {
                if let Some(bin) = first.grid().index(transit) {
                    distribution[bin] += 1;
                }
            }
            let path = self.output_dir.join("ToF_transit_time_dist.txt");
            let mut file = helpers::create_output_file(&path)?;
            writeln!(file, "Transit Time (s),Probability")?;
            for (time, count) in times.iter().zip(&distribution) {
                writeln!(file, "{},{}", time, percent(*count, attempts) / 100.0)?;
            }
        }

        let (collected, created) = match polaron_type {
            Charge::Electron => (totals.electrons_collected, totals.electrons_created),
            Charge::Hole => (totals.holes_collected, totals.holes_created),
        };
        writeln!(
            summary,
            "{} total {}s collected out of {} total attempts.",
            collected,
            carrier_name(polaron_type),
            created
        )?;
        writeln!(summary, "Overall time-of-flight charge transport test results:")?;
        writeln!(
            summary,
            "Transit time is {} +/- {} s.",
            worker::mean(&transit_times),
            worker::stdev(&transit_times)
        )?;
        writeln!(
            summary,
            "Charge carrier mobility is {} +/- {} cm^2 V^-1 s^-1.",
            worker::mean(&mobility),
            worker::stdev(&mobility)
        )?;
        Ok(())
    }

    fn write_dynamics_transients(
        &self,
        params: &Parameters,
        reports: &[TrajectoryReport],
    ) -> Result<()> {
        let Some(first) = reports.iter().find_map(|r| r.dynamics_transient.as_ref()) else {
            return Ok(());
        };
        let times = first.grid().times().to_vec();
        let bins = times.len();
        let mut singlets = vec![0_u64; bins];
        let mut triplets = vec![0_u64; bins];
        let mut electrons = vec![0_u64; bins];
        let mut holes = vec![0_u64; bins];
        let mut exciton_energy = vec![0.0_f64; bins];
        let mut electron_energy = vec![0.0_f64; bins];
        let mut hole_energy = vec![0.0_f64; bins];
        let mut exciton_msd = vec![0.0_f64; bins];
        let mut electron_msd = vec![0.0_f64; bins];
        let mut hole_msd = vec![0.0_f64; bins];
        for report in reports {
            if let Some(transient) = &report.dynamics_transient {
                for (bin, snapshot) in transient.bins.iter().enumerate() {
                    singlets[bin] += snapshot.singlets;
                    triplets[bin] += snapshot.triplets;
                    electrons[bin] += snapshot.electrons;
                    holes[bin] += snapshot.holes;
                    exciton_energy[bin] += snapshot.exciton_energy;
                    electron_energy[bin] += snapshot.electron_energy;
                    hole_energy[bin] += snapshot.hole_energy;
                    exciton_msd[bin] += snapshot.exciton_msd;
                    electron_msd[bin] += snapshot.electron_msd;
                    hole_msd[bin] += snapshot.hole_msd;
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let volume_total = reports.len() as f64 * volume_cm3(params);
        let path = self.output_dir.join("dynamics_average_transients.txt");
        let mut file = helpers::create_output_file(&path)?;
        write!(
            file,
            "Time (s),Singlet Exciton Density (cm^-3),Triplet Exciton Density (cm^-3),Electron Density (cm^-3),Hole Density (cm^-3)"
        )?;
        write!(file, ",Average Exciton Energy (eV),Exciton MSD Rate (cm^2 s^-1)")?;
        write!(file, ",Average Electron Energy (eV),Electron MSD Rate (cm^2 s^-1)")?;
        writeln!(file, ",Average Hole Energy (eV),Hole MSD Rate (cm^2 s^-1)")?;
        for bin in 0..bins {
            let time = times[bin];
            #[allow(clippy::cast_precision_loss)]
            let densities = [
                singlets[bin] as f64 / volume_total,
                triplets[bin] as f64 / volume_total,
                electrons[bin] as f64 / volume_total,
                holes[bin] as f64 / volume_total,
            ];
            write!(
                file,
                "{time},{},{},{},{}",
                densities[0], densities[1], densities[2], densities[3]
            )?;
            write_species_columns(&mut file, singlets[bin] + triplets[bin], exciton_energy[bin], exciton_msd[bin], time)?;
            write_species_columns(&mut file, electrons[bin], electron_energy[bin], electron_msd[bin], time)?;
            write_species_columns(&mut file, holes[bin], hole_energy[bin], hole_msd[bin], time)?;
            writeln!(file)?;
        }
        Ok(())
    }
}

fn write_species_columns(
    file: &mut impl Write,
    count: u64,
    energy: f64,
    msd: f64,
    time: f64,
) -> Result<()> {
    if count == 0 {
        write!(file, ",NaN,NaN")?;
    } else {
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        write!(file, ",{},{}", energy / count, msd / (count * time))?;
    }
    Ok(())
}

fn write_overall_counters(file: &mut impl Write, totals: &Counters) -> Result<()> {
    writeln!(file, "{} total excitons have been created.", totals.excitons_created)?;
    write_loss_fractions(file, totals, "total ")
}

fn write_loss_fractions(file: &mut impl Write, counters: &Counters, scope: &str) -> Result<()> {
    writeln!(
        file,
        "{} excitons were created on donor sites.",
        counters.excitons_created_donor
    )?;
    writeln!(
        file,
        "{} excitons were created on acceptor sites.",
        counters.excitons_created_acceptor
    )?;
    let created = counters.excitons_created;
    writeln!(
        file,
        "{}% of {scope}excitons have dissociated.",
        percent(counters.excitons_dissociated, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons relaxed to the ground state as singlets.",
        percent(counters.singlets_recombined, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons relaxed to the ground state as triplets.",
        percent(counters.triplets_recombined, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons were lost to singlet-singlet annihilation.",
        percent(counters.singlet_singlet_annihilations, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons were lost to singlet-triplet annihilation.",
        percent(counters.singlet_triplet_annihilations, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons were lost to triplet-triplet annihilation.",
        percent(counters.triplet_triplet_annihilations, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons were lost to singlet-polaron annihilation.",
        percent(counters.singlet_polaron_annihilations, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}excitons were lost to triplet-polaron annihilation.",
        percent(counters.triplet_polaron_annihilations, created)
    )?;
    writeln!(
        file,
        "{}% of {scope}photogenerated charges were lost to geminate recombination.",
        percent(counters.geminate_recombinations, counters.excitons_dissociated)
    )?;
    writeln!(
        file,
        "{}% of {scope}photogenerated charges were lost to bimolecular recombination.",
        percent(
            counters.bimolecular_recombinations,
            counters.excitons_dissociated
        )
    )?;
    writeln!(
        file,
        "{}% of {scope}photogenerated charges were extracted.",
        percent(
            counters.electrons_collected + counters.holes_collected,
            2 * counters.excitons_dissociated
        )
    )?;
    Ok(())
}

fn bin_width(times: &[f64], bin: usize) -> f64 {
    if bin + 1 < times.len() {
        times[bin + 1] - times[bin]
    } else if times.len() >= 2 {
        times[bin] * (times[1] / times[0]) - times[bin]
    } else {
        times[bin]
    }
}

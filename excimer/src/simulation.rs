//! The trajectory engine: owns all mutable simulation state and executes
//! one event at a time.
//!
//! Per step the scheduler selects the earliest valid event (ties broken by
//! particle id, then event kind), advances the clock, applies the event's
//! effects to occupancy, particle state, and the Coulomb cache, then drops
//! and regenerates the candidate events of every particle whose
//! neighborhood changed. Photogeneration is a recurring lattice-wide event
//! resampled on execution.

use crate::coulomb::CoulombField;
use crate::disorder;
use crate::drivers::Driver;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventStore};
use crate::lattice::{shell_offsets, Lattice, SiteId, SiteType};
use crate::params::{Architecture, KmcAlgorithm, Morphology, Parameters, TestMode};
use crate::particle::{Charge, Exciton, Particle, ParticleId, Polaron, Registry, Spin};
use crate::rates::{self, Attenuation, HoppingModel, BOLTZMANN_EV};
use crate::transient::{Counters, DynamicsTransient, LogTimeGrid, Snapshot, TofTransient};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rustc_hash::FxHashSet;

const NM2_TO_CM2: f64 = 1.0e-14;
const NM_TO_CM: f64 = 1.0e-7;

/// Discrete offsets with their real-space distances, precomputed per
/// process cutoff.
#[derive(Clone, Debug)]
struct Shell {
    offsets: Vec<([i64; 3], f64)>,
}

impl Shell {
    fn new(cutoff: u32, spacing: f64) -> Self {
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
        Self { offsets }
    }
}

/// One KMC trajectory: lattice, particles, events, clock, and observables.
#[derive(Clone, Debug)]
pub struct Simulation {
    params: Parameters,
    lattice: Lattice,
    coulomb: CoulombField,
    registry: Registry,
    events: EventStore,
    rng: Pcg64,
    driver: Driver,
    time: f64,
    events_executed: u64,
    counters: Counters,
    next_generation: Option<f64>,
    generation_rate_total: f64,
    site_counts: [usize; 2],
    dissociation_tags: u32,
    diffusion_lengths: Vec<f64>,
    transit_times: Vec<f64>,
    tof_transient: Option<TofTransient>,
    tof_collection_dz: i64,
    n_transient_cycles: usize,
    dynamics_transient: Option<DynamicsTransient>,
    electron_extraction: Vec<u64>,
    hole_extraction: Vec<u64>,
    fret_shell: Shell,
    dissociation_shell: Shell,
    polaron_shell: Shell,
    recalc_shell: Vec<[i64; 3]>,
    error: Option<String>,
}

impl Simulation {
    /// Builds a trajectory from a deep copy of `params`, seeded
    /// deterministically, with an optional imported morphology.
    ///
    /// # Errors
    ///
    /// Fails on invalid parameters, a morphology that does not match the
    /// lattice geometry, or an experiment misconfiguration.
    pub fn new(params: &Parameters, seed: u64, morphology: Option<&Morphology>) -> Result<Self> {
        params.validate()?;
        let params = params.clone();
        let mut rng = Pcg64::seed_from_u64(seed);
        let driver = Driver::from_params(&params)?;

        let mut lattice = build_lattice(&params, morphology, &mut rng)?;
        disorder::apply(
            &mut lattice,
            params.energetics.disorder,
            params.energetics.correlation,
            &mut rng,
        );
        if let Some(morphology) = morphology {
            for (id, (_, energy)) in lattice.ids().collect::<Vec<_>>().into_iter().zip(&morphology.sites) {
                if let Some(energy) = energy {
                    lattice.site_mut(id).energy = *energy;
                }
            }
        }

        let coulomb = CoulombField::new(
            &lattice,
            params.energetics.coulomb_cutoff,
            params.internal_potential,
            params.energetics.dielectric.donor,
            params.energetics.dielectric.acceptor,
        );

        let spacing = params.geometry.unit_size;
        let fret_shell = Shell::new(params.exciton.fret_cutoff, spacing);
        let dissociation_shell = Shell::new(params.exciton.dissociation_cutoff, spacing);
        let polaron_shell = Shell::new(params.polaron.hopping_cutoff, spacing);
        // the invalidation neighborhood must cover every process cutoff
        let recalc_shell =
            shell_offsets(params.kmc.recalc_cutoff.max(params.max_process_cutoff()));

        let mut site_counts = [0_usize; 2];
        for id in lattice.ids() {
            match lattice.site(id).ty {
                SiteType::Donor => site_counts[0] += 1,
                SiteType::Acceptor => site_counts[1] += 1,
            }
        }
        let site_volume = lattice.volume_cm3() / crate::convert::f64_from_usize(lattice.len());
        let generation_rate_total = params.exciton.generation_rate.donor
            * crate::convert::f64_from_usize(site_counts[0])
            * site_volume
            + params.exciton.generation_rate.acceptor
                * crate::convert::f64_from_usize(site_counts[1])
                * site_volume;

        let tof_transient = match params.test.mode {
            TestMode::TimeOfFlight {
                transient_start,
                transient_end,
                pts_per_decade,
                ..
            } => Some(TofTransient::new(LogTimeGrid::new(
                transient_start,
                transient_end,
                pts_per_decade,
            )?)),
            _ => None,
        };
        let dynamics_transient = match params.test.mode {
            TestMode::Dynamics {
                transient_start,
                transient_end,
                pts_per_decade,
                ..
            } => Some(DynamicsTransient::new(LogTimeGrid::new(
                transient_start,
                transient_end,
                pts_per_decade,
            )?)),
            _ => None,
        };

        let [l, w, _] = params.geometry.dims;
        let keep_all = params.kmc.algorithm == KmcAlgorithm::FirstReaction;
        let mut sim = Self {
            events: EventStore::new(keep_all),
            lattice,
            coulomb,
            registry: Registry::new(),
            rng,
            driver,
            time: 0.0,
            events_executed: 0,
            counters: Counters::default(),
            next_generation: None,
            generation_rate_total,
            site_counts,
            dissociation_tags: 0,
            diffusion_lengths: Vec::new(),
            transit_times: Vec::new(),
            tof_transient,
            tof_collection_dz: 0,
            n_transient_cycles: 0,
            dynamics_transient,
            electron_extraction: vec![0; l * w],
            hole_extraction: vec![0; l * w],
            fret_shell,
            dissociation_shell,
            polaron_shell,
            recalc_shell,
            error: None,
            params,
        };
        sim.seed_initial_particles()?;
        sim.regenerate_all()?;
        sim.schedule_generation()?;
        Ok(sim)
    }

    // ---- public state accessors -------------------------------------------------

    /// Current simulated time in s.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Events executed so far.
    #[must_use]
    pub fn events_executed(&self) -> u64 {
        self.events_executed
    }

    /// Event counters.
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Live particle registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Recorded per-exciton diffusion lengths in nm.
    #[must_use]
    pub fn diffusion_lengths(&self) -> &[f64] {
        &self.diffusion_lengths
    }

    /// Recorded carrier transit times in s.
    #[must_use]
    pub fn transit_times(&self) -> &[f64] {
        &self.transit_times
    }

    /// Time-of-flight transient accumulator, when running ToF.
    #[must_use]
    pub fn tof_transient(&self) -> Option<&TofTransient> {
        self.tof_transient.as_ref()
    }

    /// Dynamics transient accumulator, when running dynamics.
    #[must_use]
    pub fn dynamics_transient(&self) -> Option<&DynamicsTransient> {
        self.dynamics_transient.as_ref()
    }

    /// Completed time-of-flight transient cycles.
    #[must_use]
    pub fn n_transient_cycles(&self) -> usize {
        self.n_transient_cycles
    }

    /// Collected-electron counts per (x, y) column, flattened x-major.
    #[must_use]
    pub fn electron_extraction_map(&self) -> &[u64] {
        &self.electron_extraction
    }

    /// Collected-hole counts per (x, y) column, flattened x-major.
    #[must_use]
    pub fn hole_extraction_map(&self) -> &[u64] {
        &self.hole_extraction
    }

    /// Film volume in cm³.
    #[must_use]
    pub fn volume_cm3(&self) -> f64 {
        self.lattice.volume_cm3()
    }

    /// Film thickness along z in cm.
    #[must_use]
    pub fn film_thickness_cm(&self) -> f64 {
        crate::convert::f64_from_usize(self.params.geometry.dims[2])
            * self.params.geometry.unit_size
            * NM_TO_CM
    }

    /// Magnitude of the internal electric field in V/cm.
    #[must_use]
    pub fn internal_field(&self) -> f64 {
        self.params.internal_potential.abs() / self.film_thickness_cm()
    }

    /// Message of the runtime error that stopped this trajectory, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the driver's stop condition holds.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.driver
            .is_finished(&self.counters, self.registry.len(), self.time)
    }

    // ---- energy bookkeeping -----------------------------------------------------

    fn kt(&self) -> f64 {
        BOLTZMANN_EV * self.params.temperature
    }

    /// Exciton energy at a site: optical gap minus binding energy plus the
    /// site's disorder contribution.
    fn exciton_energy(&self, site: SiteId) -> f64 {
        let s = self.lattice.site(site);
        let e = &self.params.energetics;
        (e.homo.for_type(s.ty) - e.lumo.for_type(s.ty))
            - self.params.exciton.binding_energy.for_type(s.ty)
            + s.energy
    }

    /// Polaron energy at a site, including band edge, disorder, the cached
    /// Coulomb potential, and the internal field. `own` excludes that
    /// carrier's own pair contribution when it evaluates a nearby target.
    fn polaron_energy(&self, charge: Charge, site: SiteId, own: Option<SiteId>) -> f64 {
        let s = self.lattice.site(site);
        let e = &self.params.energetics;
        let band = match charge {
            Charge::Electron => -e.lumo.for_type(s.ty),
            Charge::Hole => e.homo.for_type(s.ty),
        };
        let potential = match own {
            Some(own_site) => self
                .coulomb
                .potential_excluding(&self.lattice, site, own_site, charge),
            None => self.coulomb.potential(site),
        };
        band + s.energy + charge.sign() * (potential + self.coulomb.field_term(&self.lattice, site))
    }

    // ---- candidate event generation ---------------------------------------------

    fn sample_event(
        &mut self,
        kind: EventKind,
        particle: ParticleId,
        target: Option<SiteId>,
        rate: f64,
        out: &mut Vec<Event>,
    ) -> Result<()> {
        if rate == 0.0 {
            return Ok(());
        }
        if !rate.is_finite() || rate < 0.0 {
            return Err(Error::Rate(format!(
                "non-finite or negative rate {rate} for {kind:?}"
            )));
        }
        let wait = rates::wait_time(rate, &mut self.rng)?;
        out.push(Event {
            kind,
            particle,
            target,
            time: self.time + wait,
        });
        Ok(())
    }

    fn exciton_candidates(&mut self, id: ParticleId, exciton: &Exciton) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let site = exciton.site;
        let ty = self.lattice.site(site).ty;
        let kt = self.kt();
        let spacing = self.params.geometry.unit_size;
        let x = self.params.exciton;

        // relaxation to the ground state
        let lifetime = match exciton.spin {
            Spin::Singlet => x.singlet_lifetime.for_type(ty),
            Spin::Triplet => x.triplet_lifetime.for_type(ty),
        };
        self.sample_event(EventKind::ExcitonRelax, id, None, rates::first_order(lifetime), &mut out)?;

        // spin interconversion
        match exciton.spin {
            Spin::Singlet => {
                self.sample_event(
                    EventKind::IntersystemCrossing,
                    id,
                    None,
                    x.isc_prefactor.for_type(ty),
                    &mut out,
                )?;
            }
            Spin::Triplet => {
                let rate = x.risc_prefactor.for_type(ty)
                    * (-x.singlet_triplet_gap.for_type(ty) / kt).exp();
                self.sample_event(EventKind::ReverseIntersystemCrossing, id, None, rate, &mut out)?;
            }
        }

        // transfer and annihilation within the FRET shell
        let e_src = self.exciton_energy(site);
        for i in 0..self.fret_shell.offsets.len() {
            let (offset, r) = self.fret_shell.offsets[i];
            let Some(target) = self.lattice.offset(site, offset) else {
                continue;
            };
            if target == site {
                continue;
            }
            match self.lattice.site(target).occupant {
                None => {
                    let delta_e = self.exciton_energy(target) - e_src;
                    let rate = match exciton.spin {
                        Spin::Singlet => {
                            rates::forster(x.singlet_hop_prefactor.for_type(ty), spacing, r)
                                * rates::boltzmann_penalty(delta_e, kt)
                        }
                        Spin::Triplet => {
                            rates::dexter(
                                x.triplet_hop_prefactor.for_type(ty),
                                x.triplet_localization.for_type(ty),
                                r,
                            ) * rates::boltzmann_penalty(delta_e, kt)
                        }
                    };
                    self.sample_event(EventKind::ExcitonHop, id, Some(target), rate, &mut out)?;
                }
                Some(other) => {
                    let Some(other_particle) = self.registry.get(other) else {
                        return Err(Error::Invariant(format!(
                            "site {} holds a dangling occupant",
                            target.index()
                        )));
                    };
                    let (kind, prefactor) = match other_particle {
                        Particle::Exciton(_) => (
                            EventKind::ExcitonExcitonAnnihilation,
                            x.exciton_exciton_annihilation.for_type(ty),
                        ),
                        Particle::Polaron(_) => (
                            EventKind::ExcitonPolaronAnnihilation,
                            x.exciton_polaron_annihilation.for_type(ty),
                        ),
                    };
                    let rate = match exciton.spin {
                        // Förster-type capture for singlets, and for triplets
                        // when the long-range channel is enabled
                        Spin::Singlet => rates::forster(prefactor, spacing, r),
                        Spin::Triplet if x.fret_triplet_annihilation => {
                            rates::forster(prefactor, spacing, r)
                        }
                        Spin::Triplet => {
                            rates::dexter(prefactor, x.triplet_localization.for_type(ty), r)
                        }
                    };
                    self.sample_event(kind, id, Some(target), rate, &mut out)?;
                }
            }
        }

        // charge-transfer dissociation onto the opposite phase
        let gamma = match exciton.spin {
            Spin::Singlet => x.singlet_localization.for_type(ty),
            Spin::Triplet => x.triplet_localization.for_type(ty),
        };
        for i in 0..self.dissociation_shell.offsets.len() {
            let (offset, r) = self.dissociation_shell.offsets[i];
            let Some(target) = self.lattice.offset(site, offset) else {
                continue;
            };
            if target == site
                || self.lattice.site(target).ty == ty
                || self.lattice.site(target).occupant.is_some()
            {
                continue;
            }
            let delta_e = self.dissociation_delta_e(site, target);
            let rate = rates::miller_abrahams(
                x.dissociation_prefactor.for_type(ty),
                Attenuation::Exponential { gamma },
                r,
                delta_e,
                kt,
            );
            self.sample_event(EventKind::ExcitonDissociate, id, Some(target), rate, &mut out)?;
        }

        Ok(out)
    }

    /// Energy change of splitting an exciton at `site` into a geminate pair
    /// with the transferred carrier on `target`: the pair's band and
    /// environment energies, minus the exciton state, minus the attraction
    /// of the pair being created (which is not yet in the Coulomb cache).
    fn dissociation_delta_e(&self, site: SiteId, target: SiteId) -> f64 {
        let pair = self.coulomb.pair_energy(&self.lattice, site, target);
        match self.lattice.site(site).ty {
            // electron transfers to the acceptor, the hole stays behind
            SiteType::Donor => {
                self.polaron_energy(Charge::Electron, target, None)
                    + self.polaron_energy(Charge::Hole, site, None)
                    - self.exciton_energy(site)
                    - pair
            }
            // hole transfers to the donor, the electron stays behind
            SiteType::Acceptor => {
                self.polaron_energy(Charge::Hole, target, None)
                    + self.polaron_energy(Charge::Electron, site, None)
                    - self.exciton_energy(site)
                    - pair
            }
        }
    }

    fn polaron_candidates(&mut self, id: ParticleId, polaron: &Polaron) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let site = polaron.site;
        let charge = polaron.charge;
        let ty = self.lattice.site(site).ty;
        let kt = self.kt();
        let p = self.params.polaron;

        let attenuation = p.gaussian_delocalization.map_or(
            Attenuation::Exponential {
                gamma: p.localization.for_type(ty),
            },
            |length| Attenuation::Gaussian { length },
        );
        let prefactor = p.hop_prefactor.for_type(ty);
        let lambda = p.reorganization.for_type(ty);
        let e_src = self.polaron_energy(charge, site, None);

        for i in 0..self.polaron_shell.offsets.len() {
            let (offset, r) = self.polaron_shell.offsets[i];
            match self.lattice.offset(site, offset) {
                Some(target) if target != site => {
                    let target_site = self.lattice.site(target);
                    match target_site.occupant {
                        None => {
                            if p.phase_restriction && !phase_allows(charge, target_site.ty) {
                                continue;
                            }
                            let delta_e =
                                self.polaron_energy(charge, target, Some(site)) - e_src;
                            let rate = match p.hopping_model {
                                HoppingModel::MillerAbrahams => {
                                    rates::miller_abrahams(prefactor, attenuation, r, delta_e, kt)
                                }
                                HoppingModel::Marcus => {
                                    rates::marcus(prefactor, attenuation, r, delta_e, lambda, kt)
                                }
                            };
                            self.sample_event(EventKind::PolaronHop, id, Some(target), rate, &mut out)?;
                        }
                        Some(other) => {
                            let Some(other_particle) = self.registry.get(other) else {
                                return Err(Error::Invariant(format!(
                                    "site {} holds a dangling occupant",
                                    target.index()
                                )));
                            };
                            // recombination is attempted from the electron
                            // side only, so each pair carries a single
                            // candidate event
                            if let Particle::Polaron(other_polaron) = other_particle {
                                if charge == Charge::Electron
                                    && other_polaron.charge == Charge::Hole
                                {
                                    let rate =
                                        p.recombination_prefactor * attenuation.factor(r);
                                    self.sample_event(
                                        EventKind::PolaronRecombination,
                                        id,
                                        Some(target),
                                        rate,
                                        &mut out,
                                    )?;
                                }
                            }
                        }
                    }
                }
                None => {
                    // out of the film: only straight steps through an
                    // electrode face count, and in ToF only the face
                    // opposite the injection layer collects
                    if offset[0] != 0 || offset[1] != 0 {
                        continue;
                    }
                    let dz = offset[2].signum();
                    if offset[2] != dz {
                        continue;
                    }
                    if !self.driver.allows_extraction()
                        || !self.lattice.exits_through_electrode(site, dz)
                    {
                        continue;
                    }
                    if self.tof_collection_dz != 0 && dz != self.tof_collection_dz {
                        continue;
                    }
                    let height = crate::convert::f64_from_usize(self.params.geometry.dims[2]);
                    #[allow(clippy::cast_precision_loss)]
                    let delta_e = charge.sign() * self.params.internal_potential * (dz as f64)
                        / height;
                    let rate = match p.hopping_model {
                        HoppingModel::MillerAbrahams => {
                            rates::miller_abrahams(prefactor, attenuation, r, delta_e, kt)
                        }
                        HoppingModel::Marcus => {
                            rates::marcus(prefactor, attenuation, r, delta_e, lambda, kt)
                        }
                    };
                    self.sample_event(EventKind::PolaronExtraction, id, None, rate, &mut out)?;
                }
                Some(_) => {}
            }
        }

        Ok(out)
    }

    fn candidate_events(&mut self, id: ParticleId) -> Result<Vec<Event>> {
        let Some(particle) = self.registry.get(id).cloned() else {
            return Err(Error::Invariant(format!(
                "regenerating events for dead particle {}",
                id.index()
            )));
        };
        match particle {
            Particle::Exciton(exciton) => self.exciton_candidates(id, &exciton),
            Particle::Polaron(polaron) => self.polaron_candidates(id, &polaron),
        }
    }

    fn regenerate(&mut self, id: ParticleId) -> Result<()> {
        let events = self.candidate_events(id)?;
        self.events.replace(id, events);
        Ok(())
    }

    fn regenerate_all(&mut self) -> Result<()> {
        let ids: Vec<_> = self.registry.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.regenerate(id)?;
        }
        Ok(())
    }

    /// Regenerates the executing particle's survivors plus every particle
    /// within the recalculation neighborhood of the touched sites. Under
    /// full recalculation, every particle is regenerated instead.
    fn regenerate_after(&mut self, touched: &[SiteId], extra: &[ParticleId]) -> Result<()> {
        if self.params.kmc.algorithm == KmcAlgorithm::FullRecalc {
            return self.regenerate_all();
        }
        let mut set: FxHashSet<ParticleId> = FxHashSet::default();
        for &id in extra {
            if self.registry.contains(id) {
                set.insert(id);
            }
        }
        for &site in touched {
            if let Some(id) = self.lattice.site(site).occupant {
                set.insert(id);
            }
            for &offset in &self.recalc_shell {
                if let Some(neighbor) = self.lattice.offset(site, offset) {
                    if let Some(id) = self.lattice.site(neighbor).occupant {
                        set.insert(id);
                    }
                }
            }
        }
        // sorted order keeps the RNG consumption sequence reproducible
        let mut ids: Vec<_> = set.into_iter().collect();
        ids.sort();
        for id in ids {
            if self.registry.contains(id) {
                self.regenerate(id)?;
            }
        }
        Ok(())
    }

    // ---- particle lifecycle -----------------------------------------------------

    fn spawn_exciton(&mut self, site: SiteId, spin: Spin) -> Result<ParticleId> {
        if self.lattice.site(site).occupant.is_some() {
            return Err(Error::Invariant(format!(
                "creating an exciton on occupied site {}",
                site.index()
            )));
        }
        let id = self.registry.insert(Particle::Exciton(Exciton {
            spin,
            created_at: self.time,
            site,
            displacement: [0.0; 3],
            path_length: 0.0,
        }));
        self.lattice.site_mut(site).occupant = Some(id);
        self.counters.excitons_created += 1;
        match self.lattice.site(site).ty {
            SiteType::Donor => self.counters.excitons_created_donor += 1,
            SiteType::Acceptor => self.counters.excitons_created_acceptor += 1,
        }
        Ok(id)
    }

    fn spawn_polaron(&mut self, site: SiteId, charge: Charge, pair_tag: Option<u32>) -> Result<ParticleId> {
        if self.lattice.site(site).occupant.is_some() {
            return Err(Error::Invariant(format!(
                "creating a polaron on occupied site {}",
                site.index()
            )));
        }
        let id = self.registry.insert(Particle::Polaron(Polaron {
            charge,
            created_at: self.time,
            site,
            displacement: [0.0; 3],
            pair_tag,
        }));
        self.lattice.site_mut(site).occupant = Some(id);
        self.coulomb.insert(&self.lattice, site, charge);
        match charge {
            Charge::Electron => self.counters.electrons_created += 1,
            Charge::Hole => self.counters.holes_created += 1,
        }
        Ok(id)
    }

    /// Destroys a particle, unsetting both ends of the site link and
    /// dropping its events.
    fn destroy(&mut self, id: ParticleId) -> Result<Particle> {
        let Some(particle) = self.registry.remove(id) else {
            return Err(Error::Invariant(format!(
                "destroying dead particle {}",
                id.index()
            )));
        };
        let site = particle.site();
        if self.lattice.site(site).occupant != Some(id) {
            return Err(Error::Invariant(format!(
                "particle {} does not occupy its recorded site {}",
                id.index(),
                site.index()
            )));
        }
        self.lattice.site_mut(site).occupant = None;
        if let Particle::Polaron(ref polaron) = particle {
            self.coulomb.remove(&self.lattice, site, polaron.charge);
        }
        self.events.remove(id);
        Ok(particle)
    }

    fn move_particle(&mut self, id: ParticleId, to: SiteId) -> Result<[f64; 3]> {
        let Some(particle) = self.registry.get(id) else {
            return Err(Error::Invariant(format!("moving dead particle {}", id.index())));
        };
        let from = particle.site();
        if self.lattice.site(to).occupant.is_some() {
            return Err(Error::Invariant(format!(
                "hop target {} is already occupied",
                to.index()
            )));
        }
        let delta = self.lattice.displacement(from, to);
        self.lattice.site_mut(from).occupant = None;
        self.lattice.site_mut(to).occupant = Some(id);
        if let Some(Particle::Polaron(polaron)) = self.registry.get(id) {
            let charge = polaron.charge;
            self.coulomb.shift(&self.lattice, from, to, charge);
        }
        self.registry
            .get_mut(id)
            .ok_or_else(|| Error::Invariant("particle vanished mid-move".into()))?
            .relocate(to, delta);
        Ok(delta)
    }

    fn random_empty_site(&mut self, ty: Option<SiteType>) -> Result<SiteId> {
        let n = self.lattice.len();
        for _ in 0..n * 100 {
            let index = self.rng.gen_range(0..n);
            let id = SiteId::from_index(u32::try_from(index).unwrap());
            let site = self.lattice.site(id);
            if site.occupant.is_none() && ty.map_or(true, |ty| site.ty == ty) {
                return Ok(id);
            }
        }
        Err(Error::Rate("no empty site available for particle creation".into()))
    }

    // ---- driver seeding ---------------------------------------------------------

    fn seed_initial_particles(&mut self) -> Result<()> {
        match self.driver {
            Driver::ExcitonDiffusion { .. } => {
                let site = self.random_empty_site(None)?;
                self.spawn_exciton(site, Spin::Singlet)?;
                Ok(())
            }
            Driver::TimeOfFlight { .. } => self.start_tof_cycle(),
            Driver::Iqe { .. } => Ok(()),
            Driver::Dynamics { .. } => {
                let TestMode::Dynamics { initial_conc, .. } = self.params.test.mode else {
                    unreachable!();
                };
                let n = crate::convert::usize_from_f64(
                    (initial_conc * self.volume_cm3()).round(),
                )
                .max(1);
                if n > self.lattice.len() / 2 {
                    return Err(Error::parameter(
                        "dynamics_initial_exciton_conc",
                        "requested exciton count exceeds half the lattice sites",
                    ));
                }
                for _ in 0..n {
                    let site = self.random_empty_site(None)?;
                    self.spawn_exciton(site, Spin::Singlet)?;
                }
                Ok(())
            }
        }
    }

    /// Injects a fresh carrier packet for a time-of-flight cycle on a fresh
    /// disorder realization. The injection face is the z face where the
    /// carrier's field energy is highest, so the packet drifts across the
    /// film and is collected at the opposite face.
    fn start_tof_cycle(&mut self) -> Result<()> {
        let Driver::TimeOfFlight {
            polaron_type,
            initial_polarons,
            ..
        } = self.driver
        else {
            unreachable!();
        };
        disorder::apply(
            &mut self.lattice,
            self.params.energetics.disorder,
            self.params.energetics.correlation,
            &mut self.rng,
        );

        let [l, w, h] = self.params.geometry.dims;
        if initial_polarons > l * w / 2 {
            return Err(Error::parameter(
                "tof_initial_polarons",
                "injected packet exceeds half the injection layer",
            ));
        }
        // field energy per unit height is q·Φ/H; inject where it is highest
        let downhill = polaron_type.sign() * self.params.internal_potential;
        let (face, collection_dz) = if downhill > 0.0 { (h - 1, -1) } else { (0, 1) };
        self.tof_collection_dz = collection_dz;

        for _ in 0..initial_polarons {
            let site = loop {
                let x = self.rng.gen_range(0..l);
                let y = self.rng.gen_range(0..w);
                let id = self.lattice.site_at([x, y, face]);
                if self.lattice.site(id).occupant.is_none() {
                    break id;
                }
            };
            self.spawn_polaron(site, polaron_type, None)?;
        }
        if let Driver::TimeOfFlight { cycle_start, .. } = &mut self.driver {
            *cycle_start = self.time;
        }
        self.regenerate_all()
    }

    fn schedule_generation(&mut self) -> Result<()> {
        if self.driver.generation_active(&self.counters) && self.generation_rate_total > 0.0 {
            let wait = rates::wait_time(self.generation_rate_total, &mut self.rng)?;
            self.next_generation = Some(self.time + wait);
        } else {
            self.next_generation = None;
        }
        Ok(())
    }

    fn execute_generation(&mut self, time: f64) -> Result<()> {
        self.time = time;
        let g = self.params.exciton.generation_rate;
        let share_donor = g.donor * crate::convert::f64_from_usize(self.site_counts[0]);
        let share_acceptor = g.acceptor * crate::convert::f64_from_usize(self.site_counts[1]);
        let ty = if self.rng.gen::<f64>() * (share_donor + share_acceptor) < share_donor {
            SiteType::Donor
        } else {
            SiteType::Acceptor
        };
        let site = self.random_empty_site(Some(ty))?;
        let id = self.spawn_exciton(site, Spin::Singlet)?;
        self.events_executed += 1;
        self.regenerate_after(&[site], &[id])?;
        self.schedule_generation()
    }

    // ---- the scheduler step -----------------------------------------------------

    /// Executes the next event. On error the message is also recorded on
    /// the simulator so the worker can report it at the next rendezvous.
    ///
    /// # Errors
    ///
    /// Any rate failure or invariant violation stops the trajectory.
    pub fn execute_next_event(&mut self) -> Result<()> {
        match self.step() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.error = Some(error.to_string());
                Err(error)
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        // a time-of-flight cycle whose window has closed expires: the
        // remaining carriers count as failed transit attempts
        if let Driver::TimeOfFlight {
            transient_end,
            cycle_start,
            ..
        } = self.driver
        {
            let deadline = cycle_start + transient_end;
            let next = match (self.events.peek(), self.next_generation) {
                (Some(event), Some(generation)) => Some(event.time.min(generation)),
                (Some(event), None) => Some(event.time),
                (None, generation) => generation,
            };
            if !self.registry.is_empty() && next.map_or(true, |t| t > deadline) {
                return self.expire_tof_cycle();
            }
        }

        let next_event = self.events.peek();
        match (next_event, self.next_generation) {
            (None, None) => Err(Error::Rate(format!(
                "event queue empty with {} live particles",
                self.registry.len()
            ))),
            (Some(event), Some(generation)) if generation < event.time => {
                self.execute_generation(generation)
            }
            (None, Some(generation)) => self.execute_generation(generation),
            (Some(_), _) => {
                let event = self
                    .events
                    .pop()
                    .ok_or_else(|| Error::Rate("event queue drained between peek and pop".into()))?;
                if event.time < self.time {
                    return Err(Error::Invariant(format!(
                        "event time {} precedes the clock {}",
                        event.time, self.time
                    )));
                }
                if let Some(transient) = &mut self.dynamics_transient {
                    let snapshot = snapshot_of(&self.lattice, &self.coulomb, &self.registry, &self.params);
                    transient.advance(event.time, snapshot);
                }
                self.time = event.time;
                self.apply_event(event)?;
                self.events_executed += 1;
                self.after_event()
            }
        }
    }

    fn apply_event(&mut self, event: Event) -> Result<()> {
        match event.kind {
            EventKind::ExcitonHop | EventKind::PolaronHop => {
                let target = required_target(&event)?;
                let Some(particle) = self.registry.get(event.particle) else {
                    return Err(Error::Invariant("executing event of dead particle".into()));
                };
                let from = particle.site();
                let delta = self.move_particle(event.particle, target)?;
                if event.kind == EventKind::PolaronHop {
                    self.record_tof_hop(event.particle, delta[2])?;
                }
                self.regenerate_after(&[from, target], &[event.particle])
            }
            EventKind::ExcitonRelax => {
                let particle = self.destroy(event.particle)?;
                let Particle::Exciton(exciton) = particle else {
                    return Err(Error::Invariant("relaxation of a non-exciton".into()));
                };
                match exciton.spin {
                    Spin::Singlet => self.counters.singlets_recombined += 1,
                    Spin::Triplet => self.counters.triplets_recombined += 1,
                }
                let site = exciton.site;
                self.exciton_died(&exciton)?;
                self.regenerate_after(&[site], &[])
            }
            EventKind::IntersystemCrossing | EventKind::ReverseIntersystemCrossing => {
                let Some(Particle::Exciton(exciton)) = self.registry.get_mut(event.particle) else {
                    return Err(Error::Invariant("spin flip of a non-exciton".into()));
                };
                let site = exciton.site;
                exciton.spin = match event.kind {
                    EventKind::IntersystemCrossing => Spin::Triplet,
                    _ => Spin::Singlet,
                };
                match event.kind {
                    EventKind::IntersystemCrossing => self.counters.intersystem_crossings += 1,
                    _ => self.counters.reverse_intersystem_crossings += 1,
                }
                self.regenerate_after(&[site], &[event.particle])
            }
            EventKind::ExcitonExcitonAnnihilation => {
                self.apply_exciton_exciton_annihilation(event)
            }
            EventKind::ExcitonPolaronAnnihilation => {
                let target = required_target(&event)?;
                let particle = self.destroy(event.particle)?;
                let Particle::Exciton(exciton) = particle else {
                    return Err(Error::Invariant("annihilation of a non-exciton".into()));
                };
                match exciton.spin {
                    Spin::Singlet => self.counters.singlet_polaron_annihilations += 1,
                    Spin::Triplet => self.counters.triplet_polaron_annihilations += 1,
                }
                let site = exciton.site;
                self.exciton_died(&exciton)?;
                self.regenerate_after(&[site, target], &[])
            }
            EventKind::ExcitonDissociate => self.apply_dissociation(event),
            EventKind::PolaronRecombination => self.apply_recombination(event),
            EventKind::PolaronExtraction => self.apply_extraction(event),
        }
    }

    fn apply_exciton_exciton_annihilation(&mut self, event: Event) -> Result<()> {
        let target = required_target(&event)?;
        let Some(Particle::Exciton(executor)) = self.registry.get(event.particle).cloned() else {
            return Err(Error::Invariant("annihilation of a non-exciton".into()));
        };
        let Some(other_id) = self.lattice.site(target).occupant else {
            return Err(Error::Invariant("annihilation target is empty".into()));
        };
        let Some(Particle::Exciton(other)) = self.registry.get(other_id).cloned() else {
            return Err(Error::Invariant("annihilation target is not an exciton".into()));
        };

        let source = executor.site;
        match (executor.spin, other.spin) {
            (Spin::Singlet, Spin::Singlet) => {
                self.counters.singlet_singlet_annihilations += 1;
                let gone = self.destroy(event.particle)?;
                self.note_exciton_loss(&gone)?;
            }
            (Spin::Singlet, Spin::Triplet) => {
                // the singlet is quenched
                self.counters.singlet_triplet_annihilations += 1;
                let gone = self.destroy(event.particle)?;
                self.note_exciton_loss(&gone)?;
            }
            (Spin::Triplet, Spin::Singlet) => {
                self.counters.singlet_triplet_annihilations += 1;
                let gone = self.destroy(other_id)?;
                self.note_exciton_loss(&gone)?;
            }
            (Spin::Triplet, Spin::Triplet) => {
                self.counters.triplet_triplet_annihilations += 1;
                let gone = self.destroy(event.particle)?;
                self.note_exciton_loss(&gone)?;
                // triplet-triplet fusion can regenerate a singlet
                let fraction = self.params.exciton.triplet_fusion_singlet_fraction;
                if fraction > 0.0 && self.rng.gen::<f64>() < fraction {
                    if let Some(Particle::Exciton(survivor)) = self.registry.get_mut(other_id) {
                        survivor.spin = Spin::Singlet;
                    }
                }
            }
        }
        self.regenerate_after(&[source, target], &[])
    }

    fn apply_dissociation(&mut self, event: Event) -> Result<()> {
        let target = required_target(&event)?;
        let particle = self.destroy(event.particle)?;
        let Particle::Exciton(exciton) = particle else {
            return Err(Error::Invariant("dissociation of a non-exciton".into()));
        };
        let site = exciton.site;
        self.counters.excitons_dissociated += 1;
        self.dissociation_tags += 1;
        let tag = Some(self.dissociation_tags);
        match self.lattice.site(site).ty {
            SiteType::Donor => {
                self.spawn_polaron(target, Charge::Electron, tag)?;
                self.spawn_polaron(site, Charge::Hole, tag)?;
            }
            SiteType::Acceptor => {
                self.spawn_polaron(target, Charge::Hole, tag)?;
                self.spawn_polaron(site, Charge::Electron, tag)?;
            }
        }
        self.exciton_died(&exciton)?;
        self.regenerate_after(&[site, target], &[])
    }

    fn apply_recombination(&mut self, event: Event) -> Result<()> {
        let target = required_target(&event)?;
        let Some(hole_id) = self.lattice.site(target).occupant else {
            return Err(Error::Invariant("recombination target is empty".into()));
        };
        let electron = self.destroy(event.particle)?;
        let hole = self.destroy(hole_id)?;
        let (Particle::Polaron(electron), Particle::Polaron(hole)) = (electron, hole) else {
            return Err(Error::Invariant("recombination of non-polarons".into()));
        };
        let geminate = match (electron.pair_tag, hole.pair_tag) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if geminate {
            self.counters.geminate_recombinations += 1;
        } else {
            self.counters.bimolecular_recombinations += 1;
        }
        self.regenerate_after(&[electron.site, hole.site], &[])
    }

    fn apply_extraction(&mut self, event: Event) -> Result<()> {
        let particle = self.destroy(event.particle)?;
        let Particle::Polaron(polaron) = particle else {
            return Err(Error::Invariant("extraction of a non-polaron".into()));
        };
        let [x, y, _] = self.lattice.coords(polaron.site);
        let column = x * self.params.geometry.dims[1] + y;
        match polaron.charge {
            Charge::Electron => {
                self.counters.electrons_collected += 1;
                self.electron_extraction[column] += 1;
            }
            Charge::Hole => {
                self.counters.holes_collected += 1;
                self.hole_extraction[column] += 1;
            }
        }
        let lifetime = self.time - polaron.created_at;
        self.transit_times.push(lifetime);
        self.regenerate_after(&[polaron.site], &[])
    }

    fn record_tof_hop(&mut self, id: ParticleId, dz_nm: f64) -> Result<()> {
        let Driver::TimeOfFlight { cycle_start, .. } = self.driver else {
            return Ok(());
        };
        let Some(Particle::Polaron(polaron)) = self.registry.get(id) else {
            return Err(Error::Invariant("recording hop of a dead polaron".into()));
        };
        let energy = self.polaron_energy(polaron.charge, polaron.site, None);
        if let Some(transient) = &mut self.tof_transient {
            transient.record_hop(self.time - cycle_start, energy, dz_nm * NM_TO_CM);
        }
        Ok(())
    }

    /// Bookkeeping shared by every exciton-consuming path in the diffusion
    /// test: one test is complete, and the next probe exciton is seeded.
    fn exciton_died(&mut self, exciton: &Exciton) -> Result<()> {
        let Driver::ExcitonDiffusion { n_tests, completed } = &mut self.driver else {
            return Ok(());
        };
        *completed += 1;
        self.diffusion_lengths
            .push(exciton.squared_displacement().sqrt());
        if *completed < *n_tests {
            let site = self.random_empty_site(None)?;
            let id = self.spawn_exciton(site, Spin::Singlet)?;
            // neighbors may hold stale candidates targeting the now
            // occupied site
            self.regenerate_after(&[site], &[id])?;
        }
        Ok(())
    }

    fn note_exciton_loss(&mut self, particle: &Particle) -> Result<()> {
        if let Particle::Exciton(exciton) = particle {
            self.exciton_died(exciton)?;
        }
        Ok(())
    }

    fn after_event(&mut self) -> Result<()> {
        if matches!(self.driver, Driver::TimeOfFlight { .. }) && self.registry.is_empty() {
            self.finish_tof_cycle()?;
        }
        Ok(())
    }

    fn finish_tof_cycle(&mut self) -> Result<()> {
        let Driver::TimeOfFlight {
            cycles_total,
            cycles_done,
            ..
        } = &mut self.driver
        else {
            return Ok(());
        };
        *cycles_done += 1;
        self.n_transient_cycles += 1;
        if *cycles_done < *cycles_total {
            self.start_tof_cycle()?;
        }
        Ok(())
    }

    fn expire_tof_cycle(&mut self) -> Result<()> {
        let ids: Vec<_> = self.registry.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.destroy(id)?;
        }
        self.finish_tof_cycle()
    }

    // ---- invariant auditing -----------------------------------------------------

    /// Verifies the site ↔ particle bijection, the particle bookkeeping
    /// identity, and the Coulomb cache against a fresh recomputation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invariant`] naming the first broken invariant.
    pub fn check_invariants(&self) -> Result<()> {
        let mut live_excitons = 0_u64;
        for (id, particle) in self.registry.iter() {
            if self.lattice.site(particle.site()).occupant != Some(id) {
                return Err(Error::Invariant(format!(
                    "particle {} not recorded as occupant of site {}",
                    id.index(),
                    particle.site().index()
                )));
            }
            if matches!(particle, Particle::Exciton(_)) {
                live_excitons += 1;
            }
        }
        let mut occupied = 0_usize;
        for site in self.lattice.ids() {
            if let Some(id) = self.lattice.site(site).occupant {
                occupied += 1;
                let Some(particle) = self.registry.get(id) else {
                    return Err(Error::Invariant(format!(
                        "site {} holds dead occupant",
                        site.index()
                    )));
                };
                if particle.site() != site {
                    return Err(Error::Invariant(format!(
                        "site {} occupant points elsewhere",
                        site.index()
                    )));
                }
            }
        }
        if occupied != self.registry.len() {
            return Err(Error::Invariant(format!(
                "{} occupied sites but {} live particles",
                occupied,
                self.registry.len()
            )));
        }
        if self.counters.excitons_created != self.counters.excitons_consumed() + live_excitons {
            return Err(Error::Invariant(format!(
                "exciton bookkeeping off: {} created, {} consumed, {} live",
                self.counters.excitons_created,
                self.counters.excitons_consumed(),
                live_excitons
            )));
        }
        let drift = self.coulomb.drift(&self.lattice, &self.registry);
        if drift > 1.0e-9 {
            return Err(Error::Invariant(format!(
                "Coulomb cache drifted by {drift} eV"
            )));
        }
        Ok(())
    }
}

fn required_target(event: &Event) -> Result<SiteId> {
    event
        .target
        .ok_or_else(|| Error::Invariant(format!("{:?} event without a target", event.kind)))
}

fn phase_allows(charge: Charge, ty: SiteType) -> bool {
    match charge {
        Charge::Electron => ty == SiteType::Acceptor,
        Charge::Hole => ty == SiteType::Donor,
    }
}

/// Builds the site grid from the imported morphology or the configured
/// architecture.
fn build_lattice(
    params: &Parameters,
    morphology: Option<&Morphology>,
    rng: &mut Pcg64,
) -> Result<Lattice> {
    let geometry = params.geometry;
    if let Some(morphology) = morphology {
        if morphology.dims != geometry.dims {
            return Err(Error::Morphology(format!(
                "morphology dimensions {:?} do not match the lattice {:?}",
                morphology.dims, geometry.dims
            )));
        }
        let mut lattice = Lattice::new(geometry, SiteType::Donor);
        for (id, (ty, _)) in lattice.ids().collect::<Vec<_>>().into_iter().zip(&morphology.sites) {
            lattice.site_mut(id).ty = *ty;
        }
        return Ok(lattice);
    }
    match params.architecture {
        Architecture::Neat => Ok(Lattice::new(geometry, SiteType::Donor)),
        Architecture::Bilayer {
            thickness_donor, ..
        } => {
            let mut lattice = Lattice::new(geometry, SiteType::Donor);
            for id in lattice.ids().collect::<Vec<_>>() {
                if lattice.coords(id)[2] >= thickness_donor {
                    lattice.site_mut(id).ty = SiteType::Acceptor;
                }
            }
            Ok(lattice)
        }
        Architecture::RandomBlend { acceptor_conc } => {
            let mut lattice = Lattice::new(geometry, SiteType::Donor);
            for id in lattice.ids().collect::<Vec<_>>() {
                if rng.gen::<f64>() < acceptor_conc {
                    lattice.site_mut(id).ty = SiteType::Acceptor;
                }
            }
            Ok(lattice)
        }
    }
}

/// Captures populations, summed energies, and summed squared displacements
/// of the live particles.
fn snapshot_of(
    lattice: &Lattice,
    coulomb: &CoulombField,
    registry: &Registry,
    params: &Parameters,
) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for (_, particle) in registry.iter() {
        match particle {
            Particle::Exciton(exciton) => {
                match exciton.spin {
                    Spin::Singlet => snapshot.singlets += 1,
                    Spin::Triplet => snapshot.triplets += 1,
                }
                let site = lattice.site(exciton.site);
                let e = &params.energetics;
                snapshot.exciton_energy += (e.homo.for_type(site.ty) - e.lumo.for_type(site.ty))
                    - params.exciton.binding_energy.for_type(site.ty)
                    + site.energy;
                snapshot.exciton_msd += particle.squared_displacement() * NM2_TO_CM2;
            }
            Particle::Polaron(polaron) => {
                let site = lattice.site(polaron.site);
                let e = &params.energetics;
                let band = match polaron.charge {
                    Charge::Electron => -e.lumo.for_type(site.ty),
                    Charge::Hole => e.homo.for_type(site.ty),
                };
                let energy = band
                    + site.energy
                    + polaron.charge.sign()
                        * (coulomb.potential(polaron.site) + coulomb.field_term(lattice, polaron.site));
                match polaron.charge {
                    Charge::Electron => {
                        snapshot.electrons += 1;
                        snapshot.electron_energy += energy;
                        snapshot.electron_msd += particle.squared_displacement() * NM2_TO_CM2;
                    }
                    Charge::Hole => {
                        snapshot.holes += 1;
                        snapshot.hole_energy += energy;
                        snapshot.hole_msd += particle.squared_displacement() * NM2_TO_CM2;
                    }
                }
            }
        }
    }
    snapshot
}

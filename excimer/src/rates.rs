//! Rate laws for every physical process in the simulation.
//!
//! All functions here are pure: they map a prefactor, a geometry, and an
//! energy difference to a first-order rate constant in 1/s. Which arguments
//! to feed them (site energies, Coulomb shifts, field terms) is decided by
//! the scheduler.

use crate::error::{Error, Result};
use rand::Rng;

/// Boltzmann constant in eV/K.
pub const BOLTZMANN_EV: f64 = 8.617333262e-5;

/// Elementary charge in C.
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;

/// e²/(4π ε₀) in eV·nm; divide by the relative permittivity and a distance
/// in nm to get a pairwise Coulomb energy in eV.
pub const COULOMB_EV_NM: f64 = 1.439964548;

/// Spatial attenuation of a transfer integral between two localized states.
#[derive(Clone, Copy, Debug)]
pub enum Attenuation {
    /// Exponential decay `exp(-2 γ r)` with inverse localization length γ
    /// in 1/nm.
    Exponential {
        /// Inverse localization length in 1/nm.
        gamma: f64,
    },
    /// Gaussian decay `exp(-(r/ℓ)²)` used for delocalized polarons.
    Gaussian {
        /// Delocalization length ℓ in nm.
        length: f64,
    },
}

impl Attenuation {
    /// Evaluates the attenuation factor at separation `r` (nm).
    #[must_use]
    pub fn factor(self, r: f64) -> f64 {
        match self {
            Self::Exponential { gamma } => (-2.0 * gamma * r).exp(),
            Self::Gaussian { length } => (-(r / length) * (r / length)).exp(),
        }
    }
}

/// Phonon-assisted hopping rate law for polarons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HoppingModel {
    /// Uphill hops pay `exp(-ΔE/kT)`, downhill hops are unpenalized.
    MillerAbrahams,
    /// Activated hopping with reorganization energy λ.
    Marcus,
}

/// Uphill Boltzmann penalty: `exp(-ΔE/kT)` for ΔE > 0, otherwise 1.
#[must_use]
pub fn boltzmann_penalty(delta_e: f64, kt: f64) -> f64 {
    if delta_e > 0.0 {
        (-delta_e / kt).exp()
    } else {
        1.0
    }
}

/// Förster (dipole-dipole) transfer rate `k (a/r)⁶` between sites separated
/// by `r` nm on a lattice with spacing `a` nm.
#[must_use]
pub fn forster(prefactor: f64, spacing: f64, r: f64) -> f64 {
    let x = spacing / r;
    prefactor * x.powi(6)
}

/// Dexter (exchange) transfer rate `k exp(-2 γ r)`.
#[must_use]
pub fn dexter(prefactor: f64, gamma: f64, r: f64) -> f64 {
    prefactor * (-2.0 * gamma * r).exp()
}

/// Miller-Abrahams hopping rate.
#[must_use]
pub fn miller_abrahams(prefactor: f64, attenuation: Attenuation, r: f64, delta_e: f64, kt: f64) -> f64 {
    prefactor * attenuation.factor(r) * boltzmann_penalty(delta_e, kt)
}

/// Marcus hopping rate with reorganization energy `lambda` (eV).
#[must_use]
pub fn marcus(prefactor: f64, attenuation: Attenuation, r: f64, delta_e: f64, lambda: f64, kt: f64) -> f64 {
    let activation = (delta_e + lambda) * (delta_e + lambda) / (4.0 * lambda * kt);
    prefactor * attenuation.factor(r) * (-activation).exp()
}

/// First-order decay rate for a state with the given lifetime in s.
#[must_use]
pub fn first_order(lifetime: f64) -> f64 {
    1.0 / lifetime
}

/// Samples an exponential wait time `Δt = -ln(u)/k` for an event with rate
/// `rate` (1/s).
///
/// # Errors
///
/// Fails when the rate is non-finite or non-positive, which would produce a
/// negative or non-finite wait time.
pub fn wait_time(rate: f64, rng: &mut impl Rng) -> Result<f64> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::Rate(format!("cannot sample wait time for rate {rate}")));
    }
    // u is uniform on [0,1); flip it to (0,1] so the logarithm stays finite
    let u = 1.0 - rng.gen::<f64>();
    Ok(-u.ln() / rate)
}

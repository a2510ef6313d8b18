#![warn(clippy::all, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! `excimer` is a kinetic Monte Carlo engine for exciton and charge-carrier
//! dynamics in organic semiconductor thin films.
//!
//! A trajectory lives on a 3D lattice of donor/acceptor sites with a
//! disordered energy landscape. Singlet and triplet excitons and
//! electron/hole polarons are created, hop, dissociate, annihilate,
//! recombine, and are collected at electrodes, one exponentially
//! distributed event at a time. Independent trajectories run as parallel
//! workers whose observables are reduced after a barrier.

pub mod coulomb;
pub mod disorder;
pub mod drivers;
pub mod error;
pub mod event;
pub mod lattice;
pub mod params;
pub mod particle;
pub mod rates;
pub mod simulation;
pub mod transient;
pub mod worker;

mod convert;

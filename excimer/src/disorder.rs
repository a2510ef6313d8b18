//! Static energetic disorder: density-of-states sampling and optional
//! spatial correlation.
//!
//! Site energies are deviations from the material band edges; the band
//! edges themselves (HOMO/LUMO) are added by the energy bookkeeping in the
//! scheduler. Generation is deterministic given the RNG state and runs once
//! per lattice realization.

use crate::lattice::{Lattice, SiteType};
use ndarray::Array3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Density of states the site energies are drawn from.
#[derive(Clone, Copy, Debug)]
pub enum DisorderModel {
    /// No energetic disorder; every site sits at the band edge.
    None,
    /// Gaussian DOS with per-material standard deviation σ in eV.
    Gaussian {
        /// σ for donor sites.
        stdev_donor: f64,
        /// σ for acceptor sites.
        stdev_acceptor: f64,
    },
    /// One-sided exponential (Urbach) tail below the band edge, with
    /// per-material characteristic energy in eV.
    Exponential {
        /// Urbach energy for donor sites.
        urbach_donor: f64,
        /// Urbach energy for acceptor sites.
        urbach_acceptor: f64,
    },
}

/// Shape of the spatial correlation kernel.
#[derive(Clone, Copy, Debug)]
pub enum Kernel {
    /// Gaussian kernel; its width is chosen so the 1/e point of the
    /// resulting energy autocorrelation lands at the correlation length.
    Gaussian,
    /// Slowly decaying kernel `1/(1 + (r/λ))ⁿ` with integer exponent n ≥ 1.
    Power {
        /// Kernel exponent.
        exponent: u32,
    },
}

/// Spatial correlation settings.
#[derive(Clone, Copy, Debug)]
pub struct Correlation {
    /// Correlation length λ in nm.
    pub length: f64,
    /// Kernel shape.
    pub kernel: Kernel,
}

/// Samples site energies and, when requested, imprints spatial correlation
/// by kernel convolution. After convolution the field is rescaled so its
/// sample mean and standard deviation match the uncorrelated sample, which
/// preserves the marginal spread for the exponential tail as well.
pub fn apply(
    lattice: &mut Lattice,
    model: DisorderModel,
    correlation: Option<Correlation>,
    rng: &mut impl Rng,
) {
    match model {
        DisorderModel::None => {
            for id in lattice.ids().collect::<Vec<_>>() {
                lattice.site_mut(id).energy = 0.0;
            }
            return;
        }
        DisorderModel::Gaussian {
            stdev_donor,
            stdev_acceptor,
        } => {
            let donor = Normal::new(0.0, stdev_donor).unwrap();
            let acceptor = Normal::new(0.0, stdev_acceptor).unwrap();
            for id in lattice.ids().collect::<Vec<_>>() {
                let sample = match lattice.site(id).ty {
                    SiteType::Donor => donor.sample(rng),
                    SiteType::Acceptor => acceptor.sample(rng),
                };
                lattice.site_mut(id).energy = sample;
            }
        }
        DisorderModel::Exponential {
            urbach_donor,
            urbach_acceptor,
        } => {
            for id in lattice.ids().collect::<Vec<_>>() {
                let urbach = match lattice.site(id).ty {
                    SiteType::Donor => urbach_donor,
                    SiteType::Acceptor => urbach_acceptor,
                };
                // u in (0,1] keeps the logarithm finite; the tail extends
                // below the band edge
                let u = 1.0 - rng.gen::<f64>();
                lattice.site_mut(id).energy = urbach * u.ln();
            }
        }
    }

    if let Some(correlation) = correlation {
        if correlation.length > 0.0 {
            convolve(lattice, correlation);
        }
    }
}

/// Convolves the energy field with the configured kernel and restores the
/// pre-convolution sample mean and standard deviation.
fn convolve(lattice: &mut Lattice, correlation: Correlation) {
    let geometry = lattice.geometry();
    let [l, w, h] = geometry.dims;
    let spacing = geometry.unit_size;

    let mut field = Array3::<f64>::zeros((l, w, h));
    for id in lattice.ids() {
        let [x, y, z] = lattice.coords(id);
        field[[x, y, z]] = lattice.site(id).energy;
    }

    let (mean_before, stdev_before) = field_stats(&field);

    // Kernel support: beyond three correlation lengths the weights are
    // negligible for both shapes.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let reach = (3.0 * correlation.length / spacing).ceil().max(1.0) as i64;
    let mut weights = Vec::new();
    for dx in -reach..=reach {
        for dy in -reach..=reach {
            for dz in -reach..=reach {
                #[allow(clippy::cast_precision_loss)]
                let r = ((dx * dx + dy * dy + dz * dz) as f64).sqrt() * spacing;
                let weight = match correlation.kernel {
                    // σ = λ/2 puts the 1/e point of the smoothed field's
                    // autocorrelation at r = λ
                    Kernel::Gaussian => {
                        let sigma = correlation.length / 2.0;
                        (-r * r / (2.0 * sigma * sigma)).exp()
                    }
                    Kernel::Power { exponent } => {
                        (1.0 + r / correlation.length).powi(-i32::try_from(exponent).unwrap())
                    }
                };
                if weight > 1.0e-6 {
                    weights.push(([dx, dy, dz], weight));
                }
            }
        }
    }

    let mut smoothed = Array3::<f64>::zeros((l, w, h));
    for x in 0..l {
        for y in 0..w {
            for z in 0..h {
                let mut acc = 0.0;
                let mut norm = 0.0;
                for &([dx, dy, dz], weight) in &weights {
                    let Some([sx, sy, sz]) = wrap(geometry.dims, geometry.periodic, [
                        i64::try_from(x).unwrap() + dx,
                        i64::try_from(y).unwrap() + dy,
                        i64::try_from(z).unwrap() + dz,
                    ]) else {
                        continue;
                    };
                    acc += weight * field[[sx, sy, sz]];
                    norm += weight;
                }
                smoothed[[x, y, z]] = acc / norm;
            }
        }
    }

    let (mean_after, stdev_after) = field_stats(&smoothed);
    let scale = if stdev_after > 0.0 {
        stdev_before / stdev_after
    } else {
        1.0
    };

    for id in lattice.ids().collect::<Vec<_>>() {
        let [x, y, z] = lattice.coords(id);
        lattice.site_mut(id).energy = (smoothed[[x, y, z]] - mean_after) * scale + mean_before;
    }
}

fn wrap(dims: [usize; 3], periodic: [bool; 3], coords: [i64; 3]) -> Option<[usize; 3]> {
    let mut out = [0_usize; 3];
    for axis in 0..3 {
        let dim = i64::try_from(dims[axis]).unwrap();
        let c = coords[axis];
        if periodic[axis] {
            out[axis] = usize::try_from(c.rem_euclid(dim)).unwrap();
        } else if (0..dim).contains(&c) {
            out[axis] = usize::try_from(c).unwrap();
        } else {
            return None;
        }
    }
    Some(out)
}

fn field_stats(field: &Array3<f64>) -> (f64, f64) {
    let n = crate::convert::f64_from_usize(field.len());
    let mean = field.sum() / n;
    let var = field.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lattice::Geometry;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn lattice(n: usize) -> Lattice {
        Lattice::new(
            Geometry {
                dims: [n, n, n],
                periodic: [true; 3],
                unit_size: 1.0,
            },
            SiteType::Donor,
        )
    }

    fn energies(lattice: &Lattice) -> Vec<f64> {
        lattice.ids().map(|id| lattice.site(id).energy).collect()
    }

    #[test]
    fn gaussian_dos_matches_requested_spread() {
        let mut lattice = lattice(20);
        let mut rng = Pcg64::seed_from_u64(11);
        apply(
            &mut lattice,
            DisorderModel::Gaussian {
                stdev_donor: 0.05,
                stdev_acceptor: 0.05,
            },
            None,
            &mut rng,
        );
        let e = energies(&lattice);
        let n = e.len() as f64;
        let mean = e.iter().sum::<f64>() / n;
        let stdev = (e.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n).sqrt();
        assert!(mean.abs() < 0.005);
        assert!((stdev - 0.05).abs() < 0.005);
    }

    #[test]
    fn exponential_dos_is_one_sided() {
        let mut lattice = lattice(10);
        let mut rng = Pcg64::seed_from_u64(5);
        apply(
            &mut lattice,
            DisorderModel::Exponential {
                urbach_donor: 0.025,
                urbach_acceptor: 0.025,
            },
            None,
            &mut rng,
        );
        let e = energies(&lattice);
        assert!(e.iter().all(|&x| x <= 0.0));
        let mean = e.iter().sum::<f64>() / e.len() as f64;
        // mean of the tail is -E_U
        assert!((mean + 0.025).abs() < 0.003);
    }

    #[test]
    fn determinism_for_equal_seeds() {
        let mut a = lattice(8);
        let mut b = lattice(8);
        let model = DisorderModel::Gaussian {
            stdev_donor: 0.08,
            stdev_acceptor: 0.08,
        };
        let correlation = Some(Correlation {
            length: 2.0,
            kernel: Kernel::Gaussian,
        });
        apply(&mut a, model, correlation, &mut Pcg64::seed_from_u64(99));
        apply(&mut b, model, correlation, &mut Pcg64::seed_from_u64(99));
        assert_eq!(energies(&a), energies(&b));
    }

    #[test]
    fn correlation_preserves_marginal_spread() {
        let mut uncorrelated = lattice(16);
        let mut correlated = lattice(16);
        let model = DisorderModel::Gaussian {
            stdev_donor: 0.06,
            stdev_acceptor: 0.06,
        };
        apply(&mut uncorrelated, model, None, &mut Pcg64::seed_from_u64(4));
        apply(
            &mut correlated,
            model,
            Some(Correlation {
                length: 3.0,
                kernel: Kernel::Gaussian,
            }),
            &mut Pcg64::seed_from_u64(4),
        );
        let stats = |e: &[f64]| {
            let n = e.len() as f64;
            let mean = e.iter().sum::<f64>() / n;
            let var = e.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
            (mean, var.sqrt())
        };
        let (m0, s0) = stats(&energies(&uncorrelated));
        let (m1, s1) = stats(&energies(&correlated));
        assert!((m0 - m1).abs() < 1e-12);
        assert!((s0 - s1).abs() < 1e-12);
    }

    #[test]
    fn autocorrelation_decays_at_the_requested_length() {
        let n = 30;
        let mut lat = lattice(n);
        let lambda = 3.0;
        apply(
            &mut lat,
            DisorderModel::Gaussian {
                stdev_donor: 0.1,
                stdev_acceptor: 0.1,
            },
            Some(Correlation {
                length: lambda,
                kernel: Kernel::Gaussian,
            }),
            &mut Pcg64::seed_from_u64(21),
        );
        let e = energies(&lat);
        let count = e.len() as f64;
        let mean = e.iter().sum::<f64>() / count;
        let var = e.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / count;

        // normalized autocorrelation along x at separation d
        let autocorr = |d: usize| {
            let mut acc = 0.0;
            for x in 0..n {
                for y in 0..n {
                    for z in 0..n {
                        let a = lat.site(lat.site_at([x, y, z])).energy - mean;
                        let b = lat.site(lat.site_at([(x + d) % n, y, z])).energy - mean;
                        acc += a * b;
                    }
                }
            }
            acc / (count * var)
        };

        let inv_e = (-1.0_f64).exp();
        // the 1/e crossing sits near 3 sites for lambda = 3
        assert!(autocorr(2) > inv_e);
        assert!(autocorr(5) < inv_e);
    }
}

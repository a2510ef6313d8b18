/// A complete parameter file for a small exciton diffusion run on a
/// 10x10x10 periodic neat film.
#[must_use]
pub fn parameter_file() -> String {
    let lines = [
        "## KMC algorithm",
        "false / enable first reaction method",
        "true / enable selective recalculation",
        "3 / recalculation cutoff",
        "false / enable full recalculation",
        "-- geometry",
        "true / periodic x",
        "true / periodic y",
        "true / periodic z",
        "10 / length",
        "10 / width",
        "10 / height",
        "1.0 / unit size (nm)",
        "300 / temperature (K)",
        "0 / internal potential (V)",
        "-- architecture",
        "true / neat",
        "false / bilayer",
        "5 / donor thickness",
        "5 / acceptor thickness",
        "false / random blend",
        "0.5 / acceptor concentration",
        "-- morphology import",
        "false / import single morphology",
        "none / morphology filename",
        "false / import morphology set",
        "morph_#.txt / morphology set format",
        "1 / n test morphologies",
        "1 / morphology set size",
        "-- tests",
        "4 / n tests",
        "true / exciton diffusion test",
        "false / ToF test",
        "electron / ToF polaron type",
        "20 / ToF initial polarons",
        "1e-9 / ToF transient start",
        "1e-5 / ToF transient end",
        "10 / ToF points per decade",
        "false / IQE test",
        "1e-4 / IQE time cutoff",
        "false / extraction map output",
        "false / dynamics test",
        "false / dynamics extraction",
        "1e17 / dynamics initial exciton concentration",
        "1e-10 / dynamics transient start",
        "1e-6 / dynamics transient end",
        "10 / dynamics points per decade",
        "-- exciton parameters",
        "1e22 / generation rate donor",
        "1e22 / generation rate acceptor",
        "1e-9 / singlet lifetime donor",
        "1e-9 / singlet lifetime acceptor",
        "1e-6 / triplet lifetime donor",
        "1e-6 / triplet lifetime acceptor",
        "1e11 / singlet hopping donor",
        "1e11 / singlet hopping acceptor",
        "1.0 / singlet localization donor",
        "1.0 / singlet localization acceptor",
        "1e10 / triplet hopping donor",
        "1e10 / triplet hopping acceptor",
        "2.0 / triplet localization donor",
        "2.0 / triplet localization acceptor",
        "false / FRET triplet annihilation",
        "1e12 / exciton-exciton annihilation donor",
        "1e12 / exciton-exciton annihilation acceptor",
        "1e12 / exciton-polaron annihilation donor",
        "1e12 / exciton-polaron annihilation acceptor",
        "2 / FRET cutoff",
        "0.3 / binding energy donor",
        "0.3 / binding energy acceptor",
        "1e14 / dissociation rate donor",
        "1e14 / dissociation rate acceptor",
        "1 / dissociation cutoff",
        "0 / ISC donor",
        "0 / ISC acceptor",
        "0 / RISC donor",
        "0 / RISC acceptor",
        "0.7 / E_ST donor",
        "0.7 / E_ST acceptor",
        "-- polaron parameters",
        "false / phase restriction",
        "1e12 / polaron hopping donor",
        "1e12 / polaron hopping acceptor",
        "2.0 / polaron localization donor",
        "2.0 / polaron localization acceptor",
        "true / Miller-Abrahams",
        "false / Marcus",
        "0.2 / reorganization donor",
        "0.2 / reorganization acceptor",
        "1e12 / recombination rate",
        "2 / polaron hopping cutoff",
        "false / gaussian delocalization",
        "1.5 / delocalization length",
        "-- energetics",
        "5.3 / HOMO donor",
        "3.0 / LUMO donor",
        "5.6 / HOMO acceptor",
        "3.9 / LUMO acceptor",
        "false / gaussian DOS",
        "0.05 / energy stdev donor",
        "0.05 / energy stdev acceptor",
        "false / exponential DOS",
        "0.025 / urbach energy donor",
        "0.025 / urbach energy acceptor",
        "false / correlated disorder",
        "3.0 / correlation length",
        "false / gaussian kernel",
        "false / power kernel",
        "2 / power kernel exponent",
        "3.5 / dielectric donor",
        "3.5 / dielectric acceptor",
        "3 / coulomb cutoff",
    ];
    lines.join("\n")
}

use anyhow::{Context, Result};
use excimer::params::{Morphology, Parameters};
use prettytable::format::{FormatBuilder, LinePosition, LineSeparator};
use prettytable::Table;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub fn read_parameters(input: &Path) -> Result<Parameters> {
    Parameters::from_reader(BufReader::new(
        File::open(input).context(format!("unable to open '{}'", input.display()))?,
    ))
    .context(format!("unable to read '{}'", input.display()))
}

pub fn read_morphology(input: &Path) -> Result<Morphology> {
    excimer::params::read_morphology(BufReader::new(
        File::open(input).context(format!("unable to open '{}'", input.display()))?,
    ))
    .context(format!("unable to read '{}'", input.display()))
}

pub fn create_output_file(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).context(format!(
        "unable to write '{}'",
        path.display()
    ))?))
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table.set_format(
        FormatBuilder::new()
            .column_separator(' ')
            .separator(LinePosition::Title, LineSeparator::new('-', '+', ' ', ' '))
            .build(),
    );
    table
}

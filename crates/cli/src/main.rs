use std::process::ExitCode;

use anyhow::Context;

fn main() -> anyhow::Result<ExitCode> {
    segmenta_cli::run().context("segmenta batch run aborted")
}

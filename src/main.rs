use anyhow::Result;

use pcsc_autoreader::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}

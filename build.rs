//! Renders the `berth` manual pages into `OUT_DIR`.
//!
//! `berth.1` covers the top-level command. Each subcommand (`recreate`,
//! `pending`, `forget-host-key`, `add-key`) also gets its own
//! `berth-<name>.1` page so packagers can ship them alongside.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const BIN_NAME: &str = "berth";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?);

    let command = Cli::command();
    write_page(&out_dir, BIN_NAME, command.clone())?;
    for subcommand in command.get_subcommands() {
        let page = format!("{BIN_NAME}-{}", subcommand.get_name());
        write_page(&out_dir, &page, subcommand.clone())?;
    }

    Ok(())
}

fn write_page(out_dir: &Path, page: &str, command: Command) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(page.to_uppercase()).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)
}

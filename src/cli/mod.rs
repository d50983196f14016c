//! Command-line interface definitions for the `berth` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `berth` binary.
#[derive(Debug, Parser)]
#[command(
    name = "berth",
    about = "Rebuild your cloud development VM in place, keeping its disk and address",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Replace the VM's instance while keeping its project volume and address.
    #[command(
        name = "recreate",
        about = "Replace the VM's instance, keeping its project volume and address"
    )]
    Recreate(RecreateCommand),
    /// List project volumes left behind by an interrupted recreate.
    #[command(name = "pending", about = "List volumes left behind by an interrupted recreate")]
    Pending,
    /// Clear the pinned host key of a VM.
    #[command(name = "forget-host-key", about = "Clear the pinned host key of a VM")]
    ForgetHostKey(ForgetHostKeyCommand),
    /// Authorise an additional SSH public key on a running VM.
    #[command(name = "add-key", about = "Authorise an additional SSH public key on a VM")]
    AddKey(AddKeyCommand),
}

/// Arguments for the `berth recreate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RecreateCommand {
    /// VM to recreate; defaults to the configured `vm_name`.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Proceed even when active sessions are detected.
    #[arg(long)]
    pub(crate) force: bool,
    /// Skip the typed confirmation prompt.
    #[arg(long, short = 'y')]
    pub(crate) yes: bool,
}

/// Arguments for the `berth forget-host-key` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ForgetHostKeyCommand {
    /// VM whose pinned key is cleared; defaults to the configured `vm_name`.
    #[arg(value_name = "NAME")]
    pub(crate) name: Option<String>,
}

/// Arguments for the `berth add-key` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct AddKeyCommand {
    /// VM to update; defaults to the configured `vm_name`.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Public key line, for example `ssh-ed25519 AAAA... user@host`.
    #[arg(value_name = "PUBLIC_KEY")]
    pub(crate) public_key: String,
}

//! Binary entry point for the berth CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use berth::{
    AddKeyError, AddKeyOutcome, AwsCli, BerthConfig, ConfigError, CredentialedRunner,
    FileHostKeyStore, HostKeyStore, HostKeyStoreError, KeyInstaller, KeyscanScanner, PendingError,
    PendingScanner, ProcessSshTransport, RecreateDeps, RecreateError, RecreateOrchestrator,
    RecreateRequest, ScriptRenderer, TagBootstrapPoller, TrustedRunner,
    default_instance_type_policy, render_pending_report,
};

mod cli;

use cli::{AddKeyCommand, Cli, ForgetHostKeyCommand, RecreateCommand};

const DEFAULT_LOG_FILTER: &str = "berth=warn";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("host key store error: {0}")]
    HostKeys(#[from] HostKeyStoreError),
    #[error(transparent)]
    Recreate(#[from] RecreateError),
    #[error(transparent)]
    Pending(#[from] PendingError),
    #[error("add-key failed: {0}")]
    AddKey(#[from] AddKeyError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping at the next step boundary");
            signal_token.cancel();
        }
    });

    let exit_code = match dispatch(cli, cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), CliError> {
    let config = load_config()?;
    match cli {
        Cli::Recreate(command) => recreate(&config, command, cancel).await,
        Cli::Pending => pending(&config).await,
        Cli::ForgetHostKey(command) => forget_host_key(&config, command),
        Cli::AddKey(command) => add_key(&config, command).await,
    }
}

fn load_config() -> Result<BerthConfig, CliError> {
    let config = BerthConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

async fn recreate(
    config: &BerthConfig,
    command: RecreateCommand,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let settings = config.recreate_settings(default_instance_type_policy)?;
    let api = AwsCli::with_process_runner(&config.aws_bin, &config.region);
    let deps = RecreateDeps {
        api: api.clone(),
        remote: CredentialedRunner::new(
            api.clone(),
            ProcessSshTransport::with_process_runner(&config.ssh_bin),
        ),
        scanner: KeyscanScanner::with_process_runner(&config.keyscan_bin),
        host_keys: config.host_key_store()?,
        renderer: ScriptRenderer,
        poller: TagBootstrapPoller::new(
            api,
            config.bootstrap_timeout(),
            config.wait_bounds().interval,
        ),
    };
    let request = RecreateRequest {
        vm_name: resolve_vm_name(command.name, config),
        force: command.force,
        assume_yes: command.yes,
    };

    let orchestrator = RecreateOrchestrator::new(deps, settings).with_cancellation(cancel);
    let mut input = io::stdin().lock();
    let mut out = io::stdout();
    orchestrator.execute(&request, &mut input, &mut out).await?;
    Ok(())
}

async fn pending(config: &BerthConfig) -> Result<(), CliError> {
    let api = AwsCli::with_process_runner(&config.aws_bin, &config.region);
    let volumes = PendingScanner::new(api, config.owner.trim())
        .scan()
        .await?;
    render_pending_report(&volumes, &mut io::stdout());
    Ok(())
}

fn forget_host_key(config: &BerthConfig, command: ForgetHostKeyCommand) -> Result<(), CliError> {
    let store = config.host_key_store()?;
    let vm_name = resolve_vm_name(command.name, config);
    let removed = store.forget(&vm_name)?;
    write_forget_outcome(io::stdout(), &store, &vm_name, removed);
    Ok(())
}

async fn add_key(config: &BerthConfig, command: AddKeyCommand) -> Result<(), CliError> {
    let api = AwsCli::with_process_runner(&config.aws_bin, &config.region);
    let remote = CredentialedRunner::new(
        &api,
        ProcessSshTransport::with_process_runner(&config.ssh_bin),
    );
    let scanner = KeyscanScanner::with_process_runner(&config.keyscan_bin);
    let host_keys = config.host_key_store()?;
    let trusted = TrustedRunner::new(&remote, &scanner, &host_keys);
    let installer = KeyInstaller::new(
        &api,
        &trusted,
        config.owner.trim(),
        &config.ssh_user,
        config.ssh_port,
    );

    let vm_name = resolve_vm_name(command.name, config);
    let outcome = installer.add_key(&vm_name, &command.public_key).await?;
    let mut out = io::stdout();
    match outcome {
        AddKeyOutcome::Added => writeln!(out, "key added to VM \"{vm_name}\"").ok(),
        AddKeyOutcome::AlreadyPresent => {
            writeln!(out, "key already authorised on VM \"{vm_name}\"").ok()
        }
    };
    Ok(())
}

fn resolve_vm_name(requested: Option<String>, config: &BerthConfig) -> String {
    requested
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| config.vm_name.trim().to_owned())
}

fn write_forget_outcome(
    mut target: impl Write,
    store: &FileHostKeyStore,
    vm_name: &str,
    removed: bool,
) {
    if removed {
        writeln!(
            target,
            "forgot host key for VM \"{vm_name}\" in {}",
            store.path()
        )
        .ok();
    } else {
        writeln!(target, "no host key pinned for VM \"{vm_name}\"").ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth::RecreateStep;
    use rstest::rstest;

    fn config_named(vm_name: &str) -> BerthConfig {
        BerthConfig {
            owner: String::from("alice"),
            owner_arn: None,
            vm_name: vm_name.to_owned(),
            region: String::from("us-east-1"),
            ssh_user: String::from("ubuntu"),
            ssh_port: 22,
            instance_type: None,
            shared_security_group: String::from("berth-shared"),
            image_name_pattern: String::from("berth-dev-*"),
            image_owner: String::from("self"),
            device_path: String::from("/dev/sdf"),
            idle_timeout_minutes: 30,
            delivery_url: String::new(),
            image_digest: String::new(),
            extra_script_file: None,
            host_keys_file: None,
            aws_bin: String::from("aws"),
            ssh_bin: String::from("ssh"),
            keyscan_bin: String::from("ssh-keyscan"),
            wait_timeout_secs: 300,
            poll_interval_secs: 5,
            bootstrap_timeout_secs: 900,
        }
    }

    #[rstest]
    #[case(None, "default")]
    #[case(Some("  "), "default")]
    #[case(Some("work"), "work")]
    fn vm_name_falls_back_to_configuration(#[case] requested: Option<&str>, #[case] expected: &str) {
        let config = config_named("default");
        assert_eq!(
            resolve_vm_name(requested.map(ToOwned::to_owned), &config),
            expected
        );
    }

    #[rstest]
    #[case(true, "forgot host key for VM \"default\" in /tmp/keys.toml")]
    #[case(false, "no host key pinned for VM \"default\"")]
    fn forget_outcome_is_reported(#[case] removed: bool, #[case] expected: &str) {
        let store = FileHostKeyStore::new("/tmp/keys.toml");
        let mut buf = Vec::new();
        write_forget_outcome(&mut buf, &store, "default", removed);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered.trim_end(), expected);
    }

    #[test]
    fn cli_exposes_one_page_per_subcommand() {
        use clap::CommandFactory;

        let command = Cli::command();
        command.clone().debug_assert();
        let names = command
            .get_subcommands()
            .map(|subcommand| subcommand.get_name().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["recreate", "pending", "forget-host-key", "add-key"]);
    }

    #[test]
    fn step_failures_lead_with_the_underlying_message() {
        let mut buf = Vec::new();
        let err = CliError::Recreate(RecreateError::step(
            RecreateStep::LaunchInstance,
            berth::CloudError::Api {
                operation: String::from("run-instances"),
                message: String::from("InsufficientInstanceCapacity"),
            },
        ));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(
            rendered.trim_end(),
            "run-instances failed: InsufficientInstanceCapacity (during step: launch instance)"
        );
    }

    #[test]
    fn write_error_names_the_failed_step() {
        let mut buf = Vec::new();
        let err = CliError::Recreate(RecreateError::Cancelled {
            step: RecreateStep::LaunchInstance,
        });
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("launch instance"), "rendered: {rendered}");
    }
}

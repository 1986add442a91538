mod config;
pub mod logging;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use hostman_guest::{
    GuestDesc, GuestInstance, Host, HostInfo, InstanceError, InstanceStartError, RenderError,
    RuntimeOverrides,
    arch::ArchStrategyError,
    certs::MigrateCerts,
    cmdline::{self, CmdlineError},
    fs::{self, FsError},
};
use hostman_system::{HostCaps, HostCapsError};
use thiserror::Error;
use tokio::{io::AsyncReadExt, task::JoinError};
use tracing::info;

pub use crate::config::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "hostman", version, about = "KVM guest host agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long = "config", global = true)]
    pub config_path: Option<PathBuf>,

    /// Log filter directives; `$HOSTMAN_LOG` takes precedence
    #[arg(long = "log", global = true, default_value = "info")]
    pub log: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the start (or stop) script for a guest
    Render {
        #[command(flatten)]
        guest: GuestArgs,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Print the stop script instead
        #[arg(long)]
        stop: bool,
    },
    /// Write scripts and launch the guest
    Start {
        #[command(flatten)]
        guest: GuestArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Stop the guest and clean up after it
    Stop {
        uuid: String,

        /// Skip the graceful monitor quit
        #[arg(long)]
        force: bool,
    },
    /// Print the guest status as JSON
    Status { uuid: String },
    /// Rebuild memory slots from the running guest
    Resync { uuid: String },
    /// Reconcile this host's QEMU command line with a migration source's
    Unify {
        /// File holding the command line rendered on this host
        #[arg(long)]
        current: PathBuf,

        /// File holding the migration source's command line
        #[arg(long)]
        source: PathBuf,
    },
    /// Manage live migration certificates
    Certs {
        #[command(subcommand)]
        command: CertsCommand,
    },
    /// Announce the guest's addresses with gratuitous ARP
    Arp { uuid: String },
}

#[derive(Subcommand, Debug)]
pub enum CertsCommand {
    /// Generate missing certificates and print the bundle as JSON
    Prepare { uuid: String },
    /// Install a JSON bundle from a file, or stdin when omitted
    Write {
        uuid: String,

        #[arg(long = "bundle")]
        bundle_path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct GuestArgs {
    /// Guest already saved under the servers path
    pub uuid: Option<String>,

    /// Guest descriptor as a JSON file
    #[arg(long = "desc")]
    pub desc_path: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    #[arg(long, default_value_t = 0)]
    pub vnc_port: u16,

    #[arg(long)]
    pub qemu_version: Option<String>,

    /// Launch paused, waiting for an inbound migration
    #[arg(long)]
    pub need_migrate: bool,

    #[arg(long)]
    pub live_migrate_port: Option<u16>,

    #[arg(long = "live-migrate-tls")]
    pub live_migrate_use_tls: bool,

    #[arg(long, env = "HOSTMAN_ENCRYPT_KEY", hide_env_values = true)]
    pub encrypt_key: Option<String>,

    /// Command line of the migration source, to unify the local one onto
    #[arg(long)]
    pub src_qemu_cmdline: Option<String>,
}

impl From<OverrideArgs> for RuntimeOverrides {
    fn from(args: OverrideArgs) -> Self {
        RuntimeOverrides {
            vnc_port: args.vnc_port,
            qemu_version: args.qemu_version,
            need_migrate: args.need_migrate,
            live_migrate_port: args.live_migrate_port,
            live_migrate_use_tls: args.live_migrate_use_tls,
            encrypt_key: args.encrypt_key,
            src_qemu_cmdline: args.src_qemu_cmdline,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    HostCaps(#[from] HostCapsError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("no guest uuid or descriptor given")]
    NoGuest,

    #[error("invalid json in {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to encode output: {0}")]
    Output(#[source] serde_json::Error),

    #[error(transparent)]
    Arch(#[from] ArchStrategyError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Start(#[from] InstanceStartError),

    #[error(transparent)]
    Cmdline(#[from] CmdlineError),

    #[error(transparent)]
    Join(#[from] JoinError),
}

pub async fn get_config(cli: &Cli) -> Result<Config, AppError> {
    let config_path = Config::resolve_path(cli.config_path.as_deref());
    let config = Config::load(&config_path).await?;
    Ok(config)
}

fn get_host(config: &Config) -> Result<Arc<dyn HostInfo>, AppError> {
    let caps = HostCaps::detect()?;
    Ok(Arc::new(Host::new(caps, config.options.clone())))
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    let config = get_config(&cli).await?;
    match cli.command {
        Command::Render {
            guest,
            overrides,
            stop,
        } => cmd_render(config, guest, overrides.into(), stop).await,
        Command::Start { guest, overrides } => cmd_start(config, guest, overrides.into()).await,
        Command::Stop { uuid, force } => cmd_stop(config, uuid, force).await,
        Command::Status { uuid } => cmd_status(config, uuid).await,
        Command::Resync { uuid } => cmd_resync(config, uuid).await,
        Command::Unify { current, source } => cmd_unify(&current, &source).await,
        Command::Certs { command } => match command {
            CertsCommand::Prepare { uuid } => cmd_certs_prepare(config, uuid).await,
            CertsCommand::Write { uuid, bundle_path } => {
                cmd_certs_write(config, uuid, bundle_path).await
            }
        },
        Command::Arp { uuid } => cmd_arp(config, uuid).await,
    }
}

async fn load_guest(config: &Config, guest: GuestArgs) -> Result<GuestInstance, AppError> {
    if let Some(path) = guest.desc_path {
        let host = get_host(config)?;
        let data = fs::read_file_to_string(&path).await?;
        let desc: GuestDesc =
            serde_json::from_str(&data).map_err(|source| AppError::Json { path, source })?;
        return Ok(GuestInstance::new(desc, host));
    }
    let uuid = guest.uuid.ok_or(AppError::NoGuest)?;
    load_uuid(config, &uuid).await
}

async fn load_uuid(config: &Config, uuid: &str) -> Result<GuestInstance, AppError> {
    let host = get_host(config)?;
    Ok(GuestInstance::load(uuid, host).await?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value).map_err(AppError::Output)?;
    println!("{json}");
    Ok(())
}

async fn cmd_render(
    config: Config,
    guest: GuestArgs,
    overrides: RuntimeOverrides,
    stop: bool,
) -> Result<(), AppError> {
    let mut instance = load_guest(&config, guest).await?;
    instance.prepare()?;
    let scripts = instance.render(&overrides)?;
    if stop {
        print!("{}", scripts.stop);
    } else {
        print!("{}", scripts.start);
    }
    Ok(())
}

async fn cmd_start(
    config: Config,
    guest: GuestArgs,
    overrides: RuntimeOverrides,
) -> Result<(), AppError> {
    let mut instance = load_guest(&config, guest).await?;
    let started = instance.start(&overrides).await?;
    println!("{}", started.pid);
    // The runtime ends with this command, so stay for the announcements.
    started.arp.await?;
    Ok(())
}

async fn cmd_stop(config: Config, uuid: String, force: bool) -> Result<(), AppError> {
    let mut instance = load_uuid(&config, &uuid).await?;
    instance.stop(force).await;
    Ok(())
}

async fn cmd_status(config: Config, uuid: String) -> Result<(), AppError> {
    let instance = load_uuid(&config, &uuid).await?;
    print_json(&instance.status().await?)
}

async fn cmd_resync(config: Config, uuid: String) -> Result<(), AppError> {
    let mut instance = load_uuid(&config, &uuid).await?;
    instance.resync_memory().await?;
    Ok(())
}

async fn cmd_unify(current: &Path, source: &Path) -> Result<(), AppError> {
    let current = fs::read_file_to_string(current).await?;
    let source = fs::read_file_to_string(source).await?;
    let unified = cmdline::unify(current.trim(), source.trim())?;
    println!("{unified}");
    Ok(())
}

async fn cmd_certs_prepare(config: Config, uuid: String) -> Result<(), AppError> {
    let mut instance = load_uuid(&config, &uuid).await?;
    print_json(&instance.prepare_migrate_certs().await?)
}

async fn cmd_certs_write(
    config: Config,
    uuid: String,
    bundle_path: Option<PathBuf>,
) -> Result<(), AppError> {
    let instance = load_uuid(&config, &uuid).await?;
    let (path, data) = match bundle_path {
        Some(path) => {
            let data = fs::read_file_to_string(&path).await?;
            (path, data)
        }
        None => {
            let mut data = String::new();
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .map_err(AppError::Stdin)?;
            (PathBuf::from("-"), data)
        }
    };
    let certs: MigrateCerts =
        serde_json::from_str(&data).map_err(|source| AppError::Json { path, source })?;
    instance.write_migrate_certs(&certs).await?;
    info!(files = certs.len(), "wrote migration certificates");
    Ok(())
}

async fn cmd_arp(config: Config, uuid: String) -> Result<(), AppError> {
    let instance = load_uuid(&config, &uuid).await?;
    instance.presend_arp().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_overrides() {
        let cli = Cli::try_parse_from([
            "hostman",
            "--log",
            "debug",
            "start",
            "6e7c1d0a",
            "--vnc-port",
            "5",
            "--need-migrate",
            "--live-migrate-port",
            "4396",
            "--live-migrate-tls",
            "--src-qemu-cmdline",
            "/opt/qemu/bin/qemu-system-x86_64 -name web-1",
        ])
        .unwrap();
        assert_eq!(cli.log, "debug");
        let Command::Start { guest, overrides } = cli.command else {
            panic!("expected start");
        };
        assert_eq!(guest.uuid.as_deref(), Some("6e7c1d0a"));
        let overrides = RuntimeOverrides::from(overrides);
        assert_eq!(overrides.vnc_port, 5);
        assert!(overrides.need_migrate);
        assert_eq!(overrides.live_migrate_port, Some(4396));
        assert!(overrides.live_migrate_use_tls);
        assert_eq!(
            overrides.src_qemu_cmdline.as_deref(),
            Some("/opt/qemu/bin/qemu-system-x86_64 -name web-1")
        );
    }

    #[test]
    fn guest_needs_uuid_or_desc() {
        assert!(Cli::try_parse_from(["hostman", "render"]).is_err());
        assert!(
            Cli::try_parse_from(["hostman", "render", "abc", "--desc", "desc.json"]).is_err()
        );
        let cli = Cli::try_parse_from(["hostman", "render", "--desc", "desc.json", "--stop"])
            .unwrap();
        let Command::Render { guest, stop, .. } = cli.command else {
            panic!("expected render");
        };
        assert_eq!(guest.desc_path, Some(PathBuf::from("desc.json")));
        assert!(stop);
    }

    #[test]
    fn parses_certs_write() {
        let cli = Cli::try_parse_from([
            "hostman",
            "certs",
            "write",
            "abc",
            "--bundle",
            "bundle.json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Certs {
                command: CertsCommand::Write { bundle_path: Some(_), .. }
            }
        ));
    }
}

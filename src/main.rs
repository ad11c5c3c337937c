use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use splitpatch::core::archive::ArchiveReader;
use splitpatch::core::config::{default_config_path, parse_config, PatchConfig};
use splitpatch::core::download::{GithubReleases, HttpDownloader};
use splitpatch::core::icons::DirAssetSource;
use splitpatch::core::install::{AdbInstaller, ExportInstaller, Installer};
use splitpatch::core::manifest::{self, MANIFEST_PATH};
use splitpatch::core::pipeline::{
    Pipeline, PipelineEvent, RunReport, Services, StartOutcome, StepStatus, TargetVariant,
};
use splitpatch::core::sign;
use splitpatch::core::utils::Target;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Config file, defaults to the user config directory
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, patch, sign and install one app version
    Patch {
        #[clap(flatten)]
        args: PatchArgs,
    },
    /// Print the identity declared by an archive's manifest
    Inspect { apk: PathBuf },
    /// Check the v2 signature of an archive
    Verify { apk: PathBuf },
}

#[derive(Args)]
struct PatchArgs {
    /// App version to patch
    app_version: String,
    /// Target ABI, defaults to the configured one
    #[clap(long)]
    arch: Option<Target>,
    /// Copy the finished archives here instead of installing them
    #[clap(long)]
    export: Option<PathBuf>,
    #[clap(long, default_value = "adb")]
    adb: PathBuf,
    /// Device serial passed to adb
    #[clap(long)]
    serial: Option<String>,
    /// Replace launcher icons even if the config does not ask for it
    #[clap(long)]
    replace_icons: bool,
    #[clap(long)]
    debuggable: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = parse_config(&config_path);
    cli.command.run(config)
}

impl Commands {
    fn run(self, config: PatchConfig) -> Result<()> {
        match self {
            Self::Patch { args } => patch(config, args),
            Self::Inspect { apk } => {
                let mut reader = ArchiveReader::open(&apk)?;
                let bytes = reader
                    .read_entry(MANIFEST_PATH)?
                    .with_context(|| format!("`{}` has no {MANIFEST_PATH}", apk.display()))?;
                let info = manifest::inspect(&bytes)?;
                println!("package:    {}", info.package);
                if let Some(split) = info.split {
                    println!("split:      {split}");
                }
                if let Some(label) = info.label {
                    println!("label:      {label}");
                }
                if let Some(debuggable) = info.debuggable {
                    println!("debuggable: {debuggable}");
                }
                Ok(())
            }
            Self::Verify { apk } => {
                let certs = sign::verify(&apk)?;
                println!("{}: valid v2 signature, {} signer(s)", apk.display(), certs.len());
                Ok(())
            }
        }
    }
}

fn patch(mut config: PatchConfig, args: PatchArgs) -> Result<()> {
    config.app.replace_icons |= args.replace_icons;
    config.app.debuggable |= args.debuggable;
    let variant = TargetVariant {
        version: args.app_version,
        arch: args.arch.unwrap_or(config.target.arch),
    };
    let installer: Box<dyn Installer> = match args.export {
        Some(dir) => Box::new(ExportInstaller::new(dir)),
        None => Box::new(AdbInstaller::new(args.adb, args.serial)),
    };
    let services = Services {
        downloads: Box::new(HttpDownloader::new(&config.source)?),
        releases: Box::new(GithubReleases::new(&config.source)?),
        installer,
        assets: Box::new(DirAssetSource::new(config.icons.dir.clone())),
    };
    let (pipeline, events) = Pipeline::new(config, services);
    let pipeline = Arc::new(pipeline);
    let handle = match pipeline.start(variant)? {
        StartOutcome::Started(handle) => handle,
        StartOutcome::AlreadyRunning => anyhow::bail!("a patch run is already active"),
    };

    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(PipelineEvent::Started(steps)) => {
                tracing::debug!("{} steps queued", steps.len());
            }
            Ok(PipelineEvent::Step(step)) => {
                if step.status == StepStatus::Unsuccessful {
                    eprintln!("✗ {}", step.name);
                } else if let (StepStatus::Successful, Some(duration)) = (step.status, step.duration) {
                    println!("✓ {} ({:.1}s)", step.name, duration.as_secs_f64());
                }
            }
            Ok(PipelineEvent::Finished) => break,
            Ok(PipelineEvent::Failed(diagnostics)) => {
                eprintln!("\n{diagnostics}");
                break;
            }
            Err(RecvTimeoutError::Timeout) if !handle.is_finished() => {}
            Err(_) => break,
        }
    }

    let report: RunReport = handle
        .join()
        .map_err(|_| anyhow::anyhow!("patch thread panicked"))?;
    match report.error {
        Some(err) => Err(err.into()),
        None => {
            println!("done");
            Ok(())
        }
    }
}

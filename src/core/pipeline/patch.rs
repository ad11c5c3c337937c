use super::env::{RunEnv, TargetVariant};
use super::run::{Diagnostics, PatchRun, PipelineEvent, StepKind};
use crate::core::archive::{ArchiveSession, ZipFileOptions};
use crate::core::config::{PatchConfig, VERSION};
use crate::core::dex::{count_dex_entries, reorder_dex};
use crate::core::download::{latest_release, DownloadService, Release, ReleaseService};
use crate::core::error::{ArchiveResultExt, PatchError, Result};
use crate::core::icons::{replace_icons, AssetSource};
use crate::core::install::Installer;
use crate::core::libs::{swap_libraries, BinaryNameMap};
use crate::core::manifest::{patch_manifest, rename_package, MANIFEST_PATH};
use crate::core::sign::{self, Signer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// The collaborators a run talks to.
pub struct Services {
    pub downloads: Box<dyn DownloadService>,
    pub releases: Box<dyn ReleaseService>,
    pub installer: Box<dyn Installer>,
    pub assets: Box<dyn AssetSource>,
}

pub enum StartOutcome {
    /// Another run is active; nothing was started.
    AlreadyRunning,
    Started(JoinHandle<RunReport>),
}

/// Final state of a run. `error` and `diagnostics` are set only when a step failed.
#[derive(Debug)]
pub struct RunReport {
    pub run: PatchRun,
    pub error: Option<PatchError>,
    pub diagnostics: Option<Diagnostics>,
}

/// Files the download steps produced for the later steps.
#[derive(Default)]
struct Fetched {
    runtime_bundles: Vec<PathBuf>,
    injector: Option<PathBuf>,
}

pub struct Pipeline {
    config: PatchConfig,
    services: Services,
    events: Mutex<Sender<PipelineEvent>>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Pipeline {
    pub fn new(config: PatchConfig, services: Services) -> (Self, Receiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::channel();
        let pipeline = Self {
            config,
            services,
            events: Mutex::new(sender),
            running: AtomicBool::new(false),
        };
        (pipeline, receiver)
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts a run on a background thread unless one is already active.
    pub fn start(self: &Arc<Self>, variant: TargetVariant) -> Result<StartOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("a patch run is already active, ignoring start request");
            return Ok(StartOutcome::AlreadyRunning);
        }
        let pipeline = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("splitpatch-run".to_string())
            .spawn(move || {
                let _guard = RunningGuard(&pipeline.running);
                pipeline.run(variant)
            });
        match spawned {
            Ok(handle) => Ok(StartOutcome::Started(handle)),
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if let Ok(sender) = self.events.lock() {
            // Nobody listening is fine.
            let _ = sender.send(event);
        }
    }

    fn run(&self, variant: TargetVariant) -> RunReport {
        let env = RunEnv::new(&self.config, variant);
        let mut run = PatchRun::new(self.config.app.replace_icons);
        let mut fetched = Fetched::default();
        tracing::info!(
            "patching {} for {} into {}",
            env.version(),
            env.arch(),
            self.config.app.package_name
        );
        self.publish(PipelineEvent::Started(run.snapshots()));

        let kinds: Vec<StepKind> = run.kinds().collect();
        for kind in kinds {
            self.publish(PipelineEvent::Step(run.begin(kind)));
            tracing::info!("{kind}...");
            let started = Instant::now();
            match self.execute(kind, &env, &mut fetched) {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    tracing::info!("{kind} done in {:.2}s", elapsed.as_secs_f64());
                    self.publish(PipelineEvent::Step(run.succeed(kind, elapsed)));
                }
                Err(error) => {
                    tracing::error!("{kind} failed: {}", error.trace());
                    self.publish(PipelineEvent::Step(run.fail(kind)));
                    let diagnostics = Diagnostics {
                        step: kind,
                        trace: error.trace(),
                        environment: environment(&env, kind),
                    };
                    self.publish(PipelineEvent::Failed(diagnostics.clone()));
                    return RunReport {
                        run,
                        error: Some(error),
                        diagnostics: Some(diagnostics),
                    };
                }
            }
        }

        run.finish();
        tracing::info!("all archives patched and installed");
        self.publish(PipelineEvent::Finished);
        RunReport {
            run,
            error: None,
            diagnostics: None,
        }
    }

    fn execute(&self, kind: StepKind, env: &RunEnv, fetched: &mut Fetched) -> Result<()> {
        let ids = env.split_ids();
        let cached = env.cached_archives();
        let patched = env.patched_archives();
        match kind {
            StepKind::DownloadBase => self.fetch_archive(env, &ids.base, &cached.base),
            StepKind::DownloadLibs => self.fetch_archive(env, &ids.libs, &cached.libs),
            StepKind::DownloadLocale => self.fetch_archive(env, &ids.locale, &cached.locale),
            StepKind::DownloadResources => {
                self.fetch_archive(env, &ids.resources, &cached.resources)
            }
            StepKind::DownloadRuntime => {
                fetched.runtime_bundles = self.fetch_runtime(env)?;
                Ok(())
            }
            StepKind::DownloadInjector => {
                fetched.injector = Some(self.fetch_injector(env)?);
                Ok(())
            }
            StepKind::PrepareArchives => prepare(env),
            StepKind::ReplaceIcons => {
                let mut session = ArchiveSession::open(&patched.base).in_archive(&patched.base)?;
                let count =
                    replace_icons(&mut session, &*self.services.assets, &self.config.icons.names)?;
                tracing::info!("{count} icon entries replaced");
                if count > 0 {
                    session.commit().in_archive(&patched.base)?;
                }
                Ok(())
            }
            StepKind::PatchManifests => {
                let app = &self.config.app;
                edit_manifest(&patched.base, |bytes| {
                    patch_manifest(bytes, &app.package_name, &app.app_name, app.debuggable)
                })?;
                for split in patched.splits() {
                    edit_manifest(split, |bytes| rename_package(bytes, &app.package_name))?;
                }
                Ok(())
            }
            StepKind::ReorderDex => {
                let injector = fetched.injector.as_deref().ok_or_else(|| missing_download("injector"))?;
                let payload = std::fs::read(injector)?;
                let mut session = ArchiveSession::open(&patched.base).in_archive(&patched.base)?;
                let count = count_dex_entries(session.entries());
                reorder_dex(&mut session, count, payload)?;
                session.commit().in_archive(&patched.base)
            }
            StepKind::SwapLibraries => {
                if fetched.runtime_bundles.is_empty() {
                    return Err(missing_download("runtime libraries"));
                }
                let names = BinaryNameMap::from(&self.config.libraries);
                let mut session = ArchiveSession::open(&patched.libs).in_archive(&patched.libs)?;
                swap_libraries(&fetched.runtime_bundles, &mut session, env.arch(), &names)?;
                session.commit().in_archive(&patched.libs)
            }
            StepKind::SignArchives => {
                let signer = self.signer()?;
                for archive in patched.iter() {
                    sign::sign(archive, &signer).map_err(|err| PatchError::SigningFailure {
                        path: archive.clone(),
                        source: err.into(),
                    })?;
                }
                Ok(())
            }
            StepKind::Install => self
                .services
                .installer
                .install(&patched.to_vec())
                .map_err(|err| PatchError::InstallRejected(err.into())),
        }
    }

    fn fetch_archive(&self, env: &RunEnv, split: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            tracing::debug!("{} is cached", dest.display());
            return Ok(());
        }
        std::fs::create_dir_all(env.cache_dir())?;
        self.services
            .downloads
            .download_named_asset(env.version(), split, dest)
            .map_err(|err| download_failure(dest, err))?;
        Ok(())
    }

    fn fetch_release_asset(&self, dest: &Path, url: &str) -> Result<()> {
        if dest.exists() {
            tracing::debug!("{} is cached", dest.display());
            return Ok(());
        }
        self.services
            .downloads
            .download(url, dest)
            .map_err(|err| download_failure(dest, err))?;
        Ok(())
    }

    fn latest(&self, project: &str) -> Result<Release> {
        let releases = self
            .services
            .releases
            .list_releases(project)
            .map_err(|err| PatchError::DownloadFailure {
                name: project.to_string(),
                source: err.into(),
            })?;
        latest_release(&releases)
            .cloned()
            .ok_or_else(|| PatchError::DownloadFailure {
                name: project.to_string(),
                source: "no releases published".into(),
            })
    }

    fn fetch_runtime(&self, env: &RunEnv) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(env.cache_dir())?;
        let project = &self.config.source.runtime_project;
        let release = self.latest(project)?;
        let mut bundles = vec![];
        for asset in release.assets_with_extension("aar") {
            let dest = env.runtime_bundle_path(&asset.name, &release.tag);
            self.fetch_release_asset(&dest, &asset.url)?;
            bundles.push(dest);
        }
        if bundles.is_empty() {
            return Err(PatchError::DownloadFailure {
                name: project.to_string(),
                source: format!("release {} has no .aar assets", release.tag).into(),
            });
        }
        Ok(bundles)
    }

    fn fetch_injector(&self, env: &RunEnv) -> Result<PathBuf> {
        std::fs::create_dir_all(env.cache_dir())?;
        let project = &self.config.source.injector_project;
        let release = self.latest(project)?;
        let asset = release
            .assets_with_extension("dex")
            .next()
            .ok_or_else(|| PatchError::DownloadFailure {
                name: project.to_string(),
                source: format!("release {} has no .dex asset", release.tag).into(),
            })?;
        let dest = env.injector_path(&release.tag);
        self.fetch_release_asset(&dest, &asset.url)?;
        Ok(dest)
    }

    fn signer(&self) -> Result<Signer> {
        match &self.config.signing.key {
            Some(key) => Signer::from_path(key).map_err(|err| PatchError::SigningFailure {
                path: key.clone(),
                source: err.into(),
            }),
            None => Signer::debug().map_err(|err| PatchError::SigningFailure {
                path: PathBuf::from("<debug key>"),
                source: err.into(),
            }),
        }
    }
}

/// Recreates `patched/` from the cached downloads.
fn prepare(env: &RunEnv) -> Result<()> {
    let dir = env.patched_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    let cached = env.cached_archives();
    let patched = env.patched_archives();
    for (from, to) in cached.iter().zip(patched.iter()) {
        std::fs::copy(from, to)?;
        tracing::debug!("{} -> {}", from.display(), to.display());
    }
    Ok(())
}

/// Applies `f` to the manifest of `path` and commits only if it changed anything.
fn edit_manifest(path: &Path, f: impl FnOnce(&[u8]) -> Result<Vec<u8>>) -> Result<()> {
    let mut session = ArchiveSession::open(path).in_archive(path)?;
    let manifest = session
        .read_entry(MANIFEST_PATH)
        .in_archive(path)?
        .ok_or_else(|| PatchError::MissingArchiveEntry {
            archive: path.to_path_buf(),
            entry: MANIFEST_PATH.to_string(),
        })?;
    let patched = f(&manifest)?;
    if patched == manifest {
        tracing::debug!("{} manifest already patched", path.display());
        return Ok(());
    }
    session.write_entry(MANIFEST_PATH, patched, ZipFileOptions::Compressed);
    session.commit().in_archive(path)
}

fn download_failure(dest: &Path, err: anyhow::Error) -> PatchError {
    PatchError::DownloadFailure {
        name: dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| dest.display().to_string()),
        source: err.into(),
    }
}

fn missing_download(what: &str) -> PatchError {
    PatchError::DownloadFailure {
        name: what.to_string(),
        source: "no file was fetched".into(),
    }
}

fn environment(env: &RunEnv, step: StepKind) -> String {
    format!(
        "splitpatch {VERSION}\nhost: {} {}\ntarget version: {}\ntarget ABI: {}\nstep: {step}\ncategory: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env.version(),
        env.arch(),
        step.category(),
    )
}

use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StepCategory {
    ArchiveDownload,
    LibraryDownload,
    Patching,
    Installing,
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ArchiveDownload => "archive download",
            Self::LibraryDownload => "library download",
            Self::Patching => "patching",
            Self::Installing => "installing",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StepKind {
    DownloadBase,
    DownloadLibs,
    DownloadLocale,
    DownloadResources,
    DownloadRuntime,
    DownloadInjector,
    PrepareArchives,
    ReplaceIcons,
    PatchManifests,
    ReorderDex,
    SwapLibraries,
    SignArchives,
    Install,
}

impl StepKind {
    /// Every step of a run in execution order. Icon replacement is the only optional one.
    pub fn sequence(replace_icons: bool) -> Vec<StepKind> {
        use StepKind::*;
        [
            DownloadBase,
            DownloadLibs,
            DownloadLocale,
            DownloadResources,
            DownloadRuntime,
            DownloadInjector,
            PrepareArchives,
            ReplaceIcons,
            PatchManifests,
            ReorderDex,
            SwapLibraries,
            SignArchives,
            Install,
        ]
        .into_iter()
        .filter(|kind| replace_icons || *kind != ReplaceIcons)
        .collect()
    }

    pub fn category(self) -> StepCategory {
        use StepKind::*;
        match self {
            DownloadBase | DownloadLibs | DownloadLocale | DownloadResources => {
                StepCategory::ArchiveDownload
            }
            DownloadRuntime | DownloadInjector => StepCategory::LibraryDownload,
            PrepareArchives | ReplaceIcons | PatchManifests | ReorderDex | SwapLibraries
            | SignArchives => StepCategory::Patching,
            Install => StepCategory::Installing,
        }
    }

    pub fn name(self) -> &'static str {
        use StepKind::*;
        match self {
            DownloadBase => "Download base archive",
            DownloadLibs => "Download native library split",
            DownloadLocale => "Download locale split",
            DownloadResources => "Download resource split",
            DownloadRuntime => "Download runtime libraries",
            DownloadInjector => "Download injector",
            PrepareArchives => "Prepare working copies",
            ReplaceIcons => "Replace icons",
            PatchManifests => "Patch manifests",
            ReorderDex => "Reorder bytecode",
            SwapLibraries => "Swap native libraries",
            SignArchives => "Sign archives",
            Install => "Install",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StepStatus {
    #[default]
    Queued,
    Ongoing,
    Successful,
    Unsuccessful,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub duration: Option<Duration>,
}

/// What observers see of a step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepSnapshot {
    pub kind: StepKind,
    pub name: &'static str,
    pub category: StepCategory,
    pub status: StepStatus,
    pub duration: Option<Duration>,
}

impl From<&PatchStep> for StepSnapshot {
    fn from(step: &PatchStep) -> Self {
        Self {
            kind: step.kind,
            name: step.kind.name(),
            category: step.kind.category(),
            status: step.status,
            duration: step.duration,
        }
    }
}

/// State of one run. Only the orchestrator mutates it.
///
/// While a step is ongoing the category pointer names what is being worked on. When a
/// step fails the category is cleared and the step pointer names the failing step, so
/// exactly one of the two is set while the run is live.
#[derive(Clone, Debug)]
pub struct PatchRun {
    steps: Vec<PatchStep>,
    current_step: Option<StepKind>,
    current_category: Option<StepCategory>,
}

impl PatchRun {
    pub fn new(replace_icons: bool) -> Self {
        Self {
            steps: StepKind::sequence(replace_icons)
                .into_iter()
                .map(|kind| PatchStep {
                    kind,
                    status: StepStatus::Queued,
                    duration: None,
                })
                .collect(),
            current_step: None,
            current_category: None,
        }
    }

    pub fn steps(&self) -> &[PatchStep] {
        &self.steps
    }

    pub fn kinds(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.steps.iter().map(|step| step.kind)
    }

    pub fn step(&self, kind: StepKind) -> Option<&PatchStep> {
        self.steps.iter().find(|step| step.kind == kind)
    }

    pub fn snapshots(&self) -> Vec<StepSnapshot> {
        self.steps.iter().map(StepSnapshot::from).collect()
    }

    pub fn current_step(&self) -> Option<StepKind> {
        self.current_step
    }

    pub fn current_category(&self) -> Option<StepCategory> {
        self.current_category
    }

    pub fn is_successful(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.status == StepStatus::Successful)
    }

    fn update(&mut self, kind: StepKind, status: StepStatus, duration: Option<Duration>) -> StepSnapshot {
        match self.steps.iter_mut().find(|step| step.kind == kind) {
            Some(step) => {
                step.status = status;
                step.duration = duration;
                StepSnapshot::from(&*step)
            }
            None => StepSnapshot::from(&PatchStep {
                kind,
                status,
                duration,
            }),
        }
    }

    pub fn begin(&mut self, kind: StepKind) -> StepSnapshot {
        self.current_step = None;
        self.current_category = Some(kind.category());
        self.update(kind, StepStatus::Ongoing, None)
    }

    pub fn succeed(&mut self, kind: StepKind, elapsed: Duration) -> StepSnapshot {
        self.update(kind, StepStatus::Successful, Some(elapsed))
    }

    pub fn fail(&mut self, kind: StepKind) -> StepSnapshot {
        self.current_category = None;
        self.current_step = Some(kind);
        self.update(kind, StepStatus::Unsuccessful, None)
    }

    /// Clears the pointers after every step succeeded.
    pub fn finish(&mut self) {
        self.current_step = None;
        self.current_category = None;
    }
}

/// Produced once a run fails, for copying into a bug report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostics {
    pub step: StepKind,
    pub trace: String,
    pub environment: String,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Step: {}", self.step)?;
        writeln!(f, "{}", self.trace)?;
        writeln!(f)?;
        write!(f, "{}", self.environment)
    }
}

/// Published in the order the orchestrator produces them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PipelineEvent {
    Started(Vec<StepSnapshot>),
    Step(StepSnapshot),
    Finished,
    Failed(Diagnostics),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icon_step_is_optional() {
        assert!(!StepKind::sequence(false).contains(&StepKind::ReplaceIcons));
        let with_icons = StepKind::sequence(true);
        let icons = with_icons.iter().position(|k| *k == StepKind::ReplaceIcons);
        let manifests = with_icons.iter().position(|k| *k == StepKind::PatchManifests);
        assert!(icons < manifests);
        assert_eq!(with_icons.last(), Some(&StepKind::Install));
    }

    #[test]
    fn categories_follow_the_order() {
        let categories: Vec<_> = StepKind::sequence(true)
            .into_iter()
            .map(StepKind::category)
            .collect();
        let mut sorted = categories.clone();
        sorted.dedup();
        assert_eq!(
            sorted,
            [
                StepCategory::ArchiveDownload,
                StepCategory::LibraryDownload,
                StepCategory::Patching,
                StepCategory::Installing
            ]
        );
    }

    #[test]
    fn step_lifecycle() {
        let mut run = PatchRun::new(false);
        assert!(run.steps().iter().all(|s| s.status == StepStatus::Queued));

        let snapshot = run.begin(StepKind::DownloadBase);
        assert_eq!(snapshot.status, StepStatus::Ongoing);
        assert_eq!(run.current_category(), Some(StepCategory::ArchiveDownload));
        assert_eq!(run.current_step(), None);

        let snapshot = run.succeed(StepKind::DownloadBase, Duration::from_millis(5));
        assert_eq!(snapshot.duration, Some(Duration::from_millis(5)));

        run.begin(StepKind::DownloadLibs);
        let snapshot = run.fail(StepKind::DownloadLibs);
        assert_eq!(snapshot.status, StepStatus::Unsuccessful);
        assert_eq!(run.current_category(), None);
        assert_eq!(run.current_step(), Some(StepKind::DownloadLibs));
        assert_eq!(
            run.step(StepKind::DownloadLocale).unwrap().status,
            StepStatus::Queued
        );
        assert!(!run.is_successful());
    }

    #[test]
    fn successful_run_clears_pointers() {
        let mut run = PatchRun::new(false);
        let kinds: Vec<_> = run.kinds().collect();
        for kind in kinds {
            run.begin(kind);
            run.succeed(kind, Duration::ZERO);
        }
        run.finish();
        assert!(run.is_successful());
        assert_eq!(run.current_step(), None);
        assert_eq!(run.current_category(), None);
    }
}

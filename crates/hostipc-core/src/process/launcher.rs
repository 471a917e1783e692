//! Process launching.

#![allow(unsafe_code)]

use super::handle::ChildProcess;
use super::hook::LauncherKind;
use super::log::{LaunchEventLog, NullLog};
use super::options::LaunchOptions;
use super::plan::{read_child_failure, ChildPlan};
use super::shuffle::FileDescriptorShuffle;
use crate::environment::{build_environment_array, EnvironmentArray};
use crate::error::{LaunchError, LaunchStage};
use crate::platform;
use nix::unistd::{getpid, ForkResult};
use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Launches child processes with remapped descriptors.
///
/// Holds no per-launch state, so one launcher can be shared between threads.
#[derive(Clone)]
pub struct ProcessLauncher {
    kind: LauncherKind,
    event_log: Arc<dyn LaunchEventLog>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher {
    /// Plain-fork launcher with no event log.
    pub fn new() -> Self {
        Self {
            kind: LauncherKind::Plain,
            event_log: Arc::new(NullLog),
        }
    }

    pub fn with_kind(mut self, kind: LauncherKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn LaunchEventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn kind(&self) -> LauncherKind {
        self.kind
    }

    /// Launch `argv[0]` (an executable path, no `PATH` search) with `argv`.
    ///
    /// Failures before the fork come back as a [`LaunchError`] naming the
    /// stage. After the fork the child exits with code 127 on any failure;
    /// with `report_child_errors` set the parent also learns the failing stage
    /// and errno and returns them as an error after reaping the child.
    pub fn launch(
        &self,
        argv: &[String],
        mut options: LaunchOptions,
    ) -> Result<ChildProcess, LaunchError> {
        if argv.is_empty() {
            return Err(LaunchError::invalid("argv is empty"));
        }
        validate_remaps(&options)?;

        let mut hook = self.kind.new_hook();
        hook.prepare(&mut options).map_err(|e| {
            warn!("Launch hook '{}' rejected the launch: {}", hook.name(), e);
            LaunchError::from_io(LaunchStage::SandboxPrepare, &e)
        })?;

        let env = match &options.full_env {
            Some(entries) => EnvironmentArray::from_entries(entries),
            None => build_environment_array(&options.env_map),
        }
        .map_err(|e| LaunchError::invalid(&e.to_string()))?;

        let shuffle = FileDescriptorShuffle::init(&options.fds_to_remap)
            .map_err(|e| LaunchError::from_io(LaunchStage::ShuffleInit, &e))?;

        let error_pipe = if options.report_child_errors {
            let (read_end, write_end) = platform::cloexec_pipe()
                .map_err(|e| LaunchError::from_io(LaunchStage::ShuffleInit, &e))?;
            let write_end = shuffle
                .reserve_above(write_end)
                .map_err(|e| LaunchError::from_io(LaunchStage::ShuffleInit, &e))?;
            Some((read_end, write_end))
        } else {
            None
        };

        let plan = ChildPlan::new(
            argv,
            env,
            options.workdir.as_deref(),
            &shuffle,
            error_pipe.as_ref().map(|(_, write_end)| write_end.as_raw_fd()),
            platform::descriptor_limit(),
        )?;

        debug!(
            "Launching {:?} via {} hook ({} remaps, workdir {:?})",
            argv,
            hook.name(),
            options.fds_to_remap.len(),
            options.workdir
        );

        // SAFETY: the child branch runs nothing but `ChildPlan::commit`, which
        // is async-signal-safe and never returns.
        let forked = unsafe { hook.fork() };
        let child = match forked {
            Ok(ForkResult::Child) => unsafe { plan.commit() },
            Ok(ForkResult::Parent { child }) => child,
            Err(errno) => {
                warn!("Failed to fork for {}: {}", argv[0], errno);
                return Err(LaunchError::new(LaunchStage::Fork, errno));
            }
        };

        drop(plan);
        drop(shuffle);

        self.event_log.record_launch(getpid(), child);
        info!("Launched {} as process {}", argv[0], child);

        let mut process = ChildProcess::new(child);

        if let Some((read_end, write_end)) = error_pipe {
            drop(write_end);
            match read_child_failure(read_end) {
                Ok(Some((stage, errno))) => {
                    if let Err(e) = process.wait() {
                        warn!("Failed to reap failed child {}: {}", child, e);
                    }
                    warn!("Child process {} failed during {}: {}", child, stage, errno);
                    return Err(LaunchError::new(stage, errno));
                }
                Ok(None) => {}
                Err(e) => warn!("Could not read launch status of {}: {}", child, e),
            }
        }

        if options.wait {
            match process.wait() {
                Ok(status) => debug!("Process {} exited: {:?}", child, status),
                Err(e) => warn!("Failed to wait for process {}: {}", child, e),
            }
        }

        Ok(process)
    }
}

impl std::fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn validate_remaps(options: &LaunchOptions) -> Result<(), LaunchError> {
    let mut sources = HashSet::new();
    let mut targets = HashSet::new();
    for &(source, target) in &options.fds_to_remap {
        if !sources.insert(source) {
            return Err(LaunchError::invalid(&format!(
                "descriptor {} is remapped twice",
                source
            )));
        }
        if !targets.insert(target) {
            return Err(LaunchError::invalid(&format!(
                "descriptor {} is the target of two remaps",
                target
            )));
        }
    }
    Ok(())
}

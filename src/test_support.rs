//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{
    BackendContext, BackendError, BackendFuture, BackendKind, CreateOutcome, DeleteOutcome,
    DriveInfo, FormatOutcome, StorageBackend, VolumeSpec, VolumeTarget, WireVolume, wire,
};
use crate::executor::{CommandOutput, CommandRunner, NodeCommandError, RunnerError};
use crate::nodes::Node;

#[derive(Clone, Debug)]
enum ScriptedResponse {
    Output(CommandOutput),
    Timeout,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same script and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the last argument, which carries the remote command line for
    /// both transports.
    #[must_use]
    pub fn remote_command(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the remote command lines executed so far, in order.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::remote_command)
            .collect()
    }

    fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response that makes the runner report a timeout.
    pub fn push_timeout(&self) {
        self.push(ScriptedResponse::Timeout);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(ScriptedResponse::Output(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Number of scripted responses not consumed yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> BackendFuture<'a, CommandOutput, RunnerError> {
        Box::pin(async move {
            self.invocations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(CommandInvocation {
                    program: program.to_owned(),
                    args: args.to_vec(),
                });
            let next = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(ScriptedResponse::Output(output)) => Ok(output),
                Some(ScriptedResponse::Timeout) => Err(RunnerError::Timeout {
                    program: program.to_owned(),
                    timeout,
                }),
                None => Err(RunnerError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                }),
            }
        })
    }
}

/// In-memory storage backend that records calls and tracks concurrency.
///
/// `format` holds the resource for a short, configurable delay so tests can
/// observe overlapping calls through [`FakeBackend::max_concurrent_formats`].
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    inner: Arc<FakeBackendInner>,
}

type DeleteHook = Arc<dyn Fn(&VolumeTarget) + Send + Sync>;

#[derive(Clone, Default)]
struct DeleteHookSlot(Option<DeleteHook>);

impl fmt::Debug for DeleteHookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Some(hook)" } else { "None" })
    }
}

#[derive(Debug, Default)]
struct FakeBackendInner {
    resources: Mutex<BTreeMap<String, u64>>,
    in_use: Mutex<HashSet<String>>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    active_formats: AtomicUsize,
    max_formats: AtomicUsize,
    fail_create: AtomicBool,
    unreachable: AtomicBool,
    format_delay: Mutex<Duration>,
    on_delete: Mutex<DeleteHookSlot>,
}

impl FakeBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every node-touching call fail as if the node were unreachable.
    pub fn set_unreachable(&self, value: bool) {
        self.inner.unreachable.store(value, Ordering::SeqCst);
    }

    /// Makes `create` fail with a provider error.
    pub fn fail_create(&self, value: bool) {
        self.inner.fail_create.store(value, Ordering::SeqCst);
    }

    /// Marks a drive as attached so `delete` reports it in use.
    pub fn mark_in_use(&self, drive_name: &str, value: bool) {
        let mut in_use = self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if value {
            in_use.insert(drive_name.to_owned());
        } else {
            in_use.remove(drive_name);
        }
    }

    /// Sets how long each `format` call holds the resource.
    pub fn set_format_delay(&self, delay: Duration) {
        *self
            .inner
            .format_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Runs `hook` inside every `delete` call, before the resource is
    /// removed.
    pub fn on_delete(&self, hook: impl Fn(&VolumeTarget) + Send + Sync + 'static) {
        self.inner
            .on_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0 = Some(Arc::new(hook));
    }

    /// Number of physical resources currently present.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when a resource exists for `drive_name`.
    #[must_use]
    pub fn has_resource(&self, drive_name: &str) -> bool {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(drive_name)
    }

    /// Number of `create` calls that reached the backend.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.inner.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that reached the backend.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `format` calls observed running at once.
    #[must_use]
    pub fn max_concurrent_formats(&self) -> usize {
        self.inner.max_formats.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), BackendError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Command(NodeCommandError::Unreachable {
                host: String::from("fake-node"),
                message: String::from("simulated outage"),
            }));
        }
        Ok(())
    }

    fn format_delay(&self) -> Duration {
        *self
            .inner
            .format_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn select_node<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        _target: &'a VolumeTarget,
    ) -> BackendFuture<'a, Node, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(Node::new("fake-node", "fake-node", "127.0.0.1"))
        })
    }

    fn exists<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, bool, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            Ok(self.has_resource(&target.drive_name))
        })
    }

    fn create<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, CreateOutcome, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            self.inner.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.inner.fail_create.load(Ordering::SeqCst) {
                return Err(BackendError::Provider {
                    message: String::from("simulated create failure"),
                });
            }
            let mut resources = self
                .inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if resources.contains_key(&target.drive_name) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            resources.insert(target.drive_name.clone(), target.size_gb);
            Ok(CreateOutcome::Created)
        })
    }

    fn format<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
        _filesystem: &'a str,
    ) -> BackendFuture<'a, FormatOutcome, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            if !self.has_resource(&target.drive_name) {
                return Err(BackendError::NotFound {
                    drive_name: target.drive_name.clone(),
                });
            }
            let active = self.inner.active_formats.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.max_formats.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.format_delay()).await;
            self.inner.active_formats.fetch_sub(1, Ordering::SeqCst);
            Ok(FormatOutcome::Formatted)
        })
    }

    fn delete<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, DeleteOutcome, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
            let hook = self
                .inner
                .on_delete
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook.0 {
                hook(target);
            }
            let busy = self
                .inner
                .in_use
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&target.drive_name);
            if busy {
                return Ok(DeleteOutcome::InUse);
            }
            let removed = self
                .inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&target.drive_name);
            Ok(if removed.is_some() {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::Missing
            })
        })
    }

    fn list_drives<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        _namespace: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<DriveInfo>, BackendError> {
        Box::pin(async move {
            self.check_reachable()?;
            let in_use = self
                .inner
                .in_use
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            Ok(self
                .inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter_map(|(drive_name, size)| {
                    let mut info =
                        DriveInfo::unused(BackendKind::Local, drive_name, Some(*size))?;
                    if in_use.contains(drive_name) {
                        info = info.used_on("fake-node", None);
                    }
                    Some(info)
                })
                .collect())
        })
    }

    fn to_wire<'a>(
        &'a self,
        _ctx: &'a BackendContext,
        target: &'a VolumeTarget,
    ) -> BackendFuture<'a, VolumeSpec, BackendError> {
        Box::pin(async move {
            Ok(VolumeSpec::local(
                &target.name,
                wire::LocalStorageVolumeSource {
                    path: format!("/fake/{}", target.drive_name),
                    size: target.size_gb,
                },
            ))
        })
    }

    fn from_wire(&self, spec: &VolumeSpec) -> Result<WireVolume, BackendError> {
        let source = spec.local_storage.as_ref().ok_or_else(|| BackendError::InvalidWire {
            backend: BackendKind::Local,
            message: String::from("missing localStorage section"),
        })?;
        let drive_name = source
            .path
            .strip_prefix("/fake/")
            .ok_or_else(|| BackendError::InvalidWire {
                backend: BackendKind::Local,
                message: format!("path {} is outside /fake", source.path),
            })?;
        Ok(WireVolume {
            size: Some(source.size),
            drive_name: drive_name.to_owned(),
        })
    }
}

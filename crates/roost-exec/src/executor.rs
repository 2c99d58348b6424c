//! The action executor: accepts submissions, serializes execution per
//! resource, dispatches through the class-appropriate transport, tracks
//! in-flight and blocked actions, manages the recurring schedule, and
//! supports cancellation.
//!
//! All tracking tables live on one shared state value; the executor is a
//! cheap clone-able handle onto it. Completion callbacks are owned by the
//! table entries and invoked exactly once per execution, outside the
//! table lock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use roost_proto::error::{RoostError, RoostResult};
use roost_proto::opkey::OpKey;

use crate::action::{
    build_exec_spec, ActionRequest, ActionResult, ActionStatus, AgentClass, ExecSpec,
};
use crate::registry::Registry;

/// Completion callback for tracked actions. Fires once per completed
/// execution; for a recurring action that is once per interval.
pub type ActionCallback = Arc<dyn Fn(&OpKey, &ActionResult) + Send + Sync>;

/// Completion callback for untracked (generic/alert) executions.
pub type GenericCallback = Arc<dyn Fn(&ActionResult) + Send + Sync>;

/// An action whose execution has started and not yet completed.
struct InflightEntry {
    key: OpKey,
    rsc_id: String,
    class: AgentClass,
    sequence: u64,
    cancelled: bool,
    kill: Arc<Notify>,
}

/// A submission waiting for the in-flight action on its resource.
struct PendingExec {
    request: ActionRequest,
    callback: ActionCallback,
    sequence: u64,
}

/// The single active recurring action for one identity.
struct RecurringEntry {
    request: ActionRequest,
    callback: ActionCallback,
    running: bool,
    /// Re-run immediately after the current execution instead of waiting
    /// a full interval (set by a duplicate submission that arrived while
    /// the action was running).
    refire: bool,
    /// Invalidates armed repeat timers when bumped.
    timer_gen: u64,
}

struct ExecState {
    sequence: u64,
    inflight: Vec<InflightEntry>,
    blocked: Vec<PendingExec>,
    recurring: HashMap<OpKey, RecurringEntry>,
    /// Re-entrancy guard for the blocked-queue drain.
    draining: bool,
}

struct Inner {
    registry: Registry,
    state: Mutex<ExecState>,
}

/// Handle to the executor. Clones share the same tables.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Runner {
    request: ActionRequest,
    callback: ActionCallback,
    sequence: u64,
    kill: Arc<Notify>,
}

impl Executor {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                state: Mutex::new(ExecState {
                    sequence: 0,
                    inflight: Vec::new(),
                    blocked: Vec::new(),
                    recurring: HashMap::new(),
                    draining: false,
                }),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Validate, resolve the class alias, and canonicalize the operation
    /// name. Shared by the async and sync submission paths.
    async fn prepare(&self, mut request: ActionRequest) -> RoostResult<ActionRequest> {
        request.validate()?;

        if request.class == AgentClass::Auto {
            request.class = self.inner.registry.resolve_auto(&request.agent).await;
        }
        if request.operation == "monitor" && request.class.monitor_is_status() {
            request.operation = "status".to_string();
        }
        Ok(request)
    }

    /// Submit an action for asynchronous execution.
    ///
    /// Recurring submissions (interval > 0) are indexed by identity; a
    /// duplicate merges into the existing entry (its callback is
    /// replaced, and if it is currently running the next execution fires
    /// immediately after the current one completes).
    pub async fn submit(&self, request: ActionRequest, callback: ActionCallback) -> RoostResult<()> {
        let request = self.prepare(request).await?;
        let key = request.key();

        let runner = {
            let mut state = self.inner.state.lock().await;
            state.sequence += 1;
            let sequence = state.sequence;

            if request.interval_ms > 0 {
                if let Some(entry) = state.recurring.get_mut(&key) {
                    entry.callback = callback.clone();
                    if entry.running {
                        entry.refire = true;
                    }
                    debug!("merged duplicate recurring submission for {}", key);
                    return Ok(());
                }
                state.recurring.insert(
                    key.clone(),
                    RecurringEntry {
                        request: request.clone(),
                        callback: callback.clone(),
                        running: false,
                        refire: false,
                        timer_gen: 0,
                    },
                );
            }

            dispatch_locked(&mut state, request, callback, sequence)
        };

        if let Some(runner) = runner {
            self.spawn_runner(runner);
        }
        Ok(())
    }

    /// Run an action to completion inline, bypassing the tracking tables.
    pub async fn execute_sync(&self, request: ActionRequest) -> RoostResult<ActionResult> {
        let request = self.prepare(request).await?;
        Ok(run_action(&self.inner.registry, &request, Arc::new(Notify::new())).await)
    }

    /// Run a bare executable with an environment, untracked. Returns an
    /// error only when the submission itself fails (the agent cannot be
    /// spawned); the completion is delivered through the callback.
    pub async fn run_generic(
        &self,
        id: &str,
        path: &str,
        timeout_ms: u64,
        env: BTreeMap<String, String>,
        callback: GenericCallback,
    ) -> RoostResult<()> {
        let mut cmd = Command::new(path);
        cmd.envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            warn!("could not spawn {} ({}): {}", id, path, e);
            RoostError::SpawnFailed
        })?;

        let id = id.to_string();
        let started = Instant::now();
        tokio::spawn(async move {
            let mut result = wait_child(child, timeout_ms, Arc::new(Notify::new())).await;
            result.elapsed = started.elapsed();
            debug!(
                "generic execution {} finished: {:?} rc={}",
                id, result.status, result.exit_code
            );
            callback(&result);
        });
        Ok(())
    }

    /// Cancel a recurring action by identity.
    ///
    /// Returns true when the cancellation took effect now (idle entry
    /// completed as cancelled, or a child process was signalled); false
    /// when the identity is unknown or an in-flight bus call has to
    /// finish on its own first.
    pub async fn cancel(&self, key: &OpKey) -> bool {
        enum Outcome {
            Killed,
            BusPending,
            Idle(ActionCallback),
        }

        let outcome = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.recurring.remove(key) else {
                debug!("nothing to cancel for {}", key);
                return false;
            };
            info!("cancelling recurring operation {}", key);

            if let Some(inflight) = state.inflight.iter_mut().find(|e| &e.key == key) {
                inflight.cancelled = true;
                if inflight.class.is_bus() {
                    info!("will cancel {} when the in-flight bus call completes", key);
                    Outcome::BusPending
                } else {
                    inflight.kill.notify_waiters();
                    Outcome::Killed
                }
            } else {
                state.blocked.retain(|p| &p.request.key() != key);
                Outcome::Idle(entry.callback)
            }
        };

        match outcome {
            Outcome::Killed => true,
            Outcome::BusPending => false,
            Outcome::Idle(callback) => {
                let result = ActionResult::with_status(ActionStatus::Cancelled);
                callback(key, &result);
                true
            }
        }
    }

    /// Force an idle recurring action to run now instead of waiting for
    /// its repeat timer. A running entry is left alone.
    pub async fn kick(&self, key: &OpKey) -> bool {
        let runner = {
            let mut state = self.inner.state.lock().await;
            if state.inflight.iter().any(|e| &e.key == key) {
                return state.recurring.contains_key(key);
            }
            let fresh = match state.recurring.get_mut(key) {
                Some(rec) => {
                    rec.timer_gen += 1;
                    (rec.request.clone(), rec.callback.clone())
                }
                None => return false,
            };
            state.sequence += 1;
            let sequence = state.sequence;
            dispatch_locked(&mut state, fresh.0, fresh.1, sequence)
        };

        if let Some(runner) = runner {
            self.spawn_runner(runner);
        }
        true
    }

    /// Number of actions currently in flight (test/introspection helper).
    pub async fn inflight_count(&self) -> usize {
        self.inner.state.lock().await.inflight.len()
    }

    /// Number of actions waiting on a busy resource.
    pub async fn blocked_count(&self) -> usize {
        self.inner.state.lock().await.blocked.len()
    }

    /// Number of tracked recurring identities.
    pub async fn recurring_count(&self) -> usize {
        self.inner.state.lock().await.recurring.len()
    }

    fn spawn_runner(&self, runner: Runner) {
        let exec = self.clone();
        tokio::spawn(async move {
            let key = runner.request.key();
            let result =
                run_action(&exec.inner.registry, &runner.request, runner.kill.clone()).await;
            exec.complete(key, runner.sequence, runner.callback, result)
                .await;
        });
    }

    /// Repeat-timer expiry: dispatch a fresh execution through the normal
    /// path unless the entry went away or is already running.
    async fn timer_fired(&self, key: OpKey, gen: u64) {
        let runner = {
            let mut state = self.inner.state.lock().await;
            let fresh = match state.recurring.get(&key) {
                Some(rec) if rec.timer_gen == gen && !rec.running => {
                    Some((rec.request.clone(), rec.callback.clone()))
                }
                _ => None,
            };
            let Some((request, callback)) = fresh else {
                return;
            };
            state.sequence += 1;
            let sequence = state.sequence;
            dispatch_locked(&mut state, request, callback, sequence)
        };

        if let Some(runner) = runner {
            self.spawn_runner(runner);
        }
    }

    /// Terminal transition for one execution: untrack, deliver the
    /// callback, re-arm the repeat timer, and drain the blocked queue.
    async fn complete(
        &self,
        key: OpKey,
        sequence: u64,
        carried_callback: ActionCallback,
        mut result: ActionResult,
    ) {
        let (callback, rearm) = {
            let mut state = self.inner.state.lock().await;

            let mut cancelled = false;
            if let Some(pos) = state.inflight.iter().position(|e| e.sequence == sequence) {
                cancelled = state.inflight.remove(pos).cancelled;
            }
            if cancelled {
                result.status = ActionStatus::Cancelled;
            }

            let mut rearm = None;
            let callback = match state.recurring.get_mut(&key) {
                Some(rec) => {
                    rec.running = false;
                    if result.status != ActionStatus::Cancelled {
                        rec.timer_gen += 1;
                        let delay_ms = if rec.refire { 0 } else { key.interval_ms };
                        rec.refire = false;
                        rearm = Some((rec.timer_gen, delay_ms));
                    }
                    // Duplicate submissions may have replaced the callback
                    // since this execution was dispatched.
                    rec.callback.clone()
                }
                None => carried_callback,
            };
            (callback, rearm)
        };

        debug!(
            "{} completed: {:?} rc={} after {:?}",
            key, result.status, result.exit_code, result.elapsed
        );
        callback(&key, &result);

        if let Some((gen, delay_ms)) = rearm {
            let exec = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                exec.timer_fired(key, gen).await;
            });
        }

        self.drain_blocked().await;
    }

    /// Dispatch every blocked action whose resource is now free, in
    /// submission order. Guarded against re-entry.
    async fn drain_blocked(&self) {
        let runners = {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                return;
            }
            state.draining = true;

            let mut runners = Vec::new();
            let mut index = 0;
            while index < state.blocked.len() {
                let rsc_busy = {
                    let rsc = &state.blocked[index].request.rsc_id;
                    state.inflight.iter().any(|e| &e.rsc_id == rsc)
                };
                if rsc_busy {
                    index += 1;
                    continue;
                }
                let pending = state.blocked.remove(index);
                if let Some(runner) = dispatch_locked(
                    &mut state,
                    pending.request,
                    pending.callback,
                    pending.sequence,
                ) {
                    runners.push(runner);
                }
            }

            state.draining = false;
            runners
        };

        for runner in runners {
            self.spawn_runner(runner);
        }
    }
}

/// Queue the submission if its resource is busy, otherwise register it
/// in flight and hand back a runner to spawn. Must be called with the
/// state lock held.
fn dispatch_locked(
    state: &mut ExecState,
    request: ActionRequest,
    callback: ActionCallback,
    sequence: u64,
) -> Option<Runner> {
    let key = request.key();

    if state.inflight.iter().any(|e| e.rsc_id == request.rsc_id) {
        debug!(
            "blocking {} until the in-flight action on {} completes",
            key, request.rsc_id
        );
        state.blocked.push(PendingExec {
            request,
            callback,
            sequence,
        });
        return None;
    }

    let kill = Arc::new(Notify::new());
    state.inflight.push(InflightEntry {
        key: key.clone(),
        rsc_id: request.rsc_id.clone(),
        class: request.class,
        sequence,
        cancelled: false,
        kill: kill.clone(),
    });
    if let Some(rec) = state.recurring.get_mut(&key) {
        rec.running = true;
    }

    Some(Runner {
        request,
        callback,
        sequence,
        kill,
    })
}

/// Execute one resolved action through its transport.
async fn run_action(registry: &Registry, request: &ActionRequest, kill: Arc<Notify>) -> ActionResult {
    let started = Instant::now();

    let spec = match build_exec_spec(&registry.roots, request) {
        Ok(spec) => spec,
        Err(err) => {
            warn!("cannot build execution for {}: {}", request.key(), err);
            return ActionResult::with_status(ActionStatus::NotConfigured);
        }
    };

    let mut result = match spec {
        ExecSpec::Bus { class } => match registry.bus_for(class) {
            Some(bus) => {
                let call = bus.exec(&request.agent, &request.operation, &request.parameters);
                if request.timeout_ms > 0 {
                    match tokio::time::timeout(Duration::from_millis(request.timeout_ms), call)
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => ActionResult::with_status(ActionStatus::TimedOut),
                    }
                } else {
                    call.await
                }
            }
            None => {
                warn!("no {} backend available for {}", class.as_str(), request.key());
                ActionResult::with_status(ActionStatus::NotInstalled)
            }
        },
        ExecSpec::Process { exec, args, env } => {
            spawn_and_wait(&exec, &args, &env, request.timeout_ms, kill).await
        }
    };

    result.elapsed = started.elapsed();
    result
}

async fn spawn_and_wait(
    exec: &Path,
    args: &[String],
    env: &BTreeMap<String, String>,
    timeout_ms: u64,
    kill: Arc<Notify>,
) -> ActionResult {
    let mut cmd = Command::new(exec);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let status = match e.kind() {
                std::io::ErrorKind::NotFound => ActionStatus::NotInstalled,
                std::io::ErrorKind::PermissionDenied => ActionStatus::NotConfigured,
                _ => ActionStatus::Error,
            };
            warn!("could not spawn {}: {}", exec.display(), e);
            return ActionResult::with_status(status);
        }
    };

    wait_child(child, timeout_ms, kill).await
}

async fn wait_child(
    mut child: tokio::process::Child,
    timeout_ms: u64,
    kill: Arc<Notify>,
) -> ActionResult {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    enum Outcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Killed,
    }

    let interrupted = async {
        tokio::select! {
            _ = sleep(Duration::from_millis(timeout_ms)), if timeout_ms > 0 => Outcome::TimedOut,
            _ = kill.notified() => Outcome::Killed,
        }
    };
    let outcome = tokio::select! {
        exit = child.wait() => Outcome::Exited(exit),
        outcome = interrupted => outcome,
    };

    let mut status = ActionStatus::Done;
    let mut exit_code = -1;
    match outcome {
        Outcome::Exited(Ok(st)) => exit_code = st.code().unwrap_or(-1),
        Outcome::Exited(Err(_)) => status = ActionStatus::Error,
        Outcome::TimedOut => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            status = ActionStatus::TimedOut;
        }
        Outcome::Killed => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            status = ActionStatus::Cancelled;
        }
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    ActionResult {
        exit_code,
        status,
        stdout,
        stderr,
        elapsed: Duration::ZERO, // filled in by run_action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentRoots, StaticBus};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        _tmp: tempfile::TempDir,
        exec: Executor,
        script_dir: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let roots = AgentRoots {
            script_dir: tmp.path().join("resource.d"),
            legacy_dir: tmp.path().join("legacy.d"),
            probe_dir: tmp.path().join("probes"),
        };
        let script_dir = roots.script_dir.clone();
        fs::create_dir_all(&script_dir).unwrap();
        Fixture {
            _tmp: tmp,
            exec: Executor::new(Registry::new(roots)),
            script_dir,
        }
    }

    fn install_agent(dir: &std::path::Path, provider: &str, name: &str, body: &str) {
        let provider_dir = dir.join(provider);
        fs::create_dir_all(&provider_dir).unwrap();
        let path = provider_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn request(rsc: &str, agent: &str, operation: &str, interval_ms: u64) -> ActionRequest {
        ActionRequest {
            rsc_id: rsc.into(),
            class: AgentClass::Script,
            provider: Some("test".into()),
            agent: agent.into(),
            operation: operation.into(),
            interval_ms,
            timeout_ms: 10_000,
            parameters: BTreeMap::new(),
        }
    }

    fn channel_callback() -> (ActionCallback, mpsc::UnboundedReceiver<(OpKey, ActionResult)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: ActionCallback = Arc::new(move |key: &OpKey, result: &ActionResult| {
            let _ = tx.send((key.clone(), result.clone()));
        });
        (cb, rx)
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<(OpKey, ActionResult)>,
    ) -> (OpKey, ActionResult) {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_script_execution_reports_exit_and_output() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "echoer", "echo hello; exit 7");
        let (cb, mut rx) = channel_callback();

        fx.exec
            .submit(request("db", "echoer", "start", 0), cb)
            .await
            .unwrap();

        let (key, result) = recv(&mut rx).await;
        assert_eq!(key, OpKey::new("db", "start", 0));
        assert_eq!(result.status, ActionStatus::Done);
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(fx.exec.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_agent_is_not_installed() {
        let fx = fixture();
        let (cb, mut rx) = channel_callback();
        fx.exec
            .submit(request("db", "ghost", "start", 0), cb)
            .await
            .unwrap();
        let (_, result) = recv(&mut rx).await;
        assert_eq!(result.status, ActionStatus::NotInstalled);
    }

    #[tokio::test]
    async fn test_validation_rejects_without_touching_tables() {
        let fx = fixture();
        let (cb, _rx) = channel_callback();
        let mut req = request("", "echoer", "start", 0);
        req.rsc_id = String::new();
        assert_eq!(
            fx.exec.submit(req, cb).await,
            Err(RoostError::MissingResource)
        );
        assert_eq!(fx.exec.inflight_count().await, 0);
        assert_eq!(fx.exec.recurring_count().await, 0);
    }

    #[tokio::test]
    async fn test_monitor_becomes_status_for_script_agents() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "probe", "echo \"$1\"");
        let (cb, mut rx) = channel_callback();
        fx.exec
            .submit(request("db", "probe", "monitor", 0), cb)
            .await
            .unwrap();
        let (key, result) = recv(&mut rx).await;
        assert_eq!(key.operation, "status");
        assert_eq!(result.stdout.trim(), "status");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "sleeper", "sleep 30");
        let (cb, mut rx) = channel_callback();
        let mut req = request("db", "sleeper", "start", 0);
        req.timeout_ms = 200;

        let started = Instant::now();
        fx.exec.submit(req, cb).await.unwrap();
        let (_, result) = recv(&mut rx).await;
        assert_eq!(result.status, ActionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_same_resource_actions_never_overlap() {
        let fx = fixture();
        // Each run prints its start and end timestamps in nanoseconds.
        install_agent(
            &fx.script_dir,
            "test",
            "spanner",
            "date +%s%N; sleep 0.2; date +%s%N",
        );
        let (cb, mut rx) = channel_callback();

        fx.exec
            .submit(request("db", "spanner", "start", 0), cb.clone())
            .await
            .unwrap();
        fx.exec
            .submit(request("db", "spanner", "stop", 0), cb)
            .await
            .unwrap();
        assert_eq!(fx.exec.blocked_count().await, 1);

        let (first_key, first) = recv(&mut rx).await;
        let (second_key, second) = recv(&mut rx).await;

        // Blocked actions run in submission order
        assert_eq!(first_key.operation, "start");
        assert_eq!(second_key.operation, "stop");

        let span = |r: &ActionResult| {
            let mut lines = r.stdout.lines();
            let start: u128 = lines.next().unwrap().trim().parse().unwrap();
            let end: u128 = lines.next().unwrap().trim().parse().unwrap();
            (start, end)
        };
        let (_, first_end) = span(&first);
        let (second_start, _) = span(&second);
        assert!(
            first_end <= second_start,
            "executions overlapped: {} > {}",
            first_end,
            second_start
        );
    }

    #[tokio::test]
    async fn test_different_resources_run_concurrently() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "sleeper", "sleep 0.3");
        let (cb, mut rx) = channel_callback();

        let started = Instant::now();
        fx.exec
            .submit(request("a", "sleeper", "start", 0), cb.clone())
            .await
            .unwrap();
        fx.exec
            .submit(request("b", "sleeper", "start", 0), cb)
            .await
            .unwrap();
        recv(&mut rx).await;
        recv(&mut rx).await;
        assert!(
            started.elapsed() < Duration::from_millis(550),
            "independent resources were serialized"
        );
    }

    #[tokio::test]
    async fn test_recurring_monitor_waits_for_inflight_start() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "starter", "sleep 0.3");
        install_agent(&fx.script_dir, "test", "mon", "exit 0");
        let (cb, mut rx) = channel_callback();

        fx.exec
            .submit(request("db", "starter", "start", 0), cb.clone())
            .await
            .unwrap();
        fx.exec
            .submit(request("db", "mon", "monitor", 5_000), cb)
            .await
            .unwrap();

        // The monitor sits on the blocked queue while start runs
        assert_eq!(fx.exec.blocked_count().await, 1);
        assert_eq!(fx.exec.recurring_count().await, 1);

        let (first_key, _) = recv(&mut rx).await;
        assert_eq!(first_key.operation, "start");
        let (second_key, second) = recv(&mut rx).await;
        assert_eq!(second_key.operation, "status");
        assert_eq!(second.status, ActionStatus::Done);

        // The first monitor completion armed the next interval
        assert_eq!(fx.exec.recurring_count().await, 1);
        fx.exec.cancel(&OpKey::new("db", "status", 5_000)).await;
    }

    #[tokio::test]
    async fn test_recurring_reschedules_until_cancelled() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "mon", "exit 0");
        let (cb, mut rx) = channel_callback();
        let key = OpKey::new("db", "status", 100);

        fx.exec
            .submit(request("db", "mon", "monitor", 100), cb)
            .await
            .unwrap();

        // At least two executions happen on the 100ms schedule
        recv(&mut rx).await;
        recv(&mut rx).await;
        assert_eq!(fx.exec.recurring_count().await, 1);

        assert!(fx.exec.cancel(&key).await || fx.exec.recurring_count().await == 0);
        assert_eq!(fx.exec.recurring_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_recurring_coalesces_and_replaces_callback() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "mon", "sleep 0.2");
        let (cb_old, mut rx_old) = channel_callback();
        let (cb_new, mut rx_new) = channel_callback();

        fx.exec
            .submit(request("db", "mon", "monitor", 60_000), cb_old)
            .await
            .unwrap();
        // First execution is still running; the duplicate merges
        fx.exec
            .submit(request("db", "mon", "monitor", 60_000), cb_new)
            .await
            .unwrap();
        assert_eq!(fx.exec.recurring_count().await, 1);

        // The merged callback receives the completion of the in-flight
        // run, and the refire executes a second run right away.
        let (_, first) = recv(&mut rx_new).await;
        assert_eq!(first.status, ActionStatus::Done);
        let (_, second) = recv(&mut rx_new).await;
        assert_eq!(second.status, ActionStatus::Done);
        assert!(rx_old.try_recv().is_err());

        fx.exec.cancel(&OpKey::new("db", "status", 60_000)).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_identity_is_noop() {
        let fx = fixture();
        assert!(!fx.exec.cancel(&OpKey::new("db", "monitor", 1000)).await);
    }

    #[tokio::test]
    async fn test_cancel_idle_synthesizes_cancelled_completion() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "mon", "exit 0");
        let (cb, mut rx) = channel_callback();
        let key = OpKey::new("db", "status", 60_000);

        fx.exec
            .submit(request("db", "mon", "monitor", 60_000), cb)
            .await
            .unwrap();
        let (_, first) = recv(&mut rx).await;
        assert_eq!(first.status, ActionStatus::Done);

        // Now idle, waiting out the 60s repeat timer
        assert!(fx.exec.cancel(&key).await);
        let (cancel_key, cancelled) = recv(&mut rx).await;
        assert_eq!(cancel_key, key);
        assert_eq!(cancelled.status, ActionStatus::Cancelled);

        // No further completions fire for this identity
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        // A fresh submission with the same identity is accepted
        let (cb2, mut rx2) = channel_callback();
        fx.exec
            .submit(request("db", "mon", "monitor", 60_000), cb2)
            .await
            .unwrap();
        let (_, fresh) = recv(&mut rx2).await;
        assert_eq!(fresh.status, ActionStatus::Done);
        fx.exec.cancel(&key).await;
    }

    #[tokio::test]
    async fn test_cancel_kills_running_child() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "hang", "sleep 30");
        let (cb, mut rx) = channel_callback();
        let key = OpKey::new("db", "status", 60_000);

        fx.exec
            .submit(request("db", "hang", "monitor", 60_000), cb)
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        assert!(fx.exec.cancel(&key).await);
        let (_, result) = recv(&mut rx).await;
        assert_eq!(result.status, ActionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fx.exec.recurring_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_bus_call_cannot_force() {
        let fx = fixture();
        let bus = Arc::new(
            StaticBus::new("unit")
                .with_agent("svc", 0)
                .with_delay(Duration::from_millis(300)),
        );
        let exec = Executor::new(
            Registry::new(AgentRoots {
                script_dir: fx.script_dir.clone(),
                legacy_dir: fx.script_dir.clone(),
                probe_dir: fx.script_dir.clone(),
            })
            .with_unit_bus(bus),
        );

        let (cb, mut rx) = channel_callback();
        let mut req = request("db", "svc", "monitor", 60_000);
        req.class = AgentClass::UnitBus;
        req.provider = None;
        exec.submit(req, cb).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let key = OpKey::new("db", "monitor", 60_000);
        // Cannot terminate the bus call; reported as not-cancelled-now
        assert!(!exec.cancel(&key).await);

        // The in-flight call completes on its own but is reported as
        // cancelled, and nothing is rescheduled.
        let (_, result) = recv(&mut rx).await;
        assert_eq!(result.status, ActionStatus::Cancelled);
        assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_kick_runs_idle_recurring_immediately() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "mon", "exit 0");
        let (cb, mut rx) = channel_callback();
        let key = OpKey::new("db", "status", 60_000);

        fx.exec
            .submit(request("db", "mon", "monitor", 60_000), cb)
            .await
            .unwrap();
        recv(&mut rx).await;

        assert!(fx.exec.kick(&key).await);
        let (_, result) = recv(&mut rx).await;
        assert_eq!(result.status, ActionStatus::Done);

        assert!(!fx.exec.kick(&OpKey::new("db", "status", 999)).await);
        fx.exec.cancel(&key).await;
    }

    #[tokio::test]
    async fn test_auto_class_resolves_to_bus_backend() {
        let fx = fixture();
        let bus = Arc::new(StaticBus::new("unit").with_agent("websvc", 0));
        let exec = Executor::new(
            Registry::new(AgentRoots {
                script_dir: fx.script_dir.clone(),
                legacy_dir: fx.script_dir.clone(),
                probe_dir: fx.script_dir.clone(),
            })
            .with_unit_bus(bus),
        );

        let (cb, mut rx) = channel_callback();
        let mut req = request("web", "websvc", "start", 0);
        req.class = AgentClass::Auto;
        req.provider = None;
        exec.submit(req, cb).await.unwrap();

        let (key, result) = recv(&mut rx).await;
        // Bus classes do not canonicalize the operation name
        assert_eq!(key.operation, "start");
        assert_eq!(result.status, ActionStatus::Done);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_execute_sync() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "echoer", "echo inline");
        let result = fx
            .exec
            .execute_sync(request("db", "echoer", "start", 0))
            .await
            .unwrap();
        assert_eq!(result.status, ActionStatus::Done);
        assert_eq!(result.stdout.trim(), "inline");
        assert_eq!(fx.exec.inflight_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_generic_propagates_environment() {
        let fx = fixture();
        install_agent(&fx.script_dir, "test", "envy", "echo \"$GREETING\"");
        let path = fx.script_dir.join("test").join("envy");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cb: GenericCallback = Arc::new(move |result: &ActionResult| {
            let _ = tx.send(result.clone());
        });
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi there".to_string());

        fx.exec
            .run_generic("g1", path.to_str().unwrap(), 5_000, env, cb)
            .await
            .unwrap();
        let result = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(result.stdout.trim(), "hi there");
    }

    #[tokio::test]
    async fn test_run_generic_spawn_failure_is_submission_error() {
        let fx = fixture();
        let cb: GenericCallback = Arc::new(|_| {});
        let result = fx
            .exec
            .run_generic("g1", "/does/not/exist", 1_000, BTreeMap::new(), cb)
            .await;
        assert_eq!(result, Err(RoostError::SpawnFailed));
    }
}

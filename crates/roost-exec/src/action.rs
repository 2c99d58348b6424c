//! Action descriptors: agent classes, requests, results, and the
//! per-class execution specification (executable, argument vector,
//! environment).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use roost_proto::error::{RoostError, RoostResult};
use roost_proto::opkey::OpKey;

use crate::registry::AgentRoots;

/// Exit code an agent returns when the resource is healthy.
pub const EXIT_OK: i32 = 0;
/// Exit code an agent returns when the resource is cleanly stopped.
pub const EXIT_NOT_RUNNING: i32 = 7;

/// Parameter-key prefix for orchestration metadata that must not be
/// forwarded to probe plugins as command-line options.
pub const META_PARAM_PREFIX: &str = "CRM_meta_";

/// The agent transport family governing how an action executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentClass {
    /// Init-script style agents run as a child process; the agent path is
    /// `<script_root>[/<provider>]/<agent>` and the operation is argv[1].
    Script,
    /// Legacy agents taking positional parameters keyed "1".."N", with
    /// the operation appended last.
    Legacy,
    /// Service-bus backend managing units; no child process of ours.
    UnitBus,
    /// Service-bus backend managing jobs; no child process of ours.
    JobBus,
    /// Monitoring plugins invoked with `--key value` option pairs.
    Probe,
    /// A bare executable path with parameters passed as environment.
    Generic,
    /// The "service" alias: resolved to a concrete class at submission.
    Auto,
}

impl AgentClass {
    /// Parse the wire name of a class.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "script" => Some(Self::Script),
            "legacy" => Some(Self::Legacy),
            "unit" => Some(Self::UnitBus),
            "job" => Some(Self::JobBus),
            "probe" => Some(Self::Probe),
            "generic" => Some(Self::Generic),
            "service" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Legacy => "legacy",
            Self::UnitBus => "unit",
            Self::JobBus => "job",
            Self::Probe => "probe",
            Self::Generic => "generic",
            Self::Auto => "service",
        }
    }

    /// Whether submissions of this class must name a provider.
    pub fn requires_provider(self) -> bool {
        matches!(self, Self::Script)
    }

    /// Whether execution goes through a service bus rather than a child
    /// process we own.
    pub fn is_bus(self) -> bool {
        matches!(self, Self::UnitBus | Self::JobBus)
    }

    /// Whether `monitor` is spelled `status` in this class's agents.
    pub fn monitor_is_status(self) -> bool {
        matches!(self, Self::Script | Self::Legacy)
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Done,
    Cancelled,
    TimedOut,
    NotInstalled,
    NotConfigured,
    ErrorHard,
    Error,
    Pending,
}

impl ActionStatus {
    pub fn to_code(self) -> u32 {
        match self {
            Self::Done => 0,
            Self::Cancelled => 1,
            Self::TimedOut => 2,
            Self::NotInstalled => 3,
            Self::NotConfigured => 4,
            Self::ErrorHard => 5,
            Self::Error => 6,
            Self::Pending => 7,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Done,
            1 => Self::Cancelled,
            2 => Self::TimedOut,
            3 => Self::NotInstalled,
            4 => Self::NotConfigured,
            5 => Self::ErrorHard,
            7 => Self::Pending,
            _ => Self::Error,
        }
    }
}

/// One submission: an operation on a resource via a class/agent pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub rsc_id: String,
    pub class: AgentClass,
    pub provider: Option<String>,
    pub agent: String,
    pub operation: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub parameters: BTreeMap<String, String>,
}

impl ActionRequest {
    pub fn key(&self) -> OpKey {
        OpKey::new(&self.rsc_id, &self.operation, self.interval_ms)
    }

    /// Up-front sanity checks, performed before the class alias is
    /// expanded and before any table is touched. The resource name and
    /// operation are checked first, then the agent, then the provider
    /// for classes that need one.
    pub fn validate(&self) -> RoostResult<()> {
        if self.rsc_id.is_empty() {
            return Err(RoostError::MissingResource);
        }
        if self.operation.is_empty() {
            return Err(RoostError::MissingOperation);
        }
        if self.agent.is_empty() {
            return Err(RoostError::MissingAgent);
        }
        if self.class.requires_provider()
            && self.provider.as_deref().unwrap_or("").is_empty()
        {
            return Err(RoostError::MissingProvider);
        }
        Ok(())
    }
}

/// The outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    /// Agent-defined exit code; meaningful when status is `Done`.
    pub exit_code: i32,
    pub status: ActionStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ActionResult {
    pub fn with_status(status: ActionStatus) -> Self {
        Self {
            exit_code: -1,
            status,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn done(exit_code: i32) -> Self {
        Self {
            exit_code,
            status: ActionStatus::Done,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// How to actually run an action: a child process of ours, or a call into
/// a service-bus backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecSpec {
    Process {
        exec: PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Bus {
        class: AgentClass,
    },
}

/// Resolve the executable path for a script-like agent: absolute paths
/// are used as-is, otherwise the agent lives under the class root
/// (with a provider subdirectory when one is named).
fn agent_path(root: &std::path::Path, provider: Option<&str>, agent: &str) -> PathBuf {
    if agent.starts_with('/') {
        PathBuf::from(agent)
    } else {
        match provider {
            Some(p) if !p.is_empty() => root.join(p).join(agent),
            _ => root.join(agent),
        }
    }
}

/// Build the execution descriptor for a resolved (non-`Auto`) request.
pub fn build_exec_spec(roots: &AgentRoots, request: &ActionRequest) -> RoostResult<ExecSpec> {
    match request.class {
        AgentClass::Script => Ok(ExecSpec::Process {
            exec: agent_path(&roots.script_dir, request.provider.as_deref(), &request.agent),
            args: vec![request.operation.clone()],
            env: request.parameters.clone(),
        }),

        AgentClass::Legacy => {
            // Positional parameters keyed by their decimal position,
            // terminated by the operation name. Gaps are skipped.
            let mut args = Vec::new();
            for index in 1..=16u32 {
                if let Some(value) = request.parameters.get(&index.to_string()) {
                    args.push(value.clone());
                }
            }
            args.push(request.operation.clone());
            Ok(ExecSpec::Process {
                exec: agent_path(&roots.legacy_dir, None, &request.agent),
                args,
                env: BTreeMap::new(),
            })
        }

        AgentClass::UnitBus | AgentClass::JobBus => Ok(ExecSpec::Bus {
            class: request.class,
        }),

        AgentClass::Probe => {
            let mut args = Vec::new();
            if is_probe_version_check(&request.operation, request.interval_ms) {
                args.push("--version".to_string());
            } else {
                for (key, value) in &request.parameters {
                    if key.starts_with(META_PARAM_PREFIX) || key == "crm_feature_set" {
                        continue;
                    }
                    args.push(format!("--{}", key));
                    args.push(value.clone());
                }
            }
            Ok(ExecSpec::Process {
                exec: agent_path(&roots.probe_dir, None, &request.agent),
                args,
                env: BTreeMap::new(),
            })
        }

        AgentClass::Generic => Ok(ExecSpec::Process {
            exec: PathBuf::from(&request.agent),
            args: Vec::new(),
            env: request.parameters.clone(),
        }),

        AgentClass::Auto => Err(RoostError::MissingClass),
    }
}

/// A zero-interval monitor on a probe plugin is a version check, not a
/// real probe invocation.
fn is_probe_version_check(operation: &str, interval_ms: u64) -> bool {
    operation == "monitor" && interval_ms == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn roots() -> AgentRoots {
        AgentRoots {
            script_dir: PathBuf::from("/usr/lib/roost/resource.d"),
            legacy_dir: PathBuf::from("/usr/lib/roost/legacy.d"),
            probe_dir: PathBuf::from("/usr/lib/roost/probes"),
        }
    }

    fn request(class: AgentClass, agent: &str, operation: &str) -> ActionRequest {
        ActionRequest {
            rsc_id: "db".into(),
            class,
            provider: None,
            agent: agent.into(),
            operation: operation.into(),
            interval_ms: 0,
            timeout_ms: 20_000,
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn test_class_wire_names_round_trip() {
        for class in [
            AgentClass::Script,
            AgentClass::Legacy,
            AgentClass::UnitBus,
            AgentClass::JobBus,
            AgentClass::Probe,
            AgentClass::Generic,
            AgentClass::Auto,
        ] {
            assert_eq!(AgentClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(AgentClass::parse("bogus"), None);
    }

    #[test]
    fn test_validation_order() {
        let mut req = request(AgentClass::Script, "pgsql", "start");
        req.rsc_id = String::new();
        assert_eq!(req.validate(), Err(RoostError::MissingResource));

        // With both operation and agent missing, the operation check
        // comes first
        let mut req = request(AgentClass::Script, "", "");
        assert_eq!(req.validate(), Err(RoostError::MissingOperation));

        req.operation = "start".into();
        assert_eq!(req.validate(), Err(RoostError::MissingAgent));

        req.agent = "pgsql".into();
        assert_eq!(req.validate(), Err(RoostError::MissingProvider));

        req.provider = Some("heartbeat".into());
        assert_eq!(req.validate(), Ok(()));

        // Only the script class needs a provider
        let req = request(AgentClass::Generic, "/bin/true", "start");
        assert_eq!(req.validate(), Ok(()));
    }

    #[test]
    fn test_script_spec_uses_provider_subdir() {
        let mut req = request(AgentClass::Script, "pgsql", "start");
        req.provider = Some("heartbeat".into());
        req.parameters.insert("pgdata".into(), "/var/lib/pg".into());

        match build_exec_spec(&roots(), &req).unwrap() {
            ExecSpec::Process { exec, args, env } => {
                assert_eq!(exec, Path::new("/usr/lib/roost/resource.d/heartbeat/pgsql"));
                assert_eq!(args, vec!["start"]);
                assert_eq!(env.get("pgdata").map(String::as_str), Some("/var/lib/pg"));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_absolute_agent_path_wins() {
        let req = request(AgentClass::Script, "/opt/agents/pgsql", "stop");
        match build_exec_spec(&roots(), &req).unwrap() {
            ExecSpec::Process { exec, .. } => {
                assert_eq!(exec, Path::new("/opt/agents/pgsql"));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_legacy_positional_args_skip_gaps() {
        let mut req = request(AgentClass::Legacy, "drbd", "start");
        req.parameters.insert("1".into(), "r0".into());
        req.parameters.insert("3".into(), "ignored-gap-follows".into());

        match build_exec_spec(&roots(), &req).unwrap() {
            ExecSpec::Process { args, env, .. } => {
                assert_eq!(args, vec!["r0", "ignored-gap-follows", "start"]);
                assert!(env.is_empty());
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_probe_version_check() {
        let req = request(AgentClass::Probe, "check_http", "monitor");
        match build_exec_spec(&roots(), &req).unwrap() {
            ExecSpec::Process { args, .. } => assert_eq!(args, vec!["--version"]),
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_probe_option_pairs_skip_meta() {
        let mut req = request(AgentClass::Probe, "check_http", "monitor");
        req.interval_ms = 10_000;
        req.parameters.insert("hostname".into(), "db1".into());
        req.parameters.insert("CRM_meta_timeout".into(), "20000".into());

        match build_exec_spec(&roots(), &req).unwrap() {
            ExecSpec::Process { args, .. } => {
                assert_eq!(args, vec!["--hostname", "db1"]);
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[test]
    fn test_bus_classes_have_no_process() {
        let req = request(AgentClass::UnitBus, "postgresql.service", "start");
        assert_eq!(
            build_exec_spec(&roots(), &req).unwrap(),
            ExecSpec::Bus {
                class: AgentClass::UnitBus
            }
        );
    }

    #[test]
    fn test_auto_must_be_resolved_first() {
        let req = request(AgentClass::Auto, "foo", "start");
        assert_eq!(
            build_exec_spec(&roots(), &req),
            Err(RoostError::MissingClass)
        );
    }
}

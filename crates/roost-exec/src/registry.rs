//! Agent discovery: where the script-like agents live on disk, which
//! service-bus backends are available, and the resolution of the
//! "service" class alias.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::action::{ActionResult, AgentClass};

/// On-disk roots for the script-like agent classes.
#[derive(Debug, Clone)]
pub struct AgentRoots {
    pub script_dir: PathBuf,
    pub legacy_dir: PathBuf,
    pub probe_dir: PathBuf,
}

impl Default for AgentRoots {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from("/usr/lib/roost/resource.d"),
            legacy_dir: PathBuf::from("/usr/lib/roost/legacy.d"),
            probe_dir: PathBuf::from("/usr/lib/roost/probes"),
        }
    }
}

/// A service-bus backend (unit or job manager).
///
/// Bus operations run outside our process tree: we can ask the bus to
/// start/stop/monitor an agent and await the outcome, but we cannot kill
/// an in-flight call, which is why cancellation of bus actions is
/// best-effort only.
#[async_trait]
pub trait ServiceBus: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Whether the bus knows the named agent. This is a remote round
    /// trip, which is why alias resolution tries the filesystem first.
    async fn has_agent(&self, agent: &str) -> bool;

    /// Run one operation to completion.
    async fn exec(
        &self,
        agent: &str,
        operation: &str,
        parameters: &BTreeMap<String, String>,
    ) -> ActionResult;
}

/// In-process service bus with a fixed agent table, used in single-node
/// mode and by the tests. Each known agent maps to the exit code its
/// operations report, after an optional artificial delay.
pub struct StaticBus {
    name: String,
    agents: BTreeMap<String, i32>,
    delay: Duration,
}

impl StaticBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            agents: BTreeMap::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_agent(mut self, agent: &str, exit_code: i32) -> Self {
        self.agents.insert(agent.to_string(), exit_code);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ServiceBus for StaticBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has_agent(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    async fn exec(
        &self,
        agent: &str,
        operation: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> ActionResult {
        if self.delay > Duration::ZERO {
            sleep(self.delay).await;
        }
        match self.agents.get(agent) {
            Some(&exit_code) => {
                debug!("bus {} ran {} {} -> {}", self.name, agent, operation, exit_code);
                let mut result = ActionResult::done(exit_code);
                result.elapsed = self.delay;
                result
            }
            None => ActionResult::with_status(crate::action::ActionStatus::NotInstalled),
        }
    }
}

/// Everything needed to resolve and execute agents.
#[derive(Clone)]
pub struct Registry {
    pub roots: AgentRoots,
    pub unit_bus: Option<Arc<dyn ServiceBus>>,
    pub job_bus: Option<Arc<dyn ServiceBus>>,
}

impl Registry {
    pub fn new(roots: AgentRoots) -> Self {
        Self {
            roots,
            unit_bus: None,
            job_bus: None,
        }
    }

    pub fn with_unit_bus(mut self, bus: Arc<dyn ServiceBus>) -> Self {
        self.unit_bus = Some(bus);
        self
    }

    pub fn with_job_bus(mut self, bus: Arc<dyn ServiceBus>) -> Self {
        self.job_bus = Some(bus);
        self
    }

    pub fn bus_for(&self, class: AgentClass) -> Option<Arc<dyn ServiceBus>> {
        match class {
            AgentClass::UnitBus => self.unit_bus.clone(),
            AgentClass::JobBus => self.job_bus.clone(),
            _ => None,
        }
    }

    /// Resolve the "service" alias to a concrete class.
    ///
    /// The filesystem check comes first because it is cheap; the bus
    /// checks need a round trip. When nothing advertises the agent, the
    /// script class is assumed.
    pub async fn resolve_auto(&self, agent: &str) -> AgentClass {
        let script_path = if agent.starts_with('/') {
            PathBuf::from(agent)
        } else {
            self.roots.script_dir.join(agent)
        };
        if script_path.is_file() {
            debug!("found script agent {} for alias", agent);
            return AgentClass::Script;
        }

        if let Some(bus) = &self.unit_bus {
            if bus.has_agent(agent).await {
                debug!("found {} agent {} for alias", bus.name(), agent);
                return AgentClass::UnitBus;
            }
        }
        if let Some(bus) = &self.job_bus {
            if bus.has_agent(agent).await {
                debug!("found {} agent {} for alias", bus.name(), agent);
                return AgentClass::JobBus;
            }
        }

        info!("assuming script class for agent {}", agent);
        AgentClass::Script
    }
}

//! Process definition aggregate.
//!
//! A definition is an immutable, versioned DAG of steps. Drafts are mutable;
//! publishing validates the graph and freezes it. New behavior ships as a new
//! version, never as an edit to a published definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult, ErrorKind};

/// Lifecycle status of a process definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Editable, not yet runnable.
    Draft,
    /// Frozen and runnable.
    Published,
    /// Retired; existing executions finish, new triggers are rejected.
    Archived,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Semantic major.minor version of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn initial() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn next_minor(&self) -> Self {
        Self { major: self.major, minor: self.minor + 1 }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How an execution of this process may be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Manual,
    Schedule { cron: String, timezone: String },
    Webhook,
}

/// Priority band used when this process's agent tasks queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Default for QueuePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl QueuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Sensitivity label carried into audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Default for DataClassification {
    fn default() -> Self {
        Self::Internal
    }
}

impl DataClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

/// How the execution's final output is assembled.
///
/// When absent, the output of the last completed step in definition order
/// is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Substitution template rendered against the finished execution context.
    pub template: String,
}

/// What to do when a step exhausts its retries (or fails outright).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Step failure fails the execution.
    Fail,
    /// Step is marked skipped; downstream continues.
    SkipStep,
}

impl Default for OnError {
    fn default() -> Self {
        Self::Fail
    }
}

/// Backoff curve between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Declarative retry behavior for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// When non-empty, only these kinds are retried.
    #[serde(default)]
    pub retryable_kinds: Vec<ErrorKind>,
    /// These kinds are never retried, regardless of the list above.
    #[serde(default)]
    pub non_retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_kinds: Vec::new(),
            non_retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt number (1 = first retry), capped at
    /// `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let attempt = attempt.max(1);
        let base = self.initial_delay_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let shift = (attempt - 1).min(32);
                base.saturating_mul(1u64 << shift)
            }
        };
        std::time::Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Whether a failure of `kind` after `attempts_used` attempts warrants
    /// another try.
    pub fn should_retry(&self, kind: ErrorKind, attempts_used: u32) -> bool {
        if attempts_used >= self.max_attempts {
            return false;
        }
        if self.non_retryable_kinds.contains(&kind) {
            return false;
        }
        if !self.retryable_kinds.is_empty() {
            return self.retryable_kinds.contains(&kind);
        }
        kind.is_transient() || kind == ErrorKind::QueueFull
    }
}

/// What to do when an approval deadline passes without a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    Reject,
    Skip,
}

/// Routing semantics of a gateway step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    /// First route whose condition holds; falls back to the default route.
    Exclusive,
    /// Every route.
    Parallel,
    /// Every route whose condition holds; default if none do.
    Inclusive,
}

/// One outgoing route of a gateway. A `condition` of `None` marks the
/// default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub target_step: String,
}

/// What a timer step waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerWait {
    /// Relative wait.
    Duration { seconds: u64 },
    /// Absolute resume instant, as an expression rendered at dispatch time.
    Until { expression: String, timezone: String },
}

/// Kind discriminator for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AgentTask,
    HumanApproval,
    Gateway,
    Timer,
    Notification,
    SubProcess,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentTask => "agent_task",
            Self::HumanApproval => "human_approval",
            Self::Gateway => "gateway",
            Self::Timer => "timer",
            Self::Notification => "notification",
            Self::SubProcess => "sub_process",
        }
    }

    /// Whether a crashed dispatch of this kind can be repeated without
    /// charging a retry. Agent tasks and notifications have external side
    /// effects; the rest are pure bookkeeping.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::AgentTask | Self::Notification)
    }
}

fn default_agent_timeout_secs() -> u64 {
    300
}

/// Kind-specific configuration of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    AgentTask {
        agent: String,
        /// Substitution template for the message sent to the agent.
        message: String,
        #[serde(default = "default_agent_timeout_secs")]
        timeout_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        #[serde(default)]
        on_error: OnError,
    },
    HumanApproval {
        approvers: Vec<String>,
        timeout_secs: u64,
        on_timeout: TimeoutAction,
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Treat an explicit rejection as a step failure instead of a
        /// completed step carrying `decision = "rejected"`.
        #[serde(default)]
        fail_on_reject: bool,
    },
    Gateway {
        gateway_type: GatewayType,
        routes: Vec<GatewayRoute>,
    },
    Timer {
        wait: TimerWait,
    },
    Notification {
        channels: Vec<String>,
        message: String,
        #[serde(default)]
        recipients: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        #[serde(default)]
        on_error: OnError,
    },
    SubProcess {
        process: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<Version>,
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        #[serde(default)]
        output_mapping: HashMap<String, String>,
        #[serde(default)]
        on_error: OnError,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::AgentTask { .. } => StepKind::AgentTask,
            Self::HumanApproval { .. } => StepKind::HumanApproval,
            Self::Gateway { .. } => StepKind::Gateway,
            Self::Timer { .. } => StepKind::Timer,
            Self::Notification { .. } => StepKind::Notification,
            Self::SubProcess { .. } => StepKind::SubProcess,
        }
    }

    /// Retry policy, where the kind supports one.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            Self::AgentTask { retry, .. } | Self::Notification { retry, .. } => retry.as_ref(),
            _ => None,
        }
    }

    /// Failure tolerance of this step.
    pub fn on_error(&self) -> OnError {
        match self {
            Self::AgentTask { on_error, .. }
            | Self::Notification { on_error, .. }
            | Self::SubProcess { on_error, .. } => *on_error,
            _ => OnError::Fail,
        }
    }
}

/// One node of the process DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    /// Predecessor step ids.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Boolean guard evaluated once dependencies complete; false skips the
    /// step without dispatching it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Agents kept informed of this step's events without participating.
    #[serde(default)]
    pub informed_agents: Vec<String>,
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }
}

/// Immutable, versioned process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: Version,
    pub status: DefinitionStatus,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
    pub owner_team: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Per-process cap on simultaneously running executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_instances: Option<u32>,
    #[serde(default)]
    pub priority: QueuePriority,
    /// Cap on cumulative execution cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub data_classification: DataClassification,
}

impl ProcessDefinition {
    /// Create a fresh draft.
    pub fn new_draft(
        name: impl Into<String>,
        owner_team: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: Version::initial(),
            status: DefinitionStatus::Draft,
            steps: Vec::new(),
            triggers: vec![TriggerSpec::Manual],
            output: None,
            owner_team: owner_team.into(),
            created_by: created_by.into(),
            created_at: Utc::now(),
            published_at: None,
            max_concurrent_instances: None,
            priority: QueuePriority::default(),
            max_cost: None,
            data_classification: DataClassification::default(),
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps with no dependencies.
    pub fn entry_steps(&self) -> Vec<&StepDefinition> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Whether this definition declares a trigger of the given shape.
    pub fn has_webhook_trigger(&self) -> bool {
        self.triggers.iter().any(|t| matches!(t, TriggerSpec::Webhook))
    }

    /// Replace the step graph on a draft.
    pub fn set_steps(&mut self, steps: Vec<StepDefinition>) -> EngineResult<()> {
        if self.status != DefinitionStatus::Draft {
            return Err(EngineError::StateConflict(format!(
                "definition {} is {}, only drafts can be edited",
                self.name,
                self.status.as_str()
            )));
        }
        self.steps = steps;
        Ok(())
    }

    /// Validate the structural invariants enforced at publish time.
    pub fn validate(&self) -> EngineResult<()> {
        if self.steps.is_empty() {
            return Err(EngineError::Validation("definition has no steps".into()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::Validation("step id cannot be empty".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }

            if let StepConfig::Gateway { routes, .. } = &step.config {
                if routes.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "gateway {} has no routes",
                        step.id
                    )));
                }
                for route in routes {
                    if !ids.contains(route.target_step.as_str()) {
                        return Err(EngineError::Validation(format!(
                            "gateway {} routes to unknown step {}",
                            step.id, route.target_step
                        )));
                    }
                }
            }

            if let StepConfig::HumanApproval { approvers, .. } = &step.config {
                if approvers.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "approval step {} has no approvers",
                        step.id
                    )));
                }
            }
        }

        if self.entry_steps().is_empty() {
            return Err(EngineError::Validation(
                "definition has no entry step (every step has dependencies)".into(),
            ));
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(EngineError::Validation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        Ok(())
    }

    /// DFS cycle detection over `depends_on` edges. Returns the cycle path.
    fn find_cycle(&self) -> Option<Vec<String>> {
        fn visit<'a>(
            node: &'a str,
            graph: &HashMap<&'a str, Vec<&'a str>>,
            visited: &mut HashSet<&'a str>,
            stack: &mut HashSet<&'a str>,
            path: &mut Vec<&'a str>,
        ) -> bool {
            visited.insert(node);
            stack.insert(node);
            path.push(node);

            if let Some(deps) = graph.get(node) {
                for &dep in deps {
                    if !visited.contains(dep) {
                        if visit(dep, graph, visited, stack, path) {
                            return true;
                        }
                    } else if stack.contains(dep) {
                        if let Some(start) = path.iter().position(|&n| n == dep) {
                            path.drain(0..start);
                        }
                        return true;
                    }
                }
            }

            stack.remove(node);
            path.pop();
            false
        }

        let graph: HashMap<&str, Vec<&str>> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
            .collect();

        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();

        for step in &self.steps {
            if !visited.contains(step.id.as_str())
                && visit(step.id.as_str(), &graph, &mut visited, &mut stack, &mut path)
            {
                return Some(path.into_iter().map(String::from).collect());
            }
        }
        None
    }

    /// Publish a draft, running publish-time validation.
    pub fn publish(&mut self) -> EngineResult<()> {
        match self.status {
            DefinitionStatus::Draft => {}
            DefinitionStatus::Published => {
                return Err(EngineError::StateConflict(format!(
                    "definition {} v{} is already published",
                    self.name, self.version
                )))
            }
            DefinitionStatus::Archived => {
                return Err(EngineError::StateConflict(format!(
                    "definition {} v{} is archived",
                    self.name, self.version
                )))
            }
        }
        self.validate()?;
        self.status = DefinitionStatus::Published;
        self.published_at = Some(Utc::now());
        Ok(())
    }

    /// Archive a published definition.
    pub fn archive(&mut self) -> EngineResult<()> {
        if self.status != DefinitionStatus::Published {
            return Err(EngineError::StateConflict(format!(
                "only published definitions can be archived, {} is {}",
                self.name,
                self.status.as_str()
            )));
        }
        self.status = DefinitionStatus::Archived;
        Ok(())
    }

    /// Create the next draft version from this definition.
    pub fn next_version_draft(&self, created_by: impl Into<String>) -> Self {
        let mut draft = self.clone();
        draft.id = Uuid::new_v4();
        draft.version = self.version.next_minor();
        draft.status = DefinitionStatus::Draft;
        draft.created_by = created_by.into();
        draft.created_at = Utc::now();
        draft.published_at = None;
        draft
    }
}

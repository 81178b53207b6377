use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Model name under which trigger definitions are published as data events.
pub const TRIGGER_MODEL: &str = "WorkflowTrigger";

/// Upper bound for a single `Wait` action (ten years).
const MAX_WAIT_SECONDS: i64 = 10 * 366 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl User {
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            name: None,
        }
    }
}

// ===== Workflow graph =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub start_step: Option<Uuid>,
    /// User whose identity data actions run under when no event user exists
    #[serde(default)]
    pub owner: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: Uuid,
    #[serde(rename = "workflow")]
    pub workflow_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub actions: Vec<Uuid>,
    #[serde(default)]
    pub conditions: Option<Value>,
    #[serde(default)]
    pub on_success_step: Option<Uuid>,
    #[serde(default)]
    pub on_failure_step: Option<Uuid>,
    #[serde(default)]
    pub is_terminal: bool,
}

impl WorkflowStep {
    /// Step taken after every action succeeded, `None` when the path ends here.
    pub fn success_edge(&self) -> Option<Uuid> {
        if self.is_terminal {
            None
        } else {
            self.on_success_step
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAction {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl WorkflowAction {
    pub fn new(name: &str, kind: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
        }
    }
}

/// Closed set of action kinds, tagged by `type` in the stored definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    Webhook(WebhookAction),
    CreateData(CreateDataAction),
    UpdateData(UpdateDataAction),
    DeleteData(DeleteDataAction),
    #[serde(rename = "GenerateAIContent")]
    GenerateAiContent(GenerateAiContentAction),
    SendEmail(SendEmailAction),
    ExecuteScript(ExecuteScriptAction),
    Wait(WaitAction),
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Webhook(_) => "Webhook",
            Self::CreateData(_) => "CreateData",
            Self::UpdateData(_) => "UpdateData",
            Self::DeleteData(_) => "DeleteData",
            Self::GenerateAiContent(_) => "GenerateAIContent",
            Self::SendEmail(_) => "SendEmail",
            Self::ExecuteScript(_) => "ExecuteScript",
            Self::Wait(_) => "Wait",
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAction {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDataAction {
    pub target_model: String,
    pub data_to_create: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDataAction {
    pub target_model: String,
    pub target_selector: Value,
    pub fields_to_update: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDataAction {
    pub target_model: String,
    pub target_selector: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAiContentAction {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailAction {
    /// Comma or semicolon separated recipients, templated
    pub to: String,
    #[serde(default)]
    pub cc: Option<String>,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub is_html: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteScriptAction {
    pub script: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitAction {
    pub duration: u64,
    #[serde(default)]
    pub duration_unit: DurationUnit,
}

impl WaitAction {
    pub fn as_duration(&self) -> Duration {
        let amount = i64::try_from(self.duration).unwrap_or(i64::MAX);
        let seconds = amount
            .saturating_mul(self.duration_unit.seconds())
            .min(MAX_WAIT_SECONDS);
        Duration::seconds(seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn seconds(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 60 * 60,
            Self::Days => 24 * 60 * 60,
        }
    }
}

// ===== Triggers and events =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventKind {
    DataAdded,
    DataEdited,
    DataDeleted,
    ModelAdded,
    ModelEdited,
    ModelDeleted,
}

impl DataEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataAdded => "DataAdded",
            Self::DataEdited => "DataEdited",
            Self::DataDeleted => "DataDeleted",
            Self::ModelAdded => "ModelAdded",
            Self::ModelEdited => "ModelEdited",
            Self::ModelDeleted => "ModelDeleted",
        }
    }
}

impl fmt::Display for DataEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DataAdded" => Ok(Self::DataAdded),
            "DataEdited" => Ok(Self::DataEdited),
            "DataDeleted" => Ok(Self::DataDeleted),
            "ModelAdded" => Ok(Self::ModelAdded),
            "ModelEdited" => Ok(Self::ModelEdited),
            "ModelDeleted" => Ok(Self::ModelDeleted),
            other => Err(format!("unknown data event kind `{}`", other)),
        }
    }
}

/// A successful mutation reported by the data layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    pub kind: DataEventKind,
    pub model: String,
    pub document: Value,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl DataEvent {
    pub fn new(kind: DataEventKind, model: &str, document: Value, user: Option<User>) -> Self {
        Self {
            kind,
            model: model.to_string(),
            document,
            user,
            occurred_at: Utc::now(),
        }
    }

    /// Identifier of the mutated document, read from `_id` or `id`.
    pub fn document_id(&self) -> Option<Uuid> {
        ["_id", "id"]
            .iter()
            .filter_map(|key| self.document.get(*key))
            .filter_map(Value::as_str)
            .find_map(|raw| Uuid::parse_str(raw).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub target_model: Option<String>,
    #[serde(default)]
    pub on_event: Option<DataEventKind>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub data_filter: Option<Value>,
    #[serde(rename = "workflow")]
    pub workflow_id: Uuid,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub lock_duration_minutes: Option<u32>,
}

impl WorkflowTrigger {
    pub fn is_scheduled(&self) -> bool {
        self.cron_expression
            .as_deref()
            .is_some_and(|expr| !expr.trim().is_empty())
    }

    /// Lock key serializing cron ticks of this trigger across processes.
    pub fn job_id(&self) -> String {
        format!("workflowTrigger_{}", self.id)
    }
}

// ===== Runs =====

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "workflow_run_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: Uuid,
    #[serde(rename = "workflow")]
    pub workflow_id: Uuid,
    #[serde(default)]
    pub trigger_id: Option<Uuid>,
    pub status: RunStatus,
    pub context_data: Value,
    pub current_step: Option<Uuid>,
    pub error: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub step_executions_count: HashMap<Uuid, u32>,
    #[serde(default)]
    pub run_as: Option<User>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Token of the driver that last claimed the run. Writes carrying an
    /// older token are rejected.
    #[serde(default, skip_serializing)]
    pub lease: Option<Uuid>,
}

impl WorkflowRun {
    /// A pending run positioned at the workflow's start step.
    pub fn pending(
        workflow: &Workflow,
        trigger_id: Option<Uuid>,
        context_data: Value,
        run_as: Option<User>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            trigger_id,
            status: RunStatus::Pending,
            context_data,
            current_step: workflow.start_step,
            error: None,
            resume_at: None,
            step_executions_count: HashMap::new(),
            run_as,
            started_at: now,
            completed_at: None,
            updated_at: now,
            lease: None,
        }
    }

    pub fn executions_of(&self, step_id: Uuid) -> u32 {
        self.step_executions_count
            .get(&step_id)
            .copied()
            .unwrap_or(0)
    }
}

// ===== Job lock =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLock {
    pub job_id: String,
    pub locked_until: DateTime<Utc>,
    /// Token of the acquisition that owns the row
    pub holder: Uuid,
}

impl JobLock {
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until > now
    }
}

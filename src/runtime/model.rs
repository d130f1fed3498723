use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Insertion-ordered variable map (serde_json is built with `preserve_order`).
pub type Variables = serde_json::Map<String, Value>;

/// Optimistic-lock revision. `0` means "not persisted yet".
pub type Revision = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    Execution,
    Task,
    Job,
    Subscription,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Execution,
        RecordKind::Task,
        RecordKind::Job,
        RecordKind::Subscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Execution => "execution",
            RecordKind::Task => "task",
            RecordKind::Job => "job",
            RecordKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub id: Uuid,
}

impl RecordKey {
    pub fn new(kind: RecordKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// 执行树节点 (Token)
/// One node of the live execution tree. The root is the process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub definition_id: String,
    /// Set on the process instance only.
    pub business_key: Option<String>,
    pub activity_id: Option<String>,
    pub is_active: bool,
    /// Scope executions own variables and boundary-event subscriptions.
    pub is_scope: bool,
    pub is_concurrent: bool,
    /// Activity that created this scope execution (sub-process or activity with boundary events).
    pub scope_activity: Option<String>,
    pub variables: Variables,
    pub started_at: DateTime<Utc>,
}

impl Execution {
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A variable as seen from one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    pub name: String,
    pub value: Value,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Assigned,
    Completed,
    Cancelled,
}

/// Human task. Also used as the snapshot handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub status: TaskStatus,
    pub priority: i32,
    pub form_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub execution_id: Option<Uuid>,
    pub process_instance_id: Option<Uuid>,
    pub process_definition_id: Option<String>,
    pub task_definition_key: Option<String>,
    pub parent_task_id: Option<Uuid>,
}

pub type TaskSnapshot = Task;

/// What a job resumes when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobHandler {
    /// Execute the activity the execution is parked at.
    AsyncContinuation,
    /// Fire an intermediate timer catch event.
    TimerCatch,
    /// Fire a timer boundary event attached to the execution's activity.
    TimerBoundary { boundary: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Scheduled,
    Locked,
    /// Retries exhausted. Kept for inspection, never acquired again.
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub handler: JobHandler,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    pub activity_id: String,
    pub state: JobState,
    pub due_at: DateTime<Utc>,
    pub retries: u32,
    /// Retries the job started with, or was reset to. Drives the backoff.
    #[serde(default)]
    pub initial_retries: u32,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub exception_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Due, not dead, and either unlocked or holding a lock that has expired.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Dead => false,
            JobState::Scheduled => self.due_at <= now,
            JobState::Locked => {
                self.due_at <= now && self.lock_expires_at.map_or(true, |expiry| expiry <= now)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Signal,
    Message,
    Error,
    Compensate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub event_type: EventType,
    /// Signal/message name, error code (empty = catch all) or compensated activity id.
    pub event_name: String,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,
    /// The catching node: boundary event or intermediate catch event.
    pub activity_id: String,
    /// Compensation handler activity for `Compensate` subscriptions.
    pub configuration: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the record store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Execution(Execution),
    Task(Task),
    Job(Job),
    Subscription(EventSubscription),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Execution(_) => RecordKind::Execution,
            Record::Task(_) => RecordKind::Task,
            Record::Job(_) => RecordKind::Job,
            Record::Subscription(_) => RecordKind::Subscription,
        }
    }

    pub fn key(&self) -> RecordKey {
        let id = match self {
            Record::Execution(e) => e.id,
            Record::Task(t) => t.id,
            Record::Job(j) => j.id,
            Record::Subscription(s) => s.id,
        };
        RecordKey::new(self.kind(), id)
    }

    /// Standalone tasks belong to no process instance.
    pub fn process_instance_id(&self) -> Option<Uuid> {
        match self {
            Record::Execution(e) => Some(e.process_instance_id),
            Record::Task(t) => t.process_instance_id,
            Record::Job(j) => Some(j.process_instance_id),
            Record::Subscription(s) => Some(s.process_instance_id),
        }
    }
}

/// Typed access to one [`Record`] variant.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: RecordKind;
    const NAME: &'static str;

    fn id(&self) -> Uuid;
    fn into_record(self) -> Record;
    fn from_record(record: &Record) -> Option<&Self>;
}

macro_rules! entity {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl Entity for $ty {
            const KIND: RecordKind = RecordKind::$variant;
            const NAME: &'static str = $name;

            fn id(&self) -> Uuid {
                self.id
            }

            fn into_record(self) -> Record {
                Record::$variant(self)
            }

            fn from_record(record: &Record) -> Option<&Self> {
                match record {
                    Record::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

entity!(Execution, Execution, "execution");
entity!(Task, Task, "task");
entity!(Job, Job, "job");
entity!(EventSubscription, Subscription, "event subscription");

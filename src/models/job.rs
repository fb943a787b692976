use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IndexCatalog,
    Acquire,
    Process,
    Export,
    Enroll,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IndexCatalog => "index_catalog",
            JobKind::Acquire => "acquire",
            JobKind::Process => "process",
            JobKind::Export => "export",
            JobKind::Enroll => "enroll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "index_catalog" => Some(JobKind::IndexCatalog),
            "acquire" => Some(JobKind::Acquire),
            "process" => Some(JobKind::Process),
            "export" => Some(JobKind::Export),
            "enroll" => Some(JobKind::Enroll),
            _ => None,
        }
    }

    /// Kinds that write to the index and therefore need the indexer lease.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, JobKind::Export)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub detail: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

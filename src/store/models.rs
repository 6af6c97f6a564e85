use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed_with_warnings",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithWarnings | Self::Failed
        )
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_warnings" => Ok(Self::CompletedWithWarnings),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Condensed validation outcome stored on the build record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub errors: usize,
    pub warnings: usize,
    pub suggestions: usize,
    pub errors_fixed: usize,
    pub is_clean: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
    pub status: BuildStatus,
    pub phase: String,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub validation_summary: Option<ValidationSummary>,
    pub created_at: String,
}

/// Raw row used to decode a build before JSON/enum fields are parsed.
pub(crate) struct BuildRow {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
    pub status: String,
    pub phase: String,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub validation_summary: Option<String>,
    pub created_at: String,
}

impl BuildRow {
    pub fn into_build(self) -> anyhow::Result<Build> {
        let status = BuildStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        let validation_summary = match self.validation_summary {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(Build {
            id: self.id,
            project_id: self.project_id,
            user_id: self.user_id,
            prompt: self.prompt,
            model: self.model,
            status,
            phase: self.phase,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
            validation_summary,
            created_at: self.created_at,
        })
    }
}

/// Fields needed to create (or re-run) a build at admission time.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
}

/// Result of the atomic admission write.
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// A fresh build row was created.
    Created(Build),
    /// A terminal build with the same id was reset to `queued` for a re-run.
    Reset(Build),
    /// A non-terminal build with the same id already exists (async re-enqueue).
    Pending(Build),
    AlreadyRunning,
    NotOwner,
    LimitReached { active: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub language: String,
}

impl GeneratedFile {
    pub fn new(path: &str, content: &str, language: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
            language: language.to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        self.path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("")
    }
}

/// Map a file extension to the language tag used in fenced blocks.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "tsx" => "tsx",
        "ts" | "mts" | "cts" => "typescript",
        "jsx" => "jsx",
        "js" | "mjs" | "cjs" => "javascript",
        "json" => "json",
        "css" => "css",
        "scss" => "scss",
        "html" | "htm" => "html",
        "md" | "mdx" => "markdown",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        _ => "text",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: i64,
    pub provider: ProviderKind,
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub position: i64,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

impl ProviderKey {
    /// A key is selectable once its cooldown has passed.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.rate_limited_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Short, non-reversible identifier safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret.as_bytes());
        format!("{:x}", digest)[..12].to_string()
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Everything a worker needs to run a build without the admitting request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub build_id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
    /// Id of the provider key selected at admission.
    pub credential_id: i64,
    pub provider: ProviderKind,
    #[serde(default)]
    pub context: Vec<GeneratedFile>,
    #[serde(default)]
    pub strict_mode: bool,
    pub max_fix_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub progress: u8,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub lease: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created,
    /// Existing waiting job had its payload replaced.
    Updated,
    /// Job is currently claimed; nothing changed.
    AlreadyActive,
    /// Finished job was reset to waiting for a re-run.
    Requeued,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Status query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusView {
    pub status: BuildStatus,
    pub phase: String,
    pub progress: u8,
    pub files_count: usize,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub user_active_builds: u32,
    pub avg_duration_ms: Option<f64>,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub build_id: Option<String>,
    pub user_id: Option<String>,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_round_trips_through_str() {
        for status in [
            BuildStatus::Queued,
            BuildStatus::Running,
            BuildStatus::Completed,
            BuildStatus::CompletedWithWarnings,
            BuildStatus::Failed,
        ] {
            assert_eq!(BuildStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(BuildStatus::from_str("paused").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Completed.is_terminal());
        assert!(BuildStatus::CompletedWithWarnings.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }

    #[test]
    fn key_availability_respects_cooldown() {
        let now = Utc::now();
        let mut key = ProviderKey {
            id: 1,
            provider: ProviderKind::Anthropic,
            secret: "sk-test".into(),
            position: 0,
            rate_limited_until: Some(now + chrono::Duration::seconds(30)),
            failure_count: 0,
        };
        assert!(!key.is_available(now));
        assert!(key.is_available(now + chrono::Duration::seconds(31)));
        key.rate_limited_until = None;
        assert!(key.is_available(now));
    }

    #[test]
    fn key_fingerprint_hides_secret() {
        let key = ProviderKey {
            id: 1,
            provider: ProviderKind::OpenAi,
            secret: "sk-very-secret".into(),
            position: 0,
            rate_limited_until: None,
            failure_count: 0,
        };
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 12);
        assert!(!fp.contains("secret"));
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("sk-very-secret"));
    }

    #[test]
    fn language_inferred_from_extension() {
        assert_eq!(language_for_path("src/App.tsx"), "tsx");
        assert_eq!(language_for_path("package.json"), "json");
        assert_eq!(language_for_path("styles/site.CSS"), "css");
        assert_eq!(language_for_path("Makefile"), "text");
    }

    #[test]
    fn job_payload_uses_camel_case() {
        let payload = JobPayload {
            build_id: "b1".into(),
            project_id: "p1".into(),
            user_id: "u1".into(),
            prompt: "hi".into(),
            model: "m".into(),
            credential_id: 7,
            provider: ProviderKind::Anthropic,
            context: vec![],
            strict_mode: false,
            max_fix_iterations: 2,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["buildId"], "b1");
        assert_eq!(value["credentialId"], 7);
        assert_eq!(value["provider"], "anthropic");
    }
}

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

/// Number of lowercase hex characters kept from the SHA-256 digest when
/// addressing external sources. 48 bits is an accepted collision risk at the
/// expected corpus scale; widen before porting to a much larger volume.
pub const EXTERNAL_HASH_LEN: usize = 12;

/// Payload keys under which collaborator tools return citable records.
pub const TOOL_RESULT_RECORD_KEYS: [&str; 5] =
    ["notes", "appointments", "medical_histories", "examinations", "lab_results"];

static NUMERIC_MARKER: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"\[\d+\]"));
static SOURCES_SECTION: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?s)\*\*Sources:\*\*\n(.*?)(?:\n\n|$)"));
static SOURCE_LINE: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"^\[(\d+)\]\s+(.+)$"));
static HASH_MARKER: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"\[([0-9a-f]{12})\]"));

fn compile_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid built-in regex {pattern}: {err}"))
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReferenceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl ReferenceError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::InvalidInput(_) => 400,
            Self::Unexpected(_) => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    Notes,
    Appointments,
    Examinations,
    MedicalHistories,
    LabResults,
    Imaging,
    External,
}

impl ReferenceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::Appointments => "appointments",
            Self::Examinations => "examinations",
            Self::MedicalHistories => "medicalhistories",
            Self::LabResults => "labresults",
            Self::Imaging => "imaging",
            Self::External => "external",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "notes" => Some(Self::Notes),
            "appointments" => Some(Self::Appointments),
            "examinations" => Some(Self::Examinations),
            "medicalhistories" => Some(Self::MedicalHistories),
            "labresults" => Some(Self::LabResults),
            "imaging" => Some(Self::Imaging),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    /// Whether a loader is wired for this kind. `imaging` is a declared
    /// variant without one, and `external` resolution never dispatches here.
    #[must_use]
    pub fn is_resolvable_internal(self) -> bool {
        matches!(
            self,
            Self::Notes
                | Self::Appointments
                | Self::Examinations
                | Self::MedicalHistories
                | Self::LabResults
        )
    }
}

impl Display for ReferenceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stable citable identifier: either an external URL addressed by a
/// truncated content hash, or one row of an internal clinical-record table
/// addressed as `{type}_{internal_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub reference_id: String,
    pub reference_type: ReferenceType,
    pub internal_id: Option<String>,
    pub external_url: Option<String>,
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Reference {
    /// Validate the internal/external field exclusivity invariant.
    ///
    /// # Errors
    /// Returns [`ReferenceError::InvalidInput`] when the populated fields do
    /// not match the reference type.
    pub fn validate(&self) -> Result<(), ReferenceError> {
        if self.reference_id.trim().is_empty() {
            return Err(ReferenceError::InvalidInput(
                "reference_id MUST be non-empty".to_string(),
            ));
        }

        if self.reference_type == ReferenceType::External {
            if self.external_url.is_none() {
                return Err(ReferenceError::InvalidInput(
                    "external reference MUST carry external_url".to_string(),
                ));
            }
            if self.internal_id.is_some() {
                return Err(ReferenceError::InvalidInput(
                    "external reference MUST NOT carry internal_id".to_string(),
                ));
            }
        } else {
            if self.internal_id.is_none() {
                return Err(ReferenceError::InvalidInput(
                    "internal reference MUST carry internal_id".to_string(),
                ));
            }
            if self.external_url.is_some() {
                return Err(ReferenceError::InvalidInput(
                    "internal reference MUST NOT carry external_url".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Derive the deterministic 12-hex-char id for an external source.
///
/// The digest covers the URL, with `"|" + title` appended when a title is
/// given, so the same source cited with the same title always lands on the
/// same id.
#[must_use]
pub fn external_reference_hash(url: &str, title: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    if let Some(title) = title {
        hasher.update(b"|");
        hasher.update(title.as_bytes());
    }
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    digest_hex[..EXTERNAL_HASH_LEN].to_string()
}

/// Compose the id of an internal reference as `{type}_{internal_id}`.
#[must_use]
pub fn internal_reference_id(reference_type: ReferenceType, internal_id: &str) -> String {
    format!("{}_{internal_id}", reference_type.as_str())
}

/// Split a reference id on the FIRST underscore, recovering the type token
/// and the original internal id (which may itself contain underscores).
#[must_use]
pub fn split_reference_id(reference_id: &str) -> Option<(&str, &str)> {
    reference_id.split_once('_')
}

/// Synthesize a display title for an external source from its domain.
#[must_use]
pub fn synthesized_source_title(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return "External Source".to_string();
    };
    match parsed.host_str() {
        Some(host) => {
            let domain = host.strip_prefix("www.").unwrap_or(host);
            format!("Source from {domain}")
        }
        None => "External Source".to_string(),
    }
}

/// Parse the `**Sources:**` footer mini-protocol.
///
/// The section runs from the marker line to the first blank line or end of
/// input. Each source is one `[<n>] <url>` line; URLs must start with
/// `http`. Malformed or non-URL lines are skipped, a missing section yields
/// an empty list.
#[must_use]
pub fn parse_sources_footer(text: &str) -> Vec<String> {
    let Some(section) = SOURCES_SECTION.captures(text).and_then(|caps| caps.get(1)) else {
        return Vec::new();
    };

    let mut urls = Vec::new();
    for line in section.as_str().lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(url) = SOURCE_LINE.captures(line).and_then(|caps| caps.get(2)) else {
            continue;
        };
        let url = url.as_str().trim();
        if url.starts_with("http") {
            urls.push(url.to_string());
        }
    }

    urls
}

/// Collect source URLs from a search-provider response, preferring the
/// structured citation metadata over the best-effort footer parse.
#[must_use]
pub fn extract_source_urls(content: &str, structured: Option<&[String]>) -> Vec<String> {
    match structured {
        Some(citations) => citations.to_vec(),
        None => parse_sources_footer(content),
    }
}

/// Remove every bare numeric bracket marker (`[<digits>]`). Model-emitted
/// numeric citations are never trusted, even on retries.
#[must_use]
pub fn strip_numeric_citations(text: &str) -> String {
    NUMERIC_MARKER.replace_all(text, "").into_owned()
}

/// Render the trailing hash-reference footer for rewritten text.
#[must_use]
pub fn build_sources_footer(reference_ids: &[String]) -> String {
    let markers =
        reference_ids.iter().map(|id| format!("[{id}]")).collect::<Vec<_>>().join(" ");
    format!("\n\nSources: {markers}")
}

/// Collect bracketed 12-hex-char reference markers from rewritten text, in
/// discovery order with duplicates collapsed.
#[must_use]
pub fn collect_hash_reference_ids(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for caps in HASH_MARKER.captures_iter(text) {
        if let Some(id) = caps.get(1) {
            let id = id.as_str().to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Collect every `reference_id` carried by records in a collaborator tool
/// result, scanning the known payload keys in a fixed order.
#[must_use]
pub fn collect_internal_reference_ids(tool_result: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    for key in TOOL_RESULT_RECORD_KEYS {
        let Some(records) = tool_result.get(key).and_then(Value::as_array) else {
            continue;
        };
        for record in records {
            if let Some(id) = record.get("reference_id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// Derive a human title for an internal reference from the tool result that
/// produced it: the record's explicit `title`, else a type-specific
/// synthesized string, else a generic fallback.
#[must_use]
pub fn reference_title_from_tool_result(reference_id: &str, tool_result: &Value) -> String {
    for key in TOOL_RESULT_RECORD_KEYS {
        let Some(records) = tool_result.get(key).and_then(Value::as_array) else {
            continue;
        };
        for record in records {
            if record.get("reference_id").and_then(Value::as_str) != Some(reference_id) {
                continue;
            }
            if let Some(title) = record.get("title").and_then(Value::as_str) {
                return title.to_string();
            }
            if let Some(test_name) = record.get("test_name").and_then(Value::as_str) {
                return format!("Lab Result: {test_name}");
            }
            if let Some(detail) = record.get("appointment_detail").and_then(Value::as_str) {
                return truncate_detail(detail);
            }
            return format!("Medical Record: {reference_id}");
        }
    }
    format!("Medical Record: {reference_id}")
}

fn truncate_detail(detail: &str) -> String {
    const MAX_CHARS: usize = 100;
    if detail.chars().count() <= MAX_CHARS {
        return detail.to_string();
    }
    let mut truncated: String = detail.chars().take(MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Internal,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalContent {
    pub description: Option<String>,
    pub external_url: String,
    pub access_note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteContent {
    pub title: String,
    pub content: String,
    pub note_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub doctor_id: String,
    pub patient_mrn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentContent {
    pub appointment_detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finish_time: OffsetDateTime,
    pub doctor_id: String,
    pub patient_mrn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MedicalHistoryContent {
    pub title: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub tags: Vec<String>,
    pub doctor_id: String,
    pub patient_mrn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExaminationContent {
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub examination_date: OffsetDateTime,
    pub doctor_id: String,
    pub patient_mrn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabResultContent {
    pub test_name: String,
    pub result_value: String,
    pub normal_values: String,
    pub unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub lab_date: OffsetDateTime,
    pub patient_mrn: Option<String>,
    pub medicalhistory_id: Option<String>,
}

/// Type-specific payload of a resolved reference, one variant per entity
/// kind. Adding a kind means adding a variant plus its loader and access
/// predicate in the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedContent {
    External(ExternalContent),
    Note(NoteContent),
    Appointment(AppointmentContent),
    MedicalHistory(MedicalHistoryContent),
    Examination(ExaminationContent),
    LabResult(LabResultContent),
}

/// The resolution envelope: identity and lineage of the reference plus the
/// access-checked content payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedReference {
    pub reference_id: String,
    pub resolution: ResolutionKind,
    pub reference_type: ReferenceType,
    pub internal_id: Option<String>,
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub content: ResolvedContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteRecord {
    pub note_id: String,
    pub title: String,
    pub content: String,
    pub note_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub deleted: bool,
    pub patient_mrn: String,
    pub doctor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentRecord {
    pub appointment_id: String,
    pub appointment_detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finish_time: OffsetDateTime,
    pub patient_mrn: String,
    pub doctor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExaminationRecord {
    pub examination_id: String,
    pub examination_title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub examination_date: OffsetDateTime,
    pub patient_mrn: String,
    pub doctor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MedicalHistoryRecord {
    pub medicalhistory_id: String,
    pub medicalhistory_title: String,
    pub medicalhistory_content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub medicalhistory_date: OffsetDateTime,
    #[serde(default)]
    pub tags: Vec<String>,
    pub patient_mrn: String,
    pub doctor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabResultRecord {
    pub lab_result_id: i64,
    pub test_name: String,
    pub result_value: String,
    pub normal_values: String,
    pub unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub lab_date: OffsetDateTime,
    pub medicalhistory_id: Option<String>,
    pub patient_mrn: Option<String>,
}

/// Minimal append-only message row the reference linker attaches to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub role: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

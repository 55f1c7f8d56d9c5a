use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use clinref_core::{
    build_sources_footer, collect_internal_reference_ids, extract_source_urls,
    reference_title_from_tool_result, split_reference_id, strip_numeric_citations,
    AppointmentContent, ExaminationContent, ExternalContent, LabResultContent,
    MedicalHistoryContent, NoteContent, Reference, ReferenceError, ReferenceType,
    ResolutionKind, ResolvedContent, ResolvedReference,
};
use clinref_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Upper bound on ids accepted by one batch resolution.
pub const BATCH_RESOLVE_LIMIT: usize = 50;

const EXTERNAL_ACCESS_NOTE: &str =
    "This is an external source. Click the URL to view the content.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResolveFailure {
    pub status_code: u16,
    pub detail: String,
}

/// Outcome of one batch resolution: every requested id lands in exactly one
/// of the two maps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResolution {
    pub resolved_references: BTreeMap<String, ResolvedReference>,
    pub errors: BTreeMap<String, BatchResolveFailure>,
    pub total_requested: usize,
    pub resolved_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageReferences {
    pub message_id: String,
    pub references: Vec<Reference>,
    pub count: usize,
}

/// Request-scoped facade over the reference store: every operation opens its
/// own store for the lifetime of the call, so callers inject nothing but the
/// database location.
#[derive(Debug, Clone)]
pub struct ReferenceApi {
    db_path: PathBuf,
}

impl ReferenceApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ReferenceError> {
        let mut store = SqliteStore::open(&self.db_path)
            .map_err(|err| unexpected("failed to open reference store", &err))?;
        store
            .migrate()
            .map_err(|err| unexpected("failed to migrate reference store", &err))?;
        Ok(store)
    }

    /// Resolve one reference id to its access-checked content.
    ///
    /// External references resolve directly from the stored URL with no
    /// access control; internal references dispatch to the loader for their
    /// kind and apply its ownership predicate. Exactly one of `NotFound`,
    /// `Forbidden`, or success per call.
    ///
    /// # Errors
    /// [`ReferenceError::NotFound`] for an unknown id or missing target row,
    /// [`ReferenceError::Forbidden`] when the ownership predicate fails,
    /// [`ReferenceError::InvalidInput`] for a kind without a wired loader,
    /// [`ReferenceError::Unexpected`] on storage failure.
    pub fn resolve(
        &self,
        reference_id: &str,
        doctor_id: &str,
    ) -> Result<ResolvedReference, ReferenceError> {
        let store = self.open_store()?;

        let reference = store
            .get_reference(reference_id)
            .map_err(|err| unexpected("failed to load reference", &err))?
            .ok_or_else(|| {
                ReferenceError::NotFound(format!("reference {reference_id} not found"))
            })?;

        if reference.reference_type == ReferenceType::External {
            let Some(external_url) = reference.external_url else {
                return Err(ReferenceError::Unexpected(format!(
                    "external reference {reference_id} carries no url"
                )));
            };
            return Ok(ResolvedReference {
                reference_id: reference.reference_id,
                resolution: ResolutionKind::External,
                reference_type: ReferenceType::External,
                internal_id: None,
                title: reference.title.clone(),
                created_at: reference.created_at,
                content: ResolvedContent::External(ExternalContent {
                    description: reference.title,
                    external_url,
                    access_note: EXTERNAL_ACCESS_NOTE.to_string(),
                }),
            });
        }

        let Some(internal_id) = reference.internal_id.clone() else {
            return Err(ReferenceError::Unexpected(format!(
                "internal reference {reference_id} carries no internal id"
            )));
        };
        let content =
            load_internal_content(&store, reference.reference_type, &internal_id, doctor_id)?;

        Ok(ResolvedReference {
            reference_id: reference.reference_id,
            resolution: ResolutionKind::Internal,
            reference_type: reference.reference_type,
            internal_id: Some(internal_id),
            title: reference.title,
            created_at: reference.created_at,
            content,
        })
    }

    /// Resolve a bounded set of ids with per-id failure isolation.
    ///
    /// The input is trimmed and de-duplicated (first occurrence wins) before
    /// the bounds check; each id then resolves independently and any failure
    /// is captured into `errors` instead of aborting the rest.
    ///
    /// # Errors
    /// [`ReferenceError::InvalidInput`] when the de-duplicated set is empty
    /// or larger than [`BATCH_RESOLVE_LIMIT`].
    pub fn resolve_batch(
        &self,
        reference_ids: &[String],
        doctor_id: &str,
    ) -> Result<BatchResolution, ReferenceError> {
        let mut seen = BTreeSet::new();
        let mut unique = Vec::new();
        for raw in reference_ids {
            let id = raw.trim();
            if id.is_empty() {
                continue;
            }
            if seen.insert(id.to_string()) {
                unique.push(id.to_string());
            }
        }

        if unique.is_empty() {
            return Err(ReferenceError::InvalidInput(
                "no reference ids provided".to_string(),
            ));
        }
        if unique.len() > BATCH_RESOLVE_LIMIT {
            return Err(ReferenceError::InvalidInput(format!(
                "too many reference ids (max {BATCH_RESOLVE_LIMIT})"
            )));
        }

        let mut resolved_references = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for reference_id in &unique {
            match self.resolve(reference_id, doctor_id) {
                Ok(resolved) => {
                    resolved_references.insert(reference_id.clone(), resolved);
                }
                Err(err) => {
                    errors.insert(
                        reference_id.clone(),
                        BatchResolveFailure {
                            status_code: err.status_code(),
                            detail: err.to_string(),
                        },
                    );
                }
            }
        }

        let total_requested = unique.len();
        let resolved_count = resolved_references.len();
        let error_count = errors.len();
        tracing::info!(total_requested, resolved_count, error_count, "batch resolution finished");

        Ok(BatchResolution {
            resolved_references,
            errors,
            total_requested,
            resolved_count,
            error_count,
        })
    }

    /// Rewrite a search-provider response: strip untrusted numeric citation
    /// markers, create one external reference per distinct source URL in
    /// discovery order, and append the hash-reference footer.
    ///
    /// Returns the rewritten text plus the created reference ids so the
    /// conversation pipeline can link them to the persisted message. Text
    /// without citations comes back stripped but otherwise unchanged, with
    /// no footer.
    ///
    /// # Errors
    /// [`ReferenceError::Unexpected`] when reference creation fails.
    pub fn rewrite_search_response(
        &self,
        content: &str,
        structured_citations: Option<&[String]>,
    ) -> Result<(String, Vec<String>), ReferenceError> {
        let urls = extract_source_urls(content, structured_citations);
        let stripped = strip_numeric_citations(content);
        if urls.is_empty() {
            return Ok((stripped, Vec::new()));
        }

        let mut store = self.open_store()?;
        let mut seen = BTreeSet::new();
        let mut reference_ids = Vec::new();
        for url in urls {
            if !seen.insert(url.clone()) {
                continue;
            }
            let reference_id = store
                .create_external_reference(&url, None, None)
                .map_err(|err| unexpected("failed to create external reference", &err))?;
            reference_ids.push(reference_id);
        }

        let rewritten = format!("{stripped}{}", build_sources_footer(&reference_ids));
        Ok((rewritten, reference_ids))
    }

    /// Make sure the reference row for an internal id exists, deriving its
    /// display title from the tool result that produced the id.
    ///
    /// Ids whose type token is unknown or has no wired loader are silently
    /// ignored, matching the tolerance the tool boundary requires.
    ///
    /// # Errors
    /// [`ReferenceError::Unexpected`] when lookup or creation fails.
    pub fn ensure_internal_reference_exists(
        &self,
        reference_id: &str,
        tool_result: &Value,
    ) -> Result<(), ReferenceError> {
        let mut store = self.open_store()?;
        let exists = store
            .reference_exists(reference_id)
            .map_err(|err| unexpected("failed to probe reference", &err))?;
        if exists {
            return Ok(());
        }

        let Some((type_token, internal_id)) = split_reference_id(reference_id) else {
            tracing::debug!(reference_id, "ignoring reference id without type token");
            return Ok(());
        };
        let reference_type = match ReferenceType::parse(type_token) {
            Some(reference_type) if reference_type.is_resolvable_internal() => reference_type,
            _ => {
                tracing::debug!(reference_id, type_token, "ignoring unknown reference kind");
                return Ok(());
            }
        };

        let title = reference_title_from_tool_result(reference_id, tool_result);
        store
            .create_internal_reference(reference_type, internal_id, Some(&title))
            .map_err(|err| unexpected("failed to create internal reference", &err))?;
        Ok(())
    }

    /// Link reference ids to a persisted message.
    ///
    /// Hard precondition: every id's reference row must already exist (via
    /// the external or internal creation path). The store's foreign keys
    /// refuse anything else.
    ///
    /// # Errors
    /// [`ReferenceError::Unexpected`] when a link row cannot be written.
    pub fn link_message_references(
        &self,
        message_id: &str,
        reference_ids: &[String],
    ) -> Result<(), ReferenceError> {
        let mut store = self.open_store()?;
        store
            .link_message_references(message_id, reference_ids)
            .map_err(|err| unexpected("failed to link message references", &err))
    }

    /// Collect internal reference ids from one collaborator tool result,
    /// ensure their rows exist, then link them to the message. This is the
    /// create-then-link composition invoked right after message persistence.
    ///
    /// Returns the ids that were linked; ids of unknown kinds are dropped.
    ///
    /// # Errors
    /// [`ReferenceError::Unexpected`] when creation or linking fails.
    pub fn record_tool_result_references(
        &self,
        message_id: &str,
        tool_result: &Value,
    ) -> Result<Vec<String>, ReferenceError> {
        let candidate_ids = collect_internal_reference_ids(tool_result);
        let mut linkable = Vec::new();
        for reference_id in &candidate_ids {
            self.ensure_internal_reference_exists(reference_id, tool_result)?;
            let wired = split_reference_id(reference_id)
                .and_then(|(token, _)| ReferenceType::parse(token))
                .is_some_and(ReferenceType::is_resolvable_internal);
            if wired {
                linkable.push(reference_id.clone());
            }
        }

        if !linkable.is_empty() {
            self.link_message_references(message_id, &linkable)?;
        }
        Ok(linkable)
    }

    /// Load the references linked to a message, in link order.
    ///
    /// # Errors
    /// [`ReferenceError::Unexpected`] when the join fails.
    pub fn references_for_message(
        &self,
        message_id: &str,
    ) -> Result<MessageReferences, ReferenceError> {
        let store = self.open_store()?;
        let references = store
            .references_for_message(message_id)
            .map_err(|err| unexpected("failed to load message references", &err))?;
        let count = references.len();
        Ok(MessageReferences { message_id: message_id.to_string(), references, count })
    }
}

fn load_internal_content(
    store: &SqliteStore,
    reference_type: ReferenceType,
    internal_id: &str,
    doctor_id: &str,
) -> Result<ResolvedContent, ReferenceError> {
    match reference_type {
        ReferenceType::Notes => {
            let note = store
                .fetch_note(internal_id)
                .map_err(|err| unexpected("failed to load note", &err))?
                .ok_or_else(|| ReferenceError::NotFound("note not found".to_string()))?;
            if note.doctor_id != doctor_id {
                return Err(ReferenceError::Forbidden("access denied to this note".to_string()));
            }
            Ok(ResolvedContent::Note(NoteContent {
                title: note.title,
                content: note.content,
                note_type: note.note_type,
                created_at: note.created_at,
                last_modified: note.last_modified,
                doctor_id: note.doctor_id,
                patient_mrn: note.patient_mrn,
            }))
        }
        ReferenceType::Appointments => {
            let appointment = store
                .fetch_appointment(internal_id)
                .map_err(|err| unexpected("failed to load appointment", &err))?
                .ok_or_else(|| ReferenceError::NotFound("appointment not found".to_string()))?;
            if appointment.doctor_id != doctor_id {
                return Err(ReferenceError::Forbidden(
                    "access denied to this appointment".to_string(),
                ));
            }
            Ok(ResolvedContent::Appointment(AppointmentContent {
                appointment_detail: appointment.appointment_detail,
                start_time: appointment.start_time,
                finish_time: appointment.finish_time,
                doctor_id: appointment.doctor_id,
                patient_mrn: appointment.patient_mrn,
            }))
        }
        ReferenceType::MedicalHistories => {
            let history = store
                .fetch_medical_history(internal_id)
                .map_err(|err| unexpected("failed to load medical history", &err))?
                .ok_or_else(|| {
                    ReferenceError::NotFound("medical history not found".to_string())
                })?;
            if history.doctor_id != doctor_id {
                return Err(ReferenceError::Forbidden(
                    "access denied to this medical history".to_string(),
                ));
            }
            Ok(ResolvedContent::MedicalHistory(MedicalHistoryContent {
                title: history.medicalhistory_title,
                content: history.medicalhistory_content,
                date: history.medicalhistory_date,
                tags: history.tags,
                doctor_id: history.doctor_id,
                patient_mrn: history.patient_mrn,
            }))
        }
        ReferenceType::Examinations => {
            let examination = store
                .fetch_examination(internal_id)
                .map_err(|err| unexpected("failed to load examination", &err))?
                .ok_or_else(|| ReferenceError::NotFound("examination not found".to_string()))?;
            if examination.doctor_id != doctor_id {
                return Err(ReferenceError::Forbidden(
                    "access denied to this examination".to_string(),
                ));
            }
            Ok(ResolvedContent::Examination(ExaminationContent {
                title: examination.examination_title,
                examination_date: examination.examination_date,
                doctor_id: examination.doctor_id,
                patient_mrn: examination.patient_mrn,
            }))
        }
        ReferenceType::LabResults => {
            let lab_result_id: i64 = internal_id.parse().map_err(|_| {
                ReferenceError::InvalidInput(format!(
                    "lab result id must be numeric, got {internal_id}"
                ))
            })?;
            let lab_result = store
                .fetch_lab_result(lab_result_id)
                .map_err(|err| unexpected("failed to load lab result", &err))?
                .ok_or_else(|| ReferenceError::NotFound("lab result not found".to_string()))?;

            // Lab results carry no owning doctor; access goes through the
            // doctor-patient assignment instead (see DESIGN.md).
            let Some(patient_mrn) = lab_result.patient_mrn.clone() else {
                return Err(ReferenceError::Forbidden(
                    "lab result has no patient assignment".to_string(),
                ));
            };
            let assigned = store
                .is_doctor_assigned(doctor_id, &patient_mrn)
                .map_err(|err| unexpected("failed to check patient assignment", &err))?;
            if !assigned {
                return Err(ReferenceError::Forbidden(
                    "access denied to this lab result".to_string(),
                ));
            }

            Ok(ResolvedContent::LabResult(LabResultContent {
                test_name: lab_result.test_name,
                result_value: lab_result.result_value,
                normal_values: lab_result.normal_values,
                unit: lab_result.unit,
                lab_date: lab_result.lab_date,
                patient_mrn: lab_result.patient_mrn,
                medicalhistory_id: lab_result.medicalhistory_id,
            }))
        }
        ReferenceType::Imaging | ReferenceType::External => Err(ReferenceError::InvalidInput(
            format!("unsupported reference type: {reference_type}"),
        )),
    }
}

fn unexpected(context: &str, err: &anyhow::Error) -> ReferenceError {
    tracing::error!("{context}: {err:#}");
    ReferenceError::Unexpected(format!("{context}: {err:#}"))
}

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clinref_core::{
    synthesized_source_title, AppointmentRecord, ExaminationRecord, LabResultRecord,
    MedicalHistoryRecord, MessageRecord, NoteRecord, Reference, ReferenceType,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "references" (
  reference_id TEXT PRIMARY KEY,
  reference_type TEXT NOT NULL CHECK (reference_type IN
    ('notes','appointments','examinations','medicalhistories','labresults','imaging','external')),
  internal_id TEXT,
  external_url TEXT,
  title TEXT,
  created_at TEXT NOT NULL,
  CHECK (
    (reference_type = 'external' AND external_url IS NOT NULL AND internal_id IS NULL)
    OR (reference_type <> 'external' AND internal_id IS NOT NULL AND external_url IS NULL)
  )
);

CREATE TABLE IF NOT EXISTS messages (
  message_id TEXT PRIMARY KEY,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_references (
  message_id TEXT NOT NULL,
  reference_id TEXT NOT NULL,
  PRIMARY KEY (message_id, reference_id),
  FOREIGN KEY (message_id) REFERENCES messages(message_id) ON DELETE CASCADE,
  FOREIGN KEY (reference_id) REFERENCES "references"(reference_id)
);

CREATE TABLE IF NOT EXISTS notes (
  note_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  content TEXT NOT NULL,
  note_type TEXT NOT NULL DEFAULT 'other',
  created_at TEXT NOT NULL,
  last_modified TEXT NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0,
  patient_mrn TEXT NOT NULL,
  doctor_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS appointments (
  appointment_id TEXT PRIMARY KEY,
  appointment_detail TEXT NOT NULL,
  start_time TEXT NOT NULL,
  finish_time TEXT NOT NULL,
  patient_mrn TEXT NOT NULL,
  doctor_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS examinations (
  examination_id TEXT PRIMARY KEY,
  examination_title TEXT NOT NULL,
  examination_date TEXT NOT NULL,
  patient_mrn TEXT NOT NULL,
  doctor_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS medicalhistories (
  medicalhistory_id TEXT PRIMARY KEY,
  medicalhistory_title TEXT NOT NULL,
  medicalhistory_content TEXT NOT NULL,
  medicalhistory_date TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  patient_mrn TEXT NOT NULL,
  doctor_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lab_results (
  lab_result_id INTEGER PRIMARY KEY AUTOINCREMENT,
  test_name TEXT NOT NULL,
  result_value TEXT NOT NULL,
  normal_values TEXT NOT NULL,
  unit TEXT NOT NULL,
  lab_date TEXT NOT NULL,
  medicalhistory_id TEXT,
  patient_mrn TEXT
);

CREATE TABLE IF NOT EXISTS doctor_patient (
  doctor_id TEXT NOT NULL,
  patient_mrn TEXT NOT NULL,
  PRIMARY KEY (doctor_id, patient_mrn)
);

CREATE INDEX IF NOT EXISTS idx_references_type ON "references"(reference_type);
CREATE INDEX IF NOT EXISTS idx_message_references_message ON message_references(message_id);
CREATE INDEX IF NOT EXISTS idx_notes_doctor ON notes(doctor_id);
CREATE INDEX IF NOT EXISTS idx_lab_results_patient ON lab_results(patient_mrn);
"#;

// SQLITE_CONSTRAINT_PRIMARYKEY and SQLITE_CONSTRAINT_UNIQUE extended result
// codes; only these mark a lost first-creation race on the references table.
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed reference store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create or return the existing external reference for a URL.
    ///
    /// `forced_id` is used verbatim when given, otherwise the id is derived
    /// by content hashing. Creation is idempotent: an existing row wins, and
    /// a concurrent first-creation race is absorbed inside the store.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or written.
    pub fn create_external_reference(
        &mut self,
        url: &str,
        title: Option<&str>,
        forced_id: Option<&str>,
    ) -> Result<String> {
        let reference_id = match forced_id {
            Some(id) => id.to_string(),
            None => clinref_core::external_reference_hash(url, title),
        };

        if self.reference_exists(&reference_id)? {
            return Ok(reference_id);
        }

        let display_title =
            title.map_or_else(|| synthesized_source_title(url), ToString::to_string);
        self.insert_reference(&Reference {
            reference_id: reference_id.clone(),
            reference_type: ReferenceType::External,
            internal_id: None,
            external_url: Some(url.to_string()),
            title: Some(display_title),
            created_at: OffsetDateTime::now_utc(),
        })?;

        Ok(reference_id)
    }

    /// Create or return the existing internal reference `{type}_{id}`.
    ///
    /// # Errors
    /// Returns an error when called with the external kind or when the row
    /// cannot be read or written.
    pub fn create_internal_reference(
        &mut self,
        reference_type: ReferenceType,
        internal_id: &str,
        title: Option<&str>,
    ) -> Result<String> {
        if reference_type == ReferenceType::External {
            return Err(anyhow!("create_internal_reference does not accept the external kind"));
        }

        let reference_id = clinref_core::internal_reference_id(reference_type, internal_id);
        if self.reference_exists(&reference_id)? {
            return Ok(reference_id);
        }

        self.insert_reference(&Reference {
            reference_id: reference_id.clone(),
            reference_type,
            internal_id: Some(internal_id.to_string()),
            external_url: None,
            title: title.map(ToString::to_string),
            created_at: OffsetDateTime::now_utc(),
        })?;

        Ok(reference_id)
    }

    /// Whether a reference row exists for the id.
    ///
    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn reference_exists(&self, reference_id: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM \"references\" WHERE reference_id = ?1)",
            params![reference_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Load one reference row by id.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_reference(&self, reference_id: &str) -> Result<Option<Reference>> {
        let mut stmt = self.conn.prepare(
            "SELECT reference_id, reference_type, internal_id, external_url, title, created_at
             FROM \"references\" WHERE reference_id = ?1",
        )?;
        let row = stmt
            .query_row(params![reference_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        let Some((id, type_raw, internal_id, external_url, title, created_at_raw)) = row else {
            return Ok(None);
        };

        Ok(Some(Reference {
            reference_id: id,
            reference_type: ReferenceType::parse(&type_raw)
                .ok_or_else(|| anyhow!("unknown reference_type: {type_raw}"))?,
            internal_id,
            external_url,
            title,
            created_at: parse_rfc3339(&created_at_raw)?,
        }))
    }

    /// Persist one message row.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_message(&mut self, message: &MessageRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO messages(message_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.message_id,
                    message.role,
                    message.content,
                    rfc3339(message.created_at)?
                ],
            )
            .context("failed to insert message")?;
        Ok(())
    }

    /// Delete one message; its reference links cascade away with it.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_message(&mut self, message_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM messages WHERE message_id = ?1", params![message_id])
            .context("failed to delete message")?;
        Ok(())
    }

    /// Link reference ids to a message in one transaction.
    ///
    /// Every id's reference row and the message row MUST already exist; the
    /// foreign keys abort the transaction otherwise. Duplicate ids collapse
    /// onto the composite key.
    ///
    /// # Errors
    /// Returns an error when any link row violates a foreign key or the
    /// transaction fails.
    pub fn link_message_references(
        &mut self,
        message_id: &str,
        reference_ids: &[String],
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start link transaction")?;
        for reference_id in reference_ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_references(message_id, reference_id)
                 VALUES (?1, ?2)",
                params![message_id, reference_id],
            )
            .with_context(|| format!("failed to link reference {reference_id}"))?;
        }
        tx.commit().context("failed to commit link transaction")?;
        Ok(())
    }

    /// Load the references linked to a message, in link insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn references_for_message(&self, message_id: &str) -> Result<Vec<Reference>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.reference_id, r.reference_type, r.internal_id, r.external_url,
                    r.title, r.created_at
             FROM message_references mr
             JOIN \"references\" r ON r.reference_id = mr.reference_id
             WHERE mr.message_id = ?1
             ORDER BY mr.rowid ASC",
        )?;

        let rows = stmt.query_map(params![message_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut references = Vec::new();
        for row in rows {
            let (id, type_raw, internal_id, external_url, title, created_at_raw) = row?;
            references.push(Reference {
                reference_id: id,
                reference_type: ReferenceType::parse(&type_raw)
                    .ok_or_else(|| anyhow!("unknown reference_type: {type_raw}"))?,
                internal_id,
                external_url,
                title,
                created_at: parse_rfc3339(&created_at_raw)?,
            });
        }

        Ok(references)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_note(&mut self, note: &NoteRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes(note_id, title, content, note_type, created_at,
                                   last_modified, deleted, patient_mrn, doctor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    note.note_id,
                    note.title,
                    note.content,
                    note.note_type,
                    rfc3339(note.created_at)?,
                    rfc3339(note.last_modified)?,
                    i64::from(note.deleted),
                    note.patient_mrn,
                    note.doctor_id,
                ],
            )
            .context("failed to insert note")?;
        Ok(())
    }

    /// Fetch one note by primary key; soft-deleted notes are invisible.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn fetch_note(&self, note_id: &str) -> Result<Option<NoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT note_id, title, content, note_type, created_at, last_modified,
                    deleted, patient_mrn, doctor_id
             FROM notes WHERE note_id = ?1 AND deleted = 0",
        )?;
        let row = stmt
            .query_row(params![note_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .optional()?;

        let Some((
            note_id,
            title,
            content,
            note_type,
            created_at,
            last_modified,
            deleted,
            patient_mrn,
            doctor_id,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(NoteRecord {
            note_id,
            title,
            content,
            note_type,
            created_at: parse_rfc3339(&created_at)?,
            last_modified: parse_rfc3339(&last_modified)?,
            deleted: deleted != 0,
            patient_mrn,
            doctor_id,
        }))
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_appointment(&mut self, appointment: &AppointmentRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO appointments(appointment_id, appointment_detail, start_time,
                                          finish_time, patient_mrn, doctor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    appointment.appointment_id,
                    appointment.appointment_detail,
                    rfc3339(appointment.start_time)?,
                    rfc3339(appointment.finish_time)?,
                    appointment.patient_mrn,
                    appointment.doctor_id,
                ],
            )
            .context("failed to insert appointment")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn fetch_appointment(&self, appointment_id: &str) -> Result<Option<AppointmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT appointment_id, appointment_detail, start_time, finish_time,
                    patient_mrn, doctor_id
             FROM appointments WHERE appointment_id = ?1",
        )?;
        let row = stmt
            .query_row(params![appointment_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        let Some((appointment_id, appointment_detail, start_time, finish_time, patient_mrn, doctor_id)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(AppointmentRecord {
            appointment_id,
            appointment_detail,
            start_time: parse_rfc3339(&start_time)?,
            finish_time: parse_rfc3339(&finish_time)?,
            patient_mrn,
            doctor_id,
        }))
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_examination(&mut self, examination: &ExaminationRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO examinations(examination_id, examination_title, examination_date,
                                          patient_mrn, doctor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    examination.examination_id,
                    examination.examination_title,
                    rfc3339(examination.examination_date)?,
                    examination.patient_mrn,
                    examination.doctor_id,
                ],
            )
            .context("failed to insert examination")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn fetch_examination(&self, examination_id: &str) -> Result<Option<ExaminationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT examination_id, examination_title, examination_date, patient_mrn, doctor_id
             FROM examinations WHERE examination_id = ?1",
        )?;
        let row = stmt
            .query_row(params![examination_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;

        let Some((examination_id, examination_title, examination_date, patient_mrn, doctor_id)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(ExaminationRecord {
            examination_id,
            examination_title,
            examination_date: parse_rfc3339(&examination_date)?,
            patient_mrn,
            doctor_id,
        }))
    }

    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_medical_history(&mut self, history: &MedicalHistoryRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO medicalhistories(medicalhistory_id, medicalhistory_title,
                                              medicalhistory_content, medicalhistory_date,
                                              tags_json, patient_mrn, doctor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    history.medicalhistory_id,
                    history.medicalhistory_title,
                    history.medicalhistory_content,
                    rfc3339(history.medicalhistory_date)?,
                    serde_json::to_string(&history.tags).context("failed to serialize tags")?,
                    history.patient_mrn,
                    history.doctor_id,
                ],
            )
            .context("failed to insert medical history")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn fetch_medical_history(
        &self,
        medicalhistory_id: &str,
    ) -> Result<Option<MedicalHistoryRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT medicalhistory_id, medicalhistory_title, medicalhistory_content,
                    medicalhistory_date, tags_json, patient_mrn, doctor_id
             FROM medicalhistories WHERE medicalhistory_id = ?1",
        )?;
        let row = stmt
            .query_row(params![medicalhistory_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;

        let Some((
            medicalhistory_id,
            medicalhistory_title,
            medicalhistory_content,
            medicalhistory_date,
            tags_json,
            patient_mrn,
            doctor_id,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(MedicalHistoryRecord {
            medicalhistory_id,
            medicalhistory_title,
            medicalhistory_content,
            medicalhistory_date: parse_rfc3339(&medicalhistory_date)?,
            tags: serde_json::from_str(&tags_json).context("failed to deserialize tags")?,
            patient_mrn,
            doctor_id,
        }))
    }

    /// Persist one lab result; returns the assigned numeric row id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_lab_result(&mut self, lab_result: &LabResultRecord) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO lab_results(test_name, result_value, normal_values, unit,
                                         lab_date, medicalhistory_id, patient_mrn)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    lab_result.test_name,
                    lab_result.result_value,
                    lab_result.normal_values,
                    lab_result.unit,
                    rfc3339(lab_result.lab_date)?,
                    lab_result.medicalhistory_id,
                    lab_result.patient_mrn,
                ],
            )
            .context("failed to insert lab result")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn fetch_lab_result(&self, lab_result_id: i64) -> Result<Option<LabResultRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT lab_result_id, test_name, result_value, normal_values, unit,
                    lab_date, medicalhistory_id, patient_mrn
             FROM lab_results WHERE lab_result_id = ?1",
        )?;
        let row = stmt
            .query_row(params![lab_result_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .optional()?;

        let Some((
            lab_result_id,
            test_name,
            result_value,
            normal_values,
            unit,
            lab_date,
            medicalhistory_id,
            patient_mrn,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(LabResultRecord {
            lab_result_id,
            test_name,
            result_value,
            normal_values,
            unit,
            lab_date: parse_rfc3339(&lab_date)?,
            medicalhistory_id,
            patient_mrn,
        }))
    }

    /// Record a doctor-patient assignment; repeated assignment is a no-op.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn assign_patient(&mut self, doctor_id: &str, patient_mrn: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO doctor_patient(doctor_id, patient_mrn) VALUES (?1, ?2)",
                params![doctor_id, patient_mrn],
            )
            .context("failed to assign patient")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the probe query fails.
    pub fn is_doctor_assigned(&self, doctor_id: &str, patient_mrn: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM doctor_patient
                           WHERE doctor_id = ?1 AND patient_mrn = ?2)",
            params![doctor_id, patient_mrn],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn insert_reference(&self, reference: &Reference) -> Result<()> {
        reference.validate().map_err(|err| anyhow!("invalid reference row: {err}"))?;

        let outcome = self.conn.execute(
            "INSERT INTO \"references\"(reference_id, reference_type, internal_id,
                                        external_url, title, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reference.reference_id,
                reference.reference_type.as_str(),
                reference.internal_id,
                reference.external_url,
                reference.title,
                rfc3339(reference.created_at)?,
            ],
        );

        match outcome {
            Ok(_) => Ok(()),
            // Lost a concurrent first-creation race; the surviving row is the
            // same content-addressed reference, so the caller never sees it.
            Err(err) if is_unique_violation(&err) => {
                if self.reference_exists(&reference.reference_id)? {
                    Ok(())
                } else {
                    Err(err).with_context(|| {
                        format!("failed to insert reference {}", reference.reference_id)
                    })
                }
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to insert reference {}", reference.reference_id)),
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == SQLITE_CONSTRAINT_UNIQUE
    )
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use time::Duration;

    fn unique_temp_db_path(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        std::env::temp_dir().join(format!("clinref-store-{prefix}-{now}.sqlite3"))
    }

    fn open_migrated(prefix: &str) -> (SqliteStore, PathBuf) {
        let path = unique_temp_db_path(prefix);
        let mut store = match SqliteStore::open(&path) {
            Ok(store) => store,
            Err(err) => panic!("store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("store should migrate: {err}");
        }
        (store, path)
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_note(note_id: &str, doctor_id: &str) -> NoteRecord {
        NoteRecord {
            note_id: note_id.to_string(),
            title: "Consult note".to_string(),
            content: "Patient stable.".to_string(),
            note_type: "consult".to_string(),
            created_at: fixture_time(),
            last_modified: fixture_time(),
            deleted: false,
            patient_mrn: "MRN-1".to_string(),
            doctor_id: doctor_id.to_string(),
        }
    }

    fn reference_row_count(store: &SqliteStore) -> i64 {
        match store.conn.query_row("SELECT COUNT(*) FROM \"references\"", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(count) => count,
            Err(err) => panic!("count query should succeed: {err}"),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_up_to_date() {
        let (mut store, path) = open_migrated("migrate");
        if let Err(err) = store.migrate() {
            panic!("second migrate should succeed: {err}");
        }

        let status = match store.schema_status() {
            Ok(status) => status,
            Err(err) => panic!("schema status should load: {err}"),
        };
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn external_reference_creation_is_idempotent() {
        let (mut store, path) = open_migrated("external-idempotent");

        let first = match store.create_external_reference("https://x.com/a", Some("T"), None) {
            Ok(id) => id,
            Err(err) => panic!("first create should succeed: {err}"),
        };
        let second = match store.create_external_reference("https://x.com/a", Some("T"), None) {
            Ok(id) => id,
            Err(err) => panic!("second create should succeed: {err}"),
        };

        assert_eq!(first, second);
        assert_eq!(first.len(), clinref_core::EXTERNAL_HASH_LEN);
        assert_eq!(reference_row_count(&store), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn external_reference_defaults_title_to_domain() {
        let (mut store, path) = open_migrated("external-title");

        let id = match store.create_external_reference("https://www.who.int/news/item/1", None, None)
        {
            Ok(id) => id,
            Err(err) => panic!("create should succeed: {err}"),
        };
        let reference = match store.get_reference(&id) {
            Ok(Some(reference)) => reference,
            Ok(None) => panic!("reference should exist"),
            Err(err) => panic!("lookup should succeed: {err}"),
        };

        assert_eq!(reference.title.as_deref(), Some("Source from who.int"));
        assert_eq!(reference.external_url.as_deref(), Some("https://www.who.int/news/item/1"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn forced_external_id_is_used_verbatim() {
        let (mut store, path) = open_migrated("forced-id");

        let id = match store.create_external_reference(
            "https://example.org/a",
            Some("Example"),
            Some("feedfacecafe"),
        ) {
            Ok(id) => id,
            Err(err) => panic!("create should succeed: {err}"),
        };

        assert_eq!(id, "feedfacecafe");
        match store.reference_exists("feedfacecafe") {
            Ok(exists) => assert!(exists),
            Err(err) => panic!("existence probe should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn internal_reference_creation_is_idempotent() {
        let (mut store, path) = open_migrated("internal-idempotent");

        let first = match store.create_internal_reference(
            ReferenceType::Notes,
            "abc123",
            Some("Consult note"),
        ) {
            Ok(id) => id,
            Err(err) => panic!("first create should succeed: {err}"),
        };
        let second =
            match store.create_internal_reference(ReferenceType::Notes, "abc123", None) {
                Ok(id) => id,
                Err(err) => panic!("second create should succeed: {err}"),
            };

        assert_eq!(first, "notes_abc123");
        assert_eq!(first, second);
        assert_eq!(reference_row_count(&store), 1);

        let reference = match store.get_reference("notes_abc123") {
            Ok(Some(reference)) => reference,
            Ok(None) => panic!("reference should exist"),
            Err(err) => panic!("lookup should succeed: {err}"),
        };
        assert_eq!(reference.title.as_deref(), Some("Consult note"));
        assert_eq!(reference.internal_id.as_deref(), Some("abc123"));
        assert_eq!(reference.external_url, None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn internal_creation_rejects_the_external_kind() {
        let (mut store, path) = open_migrated("internal-external");

        let err = match store.create_internal_reference(ReferenceType::External, "x", None) {
            Ok(id) => panic!("external kind should be rejected, got {id}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("does not accept the external kind"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn duplicate_insert_race_is_absorbed() {
        let (mut store, path) = open_migrated("race");

        let row = Reference {
            reference_id: "a1b2c3d4e5f6".to_string(),
            reference_type: ReferenceType::External,
            internal_id: None,
            external_url: Some("https://example.org/a".to_string()),
            title: Some("Example".to_string()),
            created_at: fixture_time(),
        };

        // Bypass the lookup to hit the insert path twice, as a concurrent
        // first creation would.
        if let Err(err) = store.insert_reference(&row) {
            panic!("first insert should succeed: {err}");
        }
        if let Err(err) = store.insert_reference(&row) {
            panic!("duplicate insert should be absorbed: {err}");
        }
        assert_eq!(reference_row_count(&store), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_reference_lookup_returns_none() {
        let (store, path) = open_migrated("missing");

        match store.get_reference("does_notexist") {
            Ok(found) => assert_eq!(found, None),
            Err(err) => panic!("lookup should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn linking_requires_existing_reference_rows() {
        let (mut store, path) = open_migrated("link-ordering");

        let message = MessageRecord {
            message_id: "msg-1".to_string(),
            role: "assistant".to_string(),
            content: "Cited answer".to_string(),
            created_at: fixture_time(),
        };
        if let Err(err) = store.insert_message(&message) {
            panic!("message insert should succeed: {err}");
        }

        let missing = vec!["notes_missing".to_string()];
        assert!(
            store.link_message_references("msg-1", &missing).is_err(),
            "linking before the reference row exists must fail"
        );

        let created =
            match store.create_internal_reference(ReferenceType::Notes, "missing", None) {
                Ok(id) => id,
                Err(err) => panic!("create should succeed: {err}"),
            };
        if let Err(err) = store.link_message_references("msg-1", &[created]) {
            panic!("create-then-link should succeed: {err}");
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn linking_requires_existing_message_row() {
        let (mut store, path) = open_migrated("link-message");

        let id = match store.create_internal_reference(ReferenceType::Notes, "n1", None) {
            Ok(id) => id,
            Err(err) => panic!("create should succeed: {err}"),
        };
        assert!(store.link_message_references("msg-absent", &[id]).is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn message_references_join_preserves_link_order() {
        let (mut store, path) = open_migrated("join-order");

        let message = MessageRecord {
            message_id: "msg-1".to_string(),
            role: "assistant".to_string(),
            content: "Cited answer".to_string(),
            created_at: fixture_time(),
        };
        if let Err(err) = store.insert_message(&message) {
            panic!("message insert should succeed: {err}");
        }

        let external = match store.create_external_reference("https://x.com/a", None, None) {
            Ok(id) => id,
            Err(err) => panic!("external create should succeed: {err}"),
        };
        let internal = match store.create_internal_reference(ReferenceType::LabResults, "7", None)
        {
            Ok(id) => id,
            Err(err) => panic!("internal create should succeed: {err}"),
        };

        let ids = vec![internal.clone(), external.clone(), internal.clone()];
        if let Err(err) = store.link_message_references("msg-1", &ids) {
            panic!("link should succeed: {err}");
        }

        let linked = match store.references_for_message("msg-1") {
            Ok(linked) => linked,
            Err(err) => panic!("join should succeed: {err}"),
        };
        let linked_ids: Vec<&str> =
            linked.iter().map(|reference| reference.reference_id.as_str()).collect();
        assert_eq!(linked_ids, vec![internal.as_str(), external.as_str()]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deleting_a_message_cascades_its_links() {
        let (mut store, path) = open_migrated("cascade");

        let message = MessageRecord {
            message_id: "msg-1".to_string(),
            role: "assistant".to_string(),
            content: "Cited answer".to_string(),
            created_at: fixture_time(),
        };
        if let Err(err) = store.insert_message(&message) {
            panic!("message insert should succeed: {err}");
        }
        let id = match store.create_external_reference("https://x.com/a", None, None) {
            Ok(id) => id,
            Err(err) => panic!("create should succeed: {err}"),
        };
        if let Err(err) = store.link_message_references("msg-1", std::slice::from_ref(&id)) {
            panic!("link should succeed: {err}");
        }

        if let Err(err) = store.delete_message("msg-1") {
            panic!("delete should succeed: {err}");
        }

        let remaining = match store.references_for_message("msg-1") {
            Ok(remaining) => remaining,
            Err(err) => panic!("join should succeed: {err}"),
        };
        assert!(remaining.is_empty());
        // The reference row itself survives; only the association cascades.
        match store.reference_exists(&id) {
            Ok(exists) => assert!(exists),
            Err(err) => panic!("existence probe should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn soft_deleted_notes_are_invisible_to_fetch() {
        let (mut store, path) = open_migrated("soft-delete");

        let mut note = fixture_note("n1", "doc-1");
        note.deleted = true;
        if let Err(err) = store.insert_note(&note) {
            panic!("note insert should succeed: {err}");
        }

        match store.fetch_note("n1") {
            Ok(found) => assert_eq!(found, None),
            Err(err) => panic!("fetch should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn clinical_rows_round_trip() {
        let (mut store, path) = open_migrated("clinical");

        let note = fixture_note("n1", "doc-1");
        if let Err(err) = store.insert_note(&note) {
            panic!("note insert should succeed: {err}");
        }
        match store.fetch_note("n1") {
            Ok(Some(found)) => assert_eq!(found, note),
            Ok(None) => panic!("note should be found"),
            Err(err) => panic!("fetch should succeed: {err}"),
        }

        let history = MedicalHistoryRecord {
            medicalhistory_id: "mh1".to_string(),
            medicalhistory_title: "Hypertension".to_string(),
            medicalhistory_content: "Diagnosed 2019.".to_string(),
            medicalhistory_date: fixture_time(),
            tags: vec!["cardio".to_string(), "chronic".to_string()],
            patient_mrn: "MRN-1".to_string(),
            doctor_id: "doc-1".to_string(),
        };
        if let Err(err) = store.insert_medical_history(&history) {
            panic!("history insert should succeed: {err}");
        }
        match store.fetch_medical_history("mh1") {
            Ok(Some(found)) => assert_eq!(found, history),
            Ok(None) => panic!("history should be found"),
            Err(err) => panic!("fetch should succeed: {err}"),
        }

        let lab = LabResultRecord {
            lab_result_id: 0,
            test_name: "HbA1c".to_string(),
            result_value: "6.1".to_string(),
            normal_values: "4.0-5.6".to_string(),
            unit: "%".to_string(),
            lab_date: fixture_time(),
            medicalhistory_id: Some("mh1".to_string()),
            patient_mrn: Some("MRN-1".to_string()),
        };
        let lab_id = match store.insert_lab_result(&lab) {
            Ok(id) => id,
            Err(err) => panic!("lab insert should succeed: {err}"),
        };
        match store.fetch_lab_result(lab_id) {
            Ok(Some(found)) => {
                assert_eq!(found.lab_result_id, lab_id);
                assert_eq!(found.test_name, "HbA1c");
            }
            Ok(None) => panic!("lab result should be found"),
            Err(err) => panic!("fetch should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn doctor_patient_assignment_round_trips() {
        let (mut store, path) = open_migrated("assignment");

        if let Err(err) = store.assign_patient("doc-1", "MRN-1") {
            panic!("assignment should succeed: {err}");
        }
        if let Err(err) = store.assign_patient("doc-1", "MRN-1") {
            panic!("repeated assignment should be a no-op: {err}");
        }

        match store.is_doctor_assigned("doc-1", "MRN-1") {
            Ok(assigned) => assert!(assigned),
            Err(err) => panic!("probe should succeed: {err}"),
        }
        match store.is_doctor_assigned("doc-2", "MRN-1") {
            Ok(assigned) => assert!(!assigned),
            Err(err) => panic!("probe should succeed: {err}"),
        }

        let _ = std::fs::remove_file(&path);
    }
}

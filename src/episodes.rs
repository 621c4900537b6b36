//! Episode recorder: consultations, treatment orders and the CIE-10 catalog.
//!
//! Saving a consultation is one all-or-nothing unit: the note, its
//! diagnoses, its documents, its treatment items and the closing of the
//! visit either all become observable or none do. A crash or validation
//! failure mid-write rolls back; the caller retries the whole operation.

use chrono::Utc;
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{date_from_column, datetime_from_unix, Clinic};
use crate::error::{ClinicError, Result};
use crate::models::{
    Cie10Code, Consultation, ConsultationDraft, Diagnosis, Document, OrderStatus, Permission,
    Session, TreatmentExecution, TreatmentOrder, TreatmentOrderDraft, VisitStatus,
};

fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TreatmentOrder> {
    let status: String = row.try_get("status")?;
    let from: String = row.try_get("valid_from")?;
    let until: String = row.try_get("valid_until")?;
    Ok(TreatmentOrder {
        id: row.try_get("id")?,
        patient_record_id: row.try_get("patient_record_id")?,
        consultation_id: row.try_get("consultation_id")?,
        procedure: row.try_get("procedure")?,
        frequency: row.try_get("frequency")?,
        valid_from: date_from_column(&from)?,
        valid_until: date_from_column(&until)?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| ClinicError::Integrity(format!("unknown order status '{status}'")))?,
        created_by: row.try_get("created_by")?,
        created_at: datetime_from_unix(row.try_get("created_at")?)?,
    })
}

fn validate_consultation(draft: &ConsultationDraft) -> Result<()> {
    if draft.anamnesis.trim().is_empty() {
        return Err(ClinicError::validation("anamnesis", "must not be empty"));
    }
    if draft.physical_exam.trim().is_empty() {
        return Err(ClinicError::validation("physical_exam", "must not be empty"));
    }
    if draft.diagnoses.is_empty() {
        return Err(ClinicError::validation(
            "diagnoses",
            "at least one diagnosis is required",
        ));
    }
    for item in &draft.treatment_items {
        if item.procedure.trim().is_empty() {
            return Err(ClinicError::validation("treatment_items", "empty procedure"));
        }
        if item.valid_until < item.valid_from {
            return Err(ClinicError::validation(
                "treatment_items",
                "validity range ends before it starts",
            ));
        }
    }
    Ok(())
}

impl Clinic {
    /// Save a consultation atomically. When the draft names a visit, that
    /// visit must currently be En Consulta and is flipped to Completado in
    /// the same transaction; the entry is kept as the audit trail, never
    /// deleted. Diagnosis codes must exist in the catalog.
    #[instrument(skip(self, session, draft), fields(patient_record = %draft.patient_record_id))]
    pub async fn record_consultation(
        &self,
        session: &Session,
        draft: ConsultationDraft,
    ) -> Result<Consultation> {
        let actor = self.authorize(session, Permission::RecordConsultations)?;
        validate_consultation(&draft)?;

        let now = Utc::now().timestamp();
        let consultation_id = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;

        let record = sqlx::query("SELECT id FROM patient_records WHERE id = ?")
            .bind(&draft.patient_record_id)
            .fetch_optional(&mut *tx)
            .await?;
        if record.is_none() {
            return Err(ClinicError::not_found(
                "patient record",
                &draft.patient_record_id,
            ));
        }

        if let Some(visit_id) = &draft.queue_entry_id {
            let visit = sqlx::query(
                "SELECT status, patient_record_id FROM queue_entries WHERE id = ?",
            )
            .bind(visit_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ClinicError::not_found("queue entry", visit_id))?;

            let visit_record: String = visit.try_get("patient_record_id")?;
            if visit_record != draft.patient_record_id {
                return Err(ClinicError::validation(
                    "queue_entry_id",
                    "visit belongs to a different patient record",
                ));
            }

            let status: String = visit.try_get("status")?;
            match VisitStatus::parse(&status) {
                Some(VisitStatus::EnConsulta) => {}
                Some(other) => {
                    return Err(ClinicError::Conflict(format!(
                        "visit is {}, it cannot be closed by a consultation",
                        other.label()
                    )));
                }
                None => {
                    return Err(ClinicError::Integrity(format!(
                        "unknown visit status '{status}'"
                    )));
                }
            }
        }

        sqlx::query(
            "INSERT INTO consultations
                (id, patient_record_id, queue_entry_id, anamnesis, physical_exam,
                 treatment_plan, recorded_by, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&consultation_id)
        .bind(&draft.patient_record_id)
        .bind(&draft.queue_entry_id)
        .bind(draft.anamnesis.trim())
        .bind(draft.physical_exam.trim())
        .bind(&draft.treatment_plan)
        .bind(&actor.user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut diagnoses = Vec::with_capacity(draft.diagnoses.len());
        for diagnosis in &draft.diagnoses {
            let known = sqlx::query("SELECT code FROM cie10_codes WHERE code = ?")
                .bind(&diagnosis.code)
                .fetch_optional(&mut *tx)
                .await?;
            if known.is_none() {
                return Err(ClinicError::validation(
                    "diagnoses",
                    format!("unknown CIE-10 code '{}'", diagnosis.code),
                ));
            }
            sqlx::query(
                "INSERT INTO consultation_diagnoses (consultation_id, code, description)
                 VALUES (?, ?, ?)",
            )
            .bind(&consultation_id)
            .bind(&diagnosis.code)
            .bind(&diagnosis.description)
            .execute(&mut *tx)
            .await?;
            diagnoses.push(Diagnosis {
                code: diagnosis.code.clone(),
                description: diagnosis.description.clone(),
            });
        }

        let mut documents = Vec::with_capacity(draft.documents.len());
        for document in &draft.documents {
            let document_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO consultation_documents (id, consultation_id, kind, description, payload)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&document_id)
            .bind(&consultation_id)
            .bind(&document.kind)
            .bind(&document.description)
            .bind(&document.payload)
            .execute(&mut *tx)
            .await?;
            documents.push(Document {
                id: document_id,
                consultation_id: consultation_id.clone(),
                kind: document.kind.clone(),
                description: document.description.clone(),
                payload: document.payload.clone(),
            });
        }

        for item in &draft.treatment_items {
            sqlx::query(
                "INSERT INTO treatment_orders
                    (id, patient_record_id, consultation_id, procedure, frequency,
                     valid_from, valid_until, status, created_by, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&draft.patient_record_id)
            .bind(&consultation_id)
            .bind(item.procedure.trim())
            .bind(&item.frequency)
            .bind(item.valid_from.to_string())
            .bind(item.valid_until.to_string())
            .bind(OrderStatus::Activo.as_str())
            .bind(&actor.user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(visit_id) = &draft.queue_entry_id {
            sqlx::query("UPDATE queue_entries SET status = ? WHERE id = ?")
                .bind(VisitStatus::Completado.as_str())
                .bind(visit_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(consultation_id = %consultation_id, "consultation recorded");

        Ok(Consultation {
            id: consultation_id,
            patient_record_id: draft.patient_record_id,
            queue_entry_id: draft.queue_entry_id,
            anamnesis: draft.anamnesis.trim().to_string(),
            physical_exam: draft.physical_exam.trim().to_string(),
            treatment_plan: draft.treatment_plan,
            recorded_by: actor.user_id,
            recorded_at: datetime_from_unix(now)?,
            diagnoses,
            documents,
        })
    }

    pub async fn consultation(&self, id: &str) -> Result<Consultation> {
        let row = sqlx::query("SELECT * FROM consultations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClinicError::not_found("consultation", id))?;

        let diagnosis_rows = sqlx::query(
            "SELECT code, description FROM consultation_diagnoses
             WHERE consultation_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let diagnoses = diagnosis_rows
            .iter()
            .map(|r| {
                Ok(Diagnosis {
                    code: r.try_get("code")?,
                    description: r.try_get("description")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let document_rows = sqlx::query(
            "SELECT * FROM consultation_documents WHERE consultation_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let documents = document_rows
            .iter()
            .map(|r| {
                Ok(Document {
                    id: r.try_get("id")?,
                    consultation_id: r.try_get("consultation_id")?,
                    kind: r.try_get("kind")?,
                    description: r.try_get("description")?,
                    payload: r.try_get("payload")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Consultation {
            id: row.try_get("id")?,
            patient_record_id: row.try_get("patient_record_id")?,
            queue_entry_id: row.try_get("queue_entry_id")?,
            anamnesis: row.try_get("anamnesis")?,
            physical_exam: row.try_get("physical_exam")?,
            treatment_plan: row.try_get("treatment_plan")?,
            recorded_by: row.try_get("recorded_by")?,
            recorded_at: datetime_from_unix(row.try_get("recorded_at")?)?,
            diagnoses,
            documents,
        })
    }

    /// Clinical history of a patient record, newest first.
    pub async fn list_consultations(&self, patient_record_id: &str) -> Result<Vec<Consultation>> {
        let rows = sqlx::query(
            "SELECT id FROM consultations WHERE patient_record_id = ?
             ORDER BY recorded_at DESC",
        )
        .bind(patient_record_id)
        .fetch_all(&self.pool)
        .await?;
        let mut consultations = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            consultations.push(self.consultation(&id).await?);
        }
        Ok(consultations)
    }

    #[instrument(skip(self, session, draft))]
    pub async fn create_treatment_order(
        &self,
        session: &Session,
        draft: TreatmentOrderDraft,
    ) -> Result<TreatmentOrder> {
        let actor = self.authorize(session, Permission::ManageTreatments)?;
        if draft.procedure.trim().is_empty() {
            return Err(ClinicError::validation("procedure", "must not be empty"));
        }
        if draft.valid_until < draft.valid_from {
            return Err(ClinicError::validation(
                "valid_until",
                "validity range ends before it starts",
            ));
        }

        let record = sqlx::query("SELECT id FROM patient_records WHERE id = ?")
            .bind(&draft.patient_record_id)
            .fetch_optional(&self.pool)
            .await?;
        if record.is_none() {
            return Err(ClinicError::not_found(
                "patient record",
                &draft.patient_record_id,
            ));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO treatment_orders
                (id, patient_record_id, consultation_id, procedure, frequency,
                 valid_from, valid_until, status, created_by, created_at)
             VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&draft.patient_record_id)
        .bind(draft.procedure.trim())
        .bind(&draft.frequency)
        .bind(draft.valid_from.to_string())
        .bind(draft.valid_until.to_string())
        .bind(OrderStatus::Activo.as_str())
        .bind(&actor.user_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        info!(order_id = %id, "treatment order created");
        self.treatment_order(&id).await
    }

    pub async fn treatment_order(&self, id: &str) -> Result<TreatmentOrder> {
        let row = sqlx::query("SELECT * FROM treatment_orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClinicError::not_found("treatment order", id))?;
        order_from_row(&row)
    }

    pub async fn list_treatment_orders(
        &self,
        patient_record_id: &str,
    ) -> Result<Vec<TreatmentOrder>> {
        let rows = sqlx::query(
            "SELECT * FROM treatment_orders WHERE patient_record_id = ?
             ORDER BY created_at DESC",
        )
        .bind(patient_record_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Append an execution to an order. Only Activo orders accept new
    /// executions; completed and cancelled orders keep their history
    /// readable but closed.
    #[instrument(skip(self, session))]
    pub async fn record_treatment_execution(
        &self,
        session: &Session,
        order_id: &str,
        observations: Option<&str>,
    ) -> Result<TreatmentExecution> {
        let actor = self.authorize(session, Permission::ManageTreatments)?;
        let order = self.treatment_order(order_id).await?;
        if order.status != OrderStatus::Activo {
            return Err(ClinicError::Conflict(format!(
                "treatment order is {}, executions can only be added while active",
                order.status.as_str()
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO treatment_executions (id, order_id, executed_at, observations, executed_by)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(order_id)
        .bind(now)
        .bind(observations)
        .bind(&actor.user_id)
        .execute(&self.pool)
        .await?;

        Ok(TreatmentExecution {
            id,
            order_id: order_id.to_string(),
            executed_at: datetime_from_unix(now)?,
            observations: observations.map(str::to_string),
            executed_by: actor.user_id,
        })
    }

    pub async fn list_treatment_executions(
        &self,
        order_id: &str,
    ) -> Result<Vec<TreatmentExecution>> {
        self.treatment_order(order_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM treatment_executions WHERE order_id = ? ORDER BY executed_at",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(TreatmentExecution {
                    id: r.try_get("id")?,
                    order_id: r.try_get("order_id")?,
                    executed_at: datetime_from_unix(r.try_get("executed_at")?)?,
                    observations: r.try_get("observations")?,
                    executed_by: r.try_get("executed_by")?,
                })
            })
            .collect()
    }

    /// Close or cancel an order. Leaving Activo is terminal; a closed order
    /// can never be reactivated or re-closed.
    #[instrument(skip(self, session))]
    pub async fn set_treatment_order_status(
        &self,
        session: &Session,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<TreatmentOrder> {
        self.authorize(session, Permission::ManageTreatments)?;
        if status == OrderStatus::Activo {
            return Err(ClinicError::Conflict(
                "a treatment order cannot be moved back to active".into(),
            ));
        }
        let order = self.treatment_order(order_id).await?;
        if order.status != OrderStatus::Activo {
            return Err(ClinicError::Conflict(format!(
                "treatment order is already {}",
                order.status.as_str()
            )));
        }

        let updated =
            sqlx::query("UPDATE treatment_orders SET status = ? WHERE id = ? AND status = ?")
                .bind(status.as_str())
                .bind(order_id)
                .bind(OrderStatus::Activo.as_str())
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(ClinicError::Conflict(
                "treatment order was closed by another operator".into(),
            ));
        }

        info!(order_id, status = status.as_str(), "treatment order closed");
        self.treatment_order(order_id).await
    }

    // ----- CIE-10 catalog -----

    /// Insert or update a catalog entry. The code is pattern-validated and
    /// immutable; only the description changes on conflict.
    #[instrument(skip(self, session))]
    pub async fn upsert_cie10(
        &self,
        session: &Session,
        code: &str,
        description: &str,
    ) -> Result<Cie10Code> {
        self.authorize(session, Permission::ManageCatalog)?;
        if !Cie10Code::valid_code(code) {
            return Err(ClinicError::validation(
                "code",
                format!("'{code}' is not a valid CIE-10 code"),
            ));
        }
        if description.trim().is_empty() {
            return Err(ClinicError::validation("description", "must not be empty"));
        }

        sqlx::query(
            "INSERT INTO cie10_codes (code, description) VALUES (?, ?)
             ON CONFLICT (code) DO UPDATE SET description = excluded.description",
        )
        .bind(code)
        .bind(description.trim())
        .execute(&self.pool)
        .await?;

        Ok(Cie10Code {
            code: code.to_string(),
            description: description.trim().to_string(),
        })
    }

    /// Remove a catalog entry. Codes referenced by any consultation stay:
    /// clinical history keeps its diagnosis descriptions resolvable.
    #[instrument(skip(self, session))]
    pub async fn delete_cie10(&self, session: &Session, code: &str) -> Result<()> {
        self.authorize(session, Permission::ManageCatalog)?;
        let referenced = sqlx::query(
            "SELECT id FROM consultation_diagnoses WHERE code = ? LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        if referenced.is_some() {
            return Err(ClinicError::Integrity(format!(
                "CIE-10 code '{code}' is referenced by recorded consultations"
            )));
        }

        let deleted = sqlx::query("DELETE FROM cie10_codes WHERE code = ?")
            .bind(code)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ClinicError::not_found("CIE-10 code", code));
        }
        Ok(())
    }

    /// Partial match over code or description.
    pub async fn search_cie10(&self, query: &str) -> Result<Vec<Cie10Code>> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query(
            "SELECT code, description FROM cie10_codes
             WHERE code LIKE ? OR description LIKE ?
             ORDER BY code",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(Cie10Code {
                    code: r.try_get("code")?,
                    description: r.try_get("description")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DiagnosisDraft, DocumentDraft, HolderKind, PersonDraft, TreatmentItemDraft,
    };
    use chrono::NaiveDate;

    fn person_draft(first: &str, last: &str, national_id: &str) -> PersonDraft {
        PersonDraft {
            first_name: first.into(),
            last_name: last.into(),
            nationality: "V".into(),
            national_id: national_id.into(),
            birth_date: NaiveDate::from_ymd_opt(1982, 6, 21).unwrap(),
            sex: "F".into(),
            phone: None,
            phone_alt: None,
            email: None,
        }
    }

    /// Store + session + a private holder checked in and called into
    /// consultation, ready to be recorded against.
    async fn setup_in_consultation() -> (Clinic, Session, String, String) {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = clinic.authenticate("admin", "admin").await.unwrap();
        let person = clinic
            .create_person(&session, person_draft("Ana", "Pérez", "3001"))
            .await
            .unwrap();
        clinic
            .create_account_holder(&session, &person.id, HolderKind::Private, None)
            .await
            .unwrap();
        let entry = clinic
            .enqueue_visit(&session, &person.id, "Consulta general", None)
            .await
            .unwrap();
        let entry = clinic.advance_visit(&session, &entry.id).await.unwrap();
        (clinic, session, entry.patient_record_id.clone(), entry.id)
    }

    fn base_draft(patient_record_id: &str, visit_id: Option<&str>) -> ConsultationDraft {
        ConsultationDraft {
            patient_record_id: patient_record_id.to_string(),
            queue_entry_id: visit_id.map(str::to_string),
            anamnesis: "Fiebre y malestar general de dos días".into(),
            physical_exam: "Faringe eritematosa, sin exudado".into(),
            treatment_plan: Some("Reposo e hidratación".into()),
            diagnoses: vec![DiagnosisDraft {
                code: "J00".into(),
                description: "Rinofaringitis aguda".into(),
            }],
            treatment_items: vec![],
            documents: vec![],
        }
    }

    #[tokio::test]
    async fn recording_closes_the_visit_and_keeps_it_as_audit_trail() {
        let (clinic, session, record_id, visit_id) = setup_in_consultation().await;
        let consultation = clinic
            .record_consultation(&session, base_draft(&record_id, Some(&visit_id)))
            .await
            .unwrap();
        assert_eq!(consultation.diagnoses.len(), 1);

        let visit = clinic.queue_entry(&visit_id).await.unwrap();
        assert_eq!(visit.status, VisitStatus::Completado);
    }

    #[tokio::test]
    async fn empty_diagnoses_fail_and_the_visit_stays_in_consultation() {
        let (clinic, session, record_id, visit_id) = setup_in_consultation().await;
        let mut draft = base_draft(&record_id, Some(&visit_id));
        draft.diagnoses.clear();

        let err = clinic.record_consultation(&session, draft).await.unwrap_err();
        assert!(matches!(err, ClinicError::Validation { field: "diagnoses", .. }));

        let visit = clinic.queue_entry(&visit_id).await.unwrap();
        assert_eq!(visit.status, VisitStatus::EnConsulta);
    }

    #[tokio::test]
    async fn unknown_diagnosis_code_rolls_back_everything() {
        let (clinic, session, record_id, visit_id) = setup_in_consultation().await;
        let mut draft = base_draft(&record_id, Some(&visit_id));
        // First code is valid, second is not: nothing of the write survives.
        draft.diagnoses.push(DiagnosisDraft {
            code: "X99.99".into(),
            description: "inexistente".into(),
        });
        draft.documents.push(DocumentDraft {
            kind: "informe".into(),
            description: None,
            payload: vec![1, 2, 3],
        });

        let err = clinic.record_consultation(&session, draft).await.unwrap_err();
        assert!(matches!(err, ClinicError::Validation { .. }));

        assert!(clinic.list_consultations(&record_id).await.unwrap().is_empty());
        let visit = clinic.queue_entry(&visit_id).await.unwrap();
        assert_eq!(visit.status, VisitStatus::EnConsulta);
    }

    #[tokio::test]
    async fn visit_of_another_patient_cannot_be_closed() {
        let (clinic, session, _record_a, visit_a) = setup_in_consultation().await;
        let other = clinic
            .create_person(&session, person_draft("Berta", "Soto", "3003"))
            .await
            .unwrap();
        let record_b = clinic.ensure_patient_record(&other.id).await.unwrap();

        let err = clinic
            .record_consultation(&session, base_draft(&record_b.id, Some(&visit_a)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClinicError::Validation { field: "queue_entry_id", .. }
        ));

        // The foreign visit stayed open and B's record stayed empty.
        let visit = clinic.queue_entry(&visit_a).await.unwrap();
        assert_eq!(visit.status, VisitStatus::EnConsulta);
        assert!(clinic.list_consultations(&record_b.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn waiting_visit_cannot_be_closed_directly() {
        let (clinic, session, record_id, _) = setup_in_consultation().await;
        // Second patient still waiting.
        let other = clinic
            .create_person(&session, person_draft("Berta", "Soto", "3002"))
            .await
            .unwrap();
        clinic
            .create_account_holder(&session, &other.id, HolderKind::Private, None)
            .await
            .unwrap();
        let waiting = clinic
            .enqueue_visit(&session, &other.id, "Consulta general", None)
            .await
            .unwrap();

        let mut draft = base_draft(&record_id, Some(&waiting.id));
        draft.patient_record_id = waiting.patient_record_id.clone();
        let err = clinic.record_consultation(&session, draft).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn consultation_may_carry_documents_and_treatment_items() {
        let (clinic, session, record_id, visit_id) = setup_in_consultation().await;
        let mut draft = base_draft(&record_id, Some(&visit_id));
        draft.documents.push(DocumentDraft {
            kind: "laboratorio".into(),
            description: Some("Hematología completa".into()),
            payload: b"PDF-bytes".to_vec(),
        });
        draft.treatment_items.push(TreatmentItemDraft {
            procedure: "Nebulización".into(),
            frequency: "Cada 8 horas".into(),
            valid_from: NaiveDate::from_ymd_opt(2026, 8, 27).unwrap(),
            valid_until: NaiveDate::from_ymd_opt(2026, 9, 3).unwrap(),
        });

        let saved = clinic.record_consultation(&session, draft).await.unwrap();

        let loaded = clinic.consultation(&saved.id).await.unwrap();
        assert_eq!(loaded.documents.len(), 1);
        assert_eq!(loaded.documents[0].payload, b"PDF-bytes".to_vec());

        let orders = clinic.list_treatment_orders(&record_id).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Activo);
        assert_eq!(orders[0].consultation_id.as_deref(), Some(saved.id.as_str()));
    }

    #[tokio::test]
    async fn executions_require_an_active_order() {
        let (clinic, session, record_id, _) = setup_in_consultation().await;
        let order = clinic
            .create_treatment_order(
                &session,
                TreatmentOrderDraft {
                    patient_record_id: record_id.clone(),
                    procedure: "Curas planas".into(),
                    frequency: "Diaria".into(),
                    valid_from: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                    valid_until: NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
                },
            )
            .await
            .unwrap();

        clinic
            .record_treatment_execution(&session, &order.id, Some("Sin novedad"))
            .await
            .unwrap();

        clinic
            .set_treatment_order_status(&session, &order.id, OrderStatus::Completado)
            .await
            .unwrap();

        let err = clinic
            .record_treatment_execution(&session, &order.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));

        // History stays readable after closing.
        let history = clinic.list_treatment_executions(&order.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn closed_orders_are_terminal() {
        let (clinic, session, record_id, _) = setup_in_consultation().await;
        let order = clinic
            .create_treatment_order(
                &session,
                TreatmentOrderDraft {
                    patient_record_id: record_id,
                    procedure: "Fisioterapia".into(),
                    frequency: "Semanal".into(),
                    valid_from: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                    valid_until: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
                },
            )
            .await
            .unwrap();
        clinic
            .set_treatment_order_status(&session, &order.id, OrderStatus::Cancelado)
            .await
            .unwrap();

        let err = clinic
            .set_treatment_order_status(&session, &order.id, OrderStatus::Completado)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn cie10_in_use_cannot_be_deleted() {
        let (clinic, session, record_id, visit_id) = setup_in_consultation().await;
        clinic
            .record_consultation(&session, base_draft(&record_id, Some(&visit_id)))
            .await
            .unwrap();

        let err = clinic.delete_cie10(&session, "J00").await.unwrap_err();
        assert!(matches!(err, ClinicError::Integrity(_)));

        // An unreferenced code deletes fine.
        clinic.upsert_cie10(&session, "Z76.0", "Consulta para repetición de receta").await.unwrap();
        clinic.delete_cie10(&session, "Z76.0").await.unwrap();
    }

    #[tokio::test]
    async fn cie10_upsert_validates_the_pattern() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = clinic.authenticate("admin", "admin").await.unwrap();
        let err = clinic
            .upsert_cie10(&session, "banana", "No es un código")
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation { field: "code", .. }));

        clinic.upsert_cie10(&session, "J45.9", "Asma").await.unwrap();
        let hits = clinic.search_cie10("J45").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description, "Asma");
    }
}

//! Waiting-room state machine: Esperando → En Consulta → Completado.
//!
//! The final transition belongs to the episode recorder; a visit only
//! becomes Completado as a side effect of saving its consultation. Callers
//! poll [`Clinic::list_queue`] for a stateless snapshot; there is no
//! server-side subscription channel.

use chrono::Utc;
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{datetime_from_unix, Clinic};
use crate::error::{ClinicError, Result};
use crate::models::{Permission, QueueEntry, Session, VisitKind, VisitStatus};

pub(crate) fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueueEntry> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        person_id: row.try_get("person_id")?,
        patient_record_id: row.try_get("patient_record_id")?,
        kind: VisitKind::parse(&kind)
            .ok_or_else(|| ClinicError::Integrity(format!("unknown visit kind '{kind}'")))?,
        service: row.try_get("service")?,
        account_type: row.try_get("account_type")?,
        status: VisitStatus::parse(&status)
            .ok_or_else(|| ClinicError::Integrity(format!("unknown visit status '{status}'")))?,
        checked_in_at: datetime_from_unix(row.try_get("checked_in_at")?)?,
    })
}

impl Clinic {
    pub async fn queue_entry(&self, id: &str) -> Result<QueueEntry> {
        let row = sqlx::query("SELECT * FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClinicError::not_found("queue entry", id))?;
        entry_from_row(&row)
    }

    /// Check a person into the waiting room. The account type is derived
    /// from their affiliation, never supplied:
    /// holder → their own kind; dependent → the kind of the holder they
    /// depend on. A dependent of several holders with differing kinds must
    /// be disambiguated through `holder_hint`; picking one silently would
    /// bill the wrong affiliation.
    #[instrument(skip(self, session))]
    pub async fn enqueue_visit(
        &self,
        session: &Session,
        person_id: &str,
        service: &str,
        holder_hint: Option<&str>,
    ) -> Result<QueueEntry> {
        self.authorize(session, Permission::ManageQueue)?;
        if service.trim().is_empty() {
            return Err(ClinicError::validation("service", "must not be empty"));
        }
        let person = self.person(person_id).await?;

        let open = sqlx::query(
            "SELECT id FROM queue_entries WHERE person_id = ? AND status != ?",
        )
        .bind(person_id)
        .bind(VisitStatus::Completado.as_str())
        .fetch_optional(&self.pool)
        .await?;
        if open.is_some() {
            return Err(ClinicError::Conflict(format!(
                "{} already has an active visit",
                person.full_name()
            )));
        }

        let (kind, account_type) = self.derive_account(person_id, holder_hint).await?;
        let record = self.ensure_patient_record(person_id).await?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO queue_entries
                (id, person_id, patient_record_id, kind, service, account_type, status, checked_in_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(person_id)
        .bind(&record.id)
        .bind(kind.as_str())
        .bind(service.trim())
        .bind(&account_type)
        .bind(VisitStatus::Esperando.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ClinicError::from(e).on_unique(&format!(
                "{} already has an active visit",
                person.full_name()
            ))
        })?;

        info!(person_id, account_type = %account_type, "visit enqueued");
        self.queue_entry(&id).await
    }

    /// Resolve the visit kind and billing label for a person.
    async fn derive_account(
        &self,
        person_id: &str,
        holder_hint: Option<&str>,
    ) -> Result<(VisitKind, String)> {
        if let Some(holder) = self.account_holder_for(person_id).await? {
            return Ok((VisitKind::Titular, holder.kind.account_label().to_string()));
        }

        let holders = self.holders_of_dependent(person_id).await?;
        if holders.is_empty() {
            return Err(ClinicError::validation(
                "person_id",
                "person is neither an account holder nor a dependent",
            ));
        }

        if let Some(hint) = holder_hint {
            let holder = holders
                .iter()
                .find(|h| h.id == hint)
                .ok_or_else(|| {
                    ClinicError::validation(
                        "holder_hint",
                        "person is not a dependent of that holder",
                    )
                })?;
            return Ok((
                VisitKind::Beneficiario,
                holder.kind.account_label().to_string(),
            ));
        }

        let first_kind = holders[0].kind;
        if holders.iter().any(|h| h.kind != first_kind) {
            return Err(ClinicError::validation(
                "holder_hint",
                "person depends on holders of different kinds; pick one",
            ));
        }
        Ok((
            VisitKind::Beneficiario,
            first_kind.account_label().to_string(),
        ))
    }

    /// Call a waiting patient into consultation. The only transition this
    /// entry point performs is Esperando → En Consulta.
    #[instrument(skip(self, session))]
    pub async fn advance_visit(&self, session: &Session, visit_id: &str) -> Result<QueueEntry> {
        self.authorize(session, Permission::ManageQueue)?;
        let entry = self.queue_entry(visit_id).await?;
        if entry.status != VisitStatus::Esperando {
            return Err(ClinicError::Conflict(format!(
                "visit is {}, only waiting visits can be called in",
                entry.status.label()
            )));
        }

        let updated = sqlx::query("UPDATE queue_entries SET status = ? WHERE id = ? AND status = ?")
            .bind(VisitStatus::EnConsulta.as_str())
            .bind(visit_id)
            .bind(VisitStatus::Esperando.as_str())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(ClinicError::Conflict(
                "visit was moved by another operator".into(),
            ));
        }

        info!(visit_id, "visit called into consultation");
        self.queue_entry(visit_id).await
    }

    /// Remove a visit that has not been attended yet.
    #[instrument(skip(self, session))]
    pub async fn cancel_visit(&self, session: &Session, visit_id: &str) -> Result<()> {
        self.authorize(session, Permission::ManageQueue)?;
        let entry = self.queue_entry(visit_id).await?;
        if entry.status != VisitStatus::Esperando {
            return Err(ClinicError::Conflict(format!(
                "visit is {}, only waiting visits can be removed",
                entry.status.label()
            )));
        }
        sqlx::query("DELETE FROM queue_entries WHERE id = ?")
            .bind(visit_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stateless snapshot for polling callers: every open entry plus the
    /// day's completed ones, in check-in order. Completed entries from
    /// earlier days stay in storage as the audit trail but drop out of the
    /// board.
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default();
        let rows = sqlx::query(
            "SELECT * FROM queue_entries
             WHERE status != ? OR checked_in_at >= ?
             ORDER BY checked_in_at",
        )
        .bind(VisitStatus::Completado.as_str())
        .bind(midnight)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HolderKind, PersonDraft};
    use chrono::NaiveDate;

    fn draft(first: &str, last: &str, national_id: &str) -> PersonDraft {
        PersonDraft {
            first_name: first.into(),
            last_name: last.into(),
            nationality: "V".into(),
            national_id: national_id.into(),
            birth_date: NaiveDate::from_ymd_opt(1975, 9, 3).unwrap(),
            sex: "M".into(),
            phone: None,
            phone_alt: None,
            email: None,
        }
    }

    async fn setup() -> (Clinic, Session) {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = clinic.authenticate("admin", "admin").await.unwrap();
        (clinic, session)
    }

    #[tokio::test]
    async fn holder_enqueues_with_their_own_account_type() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2001"))
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
        assert_eq!(entry.account_type, "Privado");
        assert_eq!(entry.kind, VisitKind::Titular);
        assert_eq!(entry.status, VisitStatus::Esperando);
    }

    #[tokio::test]
    async fn unaffiliated_person_cannot_enqueue() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Nadie", "Suelto", "2002"))
            .await
            .unwrap();
        let err = clinic
            .enqueue_visit(&session, &person.id, "Consulta general", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation { field: "person_id", .. }));
    }

    #[tokio::test]
    async fn second_open_visit_is_a_conflict() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2003"))
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
        let err = clinic
            .enqueue_visit(&session, &person.id, "Odontología", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));

        // Still a conflict while in consultation.
        clinic.advance_visit(&session, &entry.id).await.unwrap();
        let err = clinic
            .enqueue_visit(&session, &person.id, "Odontología", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn dependent_derives_account_type_from_holder() {
        let (clinic, session) = setup().await;
        let titular = clinic
            .create_person(&session, draft("Luis", "Hernández", "2004"))
            .await
            .unwrap();
        let child = clinic
            .create_person(&session, draft("Hijo", "Hernández", "2005"))
            .await
            .unwrap();
        let company = clinic.list_companies().await.unwrap().into_iter().next().unwrap();
        let holder = clinic
            .create_account_holder(
                &session,
                &titular.id,
                HolderKind::CorporateAffiliate,
                Some(&company.id),
            )
            .await
            .unwrap();
        clinic.attach_dependent(&session, &child.id, &holder.id).await.unwrap();

        let entry = clinic
            .enqueue_visit(&session, &child.id, "Pediatría", None)
            .await
            .unwrap();
        assert_eq!(entry.account_type, "Afiliado Corporativo");
        assert_eq!(entry.kind, VisitKind::Beneficiario);
    }

    #[tokio::test]
    async fn ambiguous_multi_holder_dependent_needs_a_hint() {
        let (clinic, session) = setup().await;
        let a = clinic
            .create_person(&session, draft("Titular", "Privado", "2006"))
            .await
            .unwrap();
        let b = clinic
            .create_person(&session, draft("Titular", "Empleado", "2007"))
            .await
            .unwrap();
        let child = clinic
            .create_person(&session, draft("Hijo", "Doble", "2008"))
            .await
            .unwrap();
        let holder_a = clinic
            .create_account_holder(&session, &a.id, HolderKind::Private, None)
            .await
            .unwrap();
        let holder_b = clinic
            .create_account_holder(&session, &b.id, HolderKind::InternalEmployee, None)
            .await
            .unwrap();
        clinic.attach_dependent(&session, &child.id, &holder_a.id).await.unwrap();
        clinic.attach_dependent(&session, &child.id, &holder_b.id).await.unwrap();

        let err = clinic
            .enqueue_visit(&session, &child.id, "Consulta general", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation { field: "holder_hint", .. }));

        let entry = clinic
            .enqueue_visit(&session, &child.id, "Consulta general", Some(&holder_b.id))
            .await
            .unwrap();
        assert_eq!(entry.account_type, "Empleado");
    }

    #[tokio::test]
    async fn storage_rejects_a_second_open_visit_even_past_the_precheck() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2012"))
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

        // The insert a racing second enqueue would run after both calls
        // passed the duplicate pre-check.
        let raced = sqlx::query(
            "INSERT INTO queue_entries
                (id, person_id, patient_record_id, kind, service, account_type, status, checked_in_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&person.id)
        .bind(&entry.patient_record_id)
        .bind(VisitKind::Titular.as_str())
        .bind("Odontología")
        .bind("Privado")
        .bind(VisitStatus::Esperando.as_str())
        .bind(Utc::now().timestamp())
        .execute(&clinic.pool)
        .await
        .unwrap_err();

        let err = ClinicError::from(raced).on_unique("second open visit");
        assert!(matches!(err, ClinicError::Conflict(_)));
        assert_eq!(clinic.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advance_only_moves_waiting_visits() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2009"))
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

        let advanced = clinic.advance_visit(&session, &entry.id).await.unwrap();
        assert_eq!(advanced.status, VisitStatus::EnConsulta);

        let err = clinic.advance_visit(&session, &entry.id).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_only_removes_waiting_visits() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2010"))
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
        clinic.advance_visit(&session, &entry.id).await.unwrap();

        let err = clinic.cancel_visit(&session, &entry.id).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn queue_snapshot_lists_open_entries_in_checkin_order() {
        let (clinic, session) = setup().await;
        for (i, name) in ["Primero", "Segundo"].iter().enumerate() {
            let person = clinic
                .create_person(&session, draft(name, "Turno", &format!("21{i}")))
                .await
                .unwrap();
            clinic
                .create_account_holder(&session, &person.id, HolderKind::Private, None)
                .await
                .unwrap();
            clinic
                .enqueue_visit(&session, &person.id, "Consulta general", None)
                .await
                .unwrap();
        }

        let snapshot = clinic.list_queue().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|e| e.status == VisitStatus::Esperando));
    }

    #[tokio::test]
    async fn denied_enqueue_leaves_no_trace() {
        let (clinic, session) = setup().await;
        let person = clinic
            .create_person(&session, draft("Ana", "Pérez", "2011"))
            .await
            .unwrap();
        clinic
            .create_account_holder(&session, &person.id, HolderKind::Private, None)
            .await
            .unwrap();

        clinic.end_session(&session.token);
        let err = clinic
            .enqueue_visit(&session, &person.id, "Consulta general", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));

        let session = clinic.authenticate("admin", "admin").await.unwrap();
        assert!(clinic.list_queue().await.unwrap().is_empty());
        // The person can still check in normally afterwards.
        clinic
            .enqueue_visit(&session, &person.id, "Consulta general", None)
            .await
            .unwrap();
    }
}

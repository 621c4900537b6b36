//! Identity graph: persons, account holders (titulares), dependents
//! (beneficiarios), companies and the lazy patient record.
//!
//! Uniqueness rules are enforced by a read-then-check pass with the store's
//! unique constraints as the backstop for the race window in between.

use chrono::Utc;
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{date_from_column, datetime_from_unix, Clinic};
use crate::error::{ClinicError, Result};
use crate::models::{
    AccountHolder, Company, CompanyDraft, Dependent, HolderKind, PatientRecord, Permission,
    Person, PersonDraft, Session,
};

pub(crate) fn person_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Person> {
    let birth: String = row.try_get("birth_date")?;
    Ok(Person {
        id: row.try_get("id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        nationality: row.try_get("nationality")?,
        national_id: row.try_get("national_id")?,
        birth_date: date_from_column(&birth)?,
        sex: row.try_get("sex")?,
        phone: row.try_get("phone")?,
        phone_alt: row.try_get("phone_alt")?,
        email: row.try_get("email")?,
        created_at: datetime_from_unix(row.try_get("created_at")?)?,
        updated_at: datetime_from_unix(row.try_get("updated_at")?)?,
    })
}

fn holder_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AccountHolder> {
    let kind: String = row.try_get("kind")?;
    Ok(AccountHolder {
        id: row.try_get("id")?,
        person_id: row.try_get("person_id")?,
        kind: HolderKind::parse(&kind)
            .ok_or_else(|| ClinicError::Integrity(format!("unknown holder kind '{kind}'")))?,
        company_id: row.try_get("company_id")?,
    })
}

fn validate_person(draft: &PersonDraft) -> Result<()> {
    if draft.first_name.trim().is_empty() {
        return Err(ClinicError::validation("first_name", "must not be empty"));
    }
    if draft.last_name.trim().is_empty() {
        return Err(ClinicError::validation("last_name", "must not be empty"));
    }
    if draft.nationality.trim().is_empty() {
        return Err(ClinicError::validation("nationality", "must not be empty"));
    }
    if draft.national_id.trim().is_empty() {
        return Err(ClinicError::validation("national_id", "must not be empty"));
    }
    if let Some(email) = &draft.email {
        if !email.contains('@') {
            return Err(ClinicError::validation("email", "not a valid address"));
        }
    }
    Ok(())
}

impl Clinic {
    pub async fn person(&self, id: &str) -> Result<Person> {
        let row = sqlx::query("SELECT * FROM persons WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClinicError::not_found("person", id))?;
        person_from_row(&row)
    }

    /// Duplicate national-id / email check against every person except
    /// `exclude` (the person being updated).
    async fn check_person_collisions(
        &self,
        draft: &PersonDraft,
        exclude: Option<&str>,
    ) -> Result<()> {
        let exclude = exclude.unwrap_or("");
        let clash = sqlx::query(
            "SELECT id FROM persons
             WHERE nationality = ? AND national_id = ? AND id != ?",
        )
        .bind(&draft.nationality)
        .bind(&draft.national_id)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;
        if clash.is_some() {
            return Err(ClinicError::Conflict(format!(
                "a person with national id {}-{} already exists",
                draft.nationality, draft.national_id
            )));
        }

        if let Some(email) = &draft.email {
            let clash = sqlx::query("SELECT id FROM persons WHERE email = ? AND id != ?")
                .bind(email)
                .bind(exclude)
                .fetch_optional(&self.pool)
                .await?;
            if clash.is_some() {
                return Err(ClinicError::Conflict(format!(
                    "a person with email {email} already exists"
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, session, draft), fields(national_id = %draft.national_id))]
    pub async fn create_person(&self, session: &Session, draft: PersonDraft) -> Result<Person> {
        self.authorize(session, Permission::ManagePersons)?;
        validate_person(&draft)?;
        self.check_person_collisions(&draft, None).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO persons (id, first_name, last_name, nationality, national_id,
                                  birth_date, sex, phone, phone_alt, email,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(draft.first_name.trim())
        .bind(draft.last_name.trim())
        .bind(&draft.nationality)
        .bind(&draft.national_id)
        .bind(draft.birth_date.to_string())
        .bind(&draft.sex)
        .bind(&draft.phone)
        .bind(&draft.phone_alt)
        .bind(&draft.email)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ClinicError::from(e).on_unique("national id or email already registered")
        })?;

        info!(person_id = %id, "person created");
        self.person(&id).await
    }

    #[instrument(skip(self, session, draft))]
    pub async fn update_person(
        &self,
        session: &Session,
        id: &str,
        draft: PersonDraft,
    ) -> Result<Person> {
        self.authorize(session, Permission::ManagePersons)?;
        validate_person(&draft)?;
        self.person(id).await?;
        self.check_person_collisions(&draft, Some(id)).await?;

        sqlx::query(
            "UPDATE persons
             SET first_name = ?, last_name = ?, nationality = ?, national_id = ?,
                 birth_date = ?, sex = ?, phone = ?, phone_alt = ?, email = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(draft.first_name.trim())
        .bind(draft.last_name.trim())
        .bind(&draft.nationality)
        .bind(&draft.national_id)
        .bind(draft.birth_date.to_string())
        .bind(&draft.sex)
        .bind(&draft.phone)
        .bind(&draft.phone_alt)
        .bind(&draft.email)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ClinicError::from(e).on_unique("national id or email already registered")
        })?;

        self.person(id).await
    }

    /// Administrative, destructive removal. The store cascades through the
    /// account holder row, dependent links, patient record and every
    /// clinical row hanging off it.
    #[instrument(skip(self, session))]
    pub async fn delete_person(&self, session: &Session, id: &str) -> Result<()> {
        self.authorize(session, Permission::ManagePersons)?;
        let deleted = sqlx::query("DELETE FROM persons WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ClinicError::not_found("person", id));
        }
        info!(person_id = id, "person deleted with cascade");
        Ok(())
    }

    pub async fn account_holder_for(&self, person_id: &str) -> Result<Option<AccountHolder>> {
        let row = sqlx::query("SELECT * FROM account_holders WHERE person_id = ?")
            .bind(person_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(holder_from_row).transpose()
    }

    /// Promote a person to account holder. One holder row per person;
    /// corporate affiliates must name their company.
    #[instrument(skip(self, session))]
    pub async fn create_account_holder(
        &self,
        session: &Session,
        person_id: &str,
        kind: HolderKind,
        company_id: Option<&str>,
    ) -> Result<AccountHolder> {
        self.authorize(session, Permission::ManageAffiliations)?;
        let person = self.person(person_id).await?;

        match (kind, company_id) {
            (HolderKind::CorporateAffiliate, None) => {
                return Err(ClinicError::validation(
                    "company_id",
                    "corporate affiliates require a company",
                ));
            }
            (_, Some(company_id)) => {
                self.company(company_id).await?;
            }
            _ => {}
        }

        if self.account_holder_for(person_id).await?.is_some() {
            return Err(ClinicError::Conflict(format!(
                "{} is already an account holder",
                person.full_name()
            )));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO account_holders (id, person_id, kind, company_id) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(person_id)
        .bind(kind.as_str())
        .bind(company_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ClinicError::from(e).on_unique("person is already an account holder"))?;

        info!(person_id, kind = kind.as_str(), "account holder created");
        Ok(AccountHolder {
            id,
            person_id: person_id.to_string(),
            kind,
            company_id: company_id.map(str::to_string),
        })
    }

    /// Holder rows a person depends on, joined with the holder's kind.
    pub(crate) async fn holders_of_dependent(
        &self,
        person_id: &str,
    ) -> Result<Vec<AccountHolder>> {
        let rows = sqlx::query(
            "SELECT h.id, h.person_id, h.kind, h.company_id
             FROM dependents d JOIN account_holders h ON h.id = d.holder_id
             WHERE d.person_id = ?",
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(holder_from_row).collect()
    }

    /// Link a person under a holder. Exact (person, holder) duplicates are
    /// rejected; a second link under a different holder is tolerated.
    #[instrument(skip(self, session))]
    pub async fn attach_dependent(
        &self,
        session: &Session,
        person_id: &str,
        holder_id: &str,
    ) -> Result<Dependent> {
        self.authorize(session, Permission::ManageAffiliations)?;
        self.person(person_id).await?;

        let holder = sqlx::query("SELECT id FROM account_holders WHERE id = ?")
            .bind(holder_id)
            .fetch_optional(&self.pool)
            .await?;
        if holder.is_none() {
            return Err(ClinicError::not_found("account holder", holder_id));
        }

        let existing = sqlx::query(
            "SELECT id FROM dependents WHERE person_id = ? AND holder_id = ?",
        )
        .bind(person_id)
        .bind(holder_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(ClinicError::Conflict(
                "person is already a dependent of this holder".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO dependents (id, person_id, holder_id) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(person_id)
            .bind(holder_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                ClinicError::from(e).on_unique("person is already a dependent of this holder")
            })?;

        info!(person_id, holder_id, "dependent attached");
        Ok(Dependent {
            id,
            person_id: person_id.to_string(),
            holder_id: holder_id.to_string(),
        })
    }

    #[instrument(skip(self, session))]
    pub async fn detach_dependent(
        &self,
        session: &Session,
        person_id: &str,
        holder_id: &str,
    ) -> Result<()> {
        self.authorize(session, Permission::ManageAffiliations)?;
        let deleted = sqlx::query(
            "DELETE FROM dependents WHERE person_id = ? AND holder_id = ?",
        )
        .bind(person_id)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(ClinicError::not_found("dependent link", person_id));
        }
        Ok(())
    }

    /// Idempotent get-or-create of the clinical anchor for a person. The
    /// conflict-tolerant insert lets two concurrent first touches race
    /// safely to the same row.
    pub async fn ensure_patient_record(&self, person_id: &str) -> Result<PatientRecord> {
        self.person(person_id).await?;

        sqlx::query(
            "INSERT INTO patient_records (id, person_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT (person_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(person_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM patient_records WHERE person_id = ?")
            .bind(person_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(PatientRecord {
            id: row.try_get("id")?,
            person_id: row.try_get("person_id")?,
            created_at: datetime_from_unix(row.try_get("created_at")?)?,
        })
    }

    pub async fn company(&self, id: &str) -> Result<Company> {
        let row = sqlx::query("SELECT * FROM companies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClinicError::not_found("company", id))?;
        Ok(Company {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            tax_id: row.try_get("tax_id")?,
            phone: row.try_get("phone")?,
            address: row.try_get("address")?,
        })
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>> {
        let rows = sqlx::query("SELECT * FROM companies ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Company {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    tax_id: row.try_get("tax_id")?,
                    phone: row.try_get("phone")?,
                    address: row.try_get("address")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, session, draft), fields(tax_id = %draft.tax_id))]
    pub async fn create_company(&self, session: &Session, draft: CompanyDraft) -> Result<Company> {
        self.authorize(session, Permission::ManageAffiliations)?;
        if draft.name.trim().is_empty() {
            return Err(ClinicError::validation("name", "must not be empty"));
        }
        if draft.tax_id.trim().is_empty() {
            return Err(ClinicError::validation("tax_id", "must not be empty"));
        }

        let clash = sqlx::query("SELECT id FROM companies WHERE tax_id = ?")
            .bind(&draft.tax_id)
            .fetch_optional(&self.pool)
            .await?;
        if clash.is_some() {
            return Err(ClinicError::Conflict(format!(
                "a company with tax id {} already exists",
                draft.tax_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO companies (id, name, tax_id, phone, address) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(draft.name.trim())
        .bind(&draft.tax_id)
        .bind(&draft.phone)
        .bind(&draft.address)
        .execute(&self.pool)
        .await
        .map_err(|e| ClinicError::from(e).on_unique("tax id already registered"))?;

        self.company(&id).await
    }

    /// Remove a company. Holder rows keep existing with their company
    /// reference cleared (FK SET NULL), never cascaded.
    #[instrument(skip(self, session))]
    pub async fn delete_company(&self, session: &Session, id: &str) -> Result<()> {
        self.authorize(session, Permission::ManageAffiliations)?;
        let deleted = sqlx::query("DELETE FROM companies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ClinicError::not_found("company", id));
        }
        info!(company_id = id, "company deleted, holder references cleared");
        Ok(())
    }
}

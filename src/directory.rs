//! Directory search: the partial-match person lookup every higher-level
//! flow uses to attach an identity to an action. Read-only; debounce timing
//! is the caller's concern.

use sqlx::Row;
use tracing::instrument;

use crate::db::Clinic;
use crate::error::Result;
use crate::identity::person_from_row;
use crate::models::DirectoryMatch;

/// Queries below this length return nothing unless the caller asks for the
/// unfiltered browse-all set.
const MIN_QUERY_LEN: usize = 2;

impl Clinic {
    /// Case-insensitive partial match on name or national id. Case folding
    /// follows SQLite `LIKE`, which is ASCII-only: "pérez" matches "pérez"
    /// but not "Pérez". Document matches rank ahead of name matches. Each
    /// hit carries the person's current roles so callers disambiguate
    /// without a second round trip.
    #[instrument(skip(self))]
    pub async fn search_directory(
        &self,
        query: &str,
        include_all: bool,
    ) -> Result<Vec<DirectoryMatch>> {
        let query = query.trim();
        if query.len() < MIN_QUERY_LEN && !include_all {
            return Ok(Vec::new());
        }

        let pattern = format!("%{query}%");
        let rows = sqlx::query(
            "SELECT * FROM persons
             WHERE first_name LIKE ? OR last_name LIKE ?
                OR (nationality || '-' || national_id) LIKE ?
             ORDER BY
                CASE WHEN (nationality || '-' || national_id) LIKE ? THEN 0 ELSE 1 END,
                last_name, first_name",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let person = person_from_row(row)?;
            let holder_kind = self
                .account_holder_for(&person.id)
                .await?
                .map(|h| h.kind);

            let holder_names = sqlx::query(
                "SELECT p.first_name, p.last_name
                 FROM dependents d
                 JOIN account_holders h ON h.id = d.holder_id
                 JOIN persons p ON p.id = h.person_id
                 WHERE d.person_id = ?
                 ORDER BY p.last_name",
            )
            .bind(&person.id)
            .fetch_all(&self.pool)
            .await?;
            let dependent_of = holder_names
                .iter()
                .map(|r| {
                    let first: String = r.try_get("first_name")?;
                    let last: String = r.try_get("last_name")?;
                    Ok(format!("{first} {last}"))
                })
                .collect::<Result<Vec<_>>>()?;

            matches.push(DirectoryMatch { person, holder_kind, dependent_of });
        }
        Ok(matches)
    }
}

//! Access control gate: authentication, the live session registry and the
//! single `authorize` surface every mutating operation goes through.
//!
//! There is deliberately no role-name comparison anywhere outside this
//! module; callers hold a [`Session`] and services ask for a [`Permission`].
//! The registry copy of a session is refreshed in place when the user's own
//! profile changes, so held tokens reflect edits without re-authentication.

use std::collections::HashSet;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{datetime_from_unix, Clinic};
use crate::error::{ClinicError, Result};
use crate::models::{Permission, Role, Session, User, UserDraft, UserUpdate};

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// PHC-string Argon2id hash; the salt travels inside the string.
pub(crate) fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ClinicError::Integrity(format!("password hashing failed: {e}")))
}

/// Constant outcome for malformed stored hashes: they verify as wrong.
pub(crate) fn verify_secret(secret: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn new_token() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    hex(&Sha256::digest(raw))
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        role: row.try_get("role")?,
        person_id: row.try_get("person_id")?,
        created_at: datetime_from_unix(row.try_get("created_at")?)?,
    })
}

impl Clinic {
    /// Verify credentials and open a session. Unknown usernames and wrong
    /// secrets produce the same message; nothing leaks which half failed.
    #[instrument(skip(self, secret))]
    pub async fn authenticate(&self, username: &str, secret: &str) -> Result<Session> {
        let denied = || ClinicError::Unauthorized("invalid credentials".into());

        let row = sqlx::query(
            "SELECT u.id, u.password_hash, u.person_id, u.role_id, r.name AS role
             FROM users u JOIN roles r ON r.id = u.role_id
             WHERE u.username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(denied)?;

        let stored: String = row.try_get("password_hash")?;
        if !verify_secret(secret, &stored) {
            warn!(username, "rejected login");
            return Err(denied());
        }

        let role_id: String = row.try_get("role_id")?;
        let session = Session {
            token: new_token(),
            user_id: row.try_get("id")?,
            username: username.to_string(),
            role: row.try_get("role")?,
            permissions: self.role_permissions(&role_id).await?,
            person_id: row.try_get("person_id")?,
        };
        self.sessions.insert(session.token.clone(), session.clone());
        info!(username, role = %session.role, "session opened");
        Ok(session)
    }

    pub fn end_session(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Current registry copy of a session, reflecting any profile refresh
    /// since login.
    pub fn session(&self, token: &str) -> Result<Session> {
        self.sessions
            .get(token)
            .map(|s| s.value().clone())
            .ok_or_else(|| ClinicError::Unauthorized("session expired or unknown".into()))
    }

    /// The one authorization check. Resolves the caller's live session and
    /// fails closed before any data is touched. Returns the live copy so
    /// services can record the acting user.
    pub fn authorize(&self, session: &Session, permission: Permission) -> Result<Session> {
        let live = self.session(&session.token)?;
        if !live.permissions.contains(&permission) {
            warn!(
                username = %live.username,
                permission = permission.as_str(),
                "denied"
            );
            return Err(ClinicError::Unauthorized(format!(
                "role '{}' lacks permission '{}'",
                live.role,
                permission.as_str()
            )));
        }
        Ok(live)
    }

    async fn role_permissions(&self, role_id: &str) -> Result<HashSet<Permission>> {
        let rows = sqlx::query("SELECT permission FROM permissions WHERE role_id = ?")
            .bind(role_id)
            .fetch_all(&self.pool)
            .await?;
        let mut set = HashSet::new();
        for row in rows {
            let name: String = row.try_get("permission")?;
            // Unknown rows are skipped rather than fatal so an older binary
            // tolerates a newer seed.
            if let Some(p) = Permission::parse(&name) {
                set.insert(p);
            }
        }
        Ok(set)
    }

    async fn role_id_by_name(&self, name: &str) -> Result<String> {
        sqlx::query("SELECT id FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get("id"))
            .ok_or_else(|| ClinicError::validation("role", format!("unknown role '{name}'")))
    }

    /// Roles available for assignment, with their permission bundles.
    pub async fn list_roles(&self, session: &Session) -> Result<Vec<Role>> {
        self.authorize(session, Permission::ManageUsers)?;
        let rows = sqlx::query("SELECT id, name FROM roles ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut roles = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            roles.push(Role {
                permissions: self.role_permissions(&id).await?,
                id,
                name: row.try_get("name")?,
            });
        }
        Ok(roles)
    }

    /// List users, optionally filtered by partial username match.
    pub async fn list_users(&self, session: &Session, query: Option<&str>) -> Result<Vec<User>> {
        self.authorize(session, Permission::ManageUsers)?;
        let pattern = format!("%{}%", query.unwrap_or(""));
        let rows = sqlx::query(
            "SELECT u.id, u.username, u.person_id, u.created_at, r.name AS role
             FROM users u JOIN roles r ON r.id = u.role_id
             WHERE u.username LIKE ?
             ORDER BY u.username",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    #[instrument(skip(self, session, draft), fields(username = %draft.username))]
    pub async fn create_user(&self, session: &Session, draft: UserDraft) -> Result<User> {
        self.authorize(session, Permission::ManageUsers)?;

        let username = draft.username.trim();
        if username.is_empty() {
            return Err(ClinicError::validation("username", "must not be empty"));
        }
        if draft.secret.len() < 4 {
            return Err(ClinicError::validation("secret", "too short"));
        }
        let role_id = self.role_id_by_name(&draft.role).await?;
        if let Some(person_id) = &draft.person_id {
            self.person(person_id).await?;
        }

        let taken = sqlx::query("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(ClinicError::Conflict(format!(
                "username '{username}' is already taken"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, role_id, person_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(username)
        .bind(hash_secret(&draft.secret)?)
        .bind(&role_id)
        .bind(&draft.person_id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ClinicError::from(e).on_unique(&format!("username '{username}' is already taken"))
        })?;

        info!(username, role = %draft.role, "user created");
        Ok(User {
            id,
            username: username.to_string(),
            role: draft.role,
            person_id: draft.person_id,
            created_at: datetime_from_unix(now.timestamp())?,
        })
    }

    /// Apply a partial edit to a user. Every live session belonging to that
    /// user is refreshed in place so later authorization checks see the new
    /// username, role, permission set and linked person immediately.
    #[instrument(skip(self, session, update))]
    pub async fn update_user(&self, session: &Session, id: &str, update: UserUpdate) -> Result<User> {
        self.authorize(session, Permission::ManageUsers)?;

        let current = sqlx::query(
            "SELECT u.id, u.username, u.person_id, u.created_at, u.role_id, r.name AS role
             FROM users u JOIN roles r ON r.id = u.role_id
             WHERE u.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ClinicError::not_found("user", id))?;

        let username = match &update.username {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(ClinicError::validation("username", "must not be empty"));
                }
                let clash = sqlx::query("SELECT id FROM users WHERE username = ? AND id != ?")
                    .bind(name)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                if clash.is_some() {
                    return Err(ClinicError::Conflict(format!(
                        "username '{name}' is already taken"
                    )));
                }
                name.to_string()
            }
            None => current.try_get("username")?,
        };

        let role_name = match &update.role {
            Some(role) => role.clone(),
            None => current.try_get("role")?,
        };
        let role_id = self.role_id_by_name(&role_name).await?;

        let person_id = match &update.person_id {
            Some(value) => {
                if let Some(pid) = value {
                    self.person(pid).await?;
                }
                value.clone()
            }
            None => current.try_get("person_id")?,
        };

        // Secret and profile change as one unit: a rejected edit must not
        // leave a half-applied password rotation behind.
        let mut tx = self.pool.begin().await?;
        if let Some(secret) = &update.secret {
            if secret.len() < 4 {
                return Err(ClinicError::validation("secret", "too short"));
            }
            sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
                .bind(hash_secret(secret)?)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE users SET username = ?, role_id = ?, person_id = ? WHERE id = ?")
            .bind(&username)
            .bind(&role_id)
            .bind(&person_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                ClinicError::from(e).on_unique(&format!("username '{username}' is already taken"))
            })?;
        tx.commit().await?;

        // Refresh every live session for this user.
        let permissions = self.role_permissions(&role_id).await?;
        for mut entry in self.sessions.iter_mut() {
            if entry.user_id == id {
                entry.username = username.clone();
                entry.role = role_name.clone();
                entry.permissions = permissions.clone();
                entry.person_id = person_id.clone();
            }
        }

        info!(username = %username, "user updated");
        Ok(User {
            id: id.to_string(),
            username,
            role: role_name,
            person_id,
            created_at: datetime_from_unix(current.try_get("created_at")?)?,
        })
    }

    /// Delete a user. A user may not delete their own account, regardless of
    /// permissions; all of the target's live sessions are dropped.
    #[instrument(skip(self, session))]
    pub async fn delete_user(&self, session: &Session, id: &str) -> Result<()> {
        let actor = self.authorize(session, Permission::ManageUsers)?;
        if actor.user_id == id {
            return Err(ClinicError::Unauthorized(
                "a user may not delete their own account".into(),
            ));
        }

        let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ClinicError::not_found("user", id));
        }

        self.sessions.retain(|_, s| s.user_id != id);
        info!(user_id = id, "user deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn admin(clinic: &Clinic) -> Session {
        clinic.authenticate("admin", "admin").await.unwrap()
    }

    #[tokio::test]
    async fn wrong_secret_and_unknown_user_look_identical() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let a = clinic.authenticate("admin", "nope").await.unwrap_err();
        let b = clinic.authenticate("ghost", "nope").await.unwrap_err();
        assert_eq!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn logout_invalidates_the_token() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        clinic.end_session(&session.token);
        let err = clinic.authorize(&session, Permission::ManageUsers).unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn non_superuser_cannot_manage_users() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        clinic
            .create_user(
                &session,
                UserDraft {
                    username: "dra.rivas".into(),
                    secret: "consulta".into(),
                    role: "medico".into(),
                    person_id: None,
                },
            )
            .await
            .unwrap();

        let medico = clinic.authenticate("dra.rivas", "consulta").await.unwrap();
        let err = clinic.list_users(&medico, None).await.unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn seeded_roles_carry_their_permission_bundles() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        let roles = clinic.list_roles(&session).await.unwrap();
        assert_eq!(roles.len(), 3);
        let superuser = roles.iter().find(|r| r.name == "superuser").unwrap();
        assert_eq!(superuser.permissions.len(), Permission::ALL.len());
        let medico = roles.iter().find(|r| r.name == "medico").unwrap();
        assert!(medico.permissions.contains(&Permission::RecordConsultations));
        assert!(!medico.permissions.contains(&Permission::ManageUsers));
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        let draft = UserDraft {
            username: "recepcion1".into(),
            secret: "turno".into(),
            role: "recepcion".into(),
            person_id: None,
        };
        clinic.create_user(&session, draft.clone()).await.unwrap();
        let err = clinic.create_user(&session, draft).await.unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }

    #[tokio::test]
    async fn self_profile_edit_refreshes_the_live_session() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        let user = clinic
            .create_user(
                &session,
                UserDraft {
                    username: "dr.paez".into(),
                    secret: "consulta".into(),
                    role: "medico".into(),
                    person_id: None,
                },
            )
            .await
            .unwrap();
        let doctor = clinic.authenticate("dr.paez", "consulta").await.unwrap();
        assert!(!doctor.permissions.contains(&Permission::ManageUsers));

        clinic
            .update_user(
                &session,
                &user.id,
                UserUpdate { role: Some("superuser".into()), ..Default::default() },
            )
            .await
            .unwrap();

        let live = clinic.session(&doctor.token).unwrap();
        assert_eq!(live.role, "superuser");
        assert!(live.permissions.contains(&Permission::ManageUsers));
        // The old token now authorizes without re-authentication.
        clinic.authorize(&doctor, Permission::ManageUsers).unwrap();
    }

    #[tokio::test]
    async fn rejected_user_edit_leaves_the_secret_unchanged() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        for name in ["uno", "dos"] {
            clinic
                .create_user(
                    &session,
                    UserDraft {
                        username: name.into(),
                        secret: format!("clave-{name}"),
                        role: "recepcion".into(),
                        person_id: None,
                    },
                )
                .await
                .unwrap();
        }
        let dos = clinic
            .list_users(&session, Some("dos"))
            .await
            .unwrap()
            .remove(0);

        let err = clinic
            .update_user(
                &session,
                &dos.id,
                UserUpdate {
                    username: Some("uno".into()),
                    secret: Some("clave-nueva".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));

        // The rejected edit rotated nothing.
        clinic.authenticate("dos", "clave-dos").await.unwrap();
        assert!(clinic.authenticate("dos", "clave-nueva").await.is_err());
    }

    #[tokio::test]
    async fn a_user_cannot_delete_their_own_account() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        let err = clinic.delete_user(&session, &session.user_id).await.unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
        // Still present and usable.
        clinic.authenticate("admin", "admin").await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_user_drops_their_sessions() {
        let clinic = Clinic::open_in_memory().await.unwrap();
        let session = admin(&clinic).await;
        let user = clinic
            .create_user(
                &session,
                UserDraft {
                    username: "temporal".into(),
                    secret: "breve".into(),
                    role: "recepcion".into(),
                    person_id: None,
                },
            )
            .await
            .unwrap();
        let temp = clinic.authenticate("temporal", "breve").await.unwrap();
        clinic.delete_user(&session, &user.id).await.unwrap();
        assert!(clinic.session(&temp.token).is_err());
    }
}

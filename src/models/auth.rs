use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The unit of authorization. Every mutating entry point names exactly one
/// of these; nothing in the codebase compares role names inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    ManagePersons,
    ManageAffiliations,
    ManageQueue,
    RecordConsultations,
    ManageTreatments,
    ManageCatalog,
    ManageUsers,
    ViewReports,
}

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::ManagePersons,
        Permission::ManageAffiliations,
        Permission::ManageQueue,
        Permission::RecordConsultations,
        Permission::ManageTreatments,
        Permission::ManageCatalog,
        Permission::ManageUsers,
        Permission::ViewReports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ManagePersons => "manage_persons",
            Permission::ManageAffiliations => "manage_affiliations",
            Permission::ManageQueue => "manage_queue",
            Permission::RecordConsultations => "record_consultations",
            Permission::ManageTreatments => "manage_treatments",
            Permission::ManageCatalog => "manage_catalog",
            Permission::ManageUsers => "manage_users",
            Permission::ViewReports => "view_reports",
        }
    }

    /// Module the permission belongs to, used to group the seeded rows.
    pub fn module(&self) -> &'static str {
        match self {
            Permission::ManagePersons => "identidad",
            Permission::ManageAffiliations => "afiliaciones",
            Permission::ManageQueue => "cola",
            Permission::RecordConsultations => "consultas",
            Permission::ManageTreatments => "tratamientos",
            Permission::ManageCatalog => "catalogo",
            Permission::ManageUsers => "usuarios",
            Permission::ViewReports => "reportes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Permission::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

/// Named permission bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub permissions: HashSet<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
    /// Optional link to a person, used only to display a human name.
    pub person_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDraft {
    pub username: String,
    pub secret: String,
    pub role: String,
    pub person_id: Option<String>,
}

/// Partial user edit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub secret: Option<String>,
    pub role: Option<String>,
    pub person_id: Option<Option<String>>,
}

/// Explicit per-call context for the access control gate. Created on login,
/// dropped on logout; the gate refreshes the registry copy in place when the
/// user's own profile changes, so a held token never goes stale.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub permissions: HashSet<Permission>,
    pub person_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_strings_are_distinct_and_parseable() {
        let mut seen = HashSet::new();
        for p in Permission::ALL {
            assert!(seen.insert(p.as_str()), "duplicate string for {p:?}");
            assert_eq!(Permission::parse(p.as_str()), Some(p));
        }
        assert_eq!(Permission::parse("superuser"), None);
    }
}

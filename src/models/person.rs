use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Canonical identity. Created once per real individual; demographic edits
/// re-key nothing because clinical rows hang off [`PatientRecord`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    /// Nationality letter of the national id, e.g. "V" or "E".
    pub nationality: String,
    pub national_id: String,
    pub birth_date: NaiveDate,
    pub sex: String,
    pub phone: Option<String>,
    pub phone_alt: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// "V-23456789" style rendering used by the directory.
    pub fn document(&self) -> String {
        format!("{}-{}", self.nationality, self.national_id)
    }
}

/// Input for creating or fully updating a [`Person`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonDraft {
    pub first_name: String,
    pub last_name: String,
    pub nationality: String,
    pub national_id: String,
    pub birth_date: NaiveDate,
    pub sex: String,
    pub phone: Option<String>,
    pub phone_alt: Option<String>,
    pub email: Option<String>,
}

/// Billing/affiliation kind of an account holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HolderKind {
    InternalEmployee,
    CorporateAffiliate,
    Private,
}

impl HolderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolderKind::InternalEmployee => "empleado_interno",
            HolderKind::CorporateAffiliate => "afiliado_corporativo",
            HolderKind::Private => "privado",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empleado_interno" => Some(HolderKind::InternalEmployee),
            "afiliado_corporativo" => Some(HolderKind::CorporateAffiliate),
            "privado" => Some(HolderKind::Private),
            _ => None,
        }
    }

    /// Account-type label derived onto a queue entry.
    pub fn account_label(&self) -> &'static str {
        match self {
            HolderKind::InternalEmployee => "Empleado",
            HolderKind::CorporateAffiliate => "Afiliado Corporativo",
            HolderKind::Private => "Privado",
        }
    }
}

/// A person acting as the root of an affiliation (titular). One per person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountHolder {
    pub id: String,
    pub person_id: String,
    pub kind: HolderKind,
    /// Required iff `kind` is [`HolderKind::CorporateAffiliate`]. Cleared,
    /// not cascaded, when the company is deleted.
    pub company_id: Option<String>,
}

/// Link row putting a person under a holder's affiliation (beneficiario).
/// The (person, holder) pair is unique; a person may appear under several
/// different holders through separate rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependent {
    pub id: String,
    pub person_id: String,
    pub holder_id: String,
}

/// Stable anchor for clinical history, 1:1 with [`Person`]. Created lazily
/// by the first clinical action and never re-keyed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: String,
    pub person_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub tax_id: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyDraft {
    pub name: String,
    pub tax_id: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// One directory search hit, annotated with the person's current roles so
/// callers can disambiguate without a second round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMatch {
    pub person: Person,
    pub holder_kind: Option<HolderKind>,
    /// Full names of the holders this person depends on.
    pub dependent_of: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_kind_round_trips_through_storage_string() {
        for kind in [
            HolderKind::InternalEmployee,
            HolderKind::CorporateAffiliate,
            HolderKind::Private,
        ] {
            assert_eq!(HolderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(HolderKind::parse("titular"), None);
    }

    #[test]
    fn account_labels_match_the_affiliation_kinds() {
        assert_eq!(HolderKind::InternalEmployee.account_label(), "Empleado");
        assert_eq!(
            HolderKind::CorporateAffiliate.account_label(),
            "Afiliado Corporativo"
        );
        assert_eq!(HolderKind::Private.account_label(), "Privado");
    }
}

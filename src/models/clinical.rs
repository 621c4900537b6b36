use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a waiting-room entry. Forward-only: Esperando entries are
/// called into consultation, and only a saved consultation completes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    Esperando,
    EnConsulta,
    Completado,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Esperando => "esperando",
            VisitStatus::EnConsulta => "en_consulta",
            VisitStatus::Completado => "completado",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "esperando" => Some(VisitStatus::Esperando),
            "en_consulta" => Some(VisitStatus::EnConsulta),
            "completado" => Some(VisitStatus::Completado),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VisitStatus::Esperando => "Esperando",
            VisitStatus::EnConsulta => "En Consulta",
            VisitStatus::Completado => "Completado",
        }
    }
}

/// Whether the visitor checked in as the affiliation root or as a dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitKind {
    Titular,
    Beneficiario,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitKind::Titular => "titular",
            VisitKind::Beneficiario => "beneficiario",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "titular" => Some(VisitKind::Titular),
            "beneficiario" => Some(VisitKind::Beneficiario),
            _ => None,
        }
    }
}

/// One waiting-room instance. At most one non-Completado entry exists per
/// person at any time. Completed entries stay behind as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub person_id: String,
    pub patient_record_id: String,
    pub kind: VisitKind,
    pub service: String,
    /// Derived from the holder kind at enqueue time, never supplied.
    pub account_type: String,
    pub status: VisitStatus,
    pub checked_in_at: DateTime<Utc>,
}

/// Immutable-once-saved clinical note closing a visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub id: String,
    pub patient_record_id: String,
    pub queue_entry_id: Option<String>,
    pub anamnesis: String,
    pub physical_exam: String,
    pub treatment_plan: Option<String>,
    pub recorded_by: String,
    pub recorded_at: DateTime<Utc>,
    pub diagnoses: Vec<Diagnosis>,
    pub documents: Vec<Document>,
}

/// CIE-10 code + description pair attached to a consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisDraft {
    pub code: String,
    pub description: String,
}

/// Binary attachment saved with a consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub consultation_id: String,
    pub kind: String,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub kind: String,
    pub description: Option<String>,
    pub payload: Vec<u8>,
}

/// Everything a consultation saves in one atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationDraft {
    pub patient_record_id: String,
    /// Visit this consultation closes; must be En Consulta when given.
    pub queue_entry_id: Option<String>,
    pub anamnesis: String,
    pub physical_exam: String,
    pub treatment_plan: Option<String>,
    pub diagnoses: Vec<DiagnosisDraft>,
    pub treatment_items: Vec<TreatmentItemDraft>,
    pub documents: Vec<DocumentDraft>,
}

/// Lifecycle of a standing treatment order. Leaving Activo is terminal for
/// new executions; history stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Activo,
    Completado,
    Cancelado,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Activo => "activo",
            OrderStatus::Completado => "completado",
            OrderStatus::Cancelado => "cancelado",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activo" => Some(OrderStatus::Activo),
            "completado" => Some(OrderStatus::Completado),
            "cancelado" => Some(OrderStatus::Cancelado),
            _ => None,
        }
    }
}

/// Standing prescription owning zero or more executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentOrder {
    pub id: String,
    pub patient_record_id: String,
    pub consultation_id: Option<String>,
    pub procedure: String,
    pub frequency: String,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
    pub status: OrderStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Standalone order creation input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentOrderDraft {
    pub patient_record_id: String,
    pub procedure: String,
    pub frequency: String,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
}

/// Order item recorded as part of a consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentItemDraft {
    pub procedure: String,
    pub frequency: String,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
}

/// One application of a treatment order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentExecution {
    pub id: String,
    pub order_id: String,
    pub executed_at: DateTime<Utc>,
    pub observations: Option<String>,
    pub executed_by: String,
}

/// Catalog diagnosis code. Natural primary key, pattern-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cie10Code {
    pub code: String,
    pub description: String,
}

impl Cie10Code {
    /// Letter, two digits, optional ".<one or two digits or X>" suffix.
    /// "A09", "I10", "E11.9", "J45.20" all pass.
    pub fn valid_code(code: &str) -> bool {
        let bytes = code.as_bytes();
        if bytes.len() < 3 || !bytes[0].is_ascii_uppercase() {
            return false;
        }
        if !bytes[1].is_ascii_digit() || !bytes[2].is_ascii_digit() {
            return false;
        }
        match &bytes[3..] {
            [] => true,
            [b'.', rest @ ..] => {
                !rest.is_empty()
                    && rest.len() <= 2
                    && rest.iter().all(|b| b.is_ascii_digit() || *b == b'X')
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_status_round_trips() {
        for status in [
            VisitStatus::Esperando,
            VisitStatus::EnConsulta,
            VisitStatus::Completado,
        ] {
            assert_eq!(VisitStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn cie10_pattern_accepts_catalog_shapes() {
        for code in ["A09", "I10", "E11.9", "J45.20", "M54.5", "Z00.0X"] {
            assert!(Cie10Code::valid_code(code), "expected valid: {code}");
        }
    }

    #[test]
    fn cie10_pattern_rejects_malformed_codes() {
        for code in ["", "10A", "a09", "A0", "A09.", "A09.123", "A09-1", "AB9"] {
            assert!(!Cie10Code::valid_code(code), "expected invalid: {code}");
        }
    }
}

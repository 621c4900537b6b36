//! Entity and draft types shared across the service modules.

pub mod auth;
pub mod clinical;
pub mod person;

pub use auth::{Permission, Role, Session, User, UserDraft, UserUpdate};
pub use clinical::{
    Cie10Code, Consultation, ConsultationDraft, Diagnosis, DiagnosisDraft, Document,
    DocumentDraft, OrderStatus, QueueEntry, TreatmentExecution, TreatmentItemDraft,
    TreatmentOrder, TreatmentOrderDraft, VisitKind, VisitStatus,
};
pub use person::{
    AccountHolder, Company, CompanyDraft, Dependent, DirectoryMatch, HolderKind,
    PatientRecord, Person, PersonDraft,
};

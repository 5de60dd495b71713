//! Integration events exchanged between the business modules.
//!
//! These are contracts, not domain objects: they carry identifiers and the
//! few fields a consumer needs to react without calling back into the
//! producing module.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::IntegrationEvent;

/// Raised by the request module when a request is submitted for appraisal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubmitted {
    pub request_id: Uuid,
    pub request_number: String,
}

impl IntegrationEvent for RequestSubmitted {
    const EVENT_TYPE: &'static str = "RequestSubmitted";
}

/// Raised by the appraisal module once an appraisal is opened for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppraisalCreated {
    pub appraisal_id: Uuid,
    pub request_id: Uuid,
    pub appraisal_number: String,
}

impl IntegrationEvent for AppraisalCreated {
    const EVENT_TYPE: &'static str = "AppraisalCreated";
}

/// Raised by the document module after a file is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUploaded {
    pub document_id: Uuid,
    pub request_id: Uuid,
    pub file_name: String,
}

impl IntegrationEvent for DocumentUploaded {
    const EVENT_TYPE: &'static str = "DocumentUploaded";
}

/// Raised by the assignment module when an assignee finishes their work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCompleted {
    pub assignment_id: Uuid,
    pub appraisal_id: Uuid,
    pub completed_by: String,
}

impl IntegrationEvent for AssignmentCompleted {
    const EVENT_TYPE: &'static str = "AssignmentCompleted";
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inferlink_core::{JobId, TenantId};

/// Envelope for an outbound event with tenant + job metadata.
///
/// `event_id` is fresh per publish; subscribers that need to deduplicate
/// should key on `(job_id, payload)` rather than on the envelope id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,
    job_id: JobId,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(tenant_id: TenantId, job_id: JobId, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            job_id,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

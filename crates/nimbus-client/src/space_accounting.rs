//! Client side of the space accounting service.
//!
//! Usage events are pushed one-way to the collector's pull endpoint; usage
//! queries are request/reply against its reply endpoint.

use std::sync::Arc;

use nimbus_types::{RequestId, TenantId, Timestamp};
use nimbus_wire::message::{SpaceAccountingDetail, SpaceEvent, SpaceUsageRequest};
use nimbus_wire::{Message, WireFrame};
use tracing::trace;

use crate::error::{ClientError, ClientResult};
use crate::resilient::ResilientClient;

/// Byte totals reported for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    pub bytes_added: u64,
    pub bytes_removed: u64,
    pub bytes_retrieved: u64,
}

#[derive(Debug, Clone)]
pub struct SpaceAccountingClient {
    push: Arc<ResilientClient>,
    requests: Option<Arc<ResilientClient>>,
}

impl SpaceAccountingClient {
    /// `requests` may be `None` for writers that only report events.
    pub fn new(push: Arc<ResilientClient>, requests: Option<Arc<ResilientClient>>) -> Self {
        Self { push, requests }
    }

    pub fn added(&self, tenant_id: TenantId, timestamp: Timestamp, bytes: u64) -> ClientResult<()> {
        self.report(tenant_id, timestamp, SpaceEvent::BytesAdded, bytes)
    }

    pub fn retrieved(&self, tenant_id: TenantId, timestamp: Timestamp, bytes: u64) -> ClientResult<()> {
        self.report(tenant_id, timestamp, SpaceEvent::BytesRetrieved, bytes)
    }

    pub fn removed(&self, tenant_id: TenantId, timestamp: Timestamp, bytes: u64) -> ClientResult<()> {
        self.report(tenant_id, timestamp, SpaceEvent::BytesRemoved, bytes)
    }

    fn report(
        &self,
        tenant_id: TenantId,
        timestamp: Timestamp,
        event: SpaceEvent,
        value: u64,
    ) -> ClientResult<()> {
        trace!(tenant = %tenant_id, ?event, value, "space accounting event");
        self.push.push(Message::SpaceAccountingDetail(SpaceAccountingDetail {
            tenant_id,
            timestamp,
            event,
            value,
        }))
    }

    pub fn get_space_usage(&self, tenant_id: TenantId) -> ClientResult<SpaceUsage> {
        let Some(requests) = self.requests.as_ref() else {
            return Err(ClientError::DestinationUnreachable {
                node: self.push.node().clone(),
            });
        };

        let reply = requests.request(Message::SpaceUsageRequest(SpaceUsageRequest {
            request_id: RequestId::default(),
            tenant_id,
        }))?;

        match reply {
            WireFrame::Message(envelope) => match envelope.message {
                Message::SpaceUsageReply(reply) if reply.status.is_success() => Ok(SpaceUsage {
                    bytes_added: reply.bytes_added,
                    bytes_removed: reply.bytes_removed,
                    bytes_retrieved: reply.bytes_retrieved,
                }),
                Message::SpaceUsageReply(reply) => Err(ClientError::remote(
                    reply.status.result,
                    reply.status.error_message.unwrap_or_default(),
                )),
                other => Err(ClientError::UnexpectedReply {
                    expected: "space-usage-reply",
                    actual: other.kind().to_string(),
                }),
            },
            other => Err(ClientError::UnexpectedReply {
                expected: "space-usage-reply",
                actual: other.describe().to_string(),
            }),
        }
    }
}

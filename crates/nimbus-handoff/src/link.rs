//! The request/reply seam between handoff logic and the network.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nimbus_client::{ClientResult, ResilientClient};
use nimbus_types::{NodeName, RequestId};
use nimbus_wire::message::{ArchiveKeyEntire, HintedHandoff};
use nimbus_wire::{Message, MessageEnvelope, SegmentDescriptor, WireFrame};

use crate::error::{HandoffError, HandoffResult};

/// A request/reply connection to one service on one node.
pub trait Link: Send + Sync {
    fn node(&self) -> &NodeName;

    /// Whether a request sent now has a chance of getting through.
    fn is_reachable(&self) -> bool;

    /// Sends a request and waits for its reply.
    fn request(&self, request: WireFrame) -> ClientResult<WireFrame>;
}

impl Link for ResilientClient {
    fn node(&self) -> &NodeName {
        ResilientClient::node(self)
    }

    fn is_reachable(&self) -> bool {
        self.is_connected()
    }

    fn request(&self, request: WireFrame) -> ClientResult<WireFrame> {
        ResilientClient::request(self, request)
    }
}

/// Links to one service, keyed by node name.
#[derive(Clone, Default)]
pub struct LinkSet {
    links: BTreeMap<NodeName, Arc<dyn Link>>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link: Arc<dyn Link>) {
        self.links.insert(link.node().clone(), link);
    }

    pub fn with(mut self, link: Arc<dyn Link>) -> Self {
        self.insert(link);
        self
    }

    pub fn get(&self, node: &NodeName) -> Option<&Arc<dyn Link>> {
        self.links.get(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Link>> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl FromIterator<Arc<dyn Link>> for LinkSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Link>>>(iter: I) -> Self {
        let mut set = LinkSet::new();
        for link in iter {
            set.insert(link);
        }
        set
    }
}

impl fmt::Debug for LinkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.links.keys()).finish()
    }
}

// ============================================================================
// Shared request helpers
// ============================================================================

/// Archives a whole segment on `link`'s writer. Returns the size of the
/// value it superseded.
pub(crate) fn archive_entire(
    link: &dyn Link,
    segment: &SegmentDescriptor,
    data: &Bytes,
) -> HandoffResult<u64> {
    let request = MessageEnvelope::with_data(
        Message::ArchiveKeyEntire(ArchiveKeyEntire {
            message_id: RequestId::default(),
            segment: segment.clone(),
        }),
        data.clone(),
    );

    match link.request(request.into())? {
        WireFrame::Message(MessageEnvelope {
            message: Message::ArchiveKeyFinalReply(reply),
            ..
        }) => {
            if reply.status.is_success() {
                Ok(reply.previous_size)
            } else {
                Err(HandoffError::Rejected {
                    node: link.node().clone(),
                    result: reply.status.result,
                    message: reply.status.error_message.unwrap_or_default(),
                })
            }
        }
        other => Err(HandoffError::UnexpectedReply {
            node: link.node().clone(),
            kind: other.describe().to_string(),
        }),
    }
}

/// Asks `link`'s handoff server to hold a segment for `original_destination`.
pub(crate) fn hinted_handoff(
    link: &dyn Link,
    original_destination: &NodeName,
    segment: &SegmentDescriptor,
    data: &Bytes,
) -> HandoffResult<()> {
    let request = MessageEnvelope::with_data(
        Message::HintedHandoff(HintedHandoff {
            message_id: RequestId::default(),
            original_destination: original_destination.clone(),
            segment: segment.clone(),
        }),
        data.clone(),
    );

    match link.request(request.into())? {
        WireFrame::Message(MessageEnvelope {
            message: Message::HintedHandoffReply(reply),
            ..
        }) => {
            if reply.status.is_success() {
                Ok(())
            } else {
                Err(HandoffError::Rejected {
                    node: link.node().clone(),
                    result: reply.status.result,
                    message: reply.status.error_message.unwrap_or_default(),
                })
            }
        }
        other => Err(HandoffError::UnexpectedReply {
            node: link.node().clone(),
            kind: other.describe().to_string(),
        }),
    }
}

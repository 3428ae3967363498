//! Contracts between the query/retrieve engine
//! and the association layer carrying its messages.
//!
//! The engine does not negotiate associations nor frame PDUs by itself.
//! Instead, it relies on the capabilities described here:
//!
//! - [`DimseResponder`] is what a query task needs
//!   to deliver responses to the requesting node;
//! - [`RetrieveChannel`] is what the retrieve orchestration needs
//!   to issue move requests and collect their responses;
//! - [`Connector`] opens retrieve channels to a remote node.
//!
//! The [`ul`](crate::ul) module implements these on top of `dicom-ul`.
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use dicom_object::InMemDicomObject;
use snafu::Snafu;

use crate::command::MoveRequest;

/// A boxed error from the underlying transport.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// could not establish association
    Establish { source: BoxError },

    /// could not encode DIMSE message
    EncodeMessage { source: crate::command::Error },

    /// could not decode DIMSE message
    DecodeMessage { source: crate::command::Error },

    /// failed to send PDU message
    Send { source: BoxError },

    /// failed to receive PDU message
    Receive { source: BoxError },

    /// could not release association
    Release { source: BoxError },

    /// association is not ready for data transfer
    NotReady,

    /// association aborted by the peer
    Aborted,

    #[snafu(display("no presentation context accepted for {}", abstract_syntax))]
    NoPresentationContext { abstract_syntax: String },

    #[snafu(display("unexpected message from peer: {}", description))]
    UnexpectedMessage { description: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The outbound path of an association,
/// as seen by a task producing DIMSE responses.
///
/// A single responder may be shared by many concurrently running tasks.
/// Implementations are responsible for serializing whole messages,
/// so that a response is never interleaved with another.
pub trait DimseResponder {
    /// Send a response command set
    /// and its optional data set
    /// through the given presentation context.
    fn send_response(
        &self,
        presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
    ) -> Result<()>;
}

impl<T> DimseResponder for &T
where
    T: DimseResponder + ?Sized,
{
    fn send_response(
        &self,
        presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
    ) -> Result<()> {
        (**self).send_response(presentation_context_id, command, dataset)
    }
}

impl<T> DimseResponder for Arc<T>
where
    T: DimseResponder + ?Sized,
{
    fn send_response(
        &self,
        presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
    ) -> Result<()> {
        (**self).send_response(presentation_context_id, command, dataset)
    }
}

/// Receiver of the responses to one request.
///
/// The channel calls `on_response` once per incoming response
/// bearing the request's message ID,
/// the terminal response being the last one.
/// Implementations should return promptly,
/// as they may be running on the channel's receiving path.
pub trait ResponseHandler: Send {
    /// Handle a response command set and its optional data set.
    fn on_response(&mut self, command: &InMemDicomObject, dataset: Option<&InMemDicomObject>);
}

/// An established association on which this node requests retrievals.
pub trait RetrieveChannel {
    /// Allocate a fresh message ID for an outgoing request.
    fn next_message_id(&mut self) -> u16;

    /// Send a C-MOVE request,
    /// registering the handler for its responses.
    fn move_request(
        &mut self,
        request: MoveRequest,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()>;

    /// Whether the association can still be used to transfer data.
    fn is_ready(&self) -> bool;

    /// Block until every registered request has received its terminal response.
    fn wait_for_outstanding(&mut self) -> Result<()>;

    /// Gracefully release the association.
    fn release(self) -> Result<()>
    where
        Self: Sized;

    /// Abort the association.
    fn abort(self) -> Result<()>
    where
        Self: Sized;
}

/// Parameters for requesting an association with a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationConfig<'a> {
    /// the remote node's address,
    /// either `host:port` or `AE-TITLE@host:port`
    pub address: Cow<'a, str>,
    /// the calling AE title
    pub calling_ae_title: Cow<'a, str>,
    /// the called AE title, if not part of the address
    pub called_ae_title: Option<Cow<'a, str>>,
    /// the abstract syntax to negotiate
    pub abstract_syntax: Cow<'a, str>,
    /// the proposed transfer syntaxes,
    /// in order of preference
    pub transfer_syntaxes: Vec<Cow<'a, str>>,
    /// whether to request relational queries/retrievals
    /// via SOP class extended negotiation
    pub relational: bool,
    /// the maximum PDU length admitted by this node
    pub max_pdu_length: u32,
    /// whether to enforce the maximum PDU length on reception
    pub strict: bool,
    /// how long to wait for each incoming response,
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl<'a> AssociationConfig<'a> {
    /// Create an association configuration
    /// with the default calling AE title `MOVESCU`,
    /// proposing _Explicit VR Little Endian_ and _Implicit VR Little Endian_.
    pub fn new(address: impl Into<Cow<'a, str>>, abstract_syntax: impl Into<Cow<'a, str>>) -> Self {
        AssociationConfig {
            address: address.into(),
            calling_ae_title: "MOVESCU".into(),
            called_ae_title: None,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()],
            relational: false,
            max_pdu_length: 16_384,
            strict: true,
            timeout: None,
        }
    }

    /// Define the calling AE title.
    pub fn calling_ae_title(mut self, calling_ae_title: impl Into<Cow<'a, str>>) -> Self {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called AE title.
    pub fn called_ae_title(mut self, called_ae_title: impl Into<Cow<'a, str>>) -> Self {
        self.called_ae_title = Some(called_ae_title.into());
        self
    }

    /// Replace the list of proposed transfer syntaxes.
    /// An empty list keeps the defaults.
    pub fn transfer_syntaxes<I, T>(mut self, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<_> = transfer_syntaxes.into_iter().map(Into::into).collect();
        if !transfer_syntaxes.is_empty() {
            self.transfer_syntaxes = transfer_syntaxes;
        }
        self
    }

    /// Request relational retrieval.
    pub fn relational(mut self, relational: bool) -> Self {
        self.relational = relational;
        self
    }

    /// Override the maximum PDU length.
    pub fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Override strict mode.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Give up waiting for a response after the given duration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Opens retrieve channels to remote nodes.
pub trait Connector {
    /// The type of channel produced.
    type Channel: RetrieveChannel;

    /// Request and establish a new association.
    fn connect(&self, config: &AssociationConfig<'_>) -> Result<Self::Channel>;
}

/// Sequential allocator of message IDs.
///
/// IDs start at 1 and wrap around without ever yielding 0.
#[derive(Debug, Clone)]
pub struct MessageIds {
    next: u16,
}

impl Default for MessageIds {
    fn default() -> Self {
        MessageIds { next: 1 }
    }
}

impl MessageIds {
    /// Take the next message ID.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_skip_zero() {
        let mut ids = MessageIds { next: u16::MAX };
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(MessageIds::default().next_id(), 1);
    }

    #[test]
    fn empty_transfer_syntax_list_keeps_defaults() {
        let config = AssociationConfig::new("QRSCP@localhost:11112", "1.2.3")
            .transfer_syntaxes(Vec::<String>::new());
        assert_eq!(config.transfer_syntaxes.len(), 2);
        let config = config.transfer_syntaxes(["1.2.840.10008.1.2"]);
        assert_eq!(config.transfer_syntaxes, vec!["1.2.840.10008.1.2"]);
    }
}

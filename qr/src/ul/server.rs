//! C-FIND service on an accepted `dicom-ul` association.
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use dicom_encoding::transfer_syntax::TransferSyntax;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::ServerAssociationOptions;
use dicom_ul::pdu::reader::MINIMUM_PDU_SIZE;
use dicom_ul::pdu::{write_pdu, Pdu};
use snafu::{OptionExt, Report, ResultExt};
use tracing::{debug, error, info, warn};

use super::boxed;
use super::pdata::{IncomingMessage, MessageAssembler};
use crate::association::{
    DecodeMessageSnafu, DimseResponder, EncodeMessageSnafu, EstablishSnafu, Result, SendSnafu,
    UnexpectedMessageSnafu,
};
use crate::command::{
    decode_dataset, encode_command, encode_dataset, message_pdus, response_command,
    transfer_syntax, C_CANCEL_RQ, C_ECHO_RQ, C_FIND_RQ,
};
use crate::find::{CancelHandle, MatchError, MatchSource, QueryOutcome, QueryTask};
use crate::status::{FailureKind, Status};

/// _Patient Root Query/Retrieve Information Model - FIND_
pub const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
/// _Study Root Query/Retrieve Information Model - FIND_
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
/// _Verification SOP Class_
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Status code for an unrecognized operation.
const UNRECOGNIZED_OPERATION: u16 = 0x0211;

const TRANSFER_SYNTAXES: &[&str] = &[
    "1.2.840.10008.1.2.1", // Explicit VR Little Endian
    "1.2.840.10008.1.2",   // Implicit VR Little Endian
];

/// Options for serving C-FIND requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindServiceOptions {
    ae_title: String,
    strict: bool,
    max_pdu_length: u32,
    sop_classes: Vec<String>,
}

impl Default for FindServiceOptions {
    fn default() -> Self {
        FindServiceOptions {
            ae_title: "FIND-SCP".to_string(),
            strict: false,
            max_pdu_length: 16_384,
            sop_classes: vec![PATIENT_ROOT_FIND.to_string(), STUDY_ROOT_FIND.to_string()],
        }
    }
}

impl FindServiceOptions {
    /// Create options serving the Patient Root and Study Root models.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define this node's AE title.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.ae_title = ae_title.into();
        self
    }

    /// Enforce the maximum PDU length on reception.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Define the maximum PDU length admitted by this node.
    pub fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Replace the FIND SOP classes served.
    pub fn sop_classes<I, T>(mut self, sop_classes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.sop_classes = sop_classes.into_iter().map(Into::into).collect();
        self
    }
}

/// The outbound half of an accepted association,
/// shared by every query task running on it.
///
/// Each message is written as a whole while holding the lock.
#[derive(Debug)]
pub struct SharedWriter {
    stream: Mutex<TcpStream>,
    max_pdu_length: u32,
    transfer_syntaxes: HashMap<u8, String>,
}

impl SharedWriter {
    /// Wrap a stream to the peer,
    /// given the maximum length of the PDUs to write
    /// and the transfer syntax of each accepted presentation context.
    pub fn new(stream: TcpStream, max_pdu_length: u32, transfer_syntaxes: HashMap<u8, String>) -> Self {
        SharedWriter {
            stream: Mutex::new(stream),
            max_pdu_length,
            transfer_syntaxes,
        }
    }

    /// Look up the transfer syntax of a presentation context.
    pub fn transfer_syntax(&self, presentation_context_id: u8) -> Result<&'static TransferSyntax> {
        let uid = self
            .transfer_syntaxes
            .get(&presentation_context_id)
            .context(UnexpectedMessageSnafu {
                description: format!("unknown presentation context {}", presentation_context_id),
            })?;
        transfer_syntax(&TransferSyntaxRegistry, uid).context(DecodeMessageSnafu)
    }

    /// Write a single PDU.
    pub fn send_pdu(&self, pdu: &Pdu) -> Result<()> {
        let mut buffer = Vec::new();
        write_pdu(&mut buffer, pdu).map_err(boxed).context(SendSnafu)?;
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&buffer).map_err(boxed).context(SendSnafu)
    }
}

impl DimseResponder for SharedWriter {
    fn send_response(
        &self,
        presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
    ) -> Result<()> {
        let command = encode_command(&command).context(EncodeMessageSnafu)?;
        let dataset = match dataset {
            Some(dataset) => {
                let ts = self.transfer_syntax(presentation_context_id)?;
                Some(encode_dataset(&dataset, ts).context(EncodeMessageSnafu)?)
            }
            None => None,
        };

        let mut buffer = Vec::new();
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        for pdu in message_pdus(presentation_context_id, command, dataset, self.max_pdu_length) {
            buffer.clear();
            write_pdu(&mut buffer, &pdu).map_err(boxed).context(SendSnafu)?;
            stream.write_all(&buffer).map_err(boxed).context(SendSnafu)?;
        }
        Ok(())
    }
}

type TaskHandle = (CancelHandle, JoinHandle<Result<QueryOutcome>>);

struct Dispatcher<'a, F> {
    writer: Arc<SharedWriter>,
    sop_classes: &'a [String],
    make_source: F,
    tasks: HashMap<u16, TaskHandle>,
}

impl<'a, F, S> Dispatcher<'a, F>
where
    F: FnMut(&str, &InMemDicomObject) -> Result<S, MatchError>,
    S: MatchSource + Send + 'static,
{
    fn handle(&mut self, message: IncomingMessage) -> Result<()> {
        match message.header.command_field {
            C_FIND_RQ => self.start_query(message),
            C_CANCEL_RQ => {
                let id = message.header.responded_to.unwrap_or_default();
                match self.tasks.get(&id) {
                    Some((cancel, _)) => {
                        debug!("Canceling query {}", id);
                        cancel.cancel();
                    }
                    None => debug!("Ignoring C-CANCEL for inactive request {}", id),
                }
                Ok(())
            }
            C_ECHO_RQ => self.writer.send_response(
                message.presentation_context_id,
                response_command(&message.header, Status::Success, false, None),
                None,
            ),
            field => {
                warn!("Unsupported command {:04X}H", field);
                self.fail(
                    &message,
                    Status::Failure(FailureKind::Other(UNRECOGNIZED_OPERATION)),
                    "unsupported operation",
                )
            }
        }
    }

    fn start_query(&mut self, message: IncomingMessage) -> Result<()> {
        let sop_class_uid = message
            .header
            .affected_sop_class_uid
            .clone()
            .unwrap_or_default();
        if !self.sop_classes.iter().any(|uid| *uid == sop_class_uid) {
            return self.fail(
                &message,
                Status::Failure(FailureKind::SopClassNotSupported),
                "SOP class not supported",
            );
        }

        let keys = match self.decode_identifier(&message) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Could not read identifier: {}", Report::from_error(&e));
                return self.fail(
                    &message,
                    Status::Failure(FailureKind::IdentifierDoesNotMatchSopClass),
                    "could not read identifier",
                );
            }
        };

        let source = match (self.make_source)(&sop_class_uid, &keys) {
            Ok(source) => source,
            Err(e) => return self.fail(&message, e.status(), e.message()),
        };

        let IncomingMessage {
            presentation_context_id,
            header,
            ..
        } = message;
        let message_id = header.message_id.unwrap_or_default();
        let task = QueryTask::new(
            Arc::clone(&self.writer),
            presentation_context_id,
            header.clone(),
            keys,
            source,
        );
        match task.spawn() {
            Ok(handle) => {
                debug!("Started query {}", message_id);
                self.tasks.insert(message_id, handle);
                Ok(())
            }
            Err(e) => {
                error!("Could not start query task: {}", e);
                self.writer.send_response(
                    presentation_context_id,
                    response_command(
                        &header,
                        Status::Failure(FailureKind::OutOfResources),
                        false,
                        Some("could not start query"),
                    ),
                    None,
                )
            }
        }
    }

    fn decode_identifier(&self, message: &IncomingMessage) -> Result<InMemDicomObject> {
        let data = message.dataset.as_deref().context(UnexpectedMessageSnafu {
            description: "C-FIND request without identifier",
        })?;
        let ts = self.writer.transfer_syntax(message.presentation_context_id)?;
        decode_dataset(data, ts).context(DecodeMessageSnafu)
    }

    fn fail(&self, message: &IncomingMessage, status: Status, comment: &str) -> Result<()> {
        self.writer.send_response(
            message.presentation_context_id,
            response_command(&message.header, status, false, Some(comment)),
            None,
        )
    }

    /// Join the tasks which have already finished.
    fn reap(&mut self) {
        let finished: Vec<u16> = self
            .tasks
            .iter()
            .filter(|(_, (_, handle))| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                join_task(id, handle);
            }
        }
    }

    /// Wait for all tasks, optionally canceling them first.
    fn join_all(&mut self, cancel: bool) {
        for (id, (cancel_handle, handle)) in self.tasks.drain() {
            if cancel {
                cancel_handle.cancel();
            }
            join_task(id, handle);
        }
    }
}

fn join_task(id: u16, handle: JoinHandle<Result<QueryOutcome>>) {
    match handle.join() {
        Ok(Ok(outcome)) => debug!("Query {} finished: {}", id, outcome.status),
        Ok(Err(e)) => warn!("Query {} failed: {}", id, Report::from_error(e)),
        Err(_) => error!("Query task {} panicked", id),
    }
}

/// Serve C-FIND requests on a newly accepted TCP connection
/// until the association is released or aborted.
///
/// Each C-FIND request runs in its own query task,
/// using the match source produced by `make_source`
/// for the requested SOP class and identifier.
/// C-CANCEL requests cancel the task of the request they refer to.
/// C-ECHO requests are also answered.
pub fn serve_find_association<F, S>(
    stream: TcpStream,
    options: &FindServiceOptions,
    make_source: F,
) -> Result<()>
where
    F: FnMut(&str, &InMemDicomObject) -> Result<S, MatchError>,
    S: MatchSource + Send + 'static,
{
    let mut server_options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(options.ae_title.as_str())
        .strict(options.strict)
        .max_pdu_length(options.max_pdu_length)
        .with_abstract_syntax(VERIFICATION);
    for uid in &options.sop_classes {
        server_options = server_options.with_abstract_syntax(uid.as_str());
    }
    for ts in TRANSFER_SYNTAXES {
        server_options = server_options.with_transfer_syntax(*ts);
    }

    let mut association = server_options
        .establish(stream)
        .map_err(boxed)
        .context(EstablishSnafu)?;
    info!("New association from {}", association.client_ae_title());
    debug!(
        "> Presentation contexts: {:?}",
        association.presentation_contexts()
    );

    let transfer_syntaxes = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.clone()))
        .collect();
    let write_stream = association
        .inner_stream()
        .try_clone()
        .map_err(boxed)
        .context(EstablishSnafu)?;
    // the requestor's maximum PDU length is not exposed,
    // so outbound messages stay within the smallest size a peer must accept
    let writer = Arc::new(SharedWriter::new(
        write_stream,
        MINIMUM_PDU_SIZE,
        transfer_syntaxes,
    ));

    let mut dispatcher = Dispatcher {
        writer: Arc::clone(&writer),
        sop_classes: &options.sop_classes,
        make_source,
        tasks: HashMap::new(),
    };
    let mut assembler = MessageAssembler::default();

    let outcome = loop {
        dispatcher.reap();
        let pdu = match association.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                info!("{}", Report::from_error(e));
                dispatcher.join_all(true);
                break Ok(());
            }
        };
        match pdu {
            Pdu::PData { data } => {
                let handled = data.into_iter().try_for_each(|pdv| {
                    match assembler.push(pdv)? {
                        Some(message) => dispatcher.handle(message),
                        None => Ok(()),
                    }
                });
                if let Err(e) = handled {
                    dispatcher.join_all(true);
                    break Err(e);
                }
            }
            Pdu::ReleaseRQ => {
                // pending queries finish before the release is confirmed
                dispatcher.join_all(false);
                if let Err(e) = writer.send_pdu(&Pdu::ReleaseRP) {
                    warn!(
                        "Failed to send association release message to SCU: {}",
                        Report::from_error(e)
                    );
                }
                info!(
                    "Released association with {}",
                    association.client_ae_title()
                );
                break Ok(());
            }
            Pdu::AbortRQ { source } => {
                warn!("Aborted connection from: {:?}", source);
                dispatcher.join_all(true);
                break Ok(());
            }
            pdu => debug!("Ignoring unexpected PDU {:?}", pdu),
        }
    };

    info!("Dropping connection with {}", association.client_ae_title());
    outcome
}

//! Retrieve channel over a requested `dicom-ul` association.
use std::collections::HashMap;

use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{Pdu, PresentationContextResultReason};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use super::boxed;
use super::pdata::{IncomingMessage, MessageAssembler};
use crate::association::{
    AbortedSnafu, AssociationConfig, Connector, DecodeMessageSnafu, EncodeMessageSnafu,
    EstablishSnafu, MessageIds, NoPresentationContextSnafu, NotReadySnafu, ReceiveSnafu,
    ReleaseSnafu, ResponseHandler, Result, RetrieveChannel, SendSnafu, UnexpectedMessageSnafu,
};
use crate::command::{
    decode_dataset, encode_command, encode_dataset, message_pdus, move_request_command,
    transfer_syntax, MoveRequest,
};
use crate::status::Status;

/// Opens retrieve channels by requesting associations over TCP.
#[derive(Debug, Default, Copy, Clone)]
pub struct UlConnector;

impl Connector for UlConnector {
    type Channel = UlRetrieveChannel;

    fn connect(&self, config: &AssociationConfig<'_>) -> Result<UlRetrieveChannel> {
        if config.relational {
            warn!("Relational retrieval requested, but SOP class extended negotiation is not available; proceeding without it");
        }

        let transfer_syntaxes: Vec<&str> = config
            .transfer_syntaxes
            .iter()
            .map(|ts| ts.as_ref())
            .collect();
        let mut options = ClientAssociationOptions::new()
            .with_presentation_context(config.abstract_syntax.as_ref(), transfer_syntaxes)
            .calling_ae_title(config.calling_ae_title.as_ref())
            .max_pdu_length(config.max_pdu_length)
            .strict(config.strict);
        if let Some(called_ae_title) = &config.called_ae_title {
            options = options.called_ae_title(called_ae_title.as_ref());
        }

        let mut association = options
            .establish_with(&config.address)
            .map_err(boxed)
            .context(EstablishSnafu)?;
        if let Some(timeout) = config.timeout {
            association
                .inner_stream()
                .set_read_timeout(Some(timeout))
                .map_err(boxed)
                .context(EstablishSnafu)?;
        }

        let pc = association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .context(NoPresentationContextSnafu {
                abstract_syntax: config.abstract_syntax.as_ref(),
            })?;
        let presentation_context_id = pc.id;
        let transfer_syntax = pc.transfer_syntax.clone();

        info!(
            "Association established with {} (presentation context {}, transfer syntax {})",
            config.address,
            presentation_context_id,
            transfer_syntax.trim_end_matches('\0')
        );

        Ok(UlRetrieveChannel {
            acceptor_max_pdu_length: association.acceptor_max_pdu_length(),
            association,
            presentation_context_id,
            transfer_syntax,
            ids: MessageIds::default(),
            outstanding: HashMap::new(),
            assembler: MessageAssembler::default(),
            ready: true,
        })
    }
}

/// A retrieve channel on an established client association.
///
/// Responses are only read while waiting for outstanding requests.
pub struct UlRetrieveChannel {
    association: ClientAssociation,
    presentation_context_id: u8,
    transfer_syntax: String,
    acceptor_max_pdu_length: u32,
    ids: MessageIds,
    outstanding: HashMap<u16, Box<dyn ResponseHandler>>,
    assembler: MessageAssembler,
    ready: bool,
}

impl std::fmt::Debug for UlRetrieveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UlRetrieveChannel")
            .field("presentation_context_id", &self.presentation_context_id)
            .field("transfer_syntax", &self.transfer_syntax)
            .field("outstanding", &self.outstanding.keys().collect::<Vec<_>>())
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl UlRetrieveChannel {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        if let Err(e) = self.association.send(pdu) {
            self.ready = false;
            return Err(boxed(e)).context(SendSnafu);
        }
        Ok(())
    }

    fn dispatch(&mut self, message: IncomingMessage) -> Result<()> {
        let IncomingMessage {
            command,
            header,
            dataset,
            ..
        } = message;
        let Some(message_id) = header.responded_to else {
            return UnexpectedMessageSnafu {
                description: format!("command {:04X}H without a message ID", header.command_field),
            }
            .fail();
        };
        if !header.is_response() {
            return UnexpectedMessageSnafu {
                description: format!("request command {:04X}H", header.command_field),
            }
            .fail();
        }

        let Some(code) = header.status else {
            return UnexpectedMessageSnafu {
                description: format!("response to message {} without status", message_id),
            }
            .fail();
        };

        let dataset = match dataset {
            Some(data) => {
                let ts = transfer_syntax(&TransferSyntaxRegistry, &self.transfer_syntax)
                    .context(DecodeMessageSnafu)?;
                Some(decode_dataset(&data, ts).context(DecodeMessageSnafu)?)
            }
            None => None,
        };

        let status = Status::from_code(code);
        match self.outstanding.get_mut(&message_id) {
            Some(handler) => handler.on_response(&command, dataset.as_ref()),
            None => {
                warn!("Ignoring response to unknown message {}", message_id);
                return Ok(());
            }
        }
        if status.is_final() {
            self.outstanding.remove(&message_id);
        }
        Ok(())
    }

    fn receive_once(&mut self) -> Result<()> {
        let pdu = match self.association.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                self.ready = false;
                return Err(boxed(e)).context(ReceiveSnafu);
            }
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    if let Some(message) = self.assembler.push(pdv)? {
                        self.dispatch(message)?;
                    }
                }
                Ok(())
            }
            Pdu::AbortRQ { source } => {
                warn!("Association aborted by peer: {:?}", source);
                self.ready = false;
                AbortedSnafu.fail()
            }
            Pdu::ReleaseRQ => {
                self.ready = false;
                self.send_pdu(&Pdu::ReleaseRP)?;
                UnexpectedMessageSnafu {
                    description: "release request with outstanding responses",
                }
                .fail()
            }
            pdu => UnexpectedMessageSnafu {
                description: format!("{:?}", pdu),
            }
            .fail(),
        }
    }
}

impl RetrieveChannel for UlRetrieveChannel {
    fn next_message_id(&mut self) -> u16 {
        self.ids.next_id()
    }

    fn move_request(
        &mut self,
        request: MoveRequest,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        snafu::ensure!(self.ready, NotReadySnafu);

        let ts = transfer_syntax(&TransferSyntaxRegistry, &self.transfer_syntax)
            .context(EncodeMessageSnafu)?;
        let command = encode_command(&move_request_command(&request)).context(EncodeMessageSnafu)?;
        let dataset = encode_dataset(&request.keys, ts).context(EncodeMessageSnafu)?;

        self.outstanding.insert(request.message_id, handler);
        for pdu in message_pdus(
            self.presentation_context_id,
            command,
            Some(dataset),
            self.acceptor_max_pdu_length,
        ) {
            if let Err(e) = self.send_pdu(&pdu) {
                self.outstanding.remove(&request.message_id);
                return Err(e);
            }
        }
        debug!("C-MOVE request {} sent", request.message_id);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn wait_for_outstanding(&mut self) -> Result<()> {
        while !self.outstanding.is_empty() {
            self.receive_once()?;
        }
        Ok(())
    }

    fn release(mut self) -> Result<()> {
        self.ready = false;
        self.association
            .release()
            .map_err(boxed)
            .context(ReleaseSnafu)
    }

    fn abort(mut self) -> Result<()> {
        self.ready = false;
        self.association.abort().map_err(boxed).context(SendSnafu)
    }
}


//! Embedded storage receiver,
//! accepting the C-STORE sub-operations of a retrieval
//! and writing each instance into the temporary storage.
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_qr::command::{
    decode_dataset, encode_command, message_pdus, response_command, transfer_syntax,
    CommandHeader, C_ECHO_RQ, C_STORE_RQ,
};
use dicom_qr::ul::{IncomingMessage, MessageAssembler};
use dicom_qr::{FailureKind, Status};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::{ServerAssociation, ServerAssociationOptions};
use dicom_ul::pdu::reader::MINIMUM_PDU_SIZE;
use dicom_ul::pdu::Pdu;
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How the receiver presents itself and where it writes.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub ae_title: String,
    pub strict: bool,
    pub max_pdu_length: u32,
    pub out_dir: PathBuf,
}

/// Accept storage associations until the runtime is shut down.
pub async fn run_store_async(listener: TcpListener, options: Arc<StoreOptions>) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("{}", Report::from_error(e));
                continue;
            }
        };
        debug!("Storage connection from {}", addr);
        let options = Arc::clone(&options);
        tokio::task::spawn_blocking(move || {
            let stream = match socket.into_std().and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("{}", Report::from_error(e));
                    return;
                }
            };
            if let Err(e) = run_store_sync(stream, &options) {
                error!("{}", Report::from_error(e));
            }
        });
    }
}

/// Serve one storage association on a blocking stream.
pub fn run_store_sync(scu_stream: TcpStream, options: &StoreOptions) -> Result<(), Whatever> {
    let mut server_options = ServerAssociationOptions::new()
        .accept_any()
        .promiscuous(true)
        .ae_title(options.ae_title.as_str())
        .strict(options.strict)
        .max_pdu_length(options.max_pdu_length);
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            server_options = server_options.with_transfer_syntax(ts.uid());
        }
    }

    let mut association = server_options
        .establish(scu_stream)
        .whatever_context("could not establish storage association")?;
    info!("New storage association from {}", association.client_ae_title());
    debug!(
        "> Presentation contexts: {:?}",
        association.presentation_contexts()
    );

    let mut assembler = MessageAssembler::default();
    loop {
        let pdu = match association.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                info!("{}", Report::from_error(e));
                break;
            }
        };
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let message = assembler
                        .push(pdv)
                        .whatever_context("could not read incoming message")?;
                    if let Some(message) = message {
                        handle_message(&mut association, message, options)?;
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).unwrap_or_else(|e| {
                    warn!(
                        "Failed to send association release message to SCU: {}",
                        Report::from_error(e)
                    );
                });
                info!(
                    "Released storage association with {}",
                    association.client_ae_title()
                );
                break;
            }
            Pdu::AbortRQ { source } => {
                warn!("Aborted storage association: {:?}", source);
                break;
            }
            pdu => debug!("Ignoring {:?}", pdu),
        }
    }
    Ok(())
}

fn handle_message(
    association: &mut ServerAssociation,
    message: IncomingMessage,
    options: &StoreOptions,
) -> Result<(), Whatever> {
    let IncomingMessage {
        presentation_context_id,
        header,
        dataset,
        ..
    } = message;
    let response = match header.command_field {
        C_ECHO_RQ => response_command(&header, Status::Success, false, None),
        C_STORE_RQ => {
            let (status, sop_instance_uid) =
                match store_instance(association, presentation_context_id, dataset, options) {
                    Ok(uid) => (Status::Success, uid),
                    Err(e) => {
                        error!("{}", Report::from_error(e));
                        (Status::Failure(FailureKind::ProcessingFailure), String::new())
                    }
                };
            let mut rsp = response_command(&header, status, false, None);
            rsp.put(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(sop_instance_uid),
            ));
            rsp
        }
        field => {
            warn!("Unsupported command {:04X}H on storage association", field);
            response_command(
                &header,
                Status::Failure(FailureKind::Other(0x0211)),
                false,
                None,
            )
        }
    };
    send_command(association, presentation_context_id, &header, response)
}

fn store_instance(
    association: &ServerAssociation,
    presentation_context_id: u8,
    dataset: Option<Vec<u8>>,
    options: &StoreOptions,
) -> Result<String, Whatever> {
    let data = dataset.whatever_context("C-STORE request without data set")?;
    let ts_uid = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .map(|pc| pc.transfer_syntax.clone())
        .whatever_context("missing presentation context")?;
    let ts = transfer_syntax(&TransferSyntaxRegistry, &ts_uid)
        .whatever_context("unsupported transfer syntax")?;
    let obj: InMemDicomObject =
        decode_dataset(&data, ts).whatever_context("failed to read DICOM data object")?;

    let sop_class_uid = element_str(&obj, tags::SOP_CLASS_UID)?;
    let sop_instance_uid = element_str(&obj, tags::SOP_INSTANCE_UID)?;
    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid.as_str())
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .transfer_syntax(ts_uid.as_str())
        .build()
        .whatever_context("failed to build DICOM meta file information")?;
    let file_obj = obj.with_exact_meta(file_meta);

    let file_path = options.out_dir.join(format!("{}.dcm", sop_instance_uid));
    file_obj
        .write_to_file(&file_path)
        .whatever_context("could not save DICOM object to file")?;
    info!("Stored {}", file_path.display());
    Ok(sop_instance_uid)
}

fn element_str(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Result<String, Whatever> {
    let value = obj
        .element(tag)
        .whatever_context("missing SOP attribute")?
        .to_str()
        .whatever_context("could not read SOP attribute")?;
    Ok(value.trim_end_matches(['\0', ' ']).to_string())
}

fn send_command(
    association: &mut ServerAssociation,
    presentation_context_id: u8,
    request: &CommandHeader,
    command: InMemDicomObject,
) -> Result<(), Whatever> {
    let data = encode_command(&command).whatever_context("could not write response object")?;
    // bounded by the smallest PDU size a requestor may admit
    for pdu in message_pdus(presentation_context_id, data, None, MINIMUM_PDU_SIZE) {
        association
            .send(&pdu)
            .whatever_context("failed to send response object to SCU")?;
    }
    debug!(
        "Answered request {}",
        request.message_id.unwrap_or_default()
    );
    Ok(())
}

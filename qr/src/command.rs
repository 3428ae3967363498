//! DIMSE command set construction and message encoding.
//!
//! Command sets are always encoded in _Implicit VR Little Endian_,
//! whereas identifiers use the transfer syntax
//! accorded for the presentation context.
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::status::Status;

/// Command field of a C-STORE-RQ message.
pub const C_STORE_RQ: u16 = 0x0001;
/// Command field of a C-FIND-RQ message.
pub const C_FIND_RQ: u16 = 0x0020;
/// Command field of a C-MOVE-RQ message.
pub const C_MOVE_RQ: u16 = 0x0021;
/// Command field of a C-ECHO-RQ message.
pub const C_ECHO_RQ: u16 = 0x0030;
/// Command field of a C-CANCEL-RQ message.
pub const C_CANCEL_RQ: u16 = 0x0FFF;
/// Bit set in the command field of every response.
pub const RESPONSE_BIT: u16 = 0x8000;

/// _Command Data Set Type_ value for messages without a data set.
pub const NO_DATA_SET: u16 = 0x0101;
/// _Command Data Set Type_ value for messages followed by a data set.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// Maximum length of the _Error Comment_ attribute.
const MAX_ERROR_COMMENT_LEN: usize = 64;

/// PDU header plus PDV item header
const PDV_OVERHEAD: usize = 12;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not write DIMSE command set
    WriteCommand { source: dicom_object::WriteError },

    /// could not read DIMSE command set
    ReadCommand { source: dicom_object::ReadError },

    /// could not write data set
    WriteDataset { source: dicom_object::WriteError },

    /// could not read data set
    ReadDataset { source: dicom_object::ReadError },

    #[snafu(display("unsupported transfer syntax {}", uid))]
    UnsupportedTransferSyntax { uid: String },

    #[snafu(display("missing command attribute {}", name))]
    MissingAttribute { name: &'static str },

    #[snafu(display("invalid command attribute {}", name))]
    InvalidAttribute {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The DIMSE priority of a request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Priority {
    #[default]
    Medium,
    High,
    Low,
}

impl Priority {
    /// The value of the _Priority_ command attribute.
    pub fn code(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }

    /// Interpret a _Priority_ attribute value.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// The relevant attributes of an incoming command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    /// _Command Field_
    pub command_field: u16,
    /// _Message ID_, present in requests
    pub message_id: Option<u16>,
    /// _Message ID Being Responded To_, present in responses and cancel requests
    pub responded_to: Option<u16>,
    /// _Affected SOP Class UID_
    pub affected_sop_class_uid: Option<String>,
    /// _Priority_
    pub priority: Option<u16>,
    /// whether a data set follows the command
    pub has_dataset: bool,
    /// _Status_, present in responses
    pub status: Option<u16>,
}

impl CommandHeader {
    /// Gather the header attributes from a decoded command set.
    pub fn from_command(cmd: &InMemDicomObject) -> Result<Self> {
        let command_field = cmd
            .element(tags::COMMAND_FIELD)
            .ok()
            .context(MissingAttributeSnafu {
                name: "Command Field",
            })?
            .to_int::<u16>()
            .context(InvalidAttributeSnafu {
                name: "Command Field",
            })?;
        let data_set_type = cmd
            .element(tags::COMMAND_DATA_SET_TYPE)
            .ok()
            .context(MissingAttributeSnafu {
                name: "Command Data Set Type",
            })?
            .to_int::<u16>()
            .context(InvalidAttributeSnafu {
                name: "Command Data Set Type",
            })?;

        let int_attr = |tag: dicom_core::Tag, name: &'static str| -> Result<Option<u16>> {
            match cmd.element(tag) {
                Ok(e) => e
                    .to_int::<u16>()
                    .map(Some)
                    .context(InvalidAttributeSnafu { name }),
                Err(_) => Ok(None),
            }
        };

        Ok(CommandHeader {
            command_field,
            message_id: int_attr(tags::MESSAGE_ID, "Message ID")?,
            responded_to: int_attr(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                "Message ID Being Responded To",
            )?,
            affected_sop_class_uid: cmd
                .element(tags::AFFECTED_SOP_CLASS_UID)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|uid| trim_uid(&uid).to_string()),
            priority: int_attr(tags::PRIORITY, "Priority")?,
            has_dataset: data_set_type != NO_DATA_SET,
            status: int_attr(tags::STATUS, "Status")?,
        })
    }

    /// Whether this is a response message.
    pub fn is_response(&self) -> bool {
        self.command_field & RESPONSE_BIT != 0
    }
}

/// A C-MOVE request as issued by the retrieve orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    /// the message ID allocated for this request
    pub message_id: u16,
    /// the SOP class of the retrieve information model
    pub sop_class_uid: String,
    /// the request priority
    pub priority: Priority,
    /// the AE title of the move destination
    pub destination: String,
    /// the identifier with the match keys
    pub keys: InMemDicomObject,
}

/// Build a response command set for the given request.
///
/// The command field of the request is echoed with the response bit set.
/// An error comment is only included in failure responses
/// and truncated to the maximum length admitted by the standard.
pub fn response_command(
    request: &CommandHeader,
    status: Status,
    has_dataset: bool,
    error_comment: Option<&str>,
) -> InMemDicomObject<StandardDataDictionary> {
    let mut elements = vec![
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [request.command_field | RESPONSE_BIT]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [request.message_id.unwrap_or_default()]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if has_dataset {
                    DATA_SET_PRESENT
                } else {
                    NO_DATA_SET
                }]
            ),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status.code()])),
    ];
    if let Some(uid) = &request.affected_sop_class_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uid.as_str()),
        ));
    }
    if let (true, Some(comment)) = (status.is_failure(), error_comment) {
        let comment: String = comment.chars().take(MAX_ERROR_COMMENT_LEN).collect();
        elements.push(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            PrimitiveValue::from(comment),
        ));
    }
    InMemDicomObject::command_from_element_iter(elements)
}

/// Build the command set of a C-MOVE-RQ message.
pub fn move_request_command(request: &MoveRequest) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(request.sop_class_uid.as_str()),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RQ])),
        DataElement::new(
            tags::MESSAGE_ID,
            VR::US,
            dicom_value!(U16, [request.message_id]),
        ),
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [request.priority.code()]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(request.destination.as_str()),
        ),
    ])
}

/// Build the command set of a C-CANCEL-RQ message
/// for the request with the given message ID.
pub fn cancel_request_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_CANCEL_RQ])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ])
}

/// Encode a command set in _Implicit VR Little Endian_.
pub fn encode_command(cmd: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(WriteCommandSnafu)?;
    Ok(out)
}

/// Decode a command set in _Implicit VR Little Endian_.
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(ReadCommandSnafu)
}

/// Look up a transfer syntax by UID in the given index.
pub fn transfer_syntax<'a, R>(registry: &'a R, uid: &str) -> Result<&'a TransferSyntax>
where
    R: TransferSyntaxIndex,
{
    let uid = trim_uid(uid);
    registry
        .get(uid)
        .context(UnsupportedTransferSyntaxSnafu { uid })
}

/// Encode a data set with the given transfer syntax.
pub fn encode_dataset(obj: &InMemDicomObject, ts: &TransferSyntax) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    obj.write_dataset_with_ts(&mut out, ts)
        .context(WriteDatasetSnafu)?;
    Ok(out)
}

/// Decode a data set with the given transfer syntax.
pub fn decode_dataset(data: &[u8], ts: &TransferSyntax) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, ts).context(ReadDatasetSnafu)
}

/// Split an encoded message into P-DATA-TF PDUs
/// which fit the maximum PDU length of the receiving node.
///
/// A maximum length of zero means no limit.
pub fn message_pdus(
    presentation_context_id: u8,
    command: Vec<u8>,
    dataset: Option<Vec<u8>>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let fragment_len = if max_pdu_length == 0 {
        usize::MAX
    } else {
        (max_pdu_length as usize).saturating_sub(PDV_OVERHEAD).max(1)
    };

    let mut pdus = Vec::new();
    fragment_into(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        fragment_len,
    );
    if let Some(dataset) = dataset {
        fragment_into(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            dataset,
            fragment_len,
        );
    }
    pdus
}

fn fragment_into(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    data: Vec<u8>,
    fragment_len: usize,
) {
    if data.len() <= fragment_len {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data,
            }],
        });
        return;
    }
    let count = (data.len() + fragment_len - 1) / fragment_len;
    for (i, chunk) in data.chunks(fragment_len).enumerate() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: value_type.clone(),
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        });
    }
}

/// Remove trailing padding from a UID value.
pub(crate) fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
}

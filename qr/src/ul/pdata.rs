//! Reassembly of DIMSE messages from P-DATA values.
use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use snafu::ResultExt;

use crate::association::{DecodeMessageSnafu, Result, UnexpectedMessageSnafu};
use crate::command::{decode_command, CommandHeader};

/// A complete DIMSE message.
#[derive(Debug)]
pub struct IncomingMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub header: CommandHeader,
    /// the encoded data set, if one followed the command
    pub dataset: Option<Vec<u8>>,
}

/// Collects command and data fragments
/// until a whole message has arrived.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command: Vec<u8>,
    data: Vec<u8>,
    awaiting_data: Option<(u8, InMemDicomObject, CommandHeader)>,
}

impl MessageAssembler {
    /// Feed one P-DATA value,
    /// obtaining a message if it was the last fragment of one.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<IncomingMessage>> {
        let PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            mut data,
        } = pdv;

        match value_type {
            PDataValueType::Command => {
                self.command.append(&mut data);
                if !is_last {
                    return Ok(None);
                }
                let command = decode_command(&self.command).context(DecodeMessageSnafu)?;
                self.command.clear();
                let header = CommandHeader::from_command(&command).context(DecodeMessageSnafu)?;
                if header.has_dataset {
                    self.awaiting_data = Some((presentation_context_id, command, header));
                    return Ok(None);
                }
                Ok(Some(IncomingMessage {
                    presentation_context_id,
                    command,
                    header,
                    dataset: None,
                }))
            }
            PDataValueType::Data => {
                if self.awaiting_data.is_none() {
                    return UnexpectedMessageSnafu {
                        description: "data set fragment without a command",
                    }
                    .fail();
                }
                self.data.append(&mut data);
                if !is_last {
                    return Ok(None);
                }
                let dataset = std::mem::take(&mut self.data);
                Ok(self
                    .awaiting_data
                    .take()
                    .map(|(presentation_context_id, command, header)| IncomingMessage {
                        presentation_context_id,
                        command,
                        header,
                        dataset: Some(dataset),
                    }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{encode_command, message_pdus, response_command, C_FIND_RQ};
    use crate::status::Status;
    use dicom_ul::pdu::Pdu;

    #[test]
    fn reassemble_fragmented_message() {
        let request = CommandHeader {
            command_field: C_FIND_RQ,
            message_id: Some(5),
            responded_to: None,
            affected_sop_class_uid: Some("1.2.840.10008.5.1.4.1.2.2.1".to_string()),
            priority: Some(0),
            has_dataset: true,
            status: None,
        };
        let cmd = encode_command(&response_command(&request, Status::Pending, true, None)).unwrap();
        let pdus = message_pdus(3, cmd, Some(vec![7; 300]), 100);

        let mut assembler = MessageAssembler::default();
        let mut messages = Vec::new();
        for pdu in pdus {
            let Pdu::PData { data } = pdu else {
                panic!("expected P-DATA");
            };
            for pdv in data {
                messages.extend(assembler.push(pdv).unwrap());
            }
        }
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.presentation_context_id, 3);
        assert_eq!(message.header.responded_to, Some(5));
        assert_eq!(message.dataset.as_deref(), Some(&[7u8; 300][..]));
    }

    #[test]
    fn data_without_command_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let result = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 4],
        });
        assert!(result.is_err());
    }
}

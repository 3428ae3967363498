//! Retrieve sessions against a scripted C-MOVE provider over loopback.
use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_qr::command::{encode_command, message_pdus, response_command, CommandHeader, C_MOVE_RQ};
use dicom_qr::retrieve::Error;
use dicom_qr::ul::{MessageAssembler, UlConnector};
use dicom_qr::{Completion, InformationModel, RetrieveOptions, RetrieveSession, Status};
use dicom_ul::association::ServerAssociationOptions;
use dicom_ul::pdu::reader::MINIMUM_PDU_SIZE;
use dicom_ul::pdu::Pdu;

/// What the provider saw during the association.
#[derive(Debug, Default)]
struct ProviderLog {
    requests: Vec<CommandHeader>,
    released: bool,
}

type Script = fn(&CommandHeader) -> Vec<InMemDicomObject>;

/// Accept one association and answer each C-MOVE request with the scripted responses.
fn spawn_provider(listener: TcpListener, script: Script) -> JoinHandle<ProviderLog> {
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut association = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("QRSCP")
            .with_abstract_syntax(InformationModel::StudyRoot.sop_class_uid())
            .with_transfer_syntax("1.2.840.10008.1.2.1")
            .with_transfer_syntax("1.2.840.10008.1.2")
            .establish(stream)
            .unwrap();

        let mut log = ProviderLog::default();
        let mut assembler = MessageAssembler::default();
        loop {
            match association.receive() {
                Ok(Pdu::PData { data }) => {
                    for pdv in data {
                        let Some(message) = assembler.push(pdv).unwrap() else {
                            continue;
                        };
                        for rsp in script(&message.header) {
                            for pdu in message_pdus(
                                message.presentation_context_id,
                                encode_command(&rsp).unwrap(),
                                None,
                                MINIMUM_PDU_SIZE,
                            ) {
                                // the requestor may already be gone
                                let _ = association.send(&pdu);
                            }
                        }
                        log.requests.push(message.header);
                    }
                }
                Ok(Pdu::ReleaseRQ) => {
                    association.send(&Pdu::ReleaseRP).unwrap();
                    log.released = true;
                    break;
                }
                Ok(Pdu::AbortRQ { .. }) | Err(_) => break,
                Ok(_) => {}
            }
        }
        log
    })
}

fn move_response(
    request: &CommandHeader,
    status: Status,
    remaining: Option<u16>,
    completed: u16,
) -> InMemDicomObject {
    let mut cmd = response_command(request, status, false, None);
    if let Some(remaining) = remaining {
        cmd.put(DataElement::new(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ));
    }
    cmd.put(DataElement::new(
        tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
        VR::US,
        dicom_value!(U16, [completed]),
    ));
    cmd
}

fn provider() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = format!("QRSCP@{}", listener.local_addr().unwrap());
    (listener, addr)
}

#[test]
fn move_over_association_completes_once() {
    let (listener, addr) = provider();
    let provider = spawn_provider(listener, |request| {
        vec![
            move_response(request, Status::Pending, Some(1), 0),
            move_response(request, Status::Pending, Some(0), 1),
            move_response(request, Status::Success, None, 1),
        ]
    });

    let calls = Arc::new(AtomicU32::new(0));
    let hook_calls = Arc::clone(&calls);
    let options = RetrieveOptions::new()
        .destination("STORESCP")
        .key_terms(&["StudyInstanceUID=1.2.3.4"])
        .unwrap()
        .on_complete(move |c: &Completion| {
            assert_eq!(c.progress.remaining, Some(0));
            assert_eq!(c.progress.completed, 1);
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

    let mut session = RetrieveSession::open(&UlConnector, &addr, options).unwrap();
    session.retrieve().unwrap();
    let tracker = session.progress().clone();
    session.close().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.responses(), 3);
    assert_eq!(tracker.last_status(), Some(Status::Success));

    let log = provider.join().unwrap();
    assert!(log.released);
    assert_eq!(log.requests.len(), 1);
    assert_eq!(log.requests[0].command_field, C_MOVE_RQ);
    assert_eq!(log.requests[0].message_id, Some(1));
    assert!(log.requests[0].has_dataset);
}

#[test]
fn response_without_status_is_rejected() {
    let (listener, addr) = provider();
    let provider = spawn_provider(listener, |request| {
        let mut rsp = move_response(request, Status::Success, Some(0), 1);
        rsp.remove_element(tags::STATUS);
        vec![rsp]
    });

    let calls = Arc::new(AtomicU32::new(0));
    let hook_calls = Arc::clone(&calls);
    let options = RetrieveOptions::new()
        .destination("STORESCP")
        .on_complete(move |_: &Completion| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

    let mut session = RetrieveSession::open(&UlConnector, &addr, options).unwrap();
    session.retrieve().unwrap();
    let closed = session.close();

    assert!(matches!(closed, Err(Error::Drain { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!provider.join().unwrap().released);
}

#[test]
fn silent_provider_times_out() {
    let (listener, addr) = provider();
    let provider = spawn_provider(listener, |_| Vec::new());

    let options = RetrieveOptions::new()
        .destination("STORESCP")
        .timeout(Duration::from_millis(200));

    let started = Instant::now();
    let mut session = RetrieveSession::open(&UlConnector, &addr, options).unwrap();
    session.retrieve().unwrap();
    let closed = session.close();

    assert!(matches!(closed, Err(Error::Drain { .. })));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!provider.join().unwrap().released);
}

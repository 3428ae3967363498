//! Query task behavior against an in-memory responder.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_qr::association::{DimseResponder, Result};
use dicom_qr::attrs::tags_of;
use dicom_qr::command::{CommandHeader, C_FIND_RQ};
use dicom_qr::{CancelHandle, FailureKind, MatchError, MatchSource, QueryTask, Status};

/// Records every response,
/// optionally canceling a task after a number of pending responses.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(CommandHeader, Option<InMemDicomObject>)>>,
    cancel_after: Mutex<Option<(usize, CancelHandle)>>,
}

impl DimseResponder for Recorder {
    fn send_response(
        &self,
        _presentation_context_id: u8,
        command: InMemDicomObject,
        dataset: Option<InMemDicomObject>,
    ) -> Result<()> {
        let header = CommandHeader::from_command(&command).unwrap();
        let mut sent = self.sent.lock().unwrap();
        sent.push((header, dataset));
        if let Some((count, cancel)) = &*self.cancel_after.lock().unwrap() {
            if sent.len() >= *count {
                cancel.cancel();
            }
        }
        Ok(())
    }
}

impl Recorder {
    fn statuses(&self) -> Vec<u16> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(h, _)| h.status.unwrap())
            .collect()
    }
}

/// A backend over a fixed list of candidates,
/// counting how many times it was closed.
struct Candidates {
    items: VecDeque<InMemDicomObject>,
    closed: Arc<AtomicU32>,
    fail_after: Option<usize>,
    pulled: usize,
}

impl Candidates {
    fn new(items: Vec<InMemDicomObject>) -> (Self, Arc<AtomicU32>) {
        let closed = Arc::new(AtomicU32::new(0));
        (
            Candidates {
                items: items.into(),
                closed: Arc::clone(&closed),
                fail_after: None,
                pulled: 0,
            },
            closed,
        )
    }
}

impl MatchSource for Candidates {
    fn has_more(&mut self) -> std::result::Result<bool, MatchError> {
        Ok(!self.items.is_empty())
    }

    fn next_match(&mut self) -> std::result::Result<InMemDicomObject, MatchError> {
        if Some(self.pulled) == self.fail_after {
            return Err(MatchError::unable_to_process("index corrupted"));
        }
        self.pulled += 1;
        self.items
            .pop_front()
            .ok_or_else(|| MatchError::unable_to_process("no more matches"))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn obj(elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter(
        elements
            .iter()
            .map(|(tag, vr, v)| DataElement::new(*tag, *vr, PrimitiveValue::from(*v))),
    )
}

fn request() -> CommandHeader {
    CommandHeader {
        command_field: C_FIND_RQ,
        message_id: Some(11),
        responded_to: None,
        affected_sop_class_uid: Some("1.2.840.10008.5.1.4.1.2.2.1".to_string()),
        priority: Some(0),
        has_dataset: true,
        status: None,
    }
}

#[test]
fn matching_keys_give_pending_responses() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, ""), (tags::STUDY_DATE, VR::DA, "")]);
    let (source, closed) = Candidates::new(vec![obj(&[
        (tags::PATIENT_ID, VR::LO, "123"),
        (tags::STUDY_DATE, VR::DA, "20240101"),
        (tags::MODALITY, VR::CS, "CT"),
    ])]);

    let recorder = Recorder::default();
    let outcome = QueryTask::new(&recorder, 1, request(), keys, source)
        .run()
        .unwrap();

    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.pending, 1);
    assert_eq!(outcome.warnings, 0);
    assert_eq!(recorder.statuses(), vec![0xFF00, 0x0000]);

    let sent = recorder.sent.lock().unwrap();
    assert_eq!(sent[0].0.responded_to, Some(11));
    let identifier = sent[0].1.as_ref().unwrap();
    assert_eq!(tags_of(identifier), vec![tags::STUDY_DATE, tags::PATIENT_ID]);
    assert_eq!(
        identifier.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
        "123"
    );
    assert!(sent[1].1.is_none());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_optional_key_gives_pending_warning() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, ""), (tags::MODALITY, VR::CS, "")]);
    let (source, _) = Candidates::new(vec![obj(&[(tags::PATIENT_ID, VR::LO, "123")])]);

    let recorder = Recorder::default();
    let outcome = QueryTask::new(&recorder, 1, request(), keys, source)
        .run()
        .unwrap();

    assert_eq!(outcome.warnings, 1);
    assert_eq!(recorder.statuses(), vec![0xFF01, 0x0000]);
    let sent = recorder.sent.lock().unwrap();
    assert_eq!(tags_of(sent[0].1.as_ref().unwrap()), vec![tags::PATIENT_ID]);
}

#[test]
fn cancel_after_first_response() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, "")]);
    let (source, closed) = Candidates::new(vec![
        obj(&[(tags::PATIENT_ID, VR::LO, "1")]),
        obj(&[(tags::PATIENT_ID, VR::LO, "2")]),
        obj(&[(tags::PATIENT_ID, VR::LO, "3")]),
    ]);

    let recorder = Recorder::default();
    let task = QueryTask::new(&recorder, 1, request(), keys, source);
    *recorder.cancel_after.lock().unwrap() = Some((1, task.cancel_handle()));
    let outcome = task.run().unwrap();

    assert_eq!(outcome.status, Status::Cancel);
    assert_eq!(outcome.pending, 1);
    assert_eq!(recorder.statuses(), vec![0xFF00, 0xFE00]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn late_cancel_after_exhaustion_is_success() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, "")]);
    let (source, _) = Candidates::new(vec![obj(&[(tags::PATIENT_ID, VR::LO, "1")])]);

    let recorder = Recorder::default();
    let task = QueryTask::new(&recorder, 1, request(), keys, source);
    *recorder.cancel_after.lock().unwrap() = Some((1, task.cancel_handle()));
    let outcome = task.run().unwrap();

    assert_eq!(outcome.status, Status::Success);
    assert_eq!(recorder.statuses(), vec![0xFF00, 0x0000]);
}

#[test]
fn backend_failure_mid_stream() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, "")]);
    let (mut source, closed) = Candidates::new(vec![
        obj(&[(tags::PATIENT_ID, VR::LO, "1")]),
        obj(&[(tags::PATIENT_ID, VR::LO, "2")]),
    ]);
    source.fail_after = Some(1);

    let recorder = Recorder::default();
    let outcome = QueryTask::new(&recorder, 1, request(), keys, source)
        .run()
        .unwrap();

    assert_eq!(
        outcome.status,
        Status::Failure(FailureKind::UnableToProcess)
    );
    assert_eq!(recorder.statuses(), vec![0xFF00, 0xC000]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn spawned_task_reports_outcome() {
    let keys = obj(&[(tags::PATIENT_ID, VR::LO, "")]);
    let (source, closed) = Candidates::new(vec![
        obj(&[(tags::PATIENT_ID, VR::LO, "1")]),
        obj(&[(tags::PATIENT_ID, VR::LO, "2")]),
    ]);

    let recorder = Arc::new(Recorder::default());
    let task = QueryTask::new(Arc::clone(&recorder), 1, request(), keys, source);
    let (_cancel, handle) = task.spawn().unwrap();
    let outcome = handle.join().unwrap().unwrap();

    assert_eq!(outcome.pending, 2);
    assert_eq!(recorder.statuses(), vec![0xFF00, 0xFF00, 0x0000]);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

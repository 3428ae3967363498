//! The C-FIND query task (service class provider role).
//!
//! A [`QueryTask`] turns a [`MatchSource`] into a stream of DIMSE responses:
//! one pending response per candidate match,
//! projected onto the requested keys,
//! followed by exactly one terminal response.
//! The task can be canceled at any time through its [`CancelHandle`],
//! which is how C-CANCEL requests from the peer are honored.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dicom_object::InMemDicomObject;
use snafu::Snafu;
use tracing::{debug, warn};

use crate::association::{DimseResponder, Result};
use crate::attrs;
use crate::command::{response_command, CommandHeader};
use crate::status::{FailureKind, Status};

/// A shared, monotonic cancellation flag.
///
/// Once set, it is never reset.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request the cancellation of the task.
    /// Calling this more than once has no additional effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A failure of the matching backend,
/// reported to the peer in a terminal failure response.
#[derive(Debug, Snafu)]
#[snafu(display("{}", message))]
pub struct MatchError {
    status: Status,
    message: String,
}

impl MatchError {
    /// Create a match error with the given failure kind and context.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        MatchSnafu {
            status: Status::Failure(kind),
            message: message.into(),
        }
        .build()
    }

    /// Create a match error with the status _Unable to process_ (C000).
    pub fn unable_to_process(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnableToProcess, message)
    }

    /// Wrap any error as a match failure, keeping its message as context.
    pub fn wrap<E>(kind: FailureKind, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::new(kind, error.to_string())
    }

    /// The failure status to report.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The error context, sent as the response's error comment.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A backend producing candidate matches for one query.
///
/// Every method has a default implementation,
/// which together describe a backend with no matches at all.
/// The task pulls candidates one at a time
/// and never calls `next_match` unless `has_more` returned `true`.
pub trait MatchSource {
    /// Whether another candidate is available.
    fn has_more(&mut self) -> Result<bool, MatchError> {
        Ok(false)
    }

    /// Pull the next candidate match.
    fn next_match(&mut self) -> Result<InMemDicomObject, MatchError> {
        Err(MatchError::unable_to_process("no more matches"))
    }

    /// Release any resources held by the source.
    ///
    /// Called exactly once per task run, whatever the outcome.
    fn close(&mut self) {}
}

/// A match source without candidates.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoMatches;

impl MatchSource for NoMatches {}

impl<S> MatchSource for Box<S>
where
    S: MatchSource + ?Sized,
{
    fn has_more(&mut self) -> Result<bool, MatchError> {
        (**self).has_more()
    }

    fn next_match(&mut self) -> Result<InMemDicomObject, MatchError> {
        (**self).next_match()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A summary of a finished query task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    /// number of pending responses sent
    pub pending: u32,
    /// how many of those were sent with a warning status
    pub warnings: u32,
    /// the status of the terminal response
    pub status: Status,
}

/// The execution of one C-FIND request.
pub struct QueryTask<S, R> {
    responder: R,
    presentation_context_id: u8,
    request: CommandHeader,
    keys: InMemDicomObject,
    source: S,
    cancel: CancelHandle,
}

impl<S, R> std::fmt::Debug for QueryTask<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTask")
            .field("presentation_context_id", &self.presentation_context_id)
            .field("request", &self.request)
            .field("canceled", &self.cancel.is_canceled())
            .finish_non_exhaustive()
    }
}

impl<S, R> QueryTask<S, R>
where
    S: MatchSource,
    R: DimseResponder,
{
    /// Prepare a query task for the given request and match keys.
    pub fn new(
        responder: R,
        presentation_context_id: u8,
        request: CommandHeader,
        keys: InMemDicomObject,
        source: S,
    ) -> Self {
        QueryTask {
            responder,
            presentation_context_id,
            request,
            keys,
            source,
            cancel: CancelHandle::default(),
        }
    }

    /// Obtain a handle for canceling this task,
    /// usually on reception of a C-CANCEL request.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the task to completion.
    ///
    /// Backend failures are reported to the peer
    /// and do not make this method fail.
    /// An error is only returned if a response could not be sent,
    /// in which case the association should be considered broken.
    pub fn run(mut self) -> Result<QueryOutcome> {
        let outcome = self.respond();
        self.source.close();
        match &outcome {
            Ok(outcome) => debug!(
                "Query task for message {} finished with {} ({} matches, {} warnings)",
                self.request.message_id.unwrap_or_default(),
                outcome.status,
                outcome.pending,
                outcome.warnings
            ),
            Err(e) => warn!(
                "Query task for message {} interrupted: {}",
                self.request.message_id.unwrap_or_default(),
                snafu::Report::from_error(e)
            ),
        }
        outcome
    }

    fn respond(&mut self) -> Result<QueryOutcome> {
        let mut pending = 0;
        let mut warnings = 0;

        let status = match self.send_matches(&mut pending, &mut warnings) {
            Ok(status) => {
                self.send(status, None, None)?;
                status
            }
            Err(MatchOrSend::Match(e)) => {
                warn!("Matching failed: {}", e);
                self.send(e.status(), None, Some(e.message()))?;
                e.status()
            }
            Err(MatchOrSend::Send(e)) => return Err(e),
        };

        Ok(QueryOutcome {
            pending,
            warnings,
            status,
        })
    }

    /// Send one response per candidate
    /// and decide on the terminal status.
    fn send_matches(
        &mut self,
        pending: &mut u32,
        warnings: &mut u32,
    ) -> Result<Status, MatchOrSend> {
        while !self.cancel.is_canceled() && self.source.has_more()? {
            let candidate = self.source.next_match()?;
            let identifier = attrs::project(&candidate, &self.keys);
            let status = if attrs::unsupported_keys(&candidate, &self.keys).is_empty() {
                Status::Pending
            } else {
                *warnings += 1;
                Status::PendingWarning
            };
            self.send(status, Some(identifier), None)
                .map_err(MatchOrSend::Send)?;
            *pending += 1;
        }

        if self.source.has_more()? {
            Ok(Status::Cancel)
        } else {
            Ok(Status::Success)
        }
    }

    fn send(
        &self,
        status: Status,
        identifier: Option<InMemDicomObject>,
        error_comment: Option<&str>,
    ) -> Result<()> {
        let command = response_command(&self.request, status, identifier.is_some(), error_comment);
        self.responder
            .send_response(self.presentation_context_id, command, identifier)
    }
}

impl<S, R> QueryTask<S, R>
where
    S: MatchSource + Send + 'static,
    R: DimseResponder + Send + 'static,
{
    /// Run the task on a dedicated worker thread.
    pub fn spawn(self) -> std::io::Result<(CancelHandle, JoinHandle<Result<QueryOutcome>>)> {
        let cancel = self.cancel_handle();
        let name = format!("find-{}", self.request.message_id.unwrap_or_default());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())?;
        Ok((cancel, handle))
    }
}

enum MatchOrSend {
    Match(MatchError),
    Send(crate::association::Error),
}

impl From<MatchError> for MatchOrSend {
    fn from(e: MatchError) -> Self {
        MatchOrSend::Match(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHeader, C_FIND_RQ};
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(u16, Option<InMemDicomObject>)>>,
    }

    impl DimseResponder for Recorder {
        fn send_response(
            &self,
            _presentation_context_id: u8,
            command: InMemDicomObject,
            dataset: Option<InMemDicomObject>,
        ) -> Result<()> {
            let status = CommandHeader::from_command(&command)
                .unwrap()
                .status
                .unwrap();
            self.sent.lock().unwrap().push((status, dataset));
            Ok(())
        }
    }

    struct Failing;

    impl MatchSource for Failing {
        fn has_more(&mut self) -> Result<bool, MatchError> {
            Err(MatchError::new(
                FailureKind::OutOfResources,
                "database unavailable",
            ))
        }
    }

    fn request() -> CommandHeader {
        CommandHeader {
            command_field: C_FIND_RQ,
            message_id: Some(1),
            responded_to: None,
            affected_sop_class_uid: Some("1.2.840.10008.5.1.4.1.2.2.1".to_string()),
            priority: Some(0),
            has_dataset: true,
            status: None,
        }
    }

    fn keys() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::Empty,
        )])
    }

    #[test]
    fn no_backend_means_immediate_success() {
        let recorder = Recorder::default();
        let outcome = QueryTask::new(&recorder, 1, request(), keys(), NoMatches)
            .run()
            .unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.pending, 0);
        let sent = recorder.sent.into_inner().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0x0000);
        assert!(sent[0].1.is_none());
    }

    #[test]
    fn backend_failure_becomes_failure_response() {
        let recorder = Recorder::default();
        let outcome = QueryTask::new(&recorder, 1, request(), keys(), Failing)
            .run()
            .unwrap();
        assert_eq!(
            outcome.status,
            Status::Failure(FailureKind::OutOfResources)
        );
        let sent = recorder.sent.into_inner().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 0xA700);
    }

    #[test]
    fn cancel_before_run_with_pending_matches() {
        struct Endless;
        impl MatchSource for Endless {
            fn has_more(&mut self) -> Result<bool, MatchError> {
                Ok(true)
            }
            fn next_match(&mut self) -> Result<InMemDicomObject, MatchError> {
                Ok(InMemDicomObject::new_empty())
            }
        }

        let recorder = Recorder::default();
        let task = QueryTask::new(&recorder, 1, request(), keys(), Endless);
        let handle = task.cancel_handle();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_canceled());
        let outcome = task.run().unwrap();
        assert_eq!(outcome.status, Status::Cancel);
        assert_eq!(outcome.pending, 0);
    }
}

//! Tracking of C-MOVE sub-operation progress.
//!
//! Each response to a C-MOVE request carries a cumulative snapshot
//! of its sub-operation counters.
//! A [`ProgressTracker`] records the latest snapshot of one retrieve session
//! and triggers the session's [`CompletionHook`]
//! the first time no sub-operations remain.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::{debug, info, warn};

use crate::association::ResponseHandler;
use crate::command::CommandHeader;
use crate::status::Status;

/// A snapshot of the sub-operation counters of a C-MOVE exchange.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MoveProgress {
    /// _Number of Remaining Sub-operations_, if reported
    pub remaining: Option<u16>,
    /// _Number of Completed Sub-operations_
    pub completed: u16,
    /// _Number of Failed Sub-operations_
    pub failed: u16,
    /// _Number of Warning Sub-operations_
    pub warning: u16,
}

impl MoveProgress {
    /// Read the sub-operation counters from a response command set.
    ///
    /// Absent or malformed counters are read as unknown (remaining)
    /// or zero (the others).
    pub fn from_command(cmd: &InMemDicomObject) -> Self {
        let counter = |tag: dicom_core::Tag| {
            cmd.element(tag)
                .ok()
                .and_then(|e| e.to_int::<u16>().ok())
        };
        MoveProgress {
            remaining: counter(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: counter(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).unwrap_or(0),
            failed: counter(tags::NUMBER_OF_FAILED_SUBOPERATIONS).unwrap_or(0),
            warning: counter(tags::NUMBER_OF_WARNING_SUBOPERATIONS).unwrap_or(0),
        }
    }

    /// The number of sub-operations which have already finished.
    pub fn finished(&self) -> u32 {
        u32::from(self.completed) + u32::from(self.failed) + u32::from(self.warning)
    }
}

/// The state of a retrieve session at the moment it completed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Completion {
    /// the counters which reported no remaining sub-operations
    pub progress: MoveProgress,
    /// the status of that response
    pub status: Status,
    /// time taken to establish the association
    pub association_time: Duration,
    /// time from the start of the session's requests to completion
    pub elapsed: Duration,
}

/// A side effect to run once all sub-operations of a retrieve session are done.
pub trait CompletionHook: Send {
    /// Called exactly once per session.
    fn on_complete(&mut self, completion: &Completion);
}

impl<F> CompletionHook for F
where
    F: FnMut(&Completion) + Send,
{
    fn on_complete(&mut self, completion: &Completion) {
        self(completion)
    }
}

#[derive(Default)]
struct State {
    latest: Option<MoveProgress>,
    status: Option<Status>,
    responses: u32,
    hook: Option<Box<dyn CompletionHook>>,
    completed: bool,
    association_time: Duration,
    started: Option<Instant>,
}

/// The progress of a retrieve session,
/// shared by the response handlers of all its requests.
///
/// Cloning produces another handle to the same progress.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ProgressTracker")
            .field("latest", &state.latest)
            .field("status", &state.status)
            .field("responses", &state.responses)
            .field("completed", &state.completed)
            .finish()
    }
}

impl ProgressTracker {
    /// Create a tracker without a completion hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker which runs the given hook on completion.
    pub fn with_hook(hook: impl CompletionHook + 'static) -> Self {
        Self::with_boxed_hook(Box::new(hook))
    }

    /// Create a tracker which runs an already boxed hook on completion.
    pub fn with_boxed_hook(hook: Box<dyn CompletionHook>) -> Self {
        let tracker = Self::default();
        tracker.lock().hook = Some(hook);
        tracker
    }

    /// Mark the start of the session's requests,
    /// recording how long the association took to establish.
    pub fn start(&self, association_time: Duration) {
        let mut state = self.lock();
        state.association_time = association_time;
        state.started = Some(Instant::now());
    }

    /// The most recently received counters.
    pub fn latest(&self) -> Option<MoveProgress> {
        self.lock().latest
    }

    /// The status of the most recently received response.
    pub fn last_status(&self) -> Option<Status> {
        self.lock().status
    }

    /// The number of responses received so far.
    pub fn responses(&self) -> u32 {
        self.lock().responses
    }

    /// Whether the session reached zero remaining sub-operations.
    pub fn is_complete(&self) -> bool {
        self.lock().completed
    }

    /// Create a response handler feeding this tracker.
    pub fn handler(&self) -> Box<dyn ResponseHandler> {
        Box::new(self.clone())
    }

    /// Record a response command set.
    pub fn record(&self, cmd: &InMemDicomObject) {
        let status = match CommandHeader::from_command(cmd) {
            Ok(CommandHeader {
                status: Some(code), ..
            }) => Status::from_code(code),
            Ok(_) => {
                warn!("Ignoring C-MOVE response without status");
                return;
            }
            Err(e) => {
                warn!("Ignoring malformed C-MOVE response: {}", e);
                return;
            }
        };
        let mut progress = MoveProgress::from_command(cmd);

        // final responses may leave out the remaining counter
        if progress.remaining.is_none() && status.is_final() {
            progress.remaining = Some(0);
        }

        match status {
            Status::Pending | Status::PendingWarning => debug!(
                "C-MOVE pending: {} remaining, {} completed, {} failed, {} warning",
                progress.remaining.unwrap_or_default(),
                progress.completed,
                progress.failed,
                progress.warning
            ),
            Status::Success => info!(
                "C-MOVE complete: {} completed, {} failed, {} warning",
                progress.completed, progress.failed, progress.warning
            ),
            Status::Cancel | Status::Warning(_) => warn!(
                "C-MOVE finished with status {:04X}H ({}): {} completed, {} failed, {} warning",
                status.code(),
                status,
                progress.completed,
                progress.failed,
                progress.warning
            ),
            Status::Failure(_) => {
                let comment = cmd
                    .element(tags::ERROR_COMMENT)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|c| c.trim().to_string())
                    .unwrap_or_default();
                warn!(
                    "C-MOVE failed with status {:04X}H ({}) {}",
                    status.code(),
                    status,
                    comment
                )
            }
        }

        let hook = {
            let mut state = self.lock();
            state.latest = Some(progress);
            state.status = Some(status);
            state.responses += 1;
            if progress.remaining == Some(0) && !state.completed {
                state.completed = true;
                state.hook.take().map(|hook| {
                    let completion = Completion {
                        progress,
                        status,
                        association_time: state.association_time,
                        elapsed: state.started.map(|t| t.elapsed()).unwrap_or_default(),
                    };
                    (hook, completion)
                })
            } else {
                None
            }
        };

        // run outside of the lock, the hook may inspect the tracker
        if let Some((mut hook, completion)) = hook {
            hook.on_complete(&completion);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseHandler for ProgressTracker {
    fn on_response(&mut self, command: &InMemDicomObject, _dataset: Option<&InMemDicomObject>) {
        self.record(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{response_command, CommandHeader, C_MOVE_RQ};
    use dicom_core::{dicom_value, DataElement, VR};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn response(status: Status, counters: &[(dicom_core::Tag, u16)]) -> InMemDicomObject {
        let request = CommandHeader {
            command_field: C_MOVE_RQ,
            message_id: Some(1),
            responded_to: None,
            affected_sop_class_uid: None,
            priority: Some(0),
            has_dataset: true,
            status: None,
        };
        let mut cmd = response_command(&request, status, false, None);
        for (tag, value) in counters {
            cmd.put(DataElement::new(*tag, VR::US, dicom_value!(U16, [*value])));
        }
        cmd
    }

    #[test]
    fn counters_are_read_from_command() {
        let cmd = response(
            Status::Pending,
            &[
                (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, 4),
                (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, 2),
                (tags::NUMBER_OF_FAILED_SUBOPERATIONS, 1),
            ],
        );
        let progress = MoveProgress::from_command(&cmd);
        assert_eq!(
            progress,
            MoveProgress {
                remaining: Some(4),
                completed: 2,
                failed: 1,
                warning: 0,
            }
        );
        assert_eq!(progress.finished(), 3);
    }

    #[test]
    fn final_response_without_counter_completes() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::clone(&calls);
        let tracker = ProgressTracker::with_hook(move |c: &Completion| {
            assert_eq!(c.progress.remaining, Some(0));
            assert_eq!(c.association_time, Duration::from_millis(15));
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });
        tracker.start(Duration::from_millis(15));
        tracker.record(&response(Status::Success, &[]));
        assert!(tracker.is_complete());
        assert_eq!(tracker.last_status(), Some(Status::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boxed_hook_fires_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::clone(&calls);
        let hook: Box<dyn CompletionHook> = Box::new(move |_: &Completion| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });
        let tracker = ProgressTracker::with_boxed_hook(hook);
        tracker.record(&response(
            Status::Pending,
            &[(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, 0)],
        ));
        tracker.record(&response(Status::Success, &[]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.responses(), 2);
    }

    #[test]
    fn pending_without_counter_does_not_complete() {
        let tracker = ProgressTracker::new();
        tracker.record(&response(Status::Pending, &[]));
        assert!(!tracker.is_complete());
        assert_eq!(tracker.responses(), 1);
    }
}

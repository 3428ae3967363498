//! This crate contains the query/retrieve engine of DICOM-rs tools:
//! the parts which drive an association
//! through C-FIND and C-MOVE message exchanges.
//!
//! - The [`find`] module
//!   provides the query task of a C-FIND service class provider,
//!   turning a [match source](find::MatchSource)
//!   into a cancellable stream of filtered responses.
//! - The [`retrieve`] module
//!   provides the retrieve orchestration of a C-MOVE service class user:
//!   opening an association, issuing move requests
//!   and tracking their sub-operations until completion.
//! - The [`association`] module
//!   describes what these need from the association layer,
//!   and the [`ul`] module implements it with `dicom-ul`.
//!
//! Supporting modules include
//! the DIMSE [`status`] vocabulary,
//! [`command`] set construction and encoding,
//! attribute set operations in [`attrs`],
//! match key parsing in [`keys`],
//! sub-operation [`progress`] tracking
//! and [`storage`] for instances received during a retrieval.

pub mod association;
pub mod attrs;
pub mod command;
pub mod find;
pub mod keys;
pub mod progress;
pub mod retrieve;
pub mod status;
pub mod storage;
pub mod ul;

// re-exports

pub use find::{CancelHandle, MatchError, MatchSource, NoMatches, QueryOutcome, QueryTask};
pub use progress::{Completion, CompletionHook, MoveProgress, ProgressTracker};
pub use retrieve::{InformationModel, Priority, RetrieveOptions, RetrieveSession};
pub use status::{FailureKind, Status};
pub use storage::TemporaryStorage;

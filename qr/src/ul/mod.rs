//! Association layer adapters on top of `dicom-ul`.
//!
//! - [`UlConnector`] requests associations for retrieve sessions;
//! - [`serve_find_association`] runs the C-FIND service
//!   on an accepted TCP connection;
//! - [`MessageAssembler`] rebuilds DIMSE messages from P-DATA values.
mod client;
mod pdata;
mod server;

pub use client::{UlConnector, UlRetrieveChannel};
pub use pdata::{IncomingMessage, MessageAssembler};
pub use server::{
    serve_find_association, FindServiceOptions, SharedWriter, PATIENT_ROOT_FIND, STUDY_ROOT_FIND,
    VERIFICATION,
};

use crate::association::BoxError;

fn boxed<E>(e: E) -> BoxError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(e)
}

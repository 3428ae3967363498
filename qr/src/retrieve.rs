//! The C-MOVE retrieve orchestration (service class user role).
//!
//! A [`RetrieveSession`] opens an association with the retrieve provider,
//! issues one C-MOVE request per retrieval,
//! tracks the sub-operation progress reported in the responses,
//! and finally drains all outstanding responses before releasing.
//!
//! ```no_run
//! # use dicom_qr::retrieve::{RetrieveOptions, RetrieveSession};
//! # use dicom_qr::ul::UlConnector;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = RetrieveOptions::new()
//!     .destination("STORESCP")
//!     .key_terms(&["StudyInstanceUID=1.2.3.4"])?;
//! let mut session = RetrieveSession::open(&UlConnector, "QRSCP@pacs:11112", options)?;
//! session.retrieve()?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::association::{AssociationConfig, Connector, RetrieveChannel};
use crate::attrs;
use crate::command::MoveRequest;
use crate::keys::{self, DEFAULT_INPUT_FILTER};
use crate::progress::{CompletionHook, ProgressTracker};
use crate::storage::TemporaryStorage;

pub use crate::command::Priority;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing move destination
    MissingDestination,

    #[snafu(display("invalid information model `{}`", name))]
    UnknownInformationModel { name: String },

    #[snafu(display("invalid priority `{}`", value))]
    InvalidPriority { value: String },

    /// invalid match key
    InvalidKey { source: keys::Error },

    #[snafu(display("could not read {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: dicom_object::ReadError,
    },

    /// could not prepare temporary storage
    PrepareStorage { source: crate::storage::Error },

    /// could not establish association
    Connect { source: crate::association::Error },

    /// association is not ready for data transfer
    NotReady,

    /// could not send C-MOVE request
    Request { source: crate::association::Error },

    /// failed while waiting for C-MOVE responses
    Drain { source: crate::association::Error },

    /// could not release association
    Release { source: crate::association::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A query/retrieve information model for the C-MOVE service.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InformationModel {
    PatientRoot,
    #[default]
    StudyRoot,
    PatientStudyOnly,
    CompositeInstanceRoot,
    HangingProtocol,
    ColorPalette,
}

impl InformationModel {
    /// All supported models.
    pub const ALL: [InformationModel; 6] = [
        InformationModel::PatientRoot,
        InformationModel::StudyRoot,
        InformationModel::PatientStudyOnly,
        InformationModel::CompositeInstanceRoot,
        InformationModel::HangingProtocol,
        InformationModel::ColorPalette,
    ];

    /// The SOP class UID of the model's MOVE service.
    pub fn sop_class_uid(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => "1.2.840.10008.5.1.4.1.2.1.2",
            InformationModel::StudyRoot => "1.2.840.10008.5.1.4.1.2.2.2",
            InformationModel::PatientStudyOnly => "1.2.840.10008.5.1.4.1.2.3.2",
            InformationModel::CompositeInstanceRoot => "1.2.840.10008.5.1.4.1.2.4.3",
            InformationModel::HangingProtocol => "1.2.840.10008.5.1.4.38.3",
            InformationModel::ColorPalette => "1.2.840.10008.5.1.4.39.3",
        }
    }

    /// The _Query/Retrieve Level_ implied by the model, if any.
    pub fn level(self) -> Option<&'static str> {
        match self {
            InformationModel::PatientRoot
            | InformationModel::StudyRoot
            | InformationModel::PatientStudyOnly => Some("STUDY"),
            InformationModel::CompositeInstanceRoot => Some("IMAGE"),
            InformationModel::HangingProtocol | InformationModel::ColorPalette => None,
        }
    }

    /// The model's name, as accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => "PatientRoot",
            InformationModel::StudyRoot => "StudyRoot",
            InformationModel::PatientStudyOnly => "PatientStudyOnly",
            InformationModel::CompositeInstanceRoot => "CompositeInstanceRoot",
            InformationModel::HangingProtocol => "HangingProtocol",
            InformationModel::ColorPalette => "ColorPalette",
        }
    }
}

impl fmt::Display for InformationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InformationModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        InformationModel::ALL
            .into_iter()
            .find(|model| model.name() == s)
            .context(UnknownInformationModelSnafu { name: s })
    }
}

impl FromStr for Priority {
    type Err = Error;

    /// Parse a priority by name (`MEDIUM`, `HIGH`, `LOW`)
    /// or by code (`0`, `1`, `2`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "LOW" => Ok(Priority::Low),
            code => code
                .parse::<u16>()
                .ok()
                .and_then(Priority::from_code)
                .context(InvalidPrioritySnafu { value: s }),
        }
    }
}

/// Options for a retrieve session.
pub struct RetrieveOptions {
    destination: Option<String>,
    model: InformationModel,
    relational: bool,
    priority: Priority,
    keys: InMemDicomObject,
    level: Option<String>,
    input_filter: Vec<Tag>,
    calling_ae_title: String,
    called_ae_title: Option<String>,
    transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    timeout: Option<Duration>,
    storage: Option<TemporaryStorage>,
    hook: Option<Box<dyn CompletionHook>>,
}

impl fmt::Debug for RetrieveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveOptions")
            .field("destination", &self.destination)
            .field("model", &self.model)
            .field("relational", &self.relational)
            .field("priority", &self.priority)
            .field("level", &self.level)
            .field("input_filter", &self.input_filter)
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("transfer_syntaxes", &self.transfer_syntaxes)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("timeout", &self.timeout)
            .field("storage", &self.storage)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        RetrieveOptions {
            destination: None,
            model: InformationModel::default(),
            relational: false,
            priority: Priority::default(),
            keys: InMemDicomObject::new_empty(),
            level: None,
            input_filter: DEFAULT_INPUT_FILTER.to_vec(),
            calling_ae_title: "MOVESCU".to_string(),
            called_ae_title: None,
            transfer_syntaxes: Vec::new(),
            max_pdu_length: 16_384,
            timeout: None,
            storage: None,
            hook: None,
        }
    }
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AE title of the move destination (required).
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the information model.
    pub fn model(mut self, model: InformationModel) -> Self {
        self.model = model;
        self
    }

    /// Request relational retrieval.
    pub fn relational(mut self, relational: bool) -> Self {
        self.relational = relational;
        self
    }

    /// Set the request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add match keys.
    /// These override attributes read from source files.
    pub fn keys(mut self, keys: &InMemDicomObject) -> Self {
        attrs::merge(&mut self.keys, keys);
        self
    }

    /// Add match keys in `tag=value` form.
    pub fn key_terms<T>(mut self, terms: &[T]) -> Result<Self>
    where
        T: AsRef<str>,
    {
        self.keys = keys::parse_queries(self.keys, terms).context(InvalidKeySnafu)?;
        Ok(self)
    }

    /// Override the query/retrieve level.
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Set the attributes to read from source files.
    /// An empty list keeps the default filter.
    pub fn input_filter(mut self, tags: Vec<Tag>) -> Self {
        if !tags.is_empty() {
            self.input_filter = tags;
        }
        self
    }

    /// Set the calling AE title.
    pub fn calling_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.calling_ae_title = ae_title.into();
        self
    }

    /// Set the called AE title,
    /// overriding the one in the provider's address.
    pub fn called_ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.called_ae_title = Some(ae_title.into());
        self
    }

    /// Set the proposed transfer syntaxes.
    pub fn transfer_syntaxes(mut self, transfer_syntaxes: Vec<String>) -> Self {
        self.transfer_syntaxes = transfer_syntaxes;
        self
    }

    /// Set the maximum PDU length admitted by this node.
    pub fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Set how long to wait for each C-MOVE response.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a temporary storage area for the moved instances,
    /// purged before the session starts and after it ends.
    pub fn storage(mut self, storage: TemporaryStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Run a side effect once no sub-operations remain.
    pub fn on_complete(mut self, hook: impl CompletionHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// The identifier sent when retrieving without source files.
    ///
    /// Holds the model's level,
    /// then the explicit match keys,
    /// then the level override.
    fn base_keys(&self) -> InMemDicomObject {
        let mut out = InMemDicomObject::new_empty();
        if let Some(level) = self.model.level() {
            out.put(keys::level_element(level));
        }
        attrs::merge(&mut out, &self.keys);
        if let Some(level) = &self.level {
            out.put(keys::level_element(level));
        }
        out
    }
}

/// An open retrieve session.
pub struct RetrieveSession<C> {
    channel: Option<C>,
    destination: String,
    sop_class_uid: &'static str,
    priority: Priority,
    keys: InMemDicomObject,
    input_filter: Vec<Tag>,
    tracker: ProgressTracker,
    storage: Option<TemporaryStorage>,
    requests: u32,
}

impl<C> fmt::Debug for RetrieveSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveSession")
            .field("destination", &self.destination)
            .field("sop_class_uid", &self.sop_class_uid)
            .field("priority", &self.priority)
            .field("tracker", &self.tracker)
            .field("storage", &self.storage)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl<C> RetrieveSession<C>
where
    C: RetrieveChannel,
{
    /// Validate the options and open an association with the retrieve provider.
    ///
    /// `address` is the provider's address,
    /// in the form `AE-TITLE@host:port`.
    pub fn open<N>(connector: &N, address: &str, options: RetrieveOptions) -> Result<Self>
    where
        N: Connector<Channel = C>,
    {
        let destination = options
            .destination
            .clone()
            .filter(|d| !d.trim().is_empty())
            .context(MissingDestinationSnafu)?;
        let keys = options.base_keys();

        if let Some(storage) = &options.storage {
            storage.create().context(PrepareStorageSnafu)?;
            storage.purge().context(PrepareStorageSnafu)?;
        }

        let mut config = AssociationConfig::new(address, options.model.sop_class_uid())
            .calling_ae_title(options.calling_ae_title.as_str())
            .transfer_syntaxes(options.transfer_syntaxes.iter().map(String::as_str))
            .relational(options.relational)
            .max_pdu_length(options.max_pdu_length);
        if let Some(called_ae_title) = &options.called_ae_title {
            config = config.called_ae_title(called_ae_title.as_str());
        }
        if let Some(timeout) = options.timeout {
            config = config.timeout(timeout);
        }

        let open_started = Instant::now();
        let channel = connector.connect(&config).context(ConnectSnafu)?;
        let association_time = open_started.elapsed();
        info!(
            "Association with {} established in {} ms",
            address,
            association_time.as_millis()
        );

        let tracker = match options.hook {
            Some(hook) => ProgressTracker::with_boxed_hook(hook),
            None => ProgressTracker::new(),
        };
        tracker.start(association_time);

        Ok(RetrieveSession {
            channel: Some(channel),
            destination,
            sop_class_uid: options.model.sop_class_uid(),
            priority: options.priority,
            keys,
            input_filter: options.input_filter,
            tracker,
            storage: options.storage,
            requests: 0,
        })
    }

    /// The progress of this session.
    pub fn progress(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Retrieve using the accumulated match keys alone.
    pub fn retrieve(&mut self) -> Result<()> {
        let keys = self.keys.clone();
        self.send(keys)
    }

    /// Retrieve using the filtered attributes of a DICOM file,
    /// overridden by the accumulated match keys.
    pub fn retrieve_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .context(ReadFileSnafu { path })?;
        let mut keys = attrs::select(&obj, self.input_filter.iter().copied());
        attrs::merge(&mut keys, &self.keys);
        debug!("Retrieving with keys from {}", path.display());
        self.send(keys)
    }

    /// Retrieve once per file, sequentially.
    ///
    /// Each request is fully answered before the next one is issued.
    pub fn retrieve_files<I, P>(&mut self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            if self.requests > 0 {
                self.channel_mut()?.wait_for_outstanding().context(DrainSnafu)?;
            }
            self.retrieve_file(path)?;
        }
        Ok(())
    }

    /// Wait for all outstanding responses,
    /// release the association
    /// and purge the temporary storage, if any.
    pub fn close(mut self) -> Result<()> {
        let outcome = self.finish();
        self.purge_storage();
        outcome
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        if !channel.is_ready() {
            warn!("Association no longer ready, not releasing");
            return Ok(());
        }
        if let Err(e) = channel.wait_for_outstanding() {
            let _ = channel.abort();
            return Err(e).context(DrainSnafu);
        }
        channel.release().context(ReleaseSnafu)?;
        debug!("Association released");
        Ok(())
    }

    fn purge_storage(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.purge() {
                warn!("{}", snafu::Report::from_error(e));
            }
        }
    }

    fn send(&mut self, keys: InMemDicomObject) -> Result<()> {
        let destination = self.destination.clone();
        let sop_class_uid = self.sop_class_uid;
        let priority = self.priority;
        let handler = self.tracker.handler();
        let channel = self.channel_mut()?;
        ensure!(channel.is_ready(), NotReadySnafu);
        let request = MoveRequest {
            message_id: channel.next_message_id(),
            sop_class_uid: sop_class_uid.to_string(),
            priority,
            destination,
            keys,
        };
        debug!(
            "Sending C-MOVE request {} to {}",
            request.message_id, request.destination
        );
        channel.move_request(request, handler).context(RequestSnafu)?;
        self.requests += 1;
        Ok(())
    }

    fn channel_mut(&mut self) -> Result<&mut C> {
        self.channel.as_mut().context(NotReadySnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_and_levels() {
        let model: InformationModel = "CompositeInstanceRoot".parse().unwrap();
        assert_eq!(model.level(), Some("IMAGE"));
        assert_eq!(model.sop_class_uid(), "1.2.840.10008.5.1.4.1.2.4.3");
        assert_eq!(InformationModel::default().to_string(), "StudyRoot");
        assert_eq!(InformationModel::HangingProtocol.level(), None);
        assert!(matches!(
            "studyroot".parse::<InformationModel>(),
            Err(Error::UnknownInformationModel { .. })
        ));
    }

    #[test]
    fn priorities_by_name_or_code() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("2".parse::<Priority>().unwrap(), Priority::Low);
        assert!("3".parse::<Priority>().is_err());
    }

    #[test]
    fn level_override_wins() {
        let options = RetrieveOptions::new()
            .key_terms(&["QueryRetrieveLevel=PATIENT", "PatientID=42"])
            .unwrap()
            .level("series");
        let keys = options.base_keys();
        assert_eq!(
            keys.element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "SERIES"
        );
        assert!(attrs::contains(&keys, tags::PATIENT_ID));

        let keys = RetrieveOptions::new().base_keys();
        assert_eq!(
            keys.element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "STUDY"
        );
    }
}

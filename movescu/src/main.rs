use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dicom_qr::keys::parse_tags;
use dicom_qr::ul::UlConnector;
use dicom_qr::{InformationModel, Priority, RetrieveOptions, RetrieveSession, TemporaryStorage};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod log_file;
mod store;

use log_file::MoveLog;
use store::{run_store_async, StoreOptions};

/// DICOM C-MOVE SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// address of the retrieve provider (example: "QRSCP@127.0.0.1:1045")
    addr: String,
    /// DICOM files providing match keys, one C-MOVE request per file
    files: Vec<PathBuf>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the C-MOVE destination AE title
    #[arg(long = "dest")]
    destination: String,
    /// the query/retrieve information model
    #[arg(short = 'M', long = "model", default_value_t = InformationModel::StudyRoot)]
    model: InformationModel,
    /// negotiate relational retrieval
    #[arg(long)]
    relational: bool,
    /// a match key in the form `tag=value` (example: "StudyInstanceUID=1.2.3")
    #[arg(short = 'm', long = "match")]
    keys: Vec<String>,
    /// override the query/retrieve level (PATIENT, STUDY, SERIES or IMAGE)
    #[arg(short = 'L', long = "level")]
    level: Option<String>,
    /// attributes read from the given DICOM files, comma separated
    #[arg(short = 'i', long = "in-attr", value_delimiter = ',')]
    input_filter: Vec<String>,
    /// the request priority (MEDIUM, HIGH, LOW or the code)
    #[arg(long, default_value = "MEDIUM")]
    priority: Priority,

    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "MOVESCU")]
    calling_ae_title: String,
    /// the called AE title, overriding the one in the address
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// a transfer syntax UID to propose (repeatable)
    #[arg(long = "transfer-syntax")]
    transfer_syntax: Vec<String>,
    /// how long to wait for each C-MOVE response, in milliseconds
    #[arg(long = "timeout")]
    timeout: Option<u64>,

    /// append a line describing the retrieval to this file;
    /// moved instances are then kept in $TMPDIR/dicoms
    /// and deleted once measured
    #[arg(long = "log-file", requires = "store_port", conflicts_with = "storage_dir")]
    log_file: Option<PathBuf>,
    /// the port of the embedded storage receiver
    #[arg(long = "store-port")]
    store_port: Option<u16>,
    /// the directory receiving moved instances,
    /// never emptied by this tool [default: .]
    #[arg(long = "storage-dir")]
    storage_dir: Option<PathBuf>,
}

fn main() {
    let app = App::parse();

    let level = if app.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            )
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(app).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(2);
    });
}

fn run(app: App) -> Result<(), Whatever> {
    let input_filter = parse_tags(&app.input_filter).whatever_context("Invalid input filter")?;
    let mut options = RetrieveOptions::new()
        .destination(app.destination.as_str())
        .model(app.model)
        .relational(app.relational)
        .priority(app.priority)
        .key_terms(&app.keys)
        .whatever_context("Invalid match keys")?
        .input_filter(input_filter)
        .calling_ae_title(app.calling_ae_title.as_str())
        .max_pdu_length(app.max_pdu_length)
        .transfer_syntaxes(app.transfer_syntax.clone());
    if let Some(level) = &app.level {
        options = options.level(level.as_str());
    }
    if let Some(called_ae_title) = &app.called_ae_title {
        options = options.called_ae_title(called_ae_title.as_str());
    }
    if let Some(timeout) = app.timeout {
        options = options.timeout(Duration::from_millis(timeout));
    }

    let runtime = match app.store_port {
        Some(port) => {
            let out_dir = match temporary_storage(&app) {
                Some((log_file, storage)) => {
                    options = options.storage(storage.clone()).on_complete(MoveLog::new(
                        log_file,
                        storage.clone(),
                        config_echo(&app),
                        app.keys.concat(),
                    ));
                    storage.path().to_path_buf()
                }
                None => app.storage_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            };
            Some(start_store_receiver(&app, port, out_dir)?)
        }
        None => None,
    };

    let mut session = RetrieveSession::open(&UlConnector, &app.addr, options)
        .whatever_context("Could not open retrieve session")?;
    let retrieved = if app.files.is_empty() {
        session.retrieve()
    } else {
        session.retrieve_files(&app.files)
    };
    let progress = session.progress().clone();
    let closed = session.close();

    if let Some(runtime) = runtime {
        runtime.shutdown_background();
    }

    retrieved.whatever_context("Retrieval failed")?;
    closed.whatever_context("Could not close the retrieve session")?;

    let status = progress
        .last_status()
        .whatever_context("No response from the retrieve provider")?;
    match progress.latest() {
        Some(p) => info!(
            "Retrieval finished with {}: {} completed, {} failed, {} warning",
            status, p.completed, p.failed, p.warning
        ),
        None => info!("Retrieval finished with {}", status),
    }
    Ok(())
}

fn start_store_receiver(
    app: &App,
    port: u16,
    out_dir: PathBuf,
) -> Result<tokio::runtime::Runtime, Whatever> {
    std::fs::create_dir_all(&out_dir)
        .whatever_context("Could not create storage directory")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .whatever_context("Could not start async runtime")?;

    let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind(listen_addr))
        .whatever_context("Could not bind storage receiver")?;
    info!(
        "{} listening on: tcp://{}",
        &app.destination, listen_addr
    );

    let options = Arc::new(StoreOptions {
        ae_title: app.destination.clone(),
        strict: false,
        max_pdu_length: app.max_pdu_length,
        out_dir,
    });
    runtime.spawn(run_store_async(listener, options));
    Ok(runtime)
}

/// The log file and the storage emptied before and after the retrieval.
///
/// Only logging to a file uses a temporary storage,
/// always at the default location.
fn temporary_storage(app: &App) -> Option<(PathBuf, TemporaryStorage)> {
    let log_file = app.log_file.clone()?;
    Some((
        log_file,
        TemporaryStorage::new(TemporaryStorage::default_location()),
    ))
}

/// The provider address echoed in the log line.
fn config_echo(app: &App) -> String {
    if app.addr.contains('@') {
        app.addr.clone()
    } else {
        String::new()
    }
}

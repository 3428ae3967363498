use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dicom_qr::ul::{serve_find_association, FindServiceOptions};
use snafu::{Report, ResultExt, Whatever};
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod index;

use index::Index;

/// DICOM C-FIND SCP over a directory of DICOM files
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// the directory of DICOM files to serve
    dir: PathBuf,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// this node's AE title
    #[arg(long = "ae-title", default_value = "FIND-SCP")]
    ae_title: String,
    /// enforce max pdu length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// the maximum PDU length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// which port to listen on
    #[arg(short, default_value = "11112")]
    port: u16,
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
    if !app.dir.is_dir() {
        snafu::whatever!("{} is not a directory", app.dir.display());
    }
    let index = Arc::new(Index::scan(&app.dir));
    if index.is_empty() {
        info!("No DICOM files found, all queries will yield no matches");
    } else {
        debug!("Serving {} indexed files", index.len());
    }

    let options = Arc::new(
        FindServiceOptions::new()
            .ae_title(app.ae_title.as_str())
            .strict(app.strict)
            .max_pdu_length(app.max_pdu_length),
    );

    let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, app.port);
    let listener = TcpListener::bind(listen_addr).whatever_context("Could not bind listener")?;
    info!("{} listening on: tcp://{}", &app.ae_title, listen_addr);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("{}", Report::from_error(e));
                continue;
            }
        };
        let index = Arc::clone(&index);
        let options = Arc::clone(&options);
        let spawned = std::thread::Builder::new()
            .name("association".to_string())
            .spawn(move || {
                let served = serve_find_association(stream, &options, |sop_class_uid, keys| {
                    debug!("C-FIND on {}", sop_class_uid);
                    Ok(index.search(keys))
                });
                if let Err(e) = served {
                    error!("{}", Report::from_error(e));
                }
            });
        if let Err(e) = spawned {
            error!("Could not serve association: {}", Report::from_error(e));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }
}

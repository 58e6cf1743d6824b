//! Terminal logging plus one log file per station.
//!
//! Events raised on a station's control thread land in that station's file
//! when it has one open. Everything else goes to the process log file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::{EitherWriter, MakeWriter};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const THREAD_PREFIX: &str = "rfcontrol-";

/// Routing key of the process log
const PROCESS_LOG: &str = "";

static LOGGING: OnceLock<Result<Logging, String>> = OnceLock::new();

struct Logging {
    router: LogRouter,
    _stdout: Mutex<WorkerGuard>,
}

/// Name given to a station's control thread.
pub(crate) fn thread_name(station: &str) -> String {
    format!("{THREAD_PREFIX}{station}")
}

fn station_of_thread(name: Option<&str>) -> Option<&str> {
    name?.strip_prefix(THREAD_PREFIX)
}

struct LogFile {
    writer: NonBlocking,
    _guard: Mutex<WorkerGuard>,
}

/// Picks the file for each event from the emitting thread's name.
#[derive(Clone, Default)]
struct LogRouter {
    files: Arc<RwLock<BTreeMap<String, LogFile>>>,
}

impl LogRouter {
    /// Route `key` to `{op_dir}/logs/{file_name}.log`, replacing any earlier file.
    fn open(&self, key: &str, op_dir: &Path, file_name: &str) -> Result<PathBuf, String> {
        let (path, file) = open_log_file(op_dir, file_name)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let mut files = self
            .files
            .write()
            .map_err(|_| "log file table poisoned".to_string())?;
        files.insert(
            key.to_owned(),
            LogFile {
                writer,
                _guard: Mutex::new(guard),
            },
        );
        Ok(path)
    }

    /// Flush and drop the file for `key`.
    fn close(&self, key: &str) {
        if let Ok(mut files) = self.files.write() {
            files.remove(key);
        }
    }
}

impl<'a> MakeWriter<'a> for LogRouter {
    type Writer = EitherWriter<NonBlocking, io::Sink>;

    fn make_writer(&'a self) -> Self::Writer {
        let Ok(files) = self.files.read() else {
            return EitherWriter::B(io::sink());
        };
        let current = thread::current();
        station_of_thread(current.name())
            .and_then(|station| files.get(station))
            .or_else(|| files.get(PROCESS_LOG))
            .map_or(EitherWriter::B(io::sink()), |f| {
                EitherWriter::A(f.writer.clone())
            })
    }
}

fn install() -> Result<Logging, String> {
    let router = LogRouter::default();
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(io::stdout());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| format!("failed to build log filter: {e}"))?;

    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(stdout_writer)
        .with_target(false);

    let file_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(router.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("failed to install logger: {e}"))?;

    Ok(Logging {
        router,
        _stdout: Mutex::new(stdout_guard),
    })
}

fn router() -> Result<&'static LogRouter, String> {
    LOGGING
        .get_or_init(install)
        .as_ref()
        .map(|l| &l.router)
        .map_err(Clone::clone)
}

/// Open `{op_dir}/logs/{name}.log` for appending, creating the directory if needed.
pub fn open_log_file(op_dir: &Path, name: &str) -> Result<(PathBuf, File), String> {
    let log_dir = op_dir.join("logs");
    fs::create_dir_all(&log_dir)
        .map_err(|e| format!("failed to create log directory {}: {e}", log_dir.display()))?;
    let log_path = log_dir.join(format!("{name}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("failed to open log file {}: {e}", log_path.display()))?;
    Ok((log_path, file))
}

/// Log to the terminal and to `{op_dir}/logs/{name}.log`.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. The file receives
/// events from every thread that is not a station with its own log. Calling
/// again moves it to the new path.
pub fn init_logging(op_dir: &Path, name: &str) -> Result<PathBuf, String> {
    router()?.open(PROCESS_LOG, op_dir, name)
}

/// Send events from `station`'s control thread to `{op_dir}/logs/{station}.log`.
pub fn open_station_log(op_dir: &Path, station: &str) -> Result<PathBuf, String> {
    router()?.open(station, op_dir, station)
}

/// Flush and close `station`'s log. Its later events go to the process log.
pub fn close_station_log(station: &str) {
    if let Some(Ok(logging)) = LOGGING.get() {
        logging.router.close(station);
    }
}

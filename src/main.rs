#[macro_use]
extern crate log;

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use parking_lot::Mutex;
use simplelog::{ColorChoice, CombinedLogger, Config, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};

use crate::program::Program;
use crate::ripper::io::CONFIG_NAME;

mod program;
mod ripper;

/// Default name of the log file.
const LOG_NAME: &str = "tumblr_ripper.log";

/// Downloads every photo and video of the given tumblr sites.
#[derive(Parser, Debug)]
#[command(name = "tumblr_ripper", version, about)]
pub(crate) struct Cli {
    /// Comma separated sites to download. The sites file is read when omitted.
    pub(crate) sites: Option<String>,

    /// Configuration file, created with defaults when missing.
    #[arg(long, default_value = CONFIG_NAME)]
    pub(crate) config: PathBuf,

    /// File receiving the full log.
    #[arg(long, default_value = LOG_NAME)]
    pub(crate) log_file: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Print the recorded download statistics without crawling.
    Stats,
}

/// A buffered log file writer that flushes every 50 lines.
struct BufferedFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
    line_count: Arc<Mutex<usize>>,
}

impl BufferedFileWriter {
    fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(64 * 1024, file))),
            line_count: Arc::new(Mutex::new(0)),
        })
    }
}

impl Write for BufferedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.inner.lock();
        let size = writer.write(buf)?;

        let lines = buf[..size].iter().filter(|&&b| b == b'\n').count();
        if lines > 0 {
            let mut count = self.line_count.lock();
            let before = *count / 50;
            *count += lines;
            if *count / 50 != before {
                writer.flush()?;
            }
        }

        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl Drop for BufferedFileWriter {
    fn drop(&mut self) {
        let _ = self.inner.lock().flush();
    }
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    initialize_logger(&cli.log_file);
    log_system_information();

    let result = Program::new(cli).run();
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    log::logger().flush();
    result
}

/// Initializes the terminal logger and the file logger. Falls back to
/// terminal-only logging when the log file cannot be opened.
fn initialize_logger(log_file: &Path) {
    let mut config = ConfigBuilder::new();
    config.add_filter_allow_str("tumblr_ripper");

    let file_writer = match BufferedFileWriter::new(log_file) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!(
                "Failed to open log file {}: {}. Logging will only output to terminal.",
                log_file.display(),
                e
            );
            let _ = TermLogger::init(LevelFilter::Info, Config::default(), TerminalMode::Mixed, ColorChoice::Auto);
            return;
        }
    };

    if let Err(e) = CombinedLogger::init(vec![
        TermLogger::new(LevelFilter::Info, Config::default(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(LevelFilter::max(), config.build(), file_writer),
    ]) {
        eprintln!("Failed to initialize combined logger: {}. Falling back to terminal-only logging.", e);
        let _ = TermLogger::init(LevelFilter::Info, Config::default(), TerminalMode::Mixed, ColorChoice::Auto);
    }
}

/// Logs information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}

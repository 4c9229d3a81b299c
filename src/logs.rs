//! Per-service log sinks that receive a spawned process's stdout and stderr.
use std::{
    collections::VecDeque,
    env,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::Local;

/// Log directory used when neither the config nor the environment names one.
pub fn default_log_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local/share/devstack/logs")
}

/// Path of the sink for `service` inside `log_dir`.
pub fn log_path(log_dir: &Path, service: &str) -> PathBuf {
    log_dir.join(format!("{service}.log"))
}

/// Opens (creating if needed) the sink for `service` in append mode and
/// writes a header marking a new launch.
pub fn open_sink(log_dir: &Path, service: &str, command: &str) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir, service))?;
    writeln!(
        file,
        "==> {} starting `{}`",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        command
    )?;
    Ok(file)
}

/// Returns the last `lines` lines of a sink, or nothing when it does not exist.
pub fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);
    for line in reader.lines().map_while(Result::ok) {
        if lines == 0 {
            break;
        }
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    Ok(buffer.into())
}

/// Prints the last `lines` lines of a service's sink.
///
/// # Returns
/// * `Ok(false)` when the sink does not exist yet.
pub fn show_logs(log_dir: &Path, service: &str, lines: usize) -> io::Result<bool> {
    let path = log_path(log_dir, service);
    if !path.exists() {
        return Ok(false);
    }

    for line in tail(&path, lines)? {
        println!("{line}");
    }
    Ok(true)
}

//! Terminal front-end for FilePortal sessions.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use fileportal_core::distributor::fingerprint;
use fileportal_core::ui::{Outcome, SelectedFile, UserInterface};
use fileportal_core::Error;

/// Name used when the announced file name has nothing usable left.
const FALLBACK_NAME: &str = "received.bin";

type Input = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Prompts on stdin, prints to stdout, and writes received files to disk.
pub struct TerminalUi {
    output_dir: PathBuf,
    auto_accept: bool,
    input: tokio::sync::Mutex<Input>,
    last_outcome: Mutex<Option<Outcome>>,
}

impl TerminalUi {
    /// Create a terminal UI that saves into `output_dir`.
    #[must_use]
    pub fn new(output_dir: PathBuf, auto_accept: bool) -> Self {
        Self::with_input(output_dir, auto_accept, BufReader::new(tokio::io::stdin()))
    }

    /// Like [`TerminalUi::new`], reading answers from `input` instead of stdin.
    pub fn with_input(
        output_dir: PathBuf,
        auto_accept: bool,
        input: impl AsyncBufRead + Send + Unpin + 'static,
    ) -> Self {
        let input: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(input);
        Self {
            output_dir,
            auto_accept,
            input: tokio::sync::Mutex::new(input.lines()),
            last_outcome: Mutex::new(None),
        }
    }

    /// Next line typed by the user, `None` at end of input.
    ///
    /// All prompts share one reader, and a cancelled read loses nothing.
    async fn read_line(&self) -> Option<String> {
        self.input.lock().await.next_line().await.ok().flatten()
    }

    /// The most recent transfer outcome, if any.
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.last_outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl UserInterface for TerminalUi {
    async fn confirm(&self, filename: &str) -> bool {
        println!();
        if self.auto_accept {
            println!("  Accepting '{}'", filename);
            return true;
        }

        print!("  Peer wants to send '{}'. Accept? [y/N] ", filename);
        if io::stdout().flush().is_err() {
            return false;
        }

        let Some(input) = self.read_line().await else {
            return false;
        };
        let input = input.trim().to_lowercase();

        input == "y" || input == "yes"
    }

    async fn select_file(&self) -> Option<SelectedFile> {
        print!("  File to send: ");
        if io::stdout().flush().is_err() {
            return None;
        }

        let input = self.read_line().await?;
        let path = PathBuf::from(input.trim());
        if path.as_os_str().is_empty() {
            return None;
        }

        match tokio::fs::read(&path).await {
            Ok(data) => Some(SelectedFile::new(display_name(&path), data)),
            Err(e) => {
                eprintln!("  Cannot read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn show_progress(&self, value: u64, max: u64) {
        print_progress(value, max);
    }

    fn notify(&self, message: &str) {
        println!("  {}", message);
    }

    fn deliver_artifact(&self, data: &[u8], filename: &str) -> fileportal_core::Result<()> {
        let failed = |e: io::Error| Error::DeliveryFailed {
            file: filename.to_string(),
            reason: e.to_string(),
        };

        std::fs::create_dir_all(&self.output_dir).map_err(failed)?;
        let path = unique_path(&self.output_dir, &sanitize_file_name(filename));
        std::fs::write(&path, data).map_err(failed)?;

        println!(
            "  Saved {} ({}, xxh3 {:016x})",
            path.display(),
            format_size(data.len() as u64),
            fingerprint(data)
        );
        Ok(())
    }

    fn finished(&self, outcome: &Outcome) {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(outcome.clone());
        println!("  {}", outcome);
    }
}

/// Redraw the chunk progress line.
pub fn print_progress(value: u64, max: u64) {
    if max == 0 {
        return;
    }

    let pct = value as f64 / max as f64 * 100.0;
    print!("\r  [{:>6.2}%] {}/{} chunks    ", pct, value, max);
    let _ = io::stdout().flush();
    if value >= max {
        println!();
    }
}

/// File name announced to the peer for `path`.
pub fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || FALLBACK_NAME.to_string(),
        |name| name.to_string_lossy().to_string(),
    )
}

/// Reduce a peer-supplied file name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `dir/name`, or `dir/name (N).ext` if that already exists.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Format a file size for display.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

//! Bus subscribers that present lifecycle progress to the operator.

use crate::commands::json_line;
use console::style;
use diskenv_core::{Event, Notify, Severity};
use indicatif::ProgressBar;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Shows the latest progress line on a spinner and prints warnings above it.
pub struct SpinnerNotifier {
    pb: ProgressBar,
}

impl SpinnerNotifier {
    pub fn new(pb: ProgressBar) -> Self {
        Self { pb }
    }
}

impl Notify for SpinnerNotifier {
    fn notify(&mut self, event: &Event) {
        match event.severity {
            Severity::Trace => self
                .pb
                .set_message(format!("[{}] {}", event.context, event.message)),
            Severity::Warning => self.pb.println(format!(
                "{} [{}] {}",
                style("warning:").yellow().bold(),
                event.context,
                event.message
            )),
            // The final error is printed once the worker has finished.
            Severity::Error => {}
        }
    }
}

/// Writes every event as one JSON document per line.
pub struct JsonNotifier<W> {
    out: W,
}

impl<W: Write + Send + 'static> JsonNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send + 'static> Notify for JsonNotifier<W> {
    fn notify(&mut self, event: &Event) {
        if let Ok(line) = json_line(event) {
            let _ = writeln!(self.out, "{line}");
            let _ = self.out.flush();
        }
    }
}

/// Appends a plain-text transcript of every event to a file.
pub struct LogFileNotifier {
    out: BufWriter<File>,
}

impl LogFileNotifier {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl Notify for LogFileNotifier {
    fn notify(&mut self, event: &Event) {
        let _ = write_log_line(&mut self.out, event);
        let _ = self.out.flush();
    }
}

fn write_log_line(out: &mut impl Write, event: &Event) -> std::io::Result<()> {
    let severity = match event.severity {
        Severity::Trace => "TRACE",
        Severity::Warning => "WARNING",
        Severity::Error => "ERROR",
    };
    writeln!(
        out,
        "{} {severity:<7} [{}] {}",
        event.at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        event.context,
        event.message
    )?;
    if let Some(detail) = &event.detail {
        for line in detail.lines() {
            writeln!(out, "    {line}")?;
        }
    }
    Ok(())
}

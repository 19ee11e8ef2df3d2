use crate::benchmark::{BenchmarkResult, Progress, VariantReport};
use crate::counter::Variant;
use chrono::{SecondsFormat, Utc};
use crossterm::{
    cursor::MoveToColumn,
    style::Print,
    terminal::{Clear, ClearType},
    QueueableCommand,
};
use itertools::Itertools;
use std::io::{self, Write};
use std::time::Duration;

const BAR_WIDTH: usize = 10;

/// Milliseconds with three decimals.
pub fn millis(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64() * 1000.0)
}

pub fn host_info() -> String {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    format!(
        "CPUs: {}, Arch: {}, OS: {}, locksbench version: {}, date: {}",
        cpus,
        std::env::consts::ARCH,
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION"),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// `average(ms): 5.000, details(ms): [5.000, 1.000, ...]`
pub fn summary_line(report: &VariantReport) -> String {
    format!(
        "average(ms): {}, details(ms): [{}]",
        millis(report.average),
        report.rounds.iter().copied().map(millis).join(", ")
    )
}

/// `AtomicLong(1.000ms) > LongAdder(2.000ms) > ...`
pub fn ranking_line(result: &BenchmarkResult) -> String {
    result
        .ranking()
        .into_iter()
        .map(|report| format!("{}({}ms)", report.variant, millis(report.average)))
        .join(" > ")
}

/// `Progress: =====>     | 50%`
pub fn progress_bar(percentage: usize) -> String {
    let percentage = percentage.min(100);
    let filled = percentage * BAR_WIDTH / 100;
    format!(
        "Progress: {}>{}| {}%",
        "=".repeat(filled),
        " ".repeat(BAR_WIDTH - filled),
        percentage
    )
}

//
// Console
//

/// Prints a sweep as it runs: a header per variant, a progress bar redrawn in
/// place after every round, and a summary line once the variant is done.
pub struct ConsoleProgress<W: Write> {
    out: W,
}

impl<W: Write> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, percentage: usize) -> io::Result<()> {
        self.out
            .queue(MoveToColumn(0))?
            .queue(Clear(ClearType::CurrentLine))?;
        if percentage < 100 {
            self.out.queue(Print(progress_bar(percentage)))?;
        }
        self.out.flush()
    }

    fn log_err(result: io::Result<()>) {
        if let Err(error) = result {
            tracing::warn!(%error, "Failed to write progress");
        }
    }
}

impl<W: Write> Progress for ConsoleProgress<W> {
    fn variant_started(&mut self, variant: Variant) {
        Self::log_err(writeln!(
            self.out,
            "Testing synchronization mechanism: {variant}"
        ));
    }

    fn round_finished(&mut self, _variant: Variant, round: usize, rounds: usize) {
        let result = self.draw(round * 100 / rounds.max(1));
        Self::log_err(result);
    }

    fn variant_finished(&mut self, report: &VariantReport) {
        Self::log_err(writeln!(self.out, "{}", summary_line(report)));
    }
}

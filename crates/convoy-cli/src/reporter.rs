//! Terminal rendering of deployment progress.

use console::{Term, style};

use convoy_core::progress::{ManifestOutcome, Reporter};

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Prints step and manifest state lines; animates a spinner while polling
/// when stdout is a terminal.
pub struct TerminalReporter {
    term: Term,
    animate: bool,
    tick: usize,
    spinning: bool,
}

impl TerminalReporter {
    pub fn new() -> Self {
        let term = Term::stdout();
        let animate = term.is_term();
        Self {
            term,
            animate,
            tick: 0,
            spinning: false,
        }
    }

    fn clear_spinner(&mut self) {
        if self.spinning {
            let _ = self.term.clear_line();
            self.spinning = false;
        }
    }

    fn line(&mut self, text: &str) {
        self.clear_spinner();
        let _ = self.term.write_line(text);
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn done() -> String {
    format!("[ {} ]", style("DONE").green().bold())
}

fn error() -> String {
    format!("[ {} ]", style("ERROR").red().bold())
}

impl Reporter for TerminalReporter {
    fn step_started(&mut self, title: &str) {
        self.line(&style(title).bold().to_string());
    }

    fn step_finished(&mut self, title: &str, ok: bool) {
        let state = if ok { done() } else { error() };
        self.line(&format!("{title:<50} {state}"));
    }

    fn step_skipped(&mut self, title: &str) {
        self.line(&format!("{title:<50} [ {} ]", style("SKIPPED").yellow()));
    }

    fn applying(&mut self, host: &str, manifest: &str) {
        self.line(&format!("  Applying {host}: {manifest}"));
    }

    fn waiting(&mut self, log_name: &str, pending: usize) {
        if !self.animate {
            return;
        }
        let frame = SPINNER[self.tick % SPINNER.len()];
        self.tick += 1;
        let _ = self.term.clear_line();
        let _ = self.term.write_str(&format!(
            "  {frame} Testing if apply is finished: {log_name} ({pending} pending)"
        ));
        self.spinning = true;
    }

    fn manifest_finished(&mut self, _host: &str, log_name: &str, outcome: &ManifestOutcome) {
        let state = match outcome {
            ManifestOutcome::Done => done(),
            ManifestOutcome::Error(_) => error(),
        };
        self.line(&format!("  {log_name:<48} {state}"));
    }

    fn barrier(&mut self, marker: &str) {
        self.clear_spinner();
        tracing::debug!(marker, "wave complete");
    }
}

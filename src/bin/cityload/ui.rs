//! Text rendering of import reports.

use std::io::IsTerminal;
use std::time::Duration;

use cityload::adapter::IndexStatus;
use cityload::duplicate::DuplicateRecord;
use cityload::{CounterSnapshot, Outcome, RunOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::{Color, Style};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Theme {
    Auto,
    Plain,
}

/// One row of a report table. `alert` rows are highlighted when non-zero.
struct Row {
    label: String,
    count: u64,
    note: Option<String>,
    alert: bool,
}

impl Row {
    fn count(label: &str, count: u64) -> Self {
        Self { label: label.to_string(), count, note: None, alert: false }
    }

    fn alert(label: &str, count: u64) -> Self {
        Self { alert: true, ..Self::count(label, count) }
    }

    fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

pub struct Ui {
    paint: bool,
    quiet: bool,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let paint = theme == Theme::Auto && std::io::stdout().is_terminal() && !quiet;
        Self { paint, quiet }
    }

    /// Counters, xlink accounting, per-class totals and the terminal state.
    pub fn outcome(&self, outcome: &Outcome) {
        let c = &outcome.counters;
        self.table(
            "Import",
            &[
                Row::count("files", c.files_total).note(format!("{} not processed", c.files_remaining)),
                Row::count("top-level features", c.top_level_features),
                Row::count("features", c.features),
                Row::count("geometries", c.geometries),
                Row::count("batches", c.batches_committed),
                Row::alert("row errors", c.row_errors),
                Row::alert("invalid records", c.validation_errors),
                Row::count("skipped duplicates", c.skipped_duplicates),
            ],
        );
        self.table("Xlinks", &xlink_rows(c));
        let mut classes: Vec<(&String, &u64)> = c.objects_by_class.iter().collect();
        classes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let classes: Vec<Row> = classes.into_iter().map(|(class, n)| Row::count(class, *n)).collect();
        self.table("Objects by class", &classes);
        if let Some(duplicates) = &outcome.duplicates {
            self.table(
                "Duplicates",
                &[
                    Row::count("found", duplicates.found).note(format!("{:?}", duplicates.mode).to_lowercase()),
                    Row::count("deleted", duplicates.deleted),
                ],
            );
        }
        match (&outcome.state, &outcome.error) {
            (RunOutcome::Done, _) => self.success("import finished"),
            (RunOutcome::Aborted, _) => self.warn("import interrupted; committed work was kept"),
            (RunOutcome::Failed, Some(err)) => self.warn(&format!("import failed: {err}")),
            (RunOutcome::Failed, None) => self.warn("import failed"),
        }
    }

    pub fn duplicates(&self, records: &[DuplicateRecord]) {
        if records.is_empty() {
            self.success("no duplicates found");
            return;
        }
        self.heading(&format!("{} duplicates", records.len()));
        let width = records.iter().map(|r| r.gml_id.len()).max().unwrap_or(0);
        for record in records {
            println!(
                "  {:<width$}  {}",
                record.gml_id,
                self.style(Style::new().dimmed()).paint(format!("feature {}", record.existing_id))
            );
        }
    }

    pub fn indexes(&self, status: &[IndexStatus]) {
        self.heading("Indexes");
        let width = status.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for index in status {
            let (state, style) = if index.active {
                ("active", Style::new().fg(Color::LightGreen))
            } else {
                ("inactive", Style::new().fg(Color::Yellow))
            };
            println!(
                "  {:<width$}  {:<8}  {}",
                index.name,
                self.style(style).paint(state),
                index.table
            );
        }
    }

    pub fn success(&self, message: &str) {
        if self.quiet {
            println!("{message}");
            return;
        }
        println!("{} {message}", self.style(Style::new().fg(Color::LightGreen).bold()).paint("✔"));
    }

    pub fn warn(&self, message: &str) {
        if self.quiet {
            eprintln!("{message}");
            return;
        }
        eprintln!("{} {message}", self.style(Style::new().fg(Color::Yellow).bold()).paint("⚠"));
    }

    /// Bar counting finished input files; hidden in quiet mode.
    pub fn files_bar(&self, total: u64) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template("[{bar:30}] {pos}/{len} files {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }

    fn table(&self, title: &str, rows: &[Row]) {
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        let label_width = rows.iter().map(|r| r.label.len()).max().unwrap_or(0);
        let count_width = rows.iter().map(|r| r.count.to_string().len()).max().unwrap_or(0);
        for row in rows {
            let style = if row.alert && row.count > 0 {
                Style::new().fg(Color::Yellow).bold()
            } else {
                Style::new()
            };
            let count = self.style(style).paint(format!("{:>count_width$}", row.count));
            match &row.note {
                Some(note) => println!(
                    "  {:<label_width$}  {count}  {}",
                    row.label,
                    self.style(Style::new().dimmed()).paint(note.as_str())
                ),
                None => println!("  {:<label_width$}  {count}", row.label),
            }
        }
    }

    fn heading(&self, title: &str) {
        println!("{}", self.style(Style::new().fg(Color::Purple).bold()).paint(title));
    }

    fn style(&self, style: Style) -> Style {
        if self.paint {
            style
        } else {
            Style::new()
        }
    }
}

fn xlink_rows(c: &CounterSnapshot) -> Vec<Row> {
    let mut resolved = Row::count("resolved", c.xlinks_resolved);
    if c.xlinks_registered > 0 {
        let share = (c.xlinks_resolved.min(c.xlinks_registered) * 100) / c.xlinks_registered;
        resolved = resolved.note(format!("{share}% of registered"));
    }
    vec![
        Row::count("registered", c.xlinks_registered),
        resolved,
        Row::alert("dangling", c.xlinks_dangling),
        Row::alert("cyclic", c.xlinks_cyclic),
        Row::alert("lost", c.xlinks_lost).note("committed but never stored"),
    ]
}

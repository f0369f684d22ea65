use std::ops::Range;

/// A toolchain diagnostic (error, warning, or note) located in a
/// generated translation unit.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Byte range into the source the diagnostic refers to.
    pub span: Range<usize>,
    /// 1-based line as reported by the toolchain.
    pub line: usize,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Diagnostic {
    pub fn error(message: String, span: Range<usize>) -> Self {
        Self::new(Severity::Error, message, span)
    }

    pub fn warning(message: String, span: Range<usize>) -> Self {
        Self::new(Severity::Warning, message, span)
    }

    fn new(severity: Severity, message: String, span: Range<usize>) -> Self {
        Self {
            severity,
            message,
            span,
            line: 0,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    fn report<'a>(&self, filename: &'a str) -> ariadne::Report<'static, (&'a str, Range<usize>)> {
        use ariadne::{Color, Label, Report, ReportKind};

        let (kind, color) = match self.severity {
            Severity::Error => (ReportKind::Error, Color::Red),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
            Severity::Note => (ReportKind::Advice, Color::Blue),
        };

        let mut report = Report::build(kind, filename, self.span.start)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, self.span.clone()))
                    .with_message(&self.message)
                    .with_color(color),
            );

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report.finish()
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::Source;

        let _ = self
            .report(filename)
            .eprint((filename, Source::from(source)));
    }

    /// Render the diagnostic into a string (no colors stripped).
    pub fn render_to_string(&self, filename: &str, source: &str) -> String {
        use ariadne::Source;

        let mut out = Vec::new();
        let _ = self
            .report(filename)
            .write((filename, Source::from(source)), &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic], filename: &str, source: &str) {
    for diag in diagnostics {
        diag.render(filename, source);
    }
}

/// Parse GCC/Clang style `file:line:col: severity: message` lines.
///
/// Lines that do not follow the format (include stacks, caret lines,
/// summaries) are attached as notes to the preceding diagnostic.
pub fn parse_toolchain_output(output: &str, source: &str) -> Vec<Diagnostic> {
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    for raw in output.lines() {
        match parse_line(raw) {
            Some((line, col, severity, message)) => {
                let start = line_starts
                    .get(line.saturating_sub(1))
                    .map(|s| (s + col.saturating_sub(1)).min(source.len()))
                    .unwrap_or(source.len());
                let end = (start + 1).min(source.len()).max(start);
                let mut diag = Diagnostic::new(severity, message, start..end);
                diag.line = line;
                diagnostics.push(diag);
            }
            None => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('|') || trimmed.starts_with('^') {
                    continue;
                }
                if let Some(last) = diagnostics.last_mut() {
                    last.notes.push(trimmed.to_string());
                }
            }
        }
    }
    diagnostics
}

fn parse_line(raw: &str) -> Option<(usize, usize, Severity, String)> {
    let mut parts = raw.splitn(5, ':');
    let _file = parts.next()?;
    let line: usize = parts.next()?.trim().parse().ok()?;
    let col: usize = parts.next()?.trim().parse().ok()?;
    let severity = match parts.next()?.trim() {
        "error" | "fatal error" => Severity::Error,
        "warning" => Severity::Warning,
        "note" => Severity::Note,
        _ => return None,
    };
    let message = parts.next()?.trim().to_string();
    Some((line, col, severity, message))
}

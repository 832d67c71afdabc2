//! Compiler diagnostic parsing, source remapping and batch aggregation.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::job::Job;
use crate::strip::LineOrigin;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// One compiler message, with the source location extracted from its text
/// when the backend provided one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerDiagnostic {
    pub severity: Severity,
    pub file: Option<String>,
    /// 1-based; zero when the message carried no locator.
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl CompilerDiagnostic {
    pub fn error(message: impl AsRef<str>) -> Self {
        Self::parse(Severity::Error, message.as_ref())
    }

    pub fn warning(message: impl AsRef<str>) -> Self {
        Self::parse(Severity::Warning, message.as_ref())
    }

    /// Extracts a leading source locator from a raw compiler message. Both
    /// common formats are recognized: `file(line,col): ...` as emitted by
    /// fxc-style compilers and `file:line:col: ...` as emitted by
    /// clang-style compilers.
    pub fn parse(severity: Severity, raw: &str) -> Self {
        parse_paren_locator(severity, raw)
            .or_else(|| parse_colon_locator(severity, raw))
            .unwrap_or(Self {
                severity,
                file: None,
                line: 0,
                column: 0,
                message: raw.to_string(),
            })
    }

    /// Replaces a synthetic location (an in-memory buffer name, a generated
    /// include, or the flattened preprocessed output itself) with the real
    /// contributing source location, using the per-line origin map built
    /// while stripping.
    pub fn remap(&mut self, origins: &[LineOrigin]) {
        if self.line == 0 {
            return;
        }
        let real_file = self
            .file
            .as_deref()
            .is_some_and(|f| f.starts_with('/') && !f.starts_with("/Engine/Generated/"));
        if real_file {
            return;
        }
        if let Some(origin) = origins.get(self.line as usize - 1) {
            self.file = Some(origin.file.clone());
            self.line = origin.line;
        }
    }

    /// `path(line): message`, the navigable single-line form used in batch
    /// reports.
    pub fn formatted(&self) -> String {
        match &self.file {
            Some(file) => format!("{file}({}): {}", self.line, self.message),
            None => self.message.clone(),
        }
    }

    /// Renders the diagnostic with an annotated source snippet when the
    /// text it points into is available.
    pub fn render(&self, source: Option<&str>) -> String {
        use annotate_snippets::{Level, Renderer, Snippet};

        let level = match self.severity {
            Severity::Error => Level::Error,
            Severity::Warning => Level::Warning,
        };
        let mut msg = level.title(&self.message);

        if let Some(source) = source {
            if let Some(range) = line_span(source, self.line) {
                let annot = level.span(range).label(&self.message);
                let mut snip = Snippet::source(source).fold(true).annotation(annot);
                if let Some(file) = self.file.as_deref() {
                    snip = snip.origin(file);
                }
                msg = msg.snippet(snip);
            }
        }

        let renderer = Renderer::styled();
        format!("{}", renderer.render(msg))
    }
}

/// `file(line[,col]): message`
fn parse_paren_locator(severity: Severity, raw: &str) -> Option<CompilerDiagnostic> {
    let open = raw.find('(')?;
    let close = open + raw[open..].find(')')?;
    if open == 0 || !raw[close + 1..].starts_with(':') {
        return None;
    }
    let inner = &raw[open + 1..close];
    let (line, column) = match inner.split_once(',') {
        Some((line, col)) => (line.trim().parse().ok()?, col.trim().parse().ok()?),
        None => (inner.trim().parse().ok()?, 0),
    };
    Some(CompilerDiagnostic {
        severity,
        file: Some(raw[..open].to_string()),
        line,
        column,
        message: raw[close + 2..].trim_start().to_string(),
    })
}

/// `file:line:col: message`
fn parse_colon_locator(severity: Severity, raw: &str) -> Option<CompilerDiagnostic> {
    for (idx, _) in raw.match_indices(':').take(4) {
        if idx == 0 {
            continue;
        }
        let mut rest = raw[idx + 1..].splitn(3, ':');
        let (Some(line), Some(column), Some(message)) = (rest.next(), rest.next(), rest.next())
        else {
            continue;
        };
        let (Ok(line), Ok(column)) = (line.parse(), column.parse()) else {
            continue;
        };
        return Some(CompilerDiagnostic {
            severity,
            file: Some(raw[..idx].to_string()),
            line,
            column,
            message: message.trim_start().to_string(),
        });
    }
    None
}

/// Byte range of the 1-based `line` in `source`, excluding the newline.
fn line_span(source: &str, line: u32) -> Option<std::ops::Range<usize>> {
    if line == 0 {
        return None;
    }
    let mut start = 0;
    for _ in 1..line {
        start += source[start..].find('\n')? + 1;
    }
    let end = source[start..]
        .find('\n')
        .map(|idx| start + idx)
        .unwrap_or(source.len());
    Some(start..end)
}

/// Deduplicated diagnostics for a batch of finished jobs.
#[derive(Debug, Default)]
pub struct BatchDiagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Platforms with at least one failed job, in first-failure order.
    pub affected_platforms: Vec<String>,
}

impl BatchDiagnostics {
    /// Collects, remaps and deduplicates diagnostics across `jobs`.
    ///
    /// Errors from failed jobs are always reported; warnings from
    /// otherwise-successful jobs only when `show_warnings` is set.
    /// Duplicate messages (after remapping and formatting) are dropped by a
    /// hash over the final text. A one-time banner pointing at dumped debug
    /// info precedes the first error when a dump path is configured.
    pub fn aggregate(jobs: &[Job], show_warnings: bool, debug_info_path: Option<&str>) -> Self {
        let mut batch = Self::default();
        let mut seen = FxHashSet::default();
        let mut banner_emitted = false;

        for unit in jobs.iter().flat_map(Job::units) {
            let failed = !unit.output.succeeded;
            let origins = unit
                .preprocess
                .as_ref()
                .map(|p| p.line_origins.as_slice())
                .unwrap_or(&[]);

            for diag in &unit.output.diagnostics {
                let mut diag = diag.clone();
                diag.remap(origins);
                let formatted = diag.formatted();
                match diag.severity {
                    Severity::Error if failed => {
                        if !seen.insert(ContentHash::digest(formatted.as_bytes())) {
                            continue;
                        }
                        if !banner_emitted {
                            if let Some(path) = debug_info_path {
                                batch.errors.push(format!("debug info dumped to: {path}"));
                            }
                            banner_emitted = true;
                        }
                        batch.errors.push(formatted);
                    }
                    Severity::Warning if show_warnings => {
                        if seen.insert(ContentHash::digest(formatted.as_bytes())) {
                            batch.warnings.push(formatted);
                        }
                    }
                    _ => {}
                }
            }

            if failed {
                let platform = &unit.input.target.platform;
                if !batch.affected_platforms.contains(platform) {
                    batch.affected_platforms.push(platform.clone());
                }
            }
        }
        batch
    }
}

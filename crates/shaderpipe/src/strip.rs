//! Textual source stripping.
//!
//! The backend preprocessor does not strip comments, so comment removal
//! happens here, both on raw source files (to produce the cached stripped
//! copy that include-dependency records hash) and on preprocessed output
//! (where blank lines and line directives are additionally dropped to
//! improve deduplication in the job cache).

/// Marker line appended to stripped preprocessed source. The hex digits that
/// follow it are overwritten in place with the job's real input hash once it
/// is known, so the dumped source self-identifies its cache entry.
pub const DEBUG_HASH_MARKER: &str = "// INPUT_HASH: ";

/// Directive prefix that can alter compile behavior invisibly to the
/// environment; occurrences are captured and folded into the input hash.
pub const METADATA_DIRECTIVE_PREFIX: &str = "UESHADERMETADATA_";

/// Removes `//` and `/* */` comments while preserving every newline, so line
/// numbers in downstream diagnostics stay valid.
pub fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let bytes = source.as_bytes();
    let mut i = 0;
    let mut run = 0;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'/') {
            // line comment: skip to end of line, keep the newline
            out.push_str(&source[run..i]);
            while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                i += 1;
            }
            run = i;
        } else if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            // block comment: echo newlines only
            out.push_str(&source[run..i]);
            i += 2;
            while i < bytes.len() {
                if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    i += 2;
                    break;
                }
                if bytes[i] == b'\n' || bytes[i] == b'\r' {
                    out.push(bytes[i] as char);
                }
                i += 1;
            }
            run = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&source[run..]);
    out
}

/// A source location in the file set that contributed to preprocessed output.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineOrigin {
    pub file: String,
    pub line: u32,
}

/// Result of stripping preprocessed source: the stripped text, captured
/// metadata directives, and a per-output-line origin map used to remap
/// compiler diagnostics back to real source locations.
#[derive(Clone, Debug, Default)]
pub struct StrippedSource {
    pub text: String,
    pub directives: Vec<String>,
    pub line_origins: Vec<LineOrigin>,
}

/// Parses a `#line <n> "<file>"` directive. The filename is optional; a bare
/// `#line <n>` keeps the current file.
fn parse_line_directive(line: &str) -> Option<(u32, Option<&str>)> {
    let rest = line.trim_start().strip_prefix("#line")?;
    let rest = rest.trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, tail) = rest.split_at(digits_end);
    let number = digits.parse().ok()?;
    let file = tail.trim().strip_prefix('"').and_then(|t| t.split('"').next());
    Some((number, file))
}

/// Strips comments, blank lines and `#line` directives from preprocessed
/// source, tracking line directives so each surviving line records the file
/// and line it originated from. Appends the debug-hash marker line with a
/// zero placeholder.
pub fn strip_preprocessed(source: &str, entry_file: &str) -> StrippedSource {
    // comment stripping preserves every newline, so raw and decommented
    // lines stay aligned and directives can be captured from the raw text
    let decommented = strip_comments(source);
    let mut stripped = StrippedSource::default();
    stripped.text.reserve(decommented.len());

    let mut current_file = entry_file.to_string();
    let mut current_line: u32 = 0;

    for (raw, line) in source.lines().zip(decommented.lines()) {
        current_line += 1;
        if let Some(idx) = raw.find(METADATA_DIRECTIVE_PREFIX) {
            stripped.directives.push(raw[idx..].to_string());
            continue;
        }
        if let Some((number, file)) = parse_line_directive(line) {
            // the directive names the line number of the *next* line
            current_line = number.saturating_sub(1);
            if let Some(file) = file {
                current_file = file.to_string();
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        stripped.text.push_str(line);
        stripped.text.push('\n');
        stripped.line_origins.push(LineOrigin {
            file: current_file.clone(),
            line: current_line,
        });
    }

    stripped.text.push_str(DEBUG_HASH_MARKER);
    stripped.text.push_str(&"0".repeat(64));
    stripped.text.push('\n');
    stripped
}

/// Overwrites the zero placeholder after [`DEBUG_HASH_MARKER`] with `hash`
/// (64 hex digits). A no-op if the marker is absent or the placeholder was
/// resized, which can happen when stripping was disabled for debugging.
pub fn patch_debug_hash(text: &mut String, hash: &str) {
    debug_assert_eq!(hash.len(), 64);
    let Some(marker) = text.find(DEBUG_HASH_MARKER) else {
        return;
    };
    let start = marker + DEBUG_HASH_MARKER.len();
    let end = text[start..]
        .find('\n')
        .map(|idx| start + idx)
        .unwrap_or(text.len());
    if end - start == hash.len() {
        text.replace_range(start..end, hash);
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

/// Indented frames, "Caused by" chains and fully qualified exception headers.
static RE_CONTINUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\s+|at\s|Caused by:|\.\.\. [0-9]+ more|[A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)+(?:Exception|Error|Throwable)\b)",
    )
    .unwrap()
});

/// Joins physical lines into log entries: indented stack frames and
/// "Caused by" chains attach to the entry above, and a JSON object spread
/// over several lines is emitted once its braces balance. Any other line
/// starts a new entry.
pub struct EntryAssembler {
    buf: String,
    lines: usize,
    max_lines: usize,
    depth: i32,
}

impl Default for EntryAssembler {
    fn default() -> Self {
        Self::new(500)
    }
}

/// Net `{`/`[` depth of a line, ignoring brackets inside JSON strings.
fn bracket_delta(line: &str) -> i32 {
    let mut depth = 0;
    let mut in_str = false;
    let mut escaped = false;
    for ch in line.chars() {
        if in_str {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }
    depth
}

fn continues_entry(line: &str) -> bool {
    RE_CONTINUATION.is_match(line)
}

impl EntryAssembler {
    /// `max_lines` caps how many physical lines one entry may absorb.
    pub fn new(max_lines: usize) -> Self {
        Self { buf: String::new(), lines: 0, max_lines: max_lines.max(1), depth: 0 }
    }

    fn append(&mut self, line: &str) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
        self.lines += 1;
    }

    fn take(&mut self) -> Option<String> {
        self.lines = 0;
        self.depth = 0;
        if self.buf.trim().is_empty() {
            self.buf.clear();
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Feeds one physical line; returns an entry when one is complete.
    pub fn push(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);

        if self.depth > 0 {
            self.append(line);
            self.depth += bracket_delta(line);
            if self.depth <= 0 || self.lines >= self.max_lines {
                return self.take();
            }
            return None;
        }

        if line.trim_start().starts_with('{') {
            let done = self.take();
            self.append(line);
            self.depth = bracket_delta(line);
            if self.depth <= 0 {
                let entry = self.take();
                // a pending text entry and a one-line object both finish here
                return match done {
                    Some(prev) => {
                        self.buf = entry.unwrap_or_default();
                        self.lines = usize::from(!self.buf.is_empty());
                        Some(prev)
                    }
                    None => entry,
                };
            }
            return done;
        }

        if self.buf.is_empty() {
            if !line.trim().is_empty() {
                self.append(line);
            }
            return None;
        }
        if !continues_entry(line) || line.trim().is_empty() || self.lines >= self.max_lines {
            let done = self.take();
            if !line.trim().is_empty() {
                self.append(line);
            }
            return done;
        }
        self.append(line);
        None
    }

    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }
}

/// Convenience for whole inputs: assembles every entry in `text`.
pub fn assemble(text: &str) -> Vec<String> {
    let mut asm = EntryAssembler::default();
    let mut out: Vec<String> = text.lines().filter_map(|l| asm.push(l)).collect();
    out.extend(asm.finish());
    out
}

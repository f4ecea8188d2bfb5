use once_cell::sync::Lazy;
use regex::Regex;

pub const PLACEHOLDER: &str = "<*>";

/// Variable-token heuristics, in priority order for equal-length ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Timestamp,
    Uuid,
    Ip,
    Hex,
    Quoted,
    Number,
}

static RE_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9]{4}-[0-9]{2}-[0-9]{2}[T ][0-9]{2}:[0-9]{2}:[0-9]{2}(?:[.,][0-9]{1,9})?(?:Z|[+-][0-9]{2}(?::?[0-9]{2})?)?").unwrap()
});

static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b").unwrap()
});

static RE_IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])(?::[0-9]{1,5})?\b").unwrap()
});

static RE_IPV6: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}\b").unwrap()
});

static RE_HEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:0[xX][0-9a-fA-F]+|[0-9a-fA-F]{8,})\b").unwrap()
});

static RE_QUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|'[^'\s]*'"#).unwrap()
});

// Digits only; a trailing unit (15ms, 2s, 99%) stays literal.
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^\w.])(-?[0-9]+(?:\.[0-9]+)?)(?:ms|us|µs|ns|s|m|h|d|kb|mb|gb|kib|mib|gib|b|%)?\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    start: usize,
    end: usize,
    kind: TokenKind,
}

impl Candidate {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

fn candidates(text: &str) -> Vec<Candidate> {
    let simple: [(&Lazy<Regex>, TokenKind); 6] = [
        (&RE_TIMESTAMP, TokenKind::Timestamp),
        (&RE_UUID, TokenKind::Uuid),
        (&RE_IPV4, TokenKind::Ip),
        (&RE_IPV6, TokenKind::Ip),
        (&RE_HEX, TokenKind::Hex),
        (&RE_QUOTED, TokenKind::Quoted),
    ];
    let mut out = Vec::new();
    for (re, kind) in simple {
        for m in re.find_iter(text) {
            if kind == TokenKind::Hex && !is_hex_token(m.as_str()) {
                continue;
            }
            out.push(Candidate { start: m.start(), end: m.end(), kind });
        }
    }
    for c in RE_NUMBER.captures_iter(text) {
        if let Some(m) = c.get(1) {
            out.push(Candidate { start: m.start(), end: m.end(), kind: TokenKind::Number });
        }
    }
    out
}

// Words like "deadline" or "facade" are hex-shaped; require a digit.
fn is_hex_token(s: &str) -> bool {
    s.starts_with("0x") || s.starts_with("0X") || s.chars().any(|c| c.is_ascii_digit())
}

/// Picks non-overlapping spans leftmost-first. When spans overlap, the one
/// covering more raw text wins so the template comes out shorter; equal
/// lengths fall back to heuristic priority.
fn resolve(mut cands: Vec<Candidate>) -> Vec<Candidate> {
    cands.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| b.len().cmp(&a.len()))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    let mut chosen: Vec<Candidate> = Vec::with_capacity(cands.len());
    for c in cands {
        match chosen.last_mut() {
            Some(last) if c.start < last.end => {
                // overlaps the previous pick: keep whichever spans more
                if c.len() > last.len() {
                    *last = c;
                }
            }
            _ => chosen.push(c),
        }
    }
    chosen
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masked {
    /// Text with every variable token replaced by `<*>`, whitespace collapsed.
    pub pattern: String,
    pub variables: Vec<(TokenKind, String)>,
}

pub fn mask(text: &str) -> Masked {
    let spans = resolve(candidates(text));
    let mut out = String::with_capacity(text.len());
    let mut variables = Vec::with_capacity(spans.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&text[cursor..span.start]);
        out.push_str(PLACEHOLDER);
        variables.push((span.kind, text[span.start..span.end].to_string()));
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Masked { pattern: out.split_whitespace().collect::<Vec<_>>().join(" "), variables }
}

/// The part of a message that determines its template: the first non-empty
/// line, so stack-trace continuations do not fork templates.
pub fn template_source(message: &str) -> &str {
    message.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

/// Normalized template signature for a message body.
pub fn signature(message: &str) -> String {
    mask(template_source(message)).pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_ip_and_number_prefers_ip() {
        let m = mask("connect 10.0.0.1:5432 failed");
        assert_eq!(m.pattern, "connect <*> failed");
        assert_eq!(m.variables, vec![(TokenKind::Ip, "10.0.0.1:5432".to_string())]);
    }

    #[test]
    fn replacement_after_overlap_keeps_later_spans() {
        let cands = vec![
            Candidate { start: 0, end: 4, kind: TokenKind::Number },
            Candidate { start: 0, end: 10, kind: TokenKind::Hex },
            Candidate { start: 12, end: 14, kind: TokenKind::Number },
        ];
        let picked = resolve(cands);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].kind, TokenKind::Hex);
        assert_eq!(picked[1].start, 12);
    }
}

use std::sync::OnceLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;

// CSI, OSC (BEL or ST terminated), DCS/SOS/PM/APC (ST terminated), and bare
// two-byte escapes.
fn escape_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[PX^_][^\x1b]*\x1b\\|[@-Z\\-_])",
        )
        .ok()
    })
    .as_ref()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Make one line of compiler/linker output safe to print and to store in logs.
pub fn sanitize_log_line(input: &str) -> String {
    let stripped = match escape_re() {
        Some(re) => re.replace_all(input, ""),
        None => input.into(),
    };
    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        let c = match c {
            '\t' => ' ',
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        if count == MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        out.push(c);
        count += 1;
    }
    out
}

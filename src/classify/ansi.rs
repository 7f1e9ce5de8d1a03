//! Terminal escape handling for captured check output.
//!
//! Checks color their verdicts with SGR sequences. For the report those
//! become `<span>` markup; for classification the markup is reduced back to
//! plain text. Escapes that carry no color (cursor movement, window titles)
//! are dropped.

use std::sync::LazyLock;

use minijinja::HtmlEscape;
use regex::Regex;

// CSI sequences (ESC [ params intermediates final), OSC sequences
// (ESC ] ... BEL|ST), charset designations (ESC ( B and friends), and
// simple two-byte escapes.
static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[([0-9;:<=>?]*)[ -/]*([@-~])",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()*+][0-9A-Za-z]",
        r"|\x1b[^\[\]]",
    ))
    .unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

fn foreground(code: u16) -> Option<&'static str> {
    let name = match code {
        30 => "black",
        31 | 91 => "red",
        32 | 92 => "green",
        33 => "orange",
        93 => "yellow",
        34 | 94 => "blue",
        35 | 95 => "magenta",
        36 | 96 => "cyan",
        37 | 97 => "white",
        90 => "gray",
        _ => return None,
    };
    Some(name)
}

fn background(code: u16) -> Option<&'static str> {
    let name = match code {
        40 => "black",
        41 => "red",
        42 => "green",
        43 => "orange",
        44 => "blue",
        45 => "magenta",
        46 => "cyan",
        47 => "white",
        _ => return None,
    };
    Some(name)
}

/// Escape text for inclusion in HTML element content, the same way the
/// report template escapes its own values.
pub fn escape_html(text: &str) -> String {
    HtmlEscape(text).to_string()
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#x2f;", "/")
        .replace("&amp;", "&")
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "")
}

/// Convert raw terminal output into HTML with colored spans.
///
/// Text is HTML-escaped. A reset (`ESC[0m` or `ESC[m`) closes every open
/// span; spans still open at the end of the output are closed there.
pub fn ansi_to_html(raw: &str) -> String {
    let raw = normalize_newlines(raw);
    let mut html = String::with_capacity(raw.len());
    let mut open_spans = 0usize;
    let mut cursor = 0;

    for caps in ESCAPE_RE.captures_iter(&raw) {
        let whole = caps.get(0).unwrap();
        html.push_str(&escape_html(&raw[cursor..whole.start()]));
        cursor = whole.end();

        let is_sgr = caps.get(2).is_some_and(|m| m.as_str() == "m");
        if !is_sgr {
            continue;
        }

        let params = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        for param in params.split(';') {
            let code = if param.is_empty() {
                0
            } else {
                match param.parse::<u16>() {
                    Ok(code) => code,
                    Err(_) => continue,
                }
            };

            if code == 0 {
                html.extend(std::iter::repeat_n("</span>", open_spans));
                open_spans = 0;
            } else if code == 1 {
                html.push_str(r#"<span style="font-weight:bold;">"#);
                open_spans += 1;
            } else if let Some(color) = foreground(code) {
                html.push_str(&format!(r#"<span style="color:{color};">"#));
                open_spans += 1;
            } else if let Some(color) = background(code) {
                html.push_str(&format!(r#"<span style="background-color:{color};">"#));
                open_spans += 1;
            }
        }
    }

    html.push_str(&escape_html(&raw[cursor..]));
    html.extend(std::iter::repeat_n("</span>", open_spans));
    html
}

/// Extract the textual content of converted output, discarding tags.
pub fn html_to_text(html: &str) -> String {
    unescape_html(&TAG_RE.replace_all(html, ""))
}

/// Reduce raw terminal output to the plain text a human would read.
pub fn plain_text(raw: &str) -> String {
    html_to_text(&ansi_to_html(raw))
}

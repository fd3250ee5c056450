//! Escaping of model output for MarkdownV2-style renderers
//!
//! Code spans and fenced blocks are kept as code, `**bold**` becomes the
//! single-asterisk bold marker, every other structural character outside
//! code is backslash-escaped, and regions still open at the end of the text
//! are closed.

/// Characters that must be escaped outside code
const SPECIAL_CHARS: &str = "_^*[]()~>#+-|{}.!=";

const FENCE: &str = "```";

/// Rewrite `text` so every structural marker is balanced and every other
/// special character is escaped
pub fn escape_markdown(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + text.len() / 8);

    let mut in_block = false;
    let mut in_span = false;
    let mut in_bold = false;

    let at = |i: usize| chars.get(i).copied();
    let prev = |i: usize| if i == 0 { None } else { at(i - 1) };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if c == '`' {
            let opens_fence = at(i + 1) == Some('`')
                && at(i + 2) == Some('`')
                && prev(i) == Some('\n');

            if opens_fence {
                in_block = !in_block;
                out.push_str(FENCE);
                i += 2;
            } else if !in_block && prev(i) != Some('\\') {
                in_span = !in_span;
                out.push(c);
            } else {
                if in_block && prev(i) != Some('\\') {
                    out.push('\\');
                }
                out.push(c);
            }
        } else if c == '\\' && (in_block || in_span) {
            let escaped = prev(i) == Some('\\');
            let escapes_next = matches!(at(i + 1), Some('\\') | Some('`'));
            if !escaped && !escapes_next {
                out.push('\\');
            }
            out.push(c);
        } else if c == '*'
            && at(i + 1) == Some('*')
            && prev(i) != Some('\\')
            && !in_block
            && !in_span
        {
            in_bold = !in_bold;
            out.push('*');
            i += 1;
        } else if !in_block && !in_span && SPECIAL_CHARS.contains(c) {
            if prev(i) != Some('\\') {
                out.push('\\');
            }
            out.push(c);
        } else {
            out.push(c);
        }

        i += 1;
    }

    if in_block {
        out.push('\n');
        out.push_str(FENCE);
    }
    if in_span {
        out.push('`');
    }
    if in_bold {
        out.push('*');
    }

    out
}

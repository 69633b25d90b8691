//! Terminal-safe rendering of decrypted payloads.

/// Decode `data` as UTF-8 (lossily) and replace control characters that a
/// terminal could interpret as escape sequences with U+FFFD.
///
/// Tab, newline and carriage return are kept. C0 controls, DEL and the C1
/// range (U+0080..U+009F, where U+009B acts as CSI on many terminals) are
/// replaced.
pub fn render_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .chars()
        .map(|c| if is_unsafe(c) { '\u{FFFD}' } else { c })
        .collect()
}

fn is_unsafe(c: char) -> bool {
    matches!(
        c,
        '\x00'..='\x08' | '\x0B'..='\x0C' | '\x0E'..='\x1F' | '\x7F' | '\u{0080}'..='\u{009F}'
    )
}

/// Heuristic used to pick a text or hex rendering: at least 85% of the
/// bytes are printable ASCII or common whitespace. Bytes >= 0x80 count as
/// printable only when the whole buffer is valid UTF-8.
pub fn looks_textual(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    let utf8 = std::str::from_utf8(data).is_ok();
    let printable = data
        .iter()
        .filter(|&&b| {
            b.is_ascii_graphic() || matches!(b, b' ' | b'\t' | b'\n' | b'\r') || (utf8 && b >= 0x80)
        })
        .count();
    printable * 100 >= data.len() * 85
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cleaning of captured container output.

/// Whether a character is a C0 or C1 control character (including DEL).
fn is_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1F | 0x7F..=0x9F)
}

/// Decode captured output, drop control characters and trim whitespace.
///
/// Newlines and tabs are control characters too, so multi-line output
/// collapses into a single line.
pub fn clean_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let cleaned: String = text.chars().filter(|c| !is_control(*c)).collect();
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_newline() {
        assert_eq!(clean_output(b"hi\n"), "hi");
    }

    #[test]
    fn test_strips_control_bytes() {
        assert_eq!(clean_output(b"\x1b[31mred\x1b[0m\r\n"), "[31mred[0m");
        assert_eq!(clean_output(b"a\tb\x00c\x7f"), "abc");
    }

    #[test]
    fn test_strips_c1_controls() {
        assert_eq!(clean_output("x\u{85}y\u{9f}".as_bytes()), "xy");
        assert_eq!(clean_output("\u{a0}kept".as_bytes()), "kept");
    }

    #[test]
    fn test_multiline_collapses() {
        assert_eq!(clean_output(b"line one\nline two\n"), "line oneline two");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let cleaned = clean_output(b"ok\xff");
        assert!(cleaned.starts_with("ok"));
        assert!(cleaned.chars().all(|c| !is_control(c)));
    }
}

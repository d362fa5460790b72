//! Terminal Sanitizer: strips dangerous escape sequences from PTY output
//! while preserving color and cursor control.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const ST_C1: u8 = 0x9c;

/// OSC numeric codes that are allowed through unchanged (color/palette
/// queries and reports).
const OSC_ALLOWLIST: &[u32] = &[4, 10, 11, 12, 17, 19, 104, 110, 111, 112];

/// Ambiguous-width bullet/circle code points normalized to their
/// text-presentation variant so column accounting doesn't break on
/// variable-width emoji rendering.
const AMBIGUOUS_NORMALIZATIONS: &[(char, char)] = &[
    ('\u{2022}', '\u{2022}'), // BULLET already text-presentation; kept for clarity
    ('\u{25CF}', '\u{25CF}'), // BLACK CIRCLE
    ('\u{2B24}', '\u{25CF}'), // BLACK LARGE CIRCLE -> BLACK CIRCLE
    ('\u{26AB}', '\u{25CF}'), // MEDIUM BLACK CIRCLE -> BLACK CIRCLE
    ('\u{2B55}', '\u{25EF}'), // HEAVY LARGE CIRCLE -> WHITE CIRCLE
];

/// Sanitizes one chunk of PTY output. Pure function: same input always
/// yields the same output, and `sanitize(sanitize(x)) == sanitize(x)`
/// because the output never contains any byte sequence this function would
/// itself strip or rewrite.
///
/// Partial escape sequences at a chunk boundary are dropped rather than
/// passed through, so a dangerous completion split across two chunks never
/// reaches a client (the contract only requires coherent chunks; dropping
/// the incomplete tail is the conservative choice).
pub fn sanitize(input: &[u8]) -> Vec<u8> {
    let text = normalize_ambiguous_codepoints(input);
    strip_dangerous_escapes(&text)
}

fn normalize_ambiguous_codepoints(input: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(input) {
        Ok(s) => {
            let mut needs_rewrite = false;
            for (from, to) in AMBIGUOUS_NORMALIZATIONS {
                if from != to && s.contains(*from) {
                    needs_rewrite = true;
                    break;
                }
            }
            if !needs_rewrite {
                return input.to_vec();
            }
            let mut out = String::with_capacity(s.len());
            for ch in s.chars() {
                let mapped = AMBIGUOUS_NORMALIZATIONS
                    .iter()
                    .find(|(from, _)| *from == ch)
                    .map(|(_, to)| *to)
                    .unwrap_or(ch);
                out.push(mapped);
            }
            out.into_bytes()
        }
        // Not valid UTF-8 (e.g. a raw escape sequence byte stream) — pass
        // through unchanged for the escape-stripping pass below to handle.
        Err(_) => input.to_vec(),
    }
}

fn strip_dangerous_escapes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b != ESC {
            out.push(b);
            i += 1;
            continue;
        }

        // Need at least one more byte to classify the sequence.
        let Some(&kind) = input.get(i + 1) else {
            // Truncated escape at the end of the chunk: drop it.
            break;
        };

        match kind {
            b']' => {
                // OSC: ESC ] <code> ; ... (BEL | ESC \)
                let Some((osc_number, body_start)) = parse_osc_number(input, i + 2) else {
                    // Malformed OSC introducer: drop the rest of the chunk
                    // rather than risk passing through a disguised payload.
                    break;
                };
                let Some(end) = find_osc_terminator(input, body_start) else {
                    // Unterminated within this chunk: drop the remainder.
                    break;
                };
                if OSC_ALLOWLIST.contains(&osc_number) {
                    out.extend_from_slice(&input[i..end]);
                }
                i = end;
            }
            b'P' | b'X' | b'^' | b'_' => {
                // DCS / SOS / PM / APC: ESC <kind> ... terminated by ST
                // (ESC \\) or, for compatibility, BEL.
                match find_st_terminator(input, i + 2) {
                    Some(end) => i = end,
                    None => break,
                }
            }
            _ => {
                out.push(ESC);
                out.push(kind);
                i += 2;
            }
        }
    }
    out
}

/// Parses the numeric OSC code starting at `start` (just after `ESC ]`).
/// Returns `(code, index_of_first_body_byte)`.
fn parse_osc_number(input: &[u8], start: usize) -> Option<(u32, usize)> {
    let mut i = start;
    let mut value: u32 = 0;
    let mut saw_digit = false;
    while let Some(&b) = input.get(i) {
        if b.is_ascii_digit() {
            saw_digit = true;
            value = value.saturating_mul(10).saturating_add((b - b'0') as u32);
            i += 1;
        } else {
            break;
        }
    }
    if !saw_digit {
        return None;
    }
    Some((value, i))
}

/// Finds the end (exclusive, pointing just past the terminator) of an OSC
/// sequence whose body starts at `start`. Terminator is BEL or ST (ESC \\ or
/// the single-byte 0x9c form).
fn find_osc_terminator(input: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < input.len() {
        match input[i] {
            BEL => return Some(i + 1),
            ST_C1 => return Some(i + 1),
            ESC if input.get(i + 1) == Some(&b'\\') => return Some(i + 2),
            _ => i += 1,
        }
    }
    None
}

/// Finds the end (exclusive) of a DCS/SOS/PM/APC sequence whose body starts
/// at `start`, terminated by ST (ESC \\, or 0x9c) or, laxly, BEL.
fn find_st_terminator(input: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < input.len() {
        match input[i] {
            BEL => return Some(i + 1),
            ST_C1 => return Some(i + 1),
            ESC if input.get(i + 1) == Some(&b'\\') => return Some(i + 2),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_osc_title_with_bel_terminator() {
        let input = b"\x1b]0;EVIL\x07ok\r\n";
        assert_eq!(sanitize(input), b"ok\r\n");
    }

    #[test]
    fn passes_allowlisted_osc_unchanged() {
        let input = b"\x1b]11;#00ff00\x07".to_vec();
        assert_eq!(sanitize(&input), input);
    }

    #[test]
    fn strips_osc_52_clipboard() {
        let input = b"\x1b]52;c;aGVsbG8=\x07after";
        assert_eq!(sanitize(input), b"after");
    }

    #[test]
    fn strips_dcs_sequence() {
        let input = b"before\x1bP1$rvalue\x1b\\after";
        assert_eq!(sanitize(input), b"beforeafter");
    }

    #[test]
    fn preserves_plain_color_sgr_codes() {
        let input = b"\x1b[31mred\x1b[0m";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn drops_truncated_osc_at_chunk_boundary() {
        let input = b"before\x1b]0;never-terminated";
        assert_eq!(sanitize(input), b"before");
    }

    #[test]
    fn is_idempotent() {
        let inputs: Vec<&[u8]> = vec![
            b"\x1b]0;EVIL\x07ok\r\n",
            b"\x1b]11;#00ff00\x07",
            b"plain text \x1b[1mbold\x1b[0m",
            b"before\x1bP1$rvalue\x1b\\after",
        ];
        for input in inputs {
            let once = sanitize(input);
            let twice = sanitize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn normalizes_ambiguous_circle_codepoints() {
        let input = "status \u{2B24} ready".as_bytes();
        let output = sanitize(input);
        assert_eq!(String::from_utf8(output).unwrap(), "status \u{25CF} ready");
    }
}

/// Parses one raw header line as delivered by the transfer engine's header
/// callback. This is the engine thread's fast path: no allocation happens
/// beyond the two returned strings, and nothing past `raw`'s length is
/// touched.
///
/// Trailing CR/LF and spaces are trimmed; lines that are empty after the
/// trim, or contain no `:`, yield nothing. The key is the prefix before the
/// first `:` as-is; the value is the suffix with leading whitespace skipped
/// and internal whitespace preserved.
pub(crate) fn parse_header_line(raw: &[u8]) -> Option<(String, String)> {
    let end = rfind_not_space(raw);
    if end == 0 {
        return None;
    }
    let line = &raw[..end];

    let colon = line.iter().position(|&byte| byte == b':')?;
    let key = &line[..colon];

    let mut value_start = colon + 1;
    while value_start < line.len() && (line[value_start] == b' ' || line[value_start] == b'\t') {
        value_start += 1;
    }
    let value = &line[value_start..];

    Some((
        String::from_utf8_lossy(key).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

/// Index one past the last byte that is not a space, CR, or LF.
fn rfind_not_space(raw: &[u8]) -> usize {
    let mut end = raw.len();
    while end > 0 {
        match raw[end - 1] {
            b'\n' | b'\r' | b' ' => end -= 1,
            _ => break,
        }
    }
    end
}

//! File names as the Apple sees them.
//!
//! Names travel as Latin-1 bytes. Characters outside Latin-1 are written
//! as `\uXXXX` (or `\UXXXXXXXX`) escapes, so a name shown in a directory
//! listing can be sent back verbatim to pick the same file.

/// Latin-1 bytes from a name, escaping characters Latin-1 lacks.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len());
    for c in name.chars() {
        let code = u32::from(c);
        match u8::try_from(code) {
            Ok(b) => bytes.push(b),
            Err(_) if code <= 0xFFFF => bytes.extend(format!("\\u{code:04x}").into_bytes()),
            Err(_) => bytes.extend(format!("\\U{code:08x}").into_bytes()),
        }
    }
    bytes
}

/// Name from Latin-1 bytes, undoing `encode_name` escapes.
pub fn decode_name(bytes: &[u8]) -> String {
    let mut name = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = match bytes.get(i..i + 2) {
            Some(b"\\u") => Some(4),
            Some(b"\\U") => Some(8),
            _ => None,
        };
        let escaped = escape.and_then(|digits| {
            let hex = bytes.get(i + 2..i + 2 + digits)?;
            let value = u32::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            Some((char::from_u32(value)?, 2 + digits))
        });
        match escaped {
            Some((c, len)) => {
                name.push(c);
                i += len;
            }
            None => {
                name.push(char::from(bytes[i]));
                i += 1;
            }
        }
    }
    name
}

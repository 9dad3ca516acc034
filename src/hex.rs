use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HexError {
    #[error("Invalid hex character in '{0}'")]
    InvalidCharacter(String),
    #[error("Odd number of hex digits in '{0}'")]
    OddLength(String),
}

/// True if every non-whitespace character is a hex digit.
pub fn is_hex(text: &str) -> bool {
    text.chars()
        .filter(|ch| !ch.is_whitespace())
        .all(|ch| ch.is_ascii_hexdigit())
}

/// Strip whitespace (and an optional `0x` prefix) and uppercase the digits.
pub fn normalize(text: &str) -> String {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    text.chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

pub fn decode(text: &str) -> Result<Vec<u8>, HexError> {
    let digits = normalize(text);
    if !is_hex(&digits) {
        return Err(HexError::InvalidCharacter(text.trim().to_owned()));
    }
    if digits.len() % 2 != 0 {
        return Err(HexError::OddLength(text.trim().to_owned()));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for ix in (0..digits.len()).step_by(2) {
        let byte = u8::from_str_radix(&digits[ix..ix + 2], 16)
            .map_err(|_| HexError::InvalidCharacter(text.trim().to_owned()))?;
        bytes.push(byte);
    }

    Ok(bytes)
}

pub fn encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Number of bytes described by a hex string.
pub fn byte_len(hex: &str) -> usize {
    normalize(hex).len() / 2
}

/// Group a hex string into space separated 32-bit words, eight words per line.
pub fn format_words(hex: &str) -> String {
    let digits = normalize(hex);
    let words: Vec<&str> = digits
        .as_bytes()
        .chunks(8)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();

    words
        .chunks(8)
        .map(|line| line.join(" "))
        .collect::<Vec<String>>()
        .join("\n")
}

/// Hexdump of finished code with its install address in the first column.
pub fn hexdump(code: &[u8], start_address: u32, stride: usize) -> String {
    fn addr(str: &mut String, offset: u32, first: bool) {
        if !first {
            str.push('\n');
        }
        str.push_str(format!("{:08x}:", offset).as_str());
    }
    let mut str = String::new();

    for (ix, byte) in code.iter().enumerate() {
        if ix % stride == 0 {
            addr(&mut str, start_address + ix as u32, ix == 0);
        }
        if ix % 4 == 0 {
            str.push(' ');
        }
        str.push_str(format!("{:02x}", byte).as_str());
    }

    str
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode() {
        assert_eq!(decode("3860 0001"), Ok(vec![0x38, 0x60, 0x00, 0x01]));
        assert_eq!(decode("0x4e800020"), Ok(vec![0x4E, 0x80, 0x00, 0x20]));
        assert_eq!(decode("386"), Err(HexError::OddLength("386".to_string())));
        assert_eq!(
            decode("li r3"),
            Err(HexError::InvalidCharacter("li r3".to_string()))
        );
    }

    #[test]
    fn test_format_words() {
        assert_eq!(format_words("3860000138800000"), "38600001 38800000");
        assert_eq!(format_words("386000"), "386000");
    }

    #[test]
    fn test_hexdump() {
        let code = vec![
            0x7C, 0x08, 0x02, 0xA6, 0x90, 0x01, 0x00, 0x04, 0x94, 0x21, 0xFF, 0xE8, 0x38, 0x60,
            0x00, 0x01, 0x4E, 0x80, 0x00, 0x20,
        ];
        let str = hexdump(&code, 0x80001000, 16);

        assert_eq!(
            str,
            "80001000: 7c0802a6 90010004 9421ffe8 38600001
80001010: 4e800020"
        );
    }
}

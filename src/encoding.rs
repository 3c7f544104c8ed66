//! Text encodings for `send` and for decoding received bytes.

/// Text encoding applied at the byte/text boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// 7-bit ASCII. Characters outside the range encode as `?`, bytes
    /// above 0x7F decode as `?`.
    #[default]
    Ascii,
    Utf8,
    /// ISO-8859-1: one byte per char, chars above U+00FF encode as `?`.
    Latin1,
}

const REPLACEMENT: u8 = b'?';

impl Encoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT })
                .collect(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(REPLACEMENT))
                .collect(),
        }
    }

    /// Decode `bytes` and append to `out`.
    pub fn decode_into(self, bytes: &[u8], out: &mut String) {
        match self {
            Encoding::Utf8 => out.push_str(&String::from_utf8_lossy(bytes)),
            Encoding::Ascii => out.extend(bytes.iter().map(|&b| {
                if b.is_ascii() {
                    b as char
                } else {
                    REPLACEMENT as char
                }
            })),
            Encoding::Latin1 => out.extend(bytes.iter().map(|&b| b as char)),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len());
        self.decode_into(bytes, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_replaces_non_ascii() {
        assert_eq!(Encoding::Ascii.encode("héllo"), b"h?llo".to_vec());
        assert_eq!(Encoding::Ascii.decode(&[b'o', 0xE9, b'k']), "o?k");
    }

    #[test]
    fn test_latin1_maps_high_bytes() {
        assert_eq!(Encoding::Latin1.encode("é€"), vec![0xE9, b'?']);
        assert_eq!(Encoding::Latin1.decode(&[0xE9]), "é");
    }

    #[test]
    fn test_utf8_passthrough() {
        assert_eq!(Encoding::Utf8.encode("héllo").len(), 6);
        assert_eq!(Encoding::Utf8.decode("héllo".as_bytes()), "héllo");
    }
}

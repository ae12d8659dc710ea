//! Text decoding for character columns.
//!
//! Non-Unicode columns arrive in the code page of their collation. The
//! connection holds a [`TextDecoder`] chosen at construction time; the
//! builtin one covers Windows-1252, UTF-8, UTF-16LE and Latin-1, and
//! anything else can be plugged in by the caller.

use std::fmt;

/// Decodes a byte string in a named encoding.
pub trait TextDecoder: Send + Sync + fmt::Debug {
    fn decode(&self, bytes: &[u8], encoding: &str) -> String;
}

/// Windows-1252 characters for bytes 0x80..=0x9F. Unassigned bytes map to U+FFFD.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{FFFD}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{FFFD}', '\u{017D}', '\u{FFFD}',
    '\u{FFFD}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{FFFD}', '\u{017E}', '\u{0178}',
];

fn cp1252_char(b: u8) -> char {
    match b {
        0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize],
        _ => b as char,
    }
}

/// Decoder for the encodings the crate understands without extra tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDecoder;

impl TextDecoder for BuiltinDecoder {
    fn decode(&self, bytes: &[u8], encoding: &str) -> String {
        match encoding.to_ascii_uppercase().as_str() {
            "WINDOWS-1252" | "CP1252" => {
                if bytes.is_ascii() {
                    // ASCII is valid UTF-8 as is
                    return String::from_utf8_lossy(bytes).into_owned();
                }
                bytes.iter().copied().map(cp1252_char).collect()
            }
            "UCS2" | "UCS-2" | "UTF16LE" | "UTF-16LE" => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
            "LATIN1" | "ISO-8859-1" | "BINARY" => bytes.iter().map(|&b| b as char).collect(),
            "UTF8" | "UTF-8" | "ASCII" => String::from_utf8_lossy(bytes).into_owned(),
            other => {
                trace!("No table for encoding {}, decoding as UTF-8", other);
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    }
}

/// Encoding name for a collation LCID.
pub fn encoding_for_lcid(lcid: u32) -> &'static str {
    match lcid & 0xFFFF {
        0x0411 => "CP932",
        0x0804 | 0x1004 => "CP936",
        0x0412 => "CP949",
        0x0404 | 0x0C04 | 0x1404 => "CP950",
        0x041E => "CP874",
        0x042A => "CP1258",
        // Primary language id
        _ => match lcid & 0x03FF {
            0x05 | 0x0E | 0x15 | 0x18 | 0x1A | 0x1B | 0x1C | 0x24 => "CP1250",
            0x02 | 0x19 | 0x22 | 0x23 | 0x2F | 0x3F | 0x40 | 0x44 | 0x50 => "CP1251",
            0x08 => "CP1253",
            0x1F | 0x2C | 0x43 => "CP1254",
            0x0D => "CP1255",
            0x01 | 0x20 | 0x29 => "CP1256",
            0x25 | 0x26 | 0x27 => "CP1257",
            _ => "CP1252",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp1252_ascii_fast_path() {
        assert_eq!(BuiltinDecoder.decode(b"hello", "CP1252"), "hello");
    }

    #[test]
    fn test_cp1252_high_bytes() {
        let decoded = BuiltinDecoder.decode(&[0x80, 0x20, 0x93, 0x41, 0x94, 0xE9], "WINDOWS-1252");
        assert_eq!(decoded, "\u{20AC} \u{201C}A\u{201D}\u{E9}");
        assert_eq!(BuiltinDecoder.decode(&[0x81], "cp1252"), "\u{FFFD}");
    }

    #[test]
    fn test_utf16le() {
        let bytes: Vec<u8> = "Grüße".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(BuiltinDecoder.decode(&bytes, "ucs2"), "Grüße");
    }

    #[test]
    fn test_latin1_and_utf8() {
        assert_eq!(BuiltinDecoder.decode(&[0x63, 0x61, 0x66, 0xE9], "latin1"), "café");
        assert_eq!(BuiltinDecoder.decode("café".as_bytes(), "utf8"), "café");
    }

    #[test]
    fn test_encoding_for_lcid() {
        assert_eq!(encoding_for_lcid(0x0409), "CP1252");
        assert_eq!(encoding_for_lcid(0x0419), "CP1251");
        assert_eq!(encoding_for_lcid(0x0411), "CP932");
        assert_eq!(encoding_for_lcid(0x0415), "CP1250");
    }
}

//! Character set handling.
//!
//! Column data arrives in the column's character set; parameters are sent in
//! the connection's. Collation ids map onto a [`Charset`]; everything beyond
//! UTF-8, ASCII and binary is converted through `encoding_rs`. The binary
//! character set (id 63) marks data that must never be converted.

use encoding_rs::{
    BIG5, EUC_JP, EUC_KR, Encoding, GB18030, GBK, IBM866, ISO_8859_2, ISO_8859_7, ISO_8859_8,
    ISO_8859_13, KOI8_R, KOI8_U, MACINTOSH, SHIFT_JIS, UTF_16BE, UTF_16LE, WINDOWS_874,
    WINDOWS_1250, WINDOWS_1251, WINDOWS_1252, WINDOWS_1254, WINDOWS_1256, WINDOWS_1257,
};
use sqlwire_core::{ClientErrorKind, Error, Result};

/// A character encoding known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// utf8 / utf8mb3 / utf8mb4, every collation
    Utf8,
    Ascii,
    /// Raw bytes (charset id 63)
    Binary,
    /// Any other server charset with an `encoding_rs` counterpart
    Encoded(&'static Encoding),
}

impl Charset {
    /// MySQL's `latin1`, which is really cp1252.
    pub fn latin1() -> Self {
        Charset::Encoded(WINDOWS_1252)
    }

    /// Map a collation id to its character set.
    ///
    /// `None` for ids the client cannot convert (dec8, hp8, swe7, armscii8,
    /// keybcs2, macce, cp850, cp852, geostd8, utf32) and for unknown ids.
    pub fn from_id(id: u16) -> Option<Self> {
        let encoding = match id {
            63 => return Some(Charset::Binary),
            11 | 65 => return Some(Charset::Ascii),
            33 | 45 | 46 | 76 | 83 | 192..=215 | 223..=247 | 255..=323 => {
                return Some(Charset::Utf8);
            }
            5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => WINDOWS_1252,
            1 | 84 => BIG5,
            2 | 9 | 21 | 27 | 77 => ISO_8859_2,
            7 | 74 => KOI8_R,
            12 | 91 | 97 | 98 => EUC_JP,
            13 | 88 | 95 | 96 => SHIFT_JIS,
            14 | 23 | 50 | 51 | 52 => WINDOWS_1251,
            16 | 71 => ISO_8859_8,
            18 | 89 => WINDOWS_874,
            19 | 85 => EUC_KR,
            20 | 41 | 42 | 79 => ISO_8859_13,
            22 | 75 => KOI8_U,
            24 | 86 | 28 | 87 => GBK,
            25 | 70 => ISO_8859_7,
            26 | 34 | 44 | 66 | 99 => WINDOWS_1250,
            29 | 58 | 59 => WINDOWS_1257,
            30 | 78 => WINDOWS_1254,
            36 | 68 => IBM866,
            39 | 53 => MACINTOSH,
            57 | 67 => WINDOWS_1256,
            248..=250 => GB18030,
            // ucs2 is UTF-16BE restricted to the BMP
            35 | 54 | 55 | 90 | 101..=124 | 128..=151 | 159 => UTF_16BE,
            56 | 62 => UTF_16LE,
            _ => return None,
        };
        Some(Charset::Encoded(encoding))
    }

    pub fn is_binary(self) -> bool {
        self == Charset::Binary
    }

    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf8mb4",
            Charset::Ascii => "ascii",
            Charset::Binary => "binary",
            Charset::Encoded(encoding) => encoding.name(),
        }
    }

    /// Whether strings can be sent in this charset.
    ///
    /// The UTF-16 family only decodes; MySQL also refuses it as a client
    /// character set.
    pub fn can_encode(self) -> bool {
        match self {
            Charset::Encoded(encoding) => encoding.output_encoding() == encoding,
            _ => true,
        }
    }

    /// Decode bytes in this charset into a string.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Charset::Utf8 | Charset::Binary => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| charset_error(format!("invalid utf8 data: {}", e))),
            Charset::Ascii => {
                if let Some(pos) = bytes.iter().position(|b| !b.is_ascii()) {
                    return Err(charset_error(format!(
                        "invalid ascii byte 0x{:02X} at offset {}",
                        bytes[pos], pos
                    )));
                }
                Ok(bytes.iter().map(|&b| char::from(b)).collect())
            }
            Charset::Encoded(encoding) => encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned())
                .ok_or_else(|| charset_error(format!("invalid {} data", encoding.name()))),
        }
    }

    /// Encode a string into this charset.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Charset::Utf8 | Charset::Binary => Ok(text.as_bytes().to_vec()),
            Charset::Ascii => match text.chars().find(|c| !c.is_ascii()) {
                Some(c) => Err(unencodable(c, "ascii")),
                None => Ok(text.as_bytes().to_vec()),
            },
            Charset::Encoded(encoding) => {
                if !self.can_encode() {
                    return Err(charset_error(format!(
                        "cannot encode text as {}",
                        encoding.name()
                    )));
                }
                let (bytes, _, had_errors) = encoding.encode(text);
                if had_errors {
                    let c = text
                        .chars()
                        .find(|c| {
                            let mut buf = [0u8; 4];
                            encoding.encode(c.encode_utf8(&mut buf)).2
                        })
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    return Err(unencodable(c, encoding.name()));
                }
                Ok(bytes.into_owned())
            }
        }
    }
}

fn unencodable(c: char, name: &str) -> Error {
    charset_error(format!("character {:?} cannot be encoded as {}", c, name))
}

fn charset_error(message: String) -> Error {
    Error::client(ClientErrorKind::Charset, message)
}

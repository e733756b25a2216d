//! Character-set conversion between the host (PETSCII) and the server
//! (ASCII) name spaces.
//!
//! Conversion is byte-for-byte: NUL maps to NUL and the length of the
//! converted name equals the length of the input.  The ASCII⇄PETSCII
//! tables swap the letter cases the way Commodore DOS expects: PETSCII
//! graphics-range letters 0xC1..0xDA correspond to ASCII 'A'..'Z' and
//! the PETSCII 0x41..0x5A range to ASCII 'a'..'z'.
#![warn(missing_docs)]
#![warn(unsafe_code)]

/// Name of the ASCII character set, as used by the CHARSET command.
pub const CHARSET_ASCII_NAME: &str = "ASCII";
/// Name of the PETSCII character set, as used by the CHARSET command.
pub const CHARSET_PETSCII_NAME: &str = "PETSCII";

/// An 8-bit character set identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Charset {
    /// ISO-Latin-1 / ASCII, the native charset of the local filesystem
    Ascii,
    /// PETSCII, the native charset of the host and of disk images
    Petscii,
}

impl Charset {
    /// Look up a charset by its wire name.  Returns None for unknown
    /// names so the CHARSET command can reject them.
    pub fn by_name(name: &str) -> Option<Charset> {
        match name {
            CHARSET_ASCII_NAME => Some(Charset::Ascii),
            CHARSET_PETSCII_NAME => Some(Charset::Petscii),
            _ => None,
        }
    }

    /// The wire name of this charset.
    pub fn name(self) -> &'static str {
        match self {
            Charset::Ascii => CHARSET_ASCII_NAME,
            Charset::Petscii => CHARSET_PETSCII_NAME,
        }
    }
}

/// Convert a single PETSCII byte to ASCII.
pub fn petscii_to_ascii(c: u8) -> u8 {
    match c {
        0xc1..=0xda => c - 0x80,
        0x41..=0x5a => c + 0x20,
        _ => c,
    }
}

/// Convert a single ASCII byte to PETSCII.
pub fn ascii_to_petscii(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => c - 0x20,
        b'A'..=b'Z' => c + 0x80,
        _ => c,
    }
}

/// Map a byte of the given charset to a unicode scalar for matching.
///
/// Both charsets fold to the ISO-Latin-1 view of the name so that a
/// PETSCII pattern can be compared against an ASCII name and vice
/// versa.
pub fn to_match_char(cset: Charset, c: u8) -> char {
    match cset {
        Charset::Ascii => c as char,
        Charset::Petscii => petscii_to_ascii(c) as char,
    }
}

/// A conversion function from one charset byte to another.
pub type Conv = fn(u8) -> u8;

fn conv_identity(c: u8) -> u8 {
    c
}

/// Return the conversion function mapping bytes of `from` into `to`.
///
/// The conversion preserves length; converting a NUL always yields a
/// NUL, so zero-terminated wire names stay zero-terminated.
pub fn converter(from: Charset, to: Charset) -> Conv {
    match (from, to) {
        (Charset::Ascii, Charset::Petscii) => ascii_to_petscii,
        (Charset::Petscii, Charset::Ascii) => petscii_to_ascii,
        _ => conv_identity,
    }
}

/// Convert a whole name between charsets.
pub fn convert(name: &[u8], from: Charset, to: Charset) -> Vec<u8> {
    let conv = converter(from, to);
    name.iter().map(|c| conv(*c)).collect()
}

#[cfg(test)]
mod tests {
    use super::{ascii_to_petscii, convert, converter, petscii_to_ascii, Charset};
    use pretty_assertions::assert_eq;

    #[test]
    fn nul_maps_to_nul() {
        assert_eq!(petscii_to_ascii(0), 0);
        assert_eq!(ascii_to_petscii(0), 0);
    }

    #[test]
    fn letter_cases_swap() {
        assert_eq!(ascii_to_petscii(b'a'), b'A');
        assert_eq!(ascii_to_petscii(b'A'), 0xc1);
        assert_eq!(petscii_to_ascii(0xc1), b'A');
        assert_eq!(petscii_to_ascii(b'A'), b'a');
    }

    #[test]
    fn ascii_subset_round_trips() {
        // For every printable ASCII byte not remapped by the tables the
        // composition petscii_to_ascii . ascii_to_petscii is identity.
        for b in 0x20..=0x7eu8 {
            let round = petscii_to_ascii(ascii_to_petscii(b));
            assert_eq!(round, b, "byte {:02x} did not survive the round trip", b);
        }
    }

    #[test]
    fn conversion_preserves_length() {
        let name = b"TEST FILE.PRG";
        let conv = convert(name, Charset::Ascii, Charset::Petscii);
        assert_eq!(conv.len(), name.len());
        let back = convert(&conv, Charset::Petscii, Charset::Ascii);
        assert_eq!(back, name.to_vec());
    }

    #[test]
    fn identity_converter_for_same_charset() {
        let conv = converter(Charset::Petscii, Charset::Petscii);
        for b in 0..=255u8 {
            assert_eq!(conv(b), b);
        }
    }
}

//! OEM codepage used for 8.3 short names.
//!
//! Long names are always UTF-16 and never go through a codepage.

use std::fmt;

/// Narrow encode/decode contract for short-name bytes.
pub trait Codepage: Sync {
    /// Map one OEM byte to a character.
    fn decode_byte(&self, b: u8) -> char;

    /// Map one character to an OEM byte, or `None` if it has no single-byte form.
    fn encode_char(&self, c: char) -> Option<u8>;

    fn decode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.decode_byte(b)).collect()
    }

    /// Encode a whole string; `None` if any character is unrepresentable.
    fn encode(&self, text: &str) -> Option<Vec<u8>> {
        text.chars().map(|c| self.encode_char(c)).collect()
    }
}

impl fmt::Debug for dyn Codepage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codepage")
    }
}

/// IBM PC codepage 437, the DOS default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cp437;

impl Codepage for Cp437 {
    fn decode_byte(&self, b: u8) -> char {
        if b < 0x80 {
            b as char
        } else {
            CP437_HIGH[b as usize - 0x80]
        }
    }

    fn encode_char(&self, c: char) -> Option<u8> {
        if (c as u32) < 0x80 {
            return Some(c as u8);
        }
        CP437_HIGH
            .iter()
            .position(|&h| h == c)
            .map(|i| (i + 0x80) as u8)
    }
}

/// CP437 to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    // 0xD0-0xDF
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    // 0xE0-0xEF
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    // 0xF0-0xFF
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cp437_decode() {
        assert_eq!(Cp437.decode(b"GR\x81\x81E"), "GRüüE");
        assert_eq!(Cp437.decode(b"3\xABFLOP"), "3½FLOP");
    }

    #[test]
    fn test_cp437_encode() {
        assert_eq!(Cp437.encode("CAFé"), Some(b"CAF\x82".to_vec()));
        assert_eq!(Cp437.encode_char('Ç'), Some(0x80));
        assert_eq!(Cp437.encode("日本"), None);
    }
}

//! 8.3 short names: validation, display, synthesis and the LFN checksum.

use std::collections::HashSet;

use super::dir_entry::{NT_LOWER_BASE, NT_LOWER_EXT};
use crate::codepage::Codepage;
use crate::error::FatError;

/// Space-padded 11-byte short name as stored on disk.
pub type ShortName = [u8; 11];

/// Number of plain `~N` tails tried before switching to hashed prefixes.
const NUMERIC_TAIL_ATTEMPTS: u32 = 4;

/// Characters a long name may never contain.
const LONG_NAME_FORBIDDEN: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// Checksum of a short name, stored in each of its LFN fragments.
pub fn lfn_checksum(name: &ShortName) -> u8 {
    name.iter()
        .fold(0u8, |sum, &c| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c))
}

/// Whether `b` may appear in a short name. Lower case letters are tolerated
/// only when reading names written by other systems.
pub fn is_valid_short_char(b: u8, allow_lower: bool) -> bool {
    match b {
        b'A'..=b'Z' | b'0'..=b'9' => true,
        b'a'..=b'z' => allow_lower,
        b' ' | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@' | b'^'
        | b'_' | b'`' | b'{' | b'}' | b'~' => true,
        0x80..=0xFF => true,
        _ => false,
    }
}

/// Every byte passes the charset test and the name does not start with a space.
pub fn is_valid_short_name(name: &ShortName, allow_lower: bool) -> bool {
    name[0] != b' ' && name.iter().all(|&b| is_valid_short_char(b, allow_lower))
}

/// Build a DOS 8.3 display name from the stored bytes, honouring the NT
/// lower-case flags.
pub fn build_short_name(name: &ShortName, nt_reserved: u8, codepage: &dyn Codepage) -> String {
    let base = codepage.decode(&name[..8]);
    let base = base.trim_end();
    let ext = codepage.decode(&name[8..]);
    let ext = ext.trim_end();

    let base = if nt_reserved & NT_LOWER_BASE != 0 {
        base.to_lowercase()
    } else {
        base.to_string()
    };
    let ext = if nt_reserved & NT_LOWER_EXT != 0 {
        ext.to_lowercase()
    } else {
        ext.to_string()
    };

    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// Reject names no FAT directory can hold.
pub fn validate_long_name(name: &str) -> Result<(), FatError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FatError::InvalidName(format!("{name:?}")));
    }
    if let Some(c) = name
        .chars()
        .find(|&c| (c as u32) < 0x20 || LONG_NAME_FORBIDDEN.contains(&c))
    {
        return Err(FatError::InvalidName(format!("{name:?} contains {c:?}")));
    }
    if name.encode_utf16().count() > super::dir_entry::LFN_MAX_UNITS {
        return Err(FatError::InvalidName(format!("{name:?} is too long")));
    }
    Ok(())
}

/// Encode `name` as-is if it already is a strict 8.3 name.
pub fn fit_short_name(name: &str, codepage: &dyn Codepage) -> Option<ShortName> {
    let (base, ext) = match name.rfind('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    if base.contains('.') || name.ends_with('.') || name.contains(' ') {
        return None;
    }
    let base = codepage.encode(base)?;
    let ext = codepage.encode(ext)?;
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    let mut short = [b' '; 11];
    short[..base.len()].copy_from_slice(&base);
    short[8..8 + ext.len()].copy_from_slice(&ext);
    is_valid_short_name(&short, false).then_some(short)
}

/// Map a character into the strict short-name charset: upper-cased, with
/// anything unrepresentable replaced by `_`. Spaces and dots are dropped.
fn sanitize(text: &str, codepage: &dyn Codepage) -> Vec<u8> {
    text.chars()
        .filter(|&c| c != ' ' && c != '.')
        .flat_map(char::to_uppercase)
        .map(|c| match codepage.encode_char(c) {
            Some(b) if is_valid_short_char(b, false) => b,
            _ => b'_',
        })
        .collect()
}

fn with_tail(base: &[u8], ext: &[u8], tail: &str) -> ShortName {
    let keep = base.len().min(8 - tail.len());
    let mut short = [b' '; 11];
    short[..keep].copy_from_slice(&base[..keep]);
    short[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
    short[8..8 + ext.len()].copy_from_slice(ext);
    short
}

/// Pick the short name for a new entry called `long_name` among siblings
/// whose short names are in `taken`.
///
/// Order: the name itself if it is already 8.3, then its upper-cased form,
/// then `BASE~N.EXT` for the first few N, then a hash-seeded prefix with
/// increasing N.
pub fn generate_short_name(
    long_name: &str,
    codepage: &dyn Codepage,
    taken: &HashSet<ShortName>,
) -> Result<ShortName, FatError> {
    if let Some(short) = fit_short_name(long_name, codepage) {
        if !taken.contains(&short) {
            return Ok(short);
        }
    }
    if let Some(short) = fit_short_name(&long_name.to_uppercase(), codepage) {
        if !taken.contains(&short) {
            return Ok(short);
        }
    }

    let trimmed = long_name.trim_start_matches('.');
    let (base_text, ext_text) = match trimmed.rfind('.') {
        Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
        None => (trimmed, ""),
    };
    let base = sanitize(base_text, codepage);
    let mut ext = sanitize(ext_text, codepage);
    ext.truncate(3);

    for n in 1..=NUMERIC_TAIL_ATTEMPTS {
        if base.is_empty() {
            break;
        }
        let short = with_tail(&base[..base.len().min(6)], &ext, &format!("~{n}"));
        if !taken.contains(&short) {
            return Ok(short);
        }
    }

    let hash = crc32fast::hash(long_name.as_bytes()) as u16;
    let mut hashed = base[..base.len().min(2)].to_vec();
    hashed.extend_from_slice(format!("{hash:04X}").as_bytes());
    for n in 1..=999_999u32 {
        let short = with_tail(&hashed, &ext, &format!("~{n}"));
        if !taken.contains(&short) {
            return Ok(short);
        }
    }
    Err(FatError::DirectoryFull(format!(
        "no unique short name left for {long_name:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::Cp437;

    fn name(s: &str) -> ShortName {
        let mut out = [b' '; 11];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn test_lfn_checksum() {
        assert_eq!(lfn_checksum(b"README  TXT"), 0x73);
        assert_eq!(lfn_checksum(b"LONGFI~1TXT"), 0xD4);
    }

    #[test]
    fn test_build_short_name() {
        assert_eq!(build_short_name(b"README  TXT", 0, &Cp437), "README.TXT");
        assert_eq!(build_short_name(b"NOEXT      ", 0, &Cp437), "NOEXT");
        assert_eq!(build_short_name(b"GR\x81\x81E   TXT", 0, &Cp437), "GRüüE.TXT");
        assert_eq!(
            build_short_name(b"README  TXT", NT_LOWER_BASE, &Cp437),
            "readme.TXT"
        );
        assert_eq!(
            build_short_name(b"README  TXT", NT_LOWER_BASE | NT_LOWER_EXT, &Cp437),
            "readme.txt"
        );
    }

    #[test]
    fn test_short_name_validity() {
        assert!(is_valid_short_name(b"README  TXT", false));
        assert!(!is_valid_short_name(b"readme  txt", false));
        assert!(is_valid_short_name(b"readme  txt", true));
        assert!(!is_valid_short_name(b"READ*ME TXT", true));
        assert!(!is_valid_short_name(b" EADME  TXT", true));
    }

    #[test]
    fn test_fit_short_name() {
        assert_eq!(fit_short_name("README.TXT", &Cp437), Some(*b"README  TXT"));
        assert_eq!(fit_short_name("A", &Cp437), Some(name("A")));
        assert_eq!(fit_short_name("readme.txt", &Cp437), None);
        assert_eq!(fit_short_name("TOOLONGNAME.TXT", &Cp437), None);
        assert_eq!(fit_short_name("A.B.C", &Cp437), None);
        assert_eq!(fit_short_name("A B.TXT", &Cp437), None);
        assert_eq!(fit_short_name(".HIDDEN", &Cp437), None);
    }

    #[test]
    fn test_generate_short_name_simple_cases() {
        let taken = HashSet::new();
        assert_eq!(
            generate_short_name("README.TXT", &Cp437, &taken).unwrap(),
            *b"README  TXT"
        );
        assert_eq!(
            generate_short_name("readme.txt", &Cp437, &taken).unwrap(),
            *b"README  TXT"
        );
        assert_eq!(
            generate_short_name("Long File Name.text", &Cp437, &taken).unwrap(),
            *b"LONGFI~1TEX"
        );
        assert_eq!(
            generate_short_name(".bashrc", &Cp437, &taken).unwrap(),
            *b"BASHRC~1   "
        );
        assert_eq!(
            generate_short_name("a+b.txt", &Cp437, &taken).unwrap(),
            *b"A_B~1   TXT"
        );
    }

    #[test]
    fn test_tilde_names_are_unique() {
        let mut taken = HashSet::new();
        for i in 0..12 {
            let long = format!("This is a long name {i}.txt");
            let short = generate_short_name(&long, &Cp437, &taken).unwrap();
            assert!(is_valid_short_name(&short, false));
            assert_eq!(&short[8..], b"TXT");
            assert!(taken.insert(short), "duplicate short name for {long}");
        }
        assert!(taken.contains(b"THISIS~1TXT"));
        assert!(taken.contains(b"THISIS~4TXT"));
        // After four numeric tails the prefix switches to two characters
        // plus a hash.
        let hashed: Vec<_> = taken.iter().filter(|s| !s.starts_with(b"THISIS")).collect();
        assert_eq!(hashed.len(), 8);
        assert!(hashed.iter().all(|s| s.starts_with(b"TH") && s[6] == b'~'));
    }

    #[test]
    fn test_validate_long_name() {
        assert!(validate_long_name("My Document.docx").is_ok());
        assert!(validate_long_name("").is_err());
        assert!(validate_long_name("..").is_err());
        assert!(validate_long_name("a:b").is_err());
        assert!(validate_long_name("tab\tname").is_err());
        assert!(validate_long_name(&"n".repeat(256)).is_err());
    }
}

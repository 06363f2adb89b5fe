//! 32-byte directory records and VFAT long-name fragments.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::error::FatError;

pub const DIR_ENTRY_SIZE: usize = 32;

/// Byte 0 of a slot that ends the directory.
pub const END_OF_DIRECTORY: u8 = 0x00;
/// Byte 0 of a deleted slot.
pub const DELETED_MARKER: u8 = 0xE5;
/// On-disk stand-in for a short name whose first character is 0xE5.
pub const KANJI_E5_ESCAPE: u8 = 0x05;

/// NtReserved flag: display the base name in lower case.
pub const NT_LOWER_BASE: u8 = 0x08;
/// NtReserved flag: display the extension in lower case.
pub const NT_LOWER_EXT: u8 = 0x10;

/// UTF-16 units per LFN fragment.
pub const LFN_UNITS_PER_FRAGMENT: usize = 13;
/// Longest long name, in UTF-16 units.
pub const LFN_MAX_UNITS: usize = 255;
pub const LFN_LAST_FLAG: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Attributes(pub u8);

impl Attributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    pub const LONG_NAME: u8 = Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID;

    pub fn has(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn is_long_name(self) -> bool {
        self.0 & 0x3F == Self::LONG_NAME
    }

    pub fn is_directory(self) -> bool {
        !self.is_long_name() && self.has(Self::DIRECTORY)
    }

    pub fn is_volume_id(self) -> bool {
        !self.is_long_name() && self.has(Self::VOLUME_ID)
    }
}

/// A short directory record. Byte 0 escaping (0x05 for a literal 0xE5) is
/// undone by [`DirectoryRecord::parse`] and redone by
/// [`DirectoryRecord::to_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DirectoryRecord {
    pub name: [u8; 11],
    pub attributes: Attributes,
    pub nt_reserved: u8,
    pub creation_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub first_cluster_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
}

impl DirectoryRecord {
    pub fn parse(data: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&data[0..11]);
        if name[0] == KANJI_E5_ESCAPE {
            name[0] = DELETED_MARKER;
        }
        Self {
            name,
            attributes: Attributes(data[11]),
            nt_reserved: data[12],
            creation_tenths: data[13],
            creation_time: LittleEndian::read_u16(&data[14..16]),
            creation_date: LittleEndian::read_u16(&data[16..18]),
            last_access_date: LittleEndian::read_u16(&data[18..20]),
            first_cluster_high: LittleEndian::read_u16(&data[20..22]),
            write_time: LittleEndian::read_u16(&data[22..24]),
            write_date: LittleEndian::read_u16(&data[24..26]),
            first_cluster_low: LittleEndian::read_u16(&data[26..28]),
            file_size: LittleEndian::read_u32(&data[28..32]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut data = [0u8; DIR_ENTRY_SIZE];
        data[0..11].copy_from_slice(&self.name);
        if data[0] == DELETED_MARKER {
            data[0] = KANJI_E5_ESCAPE;
        }
        data[11] = self.attributes.0;
        data[12] = self.nt_reserved;
        data[13] = self.creation_tenths;
        LittleEndian::write_u16(&mut data[14..16], self.creation_time);
        LittleEndian::write_u16(&mut data[16..18], self.creation_date);
        LittleEndian::write_u16(&mut data[18..20], self.last_access_date);
        LittleEndian::write_u16(&mut data[20..22], self.first_cluster_high);
        LittleEndian::write_u16(&mut data[22..24], self.write_time);
        LittleEndian::write_u16(&mut data[24..26], self.write_date);
        LittleEndian::write_u16(&mut data[26..28], self.first_cluster_low);
        LittleEndian::write_u32(&mut data[28..32], self.file_size);
        data
    }

    /// A fresh record for `name` with all timestamps set to `now`.
    pub fn new(name: [u8; 11], attributes: u8, now: NaiveDateTime) -> Self {
        let mut record = Self {
            name,
            attributes: Attributes(attributes),
            ..Default::default()
        };
        record.touch_created(now);
        record
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | self.first_cluster_low as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high = (cluster >> 16) as u16;
        self.first_cluster_low = cluster as u16;
    }

    pub fn touch_created(&mut self, now: NaiveDateTime) {
        let (date, time, tenths) = encode_timestamp(now);
        self.creation_date = date;
        self.creation_time = time;
        self.creation_tenths = tenths;
        self.write_date = date;
        self.write_time = time;
        self.last_access_date = date;
    }

    pub fn touch_modified(&mut self, now: NaiveDateTime) {
        let (date, time, _) = encode_timestamp(now);
        self.write_date = date;
        self.write_time = time;
        self.last_access_date = date;
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        decode_timestamp(self.write_date, self.write_time, 0)
    }

    pub fn created(&self) -> Option<NaiveDateTime> {
        decode_timestamp(self.creation_date, self.creation_time, self.creation_tenths)
    }
}

/// Encode a local time as FAT (date, time, tenths). Years outside
/// 1980..=2107 are clamped to the representable range.
pub fn encode_timestamp(dt: NaiveDateTime) -> (u16, u16, u8) {
    let year = dt.year().clamp(1980, 2107);
    if year != dt.year() {
        let edge = if year == 1980 {
            (1u16 << 5) | 1
        } else {
            (127u16 << 9) | (12 << 5) | 31
        };
        let time = if year == 1980 { 0 } else { (23 << 11) | (59 << 5) | 29 };
        return (edge, time, 0);
    }
    let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    let odd_second = (dt.second() % 2) as u8 * 100;
    let tenths = odd_second + (dt.nanosecond().min(999_999_999) / 10_000_000) as u8;
    (date, time, tenths)
}

/// Decode a FAT timestamp; `None` when the date field is zero or invalid.
pub fn decode_timestamp(date: u16, time: u16, tenths: u8) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = (time & 0x1F) as u32 * 2 + (tenths as u32 / 100).min(1);
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let millis = (tenths as u32 % 100) * 10;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_milli_opt(hour, minute, second, millis)
}

/// One 32-byte VFAT long-name fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfnFragment {
    pub ordinal: u8,
    pub name: [u16; LFN_UNITS_PER_FRAGMENT],
    pub checksum: u8,
}

/// Byte offsets of the 13 name units within a fragment.
const LFN_UNIT_OFFSETS: [usize; LFN_UNITS_PER_FRAGMENT] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

impl LfnFragment {
    pub fn parse(data: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u16; LFN_UNITS_PER_FRAGMENT];
        for (unit, &off) in name.iter_mut().zip(LFN_UNIT_OFFSETS.iter()) {
            *unit = LittleEndian::read_u16(&data[off..off + 2]);
        }
        Self {
            ordinal: data[0],
            name,
            checksum: data[13],
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut data = [0u8; DIR_ENTRY_SIZE];
        data[0] = self.ordinal;
        data[11] = Attributes::LONG_NAME;
        data[13] = self.checksum;
        for (&unit, &off) in self.name.iter().zip(LFN_UNIT_OFFSETS.iter()) {
            LittleEndian::write_u16(&mut data[off..off + 2], unit);
        }
        data
    }

    /// Sequence number, 1 for the fragment adjacent to the short record.
    pub fn sequence(&self) -> u8 {
        self.ordinal & 0x3F
    }

    pub fn is_last(&self) -> bool {
        self.ordinal & LFN_LAST_FLAG != 0
    }
}

/// Split `name` into fragments in on-disk order (highest sequence first).
pub fn build_lfn_fragments(name: &str, checksum: u8) -> Result<Vec<LfnFragment>, FatError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > LFN_MAX_UNITS {
        return Err(FatError::InvalidName(format!(
            "long name must be 1..={LFN_MAX_UNITS} UTF-16 units: {name:?}"
        )));
    }
    let count = units.len().div_ceil(LFN_UNITS_PER_FRAGMENT);
    let mut fragments = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let start = (seq - 1) * LFN_UNITS_PER_FRAGMENT;
        let chunk = &units[start..units.len().min(start + LFN_UNITS_PER_FRAGMENT)];
        let mut unit_buf = [0xFFFFu16; LFN_UNITS_PER_FRAGMENT];
        unit_buf[..chunk.len()].copy_from_slice(chunk);
        if chunk.len() < LFN_UNITS_PER_FRAGMENT {
            unit_buf[chunk.len()] = 0x0000;
        }
        let mut ordinal = seq as u8;
        if seq == count {
            ordinal |= LFN_LAST_FLAG;
        }
        fragments.push(LfnFragment {
            ordinal,
            name: unit_buf,
            checksum,
        });
    }
    Ok(fragments)
}

/// Reassemble a long name from fragments in on-disk order.
pub fn assemble_long_name(fragments: &[LfnFragment]) -> String {
    let units: Vec<u16> = fragments
        .iter()
        .rev()
        .flat_map(|f| f.name.iter().copied())
        .take_while(|&u| u != 0x0000)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DirectoryRecord {
        DirectoryRecord {
            name: *b"README  TXT",
            attributes: Attributes(Attributes::ARCHIVE),
            nt_reserved: NT_LOWER_EXT,
            creation_tenths: 150,
            creation_time: 0x7D3C,
            creation_date: 0x5A21,
            last_access_date: 0x5A21,
            first_cluster_high: 0x0001,
            write_time: 0x7D3C,
            write_date: 0x5A21,
            first_cluster_low: 0x0203,
            file_size: 12345,
        }
    }

    #[test]
    fn test_record_layout() {
        let record = sample_record();
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..11], b"README  TXT");
        assert_eq!(bytes[11], 0x20);
        assert_eq!(&bytes[20..22], &[0x01, 0x00]);
        assert_eq!(&bytes[26..28], &[0x03, 0x02]);
        assert_eq!(&bytes[28..32], &12345u32.to_le_bytes());
        assert_eq!(DirectoryRecord::parse(&bytes), record);
        assert_eq!(record.first_cluster(), 0x0001_0203);
    }

    #[test]
    fn test_e5_escape() {
        let mut record = sample_record();
        record.name[0] = 0xE5;
        let bytes = record.to_bytes();
        assert_eq!(bytes[0], KANJI_E5_ESCAPE);
        assert_eq!(DirectoryRecord::parse(&bytes).name[0], 0xE5);
    }

    #[test]
    fn test_attributes() {
        assert!(Attributes(0x0F).is_long_name());
        assert!(Attributes(0x3F).is_long_name());
        assert!(!Attributes(0x0F).is_directory());
        assert!(Attributes(0x10).is_directory());
        assert!(Attributes(0x28).is_volume_id());
    }

    #[test]
    fn test_timestamp_encoding() {
        let dt = NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_milli_opt(14, 30, 45, 500)
            .unwrap();
        let (date, time, tenths) = encode_timestamp(dt);
        assert_eq!(date, (44 << 9) | (6 << 5) | 15);
        assert_eq!(time, (14 << 11) | (30 << 5) | 22);
        assert_eq!(tenths, 150);
        assert_eq!(decode_timestamp(date, time, tenths), Some(dt));
        assert_eq!(decode_timestamp(0, 0, 0), None);
    }

    #[test]
    fn test_timestamp_clamps_year() {
        let early = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let (date, time, _) = encode_timestamp(early);
        assert_eq!(
            decode_timestamp(date, time, 0),
            NaiveDate::from_ymd_opt(1980, 1, 1).unwrap().and_hms_opt(0, 0, 0)
        );
    }

    #[test]
    fn test_lfn_fragments() {
        let name = "A fairly long file name.txt";
        let fragments = build_lfn_fragments(name, 0x5A).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].ordinal, 0x43);
        assert_eq!(fragments[2].ordinal, 0x01);
        assert!(fragments.iter().all(|f| f.checksum == 0x5A));
        // 27 units: one unit in the last fragment, then terminator and padding
        assert_eq!(fragments[0].name[0], 't' as u16);
        assert_eq!(fragments[0].name[1], 0x0000);
        assert_eq!(fragments[0].name[2], 0xFFFF);

        let reparsed: Vec<LfnFragment> = fragments
            .iter()
            .map(|f| {
                let bytes = f.to_bytes();
                assert_eq!(bytes[11], Attributes::LONG_NAME);
                LfnFragment::parse(&bytes)
            })
            .collect();
        assert_eq!(reparsed, fragments);
        assert_eq!(assemble_long_name(&reparsed), name);
    }

    #[test]
    fn test_lfn_exact_multiple_has_no_terminator() {
        let fragments = build_lfn_fragments("abcdefghijklm", 0).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].name.contains(&0x0000));
        assert_eq!(assemble_long_name(&fragments), "abcdefghijklm");
    }

    #[test]
    fn test_lfn_length_limit() {
        assert!(build_lfn_fragments(&"x".repeat(255), 0).is_ok());
        assert!(build_lfn_fragments(&"x".repeat(256), 0).is_err());
        assert!(build_lfn_fragments("", 0).is_err());
    }
}

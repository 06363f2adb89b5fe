//! Formatting: choose a FAT layout for a capacity and describe the sectors
//! that make up an empty volume.

pub mod emit;
pub mod layout;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::codepage::{Codepage, Cp437};
use crate::fs::FatVariant;
use crate::sector_set::SectorSet;

pub use emit::emit_sectors;
pub use layout::{compute_layout, DiskLayout};

/// Formatting options. Every field is optional in serialized form; unset
/// fields fall back to [`MkfsOptions::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    /// Volume serial number. Derived from the capacity, label and OEM name
    /// when unset.
    pub id: Option<u32>,
    pub fat_type: Option<FatVariant>,
    pub num_fats: Option<u8>,
    pub root_entry_count: Option<u16>,
    pub sectors_per_cluster: Option<u8>,
    pub label: Option<String>,
    /// Clusters kept clear of each variant boundary (0..=16).
    pub compat: u8,
    pub oem_name: String,
    pub media: Option<u8>,
    pub sectors_per_track: Option<u16>,
    pub num_heads: Option<u16>,
    pub hidden_sectors: u32,
    /// Boot code placed after the BPB. Truncated to the space available.
    pub boot_code: Option<Vec<u8>>,
    /// Text printed by the boot code, stored right after it.
    pub message: Option<String>,
    pub bytes_per_sector: u16,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            id: None,
            fat_type: None,
            num_fats: None,
            root_entry_count: None,
            sectors_per_cluster: None,
            label: None,
            compat: 0,
            oem_name: "MSWIN4.1".to_string(),
            media: None,
            sectors_per_track: None,
            num_heads: None,
            hidden_sectors: 0,
            boot_code: None,
            message: None,
            bytes_per_sector: 512,
        }
    }
}

/// Summary of a formatted volume plus the sectors to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MkfsResult {
    pub id: u32,
    pub fat_type: FatVariant,
    pub tot_sec: u32,
    pub rsvd_sec_cnt: u16,
    pub num_fats: u8,
    pub fat_sz: u32,
    pub root_dir_sectors: u32,
    pub count_of_clusters: u32,
    pub sec_per_clus: u8,
    pub byts_per_sec: u16,
    pub sectors: SectorSet,
}

/// The 11-byte label field for `options`: `Ok(None)` when no label was
/// requested, `Err(())` when the label cannot be stored.
pub(crate) fn encode_label(options: &MkfsOptions) -> Result<Option<[u8; 11]>, ()> {
    let Some(label) = options.label.as_deref() else {
        return Ok(None);
    };
    let label = label.trim_end().to_uppercase();
    if label.is_empty() {
        return Ok(None);
    }
    let bytes = Cp437.encode(&label).ok_or(())?;
    if bytes.len() > 11 || bytes.iter().any(|&b| b < 0x20 || b"\"*+,./:;<=>?[\\]|".contains(&b)) {
        return Err(());
    }
    let mut field = [b' '; 11];
    field[..bytes.len()].copy_from_slice(&bytes);
    Ok(Some(field))
}

/// Serial number for the volume: the explicit id, or a CRC-32 over the
/// volume size, label and OEM name so that identical inputs format
/// identically.
pub(crate) fn volume_id(layout: &DiskLayout, options: &MkfsOptions) -> u32 {
    if let Some(id) = options.id {
        return id;
    }
    let bytes = layout.total_sectors as u64 * layout.bytes_per_sector() as u64;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes.to_le_bytes());
    hasher.update(options.label.as_deref().unwrap_or("").as_bytes());
    hasher.update(options.oem_name.as_bytes());
    hasher.finalize()
}

/// Format `capacity` bytes. `None` when the options are inconsistent or no
/// layout fits.
pub fn mkfsvfat(capacity: u64, options: &MkfsOptions) -> Option<MkfsResult> {
    if encode_label(options).is_err() {
        debug!("volume label {:?} cannot be stored", options.label);
        return None;
    }
    if !options.oem_name.is_ascii() || options.oem_name.len() > 8 {
        debug!("OEM name {:?} does not fit 8 ASCII bytes", options.oem_name);
        return None;
    }
    let layout = compute_layout(capacity, options)?;
    let sectors = emit_sectors(&layout, options);
    Some(MkfsResult {
        id: volume_id(&layout, options),
        fat_type: layout.variant,
        tot_sec: layout.total_sectors,
        rsvd_sec_cnt: layout.reserved_sector_count,
        num_fats: layout.num_fats,
        fat_sz: layout.fat_size,
        root_dir_sectors: layout.root_dir_sectors,
        count_of_clusters: layout.count_of_clusters,
        sec_per_clus: layout.sectors_per_cluster() as u8,
        byts_per_sec: layout.bytes_per_sector() as u16,
        sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_720k_default_format() {
        let result = mkfsvfat(737_280, &MkfsOptions::default()).unwrap();
        assert_eq!(result.fat_type, FatVariant::Fat12);
        assert_eq!(result.num_fats, 2);
        assert_eq!(result.root_dir_sectors, 7);
        assert_eq!(result.sec_per_clus, 2);
        assert_eq!(result.count_of_clusters, 713);
        assert_eq!(result.tot_sec, 1440);
        assert_eq!(result.byts_per_sec, 512);
    }

    #[test]
    fn test_default_id_is_deterministic() {
        let options = MkfsOptions {
            label: Some("DATA".into()),
            ..Default::default()
        };
        let a = mkfsvfat(32 * 1024 * 1024, &options).unwrap();
        let b = mkfsvfat(32 * 1024 * 1024, &options).unwrap();
        assert_eq!(a, b);

        let other = MkfsOptions {
            label: Some("OTHER".into()),
            ..Default::default()
        };
        assert_ne!(mkfsvfat(32 * 1024 * 1024, &other).unwrap().id, a.id);
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let options = MkfsOptions {
            id: Some(0x0BAD_CAFE),
            ..Default::default()
        };
        assert_eq!(mkfsvfat(1_474_560, &options).unwrap().id, 0x0BAD_CAFE);
    }

    #[test]
    fn test_rejects_unstorable_label_and_oem() {
        let long = MkfsOptions {
            label: Some("TWELVE CHARS".into()),
            ..Default::default()
        };
        assert!(mkfsvfat(1_474_560, &long).is_none());

        let bad_char = MkfsOptions {
            label: Some("A*B".into()),
            ..Default::default()
        };
        assert!(mkfsvfat(1_474_560, &bad_char).is_none());

        let oem = MkfsOptions {
            oem_name: "TOOLONGOEM".into(),
            ..Default::default()
        };
        assert!(mkfsvfat(1_474_560, &oem).is_none());
    }

    #[test]
    fn test_label_is_uppercased() {
        let options = MkfsOptions {
            label: Some("games".into()),
            ..Default::default()
        };
        assert_eq!(encode_label(&options), Ok(Some(*b"GAMES      ")));
        assert_eq!(encode_label(&MkfsOptions::default()), Ok(None));
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: MkfsOptions =
            serde_json::from_str(r#"{ "fat_type": "FAT16", "label": "CFG" }"#).unwrap();
        assert_eq!(options.fat_type, Some(FatVariant::Fat16));
        assert_eq!(options.oem_name, "MSWIN4.1");
        assert_eq!(options.bytes_per_sector, 512);
    }
}

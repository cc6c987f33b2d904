//! Superblock codec and the bootstrap chunk mapping.
//!
//! The primary superblock sits at byte 65536 of the image and is 4096 bytes.
//! Its sys-chunk-array carries enough logical-to-physical mappings to locate
//! the chunk tree without having read any tree block yet. Parsing validates
//! geometry before anything trusts it; encoding reproduces the same layout
//! so an edited superblock can be written back.

use crate::csum::ChecksumType;
use cfs_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8, trim_nul_padded, u64_to_usize,
    write_fixed, write_le_u16, write_le_u32, write_le_u64, write_u8, DISK_KEY_SIZE, Key,
    ParseError, SUPER_INFO_OFFSET, SUPER_INFO_SIZE, SUPER_MAGIC,
};
use serde::{Deserialize, Serialize};

const LABEL_OFFSET: usize = 0x12B;
const LABEL_LEN: usize = 256;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Fixed chunk fields before the embedded stripe array.
const CHUNK_FIXED_SIZE: usize = 48;
/// One stripe descriptor (devid:u64 + offset:u64 + dev uuid:16).
const STRIPE_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub chunk_tree_uuid: [u8; 16],
    pub label: String,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse a 4096-byte superblock region.
    #[allow(clippy::too_many_lines)]
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let stripesize = read_le_u32(region, 0x9C)?;
        validate_geometry(sectorsize, nodesize, stripesize)?;

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = SYS_CHUNK_ARRAY_OFFSET
            .checked_add(sys_array_len)
            .ok_or(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "offset overflow",
            })?;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            stripesize,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: read_u8(region, 0xC6)?,
            chunk_root_level: read_u8(region, 0xC7)?,
            log_root_level: read_u8(region, 0xC8)?,
            chunk_tree_uuid: read_fixed::<16>(region, 0xC9)?,
            label: trim_nul_padded(&read_fixed::<LABEL_LEN>(region, LABEL_OFFSET)?),
            sys_chunk_array_size,
            sys_chunk_array: region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec(),
        })
    }

    /// Parse the primary superblock from a full image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = SUPER_INFO_OFFSET
            .checked_add(SUPER_INFO_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "superblock_offset",
                reason: "overflow",
            })?;
        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: SUPER_INFO_OFFSET,
                actual: image.len().saturating_sub(SUPER_INFO_OFFSET),
            });
        }
        Self::parse_region(&image[SUPER_INFO_OFFSET..end])
    }

    /// Encode into a 4096-byte region. The stored `csum` field is written
    /// as-is; callers restamp it with [`crate::csum::stamp`] after edits.
    #[allow(clippy::too_many_lines)]
    pub fn encode_region(&self) -> Result<Vec<u8>, ParseError> {
        validate_geometry(self.sectorsize, self.nodesize, self.stripesize)?;
        if self.sys_chunk_array.len() > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "exceeds 2048 byte limit",
            });
        }
        if self.label.len() >= LABEL_LEN {
            return Err(ParseError::InvalidField {
                field: "label",
                reason: "must be shorter than 256 bytes",
            });
        }

        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        write_fixed::<32>(&mut region, 0x00, &self.csum)?;
        write_fixed::<16>(&mut region, 0x20, &self.fsid)?;
        write_le_u64(&mut region, 0x30, self.bytenr)?;
        write_le_u64(&mut region, 0x38, self.flags)?;
        write_le_u64(&mut region, 0x40, self.magic)?;
        write_le_u64(&mut region, 0x48, self.generation)?;
        write_le_u64(&mut region, 0x50, self.root)?;
        write_le_u64(&mut region, 0x58, self.chunk_root)?;
        write_le_u64(&mut region, 0x60, self.log_root)?;
        write_le_u64(&mut region, 0x70, self.total_bytes)?;
        write_le_u64(&mut region, 0x78, self.bytes_used)?;
        write_le_u64(&mut region, 0x80, self.root_dir_objectid)?;
        write_le_u64(&mut region, 0x88, self.num_devices)?;
        write_le_u32(&mut region, 0x90, self.sectorsize)?;
        write_le_u32(&mut region, 0x94, self.nodesize)?;
        write_le_u32(&mut region, 0x9C, self.stripesize)?;
        write_le_u32(
            &mut region,
            0xA0,
            u32::try_from(self.sys_chunk_array.len()).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "sys_chunk_array_size",
                }
            })?,
        )?;
        write_le_u64(&mut region, 0xAC, self.compat_flags)?;
        write_le_u64(&mut region, 0xB4, self.compat_ro_flags)?;
        write_le_u64(&mut region, 0xBC, self.incompat_flags)?;
        write_le_u16(&mut region, 0xC4, self.csum_type)?;
        write_u8(&mut region, 0xC6, self.root_level)?;
        write_u8(&mut region, 0xC7, self.chunk_root_level)?;
        write_u8(&mut region, 0xC8, self.log_root_level)?;
        write_fixed::<16>(&mut region, 0xC9, &self.chunk_tree_uuid)?;
        region[LABEL_OFFSET..LABEL_OFFSET + self.label.len()]
            .copy_from_slice(self.label.as_bytes());
        region[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + self.sys_chunk_array.len()]
            .copy_from_slice(&self.sys_chunk_array);
        Ok(region)
    }

    pub fn checksum_type(&self) -> Result<ChecksumType, ParseError> {
        ChecksumType::from_raw(self.csum_type)
    }
}

fn validate_geometry(sectorsize: u32, nodesize: u32, stripesize: u32) -> Result<(), ParseError> {
    if sectorsize == 0 || !sectorsize.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field: "sectorsize",
            reason: "must be non-zero power of two",
        });
    }
    if nodesize == 0 || !nodesize.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field: "nodesize",
            reason: "must be non-zero power of two",
        });
    }
    if stripesize != 0 && !stripesize.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field: "stripesize",
            reason: "must be zero or power of two",
        });
    }
    if sectorsize > 256 * 1024 {
        return Err(ParseError::InvalidField {
            field: "sectorsize",
            reason: "exceeds 256K upper bound",
        });
    }
    if nodesize > 256 * 1024 {
        return Err(ParseError::InvalidField {
            field: "nodesize",
            reason: "exceeds 256K upper bound",
        });
    }
    Ok(())
}

// ── sys-chunk-array entries ─────────────────────────────────────────────────

/// One stripe within a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A parsed sys-chunk-array entry: a disk key followed by the chunk record
/// with its embedded stripe descriptors. The key's offset is the logical
/// start of the chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: Key,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

/// Parse all entries from a sys-chunk-array byte slice.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<ChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let key = Key::decode(data, cur)?;
        cur += DISK_KEY_SIZE;

        if cur + CHUNK_FIXED_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: CHUNK_FIXED_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let length = read_le_u64(data, cur)?;
        let owner = read_le_u64(data, cur + 8)?;
        let stripe_len = read_le_u64(data, cur + 16)?;
        let chunk_type = read_le_u64(data, cur + 24)?;
        let io_align = read_le_u32(data, cur + 32)?;
        let io_width = read_le_u32(data, cur + 36)?;
        let sector_size = read_le_u32(data, cur + 40)?;
        let num_stripes = read_le_u16(data, cur + 44)?;
        let sub_stripes = read_le_u16(data, cur + 46)?;
        cur += CHUNK_FIXED_SIZE;

        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }

        let stripes_count = usize::from(num_stripes);
        let stripes_bytes =
            stripes_count
                .checked_mul(STRIPE_SIZE)
                .ok_or(ParseError::InvalidField {
                    field: "num_stripes",
                    reason: "stripe count overflow",
                })?;
        if cur + stripes_bytes > data.len() {
            return Err(ParseError::InsufficientData {
                needed: stripes_bytes,
                offset: cur,
                actual: data.len() - cur,
            });
        }

        let mut stripes = Vec::with_capacity(stripes_count);
        for _ in 0..stripes_count {
            stripes.push(Stripe {
                devid: read_le_u64(data, cur)?,
                offset: read_le_u64(data, cur + 8)?,
                dev_uuid: read_fixed::<16>(data, cur + 16)?,
            });
            cur += STRIPE_SIZE;
        }

        entries.push(ChunkEntry {
            key,
            length,
            owner,
            stripe_len,
            chunk_type,
            io_align,
            io_width,
            sector_size,
            num_stripes,
            sub_stripes,
            stripes,
        });
    }

    Ok(entries)
}

/// Encode chunk entries back into sys-chunk-array bytes.
pub fn encode_sys_chunk_array(entries: &[ChunkEntry]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.stripes.is_empty() {
            return Err(ParseError::InvalidField {
                field: "stripes",
                reason: "chunk must have at least one stripe",
            });
        }
        let base = out.len();
        out.resize(
            base + DISK_KEY_SIZE + CHUNK_FIXED_SIZE + entry.stripes.len() * STRIPE_SIZE,
            0,
        );
        entry.key.encode(&mut out, base)?;
        let c = base + DISK_KEY_SIZE;
        write_le_u64(&mut out, c, entry.length)?;
        write_le_u64(&mut out, c + 8, entry.owner)?;
        write_le_u64(&mut out, c + 16, entry.stripe_len)?;
        write_le_u64(&mut out, c + 24, entry.chunk_type)?;
        write_le_u32(&mut out, c + 32, entry.io_align)?;
        write_le_u32(&mut out, c + 36, entry.io_width)?;
        write_le_u32(&mut out, c + 40, entry.sector_size)?;
        write_le_u16(
            &mut out,
            c + 44,
            u16::try_from(entry.stripes.len()).map_err(|_| ParseError::IntegerConversion {
                field: "num_stripes",
            })?,
        )?;
        write_le_u16(&mut out, c + 46, entry.sub_stripes)?;
        let mut s = c + CHUNK_FIXED_SIZE;
        for stripe in &entry.stripes {
            write_le_u64(&mut out, s, stripe.devid)?;
            write_le_u64(&mut out, s + 8, stripe.offset)?;
            write_fixed::<16>(&mut out, s + 16, &stripe.dev_uuid)?;
            s += STRIPE_SIZE;
        }
    }
    if out.len() > SYS_CHUNK_ARRAY_MAX {
        return Err(ParseError::InvalidField {
            field: "sys_chunk_array",
            reason: "exceeds 2048 byte limit",
        });
    }
    Ok(out)
}

// ── Logical → physical mapping ──────────────────────────────────────────────

/// Result of mapping a logical byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Map a logical byte address through the bootstrap chunk entries.
///
/// Uses the first stripe of the covering chunk, which is exact for the
/// single-device images this toolkit operates on. Returns `Ok(None)` when
/// no chunk covers the address.
pub fn map_logical_to_physical(
    chunks: &[ChunkEntry],
    logical: u64,
) -> Result<Option<PhysicalMapping>, ParseError> {
    for chunk in chunks {
        let chunk_start = chunk.key.offset;
        let chunk_end = chunk_start
            .checked_add(chunk.length)
            .ok_or(ParseError::InvalidField {
                field: "chunk_length",
                reason: "logical range overflow",
            })?;
        if logical >= chunk_start && logical < chunk_end {
            let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
                field: "stripes",
                reason: "chunk has no stripes",
            })?;
            let physical = stripe
                .offset
                .checked_add(logical - chunk_start)
                .ok_or(ParseError::InvalidField {
                    field: "stripe_offset",
                    reason: "physical address overflow",
                })?;
            return Ok(Some(PhysicalMapping {
                devid: stripe.devid,
                physical,
            }));
        }
    }
    Ok(None)
}

/// Map a logical address to a `usize` image offset, for in-memory images.
pub fn logical_to_image_offset(
    chunks: &[ChunkEntry],
    logical: u64,
) -> Result<Option<usize>, ParseError> {
    match map_logical_to_physical(chunks, logical)? {
        Some(mapping) => Ok(Some(u64_to_usize(mapping.physical, "physical")?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_superblock() -> Superblock {
        Superblock {
            csum: [0; 32],
            fsid: [0x11; 16],
            bytenr: SUPER_INFO_OFFSET as u64,
            flags: 1,
            magic: SUPER_MAGIC,
            generation: 7,
            root: 0x40_0000,
            chunk_root: 0x2_0000,
            log_root: 0,
            total_bytes: 256 * 1024 * 1024,
            bytes_used: 1024 * 1024,
            root_dir_objectid: 256,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: 16384,
            stripesize: 4096,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0x341,
            csum_type: 0,
            root_level: 1,
            chunk_root_level: 0,
            log_root_level: 0,
            chunk_tree_uuid: [0x22; 16],
            label: "scratch".to_owned(),
            sys_chunk_array_size: 0,
            sys_chunk_array: Vec::new(),
        }
    }

    fn single_chunk(logical: u64, length: u64, physical: u64) -> ChunkEntry {
        ChunkEntry {
            key: Key::new(256, 228, logical),
            length,
            owner: 2,
            stripe_len: 0x1_0000,
            chunk_type: 2,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![Stripe {
                devid: 1,
                offset: physical,
                dev_uuid: [0; 16],
            }],
        }
    }

    #[test]
    fn superblock_round_trips() {
        let mut sb = make_superblock();
        sb.sys_chunk_array = encode_sys_chunk_array(&[single_chunk(0x10_0000, 0x80_0000, 0x2000)])
            .expect("encode chunks");
        sb.sys_chunk_array_size =
            u32::try_from(sb.sys_chunk_array.len()).expect("array size fits");

        let region = sb.encode_region().expect("encode");
        assert_eq!(region.len(), SUPER_INFO_SIZE);
        let parsed = Superblock::parse_region(&region).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut sb = make_superblock();
        sb.magic = 0xDEAD;
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        region[0x40..0x48].copy_from_slice(&0xDEAD_u64.to_le_bytes());
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
        // encode still works; the magic field is not forced
        assert!(sb.encode_region().is_ok());
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let good = make_superblock();

        let mut sb = good.clone();
        sb.nodesize = 12_000; // not a power of two
        assert!(sb.encode_region().is_err());

        let mut sb = good.clone();
        sb.sectorsize = 0;
        assert!(sb.encode_region().is_err());

        let mut sb = good;
        sb.nodesize = 1024 * 1024;
        assert!(sb.encode_region().is_err());
    }

    #[test]
    fn parse_from_image_needs_the_full_region() {
        let image = vec![0_u8; SUPER_INFO_OFFSET + 100];
        assert!(matches!(
            Superblock::parse_from_image(&image),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn chunk_array_round_trips() {
        let entries = vec![
            single_chunk(0x10_0000, 0x40_0000, 0x2000),
            single_chunk(0x50_0000, 0x40_0000, 0x42_2000),
        ];
        let bytes = encode_sys_chunk_array(&entries).expect("encode");
        assert_eq!(bytes.len(), 2 * (17 + 48 + 32));
        let parsed = parse_sys_chunk_array(&bytes).expect("parse");
        assert_eq!(parsed, entries);
    }

    #[test]
    fn truncated_chunk_array_is_an_error() {
        let bytes =
            encode_sys_chunk_array(&[single_chunk(0x10_0000, 0x40_0000, 0x2000)]).expect("encode");
        assert!(parse_sys_chunk_array(&bytes[..bytes.len() - 10]).is_err());
        assert!(parse_sys_chunk_array(&bytes[..10]).is_err());
        assert!(parse_sys_chunk_array(&[]).expect("empty is fine").is_empty());
    }

    #[test]
    fn zero_stripes_is_an_error() {
        let mut bytes =
            encode_sys_chunk_array(&[single_chunk(0x10_0000, 0x40_0000, 0x2000)]).expect("encode");
        bytes[17 + 44] = 0;
        bytes[17 + 45] = 0;
        assert!(parse_sys_chunk_array(&bytes).is_err());
    }

    #[test]
    fn logical_mapping_hits_and_misses() {
        let chunks = vec![single_chunk(0x100_0000, 0x80_0000, 0x40_0000)];

        let hit = map_logical_to_physical(&chunks, 0x108_0000)
            .expect("map")
            .expect("covered");
        assert_eq!(hit.devid, 1);
        assert_eq!(hit.physical, 0x48_0000);

        assert!(map_logical_to_physical(&chunks, 0x200_0000)
            .expect("map")
            .is_none());
        assert!(map_logical_to_physical(&[], 0x1000).expect("map").is_none());
    }
}

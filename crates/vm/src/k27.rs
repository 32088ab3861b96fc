//! K27 container loader.
//!
//! A K27 file is a fixed header, a label-table payload, and the raw
//! instruction body. Multi-byte integers are big-endian.
//!
//! | Offset | Size            | Field                              |
//! |--------|-----------------|------------------------------------|
//! | 0x00   | 4               | magic `"KL27"`                     |
//! | 0x04   | 1               | version (1)                        |
//! | 0x05   | 1               | compression (0 = raw, 1 = LZMA)    |
//! | 0x06   | 4               | body offset (entry point)          |
//! | 0x0A   | 1               | stack size (4..=255)               |
//! | 0x0B   | 4               | CRC32 of body; all-zero = unchecked|
//! | 0x0F   | 5               | reserved                           |
//! | 0x14   | 2               | label count (<= 640)               |
//! | 0x16   | 4 * label count | label-table payload, raw           |
//! | ...    | 5               | table terminator, skipped          |
//! | ...    | rest            | instruction body                   |
//!
//! The payload is copied verbatim to `LABEL_TABLE_BASE` and the body to
//! `CODE_BASE`. Note the width mismatch the format carries: in-memory label
//! records are 6 bytes wide, but the payload length field counts 4 bytes
//! per label. `pack_label_table` deals with this when building images.

use crate::error::VmError;
use crate::mmu::{Mmu, CODE_BASE, LABEL_TABLE_BASE, MEM_SIZE};
use log::debug;
use std::mem;

/// File magic.
pub const MAGIC: [u8; 4] = *b"KL27";

/// The only supported container version.
pub const K27_VERSION: u8 = 1;

/// Fixed header size, up to and including the label count.
pub const HEADER_SIZE: usize = 0x16;

/// Bytes skipped between the label-table payload and the body.
pub const TERMINATOR_SIZE: usize = 5;

/// Maximum label count the table region can hold.
pub const MAX_LABELS: u16 = 640;

const COMPRESS_RAW: u8 = 0;
const COMPRESS_LZMA: u8 = 1;

/// A parsed K27 file.
///
/// `install` consumes the label-table and body payloads into an MMU;
/// after that the loader retains only the header fields a front-end
/// displays (entry, stack size, version, checksum, label count).
pub struct K27Loader {
    version: u8,
    compression: u8,
    entry: u32,
    stack_size: u8,
    checksum: [u8; 4],
    label_count: u16,
    body_len: usize,
    table: Vec<u8>,
    body: Vec<u8>,
}

impl K27Loader {
    /// Parse a K27 byte stream.
    ///
    /// # Errors
    ///
    /// - `BadMagic` / `BadVersion` for a foreign or newer container
    /// - `Unsupported` for an LZMA-compressed body
    /// - `BadFile` for anything structurally malformed (truncated header,
    ///   out-of-range entry point, stack size or label count, unknown
    ///   compression mode)
    /// - `Checksum` when the header carries a non-zero CRC32 that does not
    ///   match the body
    pub fn parse(data: &[u8]) -> Result<Self, VmError> {
        if data.len() < HEADER_SIZE {
            return Err(VmError::BadFile(format!(
                "{} bytes is too short for the header ({} needed)",
                data.len(),
                HEADER_SIZE
            )));
        }

        if data[0..4] != MAGIC {
            return Err(VmError::BadMagic {
                found: [data[0], data[1], data[2], data[3]],
            });
        }

        let version = data[4];
        if version != K27_VERSION {
            return Err(VmError::BadVersion { version });
        }

        let compression = data[5];
        match compression {
            COMPRESS_RAW => {}
            COMPRESS_LZMA => return Err(VmError::Unsupported),
            other => {
                return Err(VmError::BadFile(format!(
                    "unknown compression mode {other}"
                )))
            }
        }

        let entry = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        if entry >= MEM_SIZE - CODE_BASE {
            return Err(VmError::BadFile(format!(
                "entry point {entry:#x} lies outside memory"
            )));
        }

        let stack_size = data[0x0A];
        if stack_size < 4 {
            return Err(VmError::BadFile(format!(
                "stack size {stack_size} below minimum of 4"
            )));
        }

        let checksum = [data[0x0B], data[0x0C], data[0x0D], data[0x0E]];
        // data[0x0F..0x14] is reserved padding.

        let label_count = u16::from_be_bytes([data[0x14], data[0x15]]);
        if label_count > MAX_LABELS {
            return Err(VmError::BadFile(format!(
                "label count {label_count} exceeds table capacity ({MAX_LABELS})"
            )));
        }

        let table_len = label_count as usize * 4;
        let table_end = HEADER_SIZE + table_len;
        let body_start = table_end + TERMINATOR_SIZE;
        if data.len() < body_start {
            return Err(VmError::BadFile(format!(
                "truncated label table: {} bytes left, {} needed",
                data.len() - HEADER_SIZE,
                table_len + TERMINATOR_SIZE
            )));
        }

        let table = data[HEADER_SIZE..table_end].to_vec();
        let body = data[body_start..].to_vec();

        debug!(
            "parsed K27 header: entry={entry:#x} stack={stack_size} labels={label_count} body={} bytes",
            body.len()
        );

        if checksum != [0; 4] {
            let expected = u32::from_be_bytes(checksum);
            let computed = crc32fast::hash(&body);
            if computed != expected {
                return Err(VmError::Checksum { expected, computed });
            }
            debug!("body checksum verified ({computed:#010x})");
        } else {
            debug!("body checksum absent, skipping verification");
        }

        Ok(Self {
            version,
            compression,
            entry,
            stack_size,
            checksum,
            label_count,
            body_len: body.len(),
            table,
            body,
        })
    }

    /// Install the label table and instruction body into an MMU.
    ///
    /// The payloads are consumed: after this call the loader holds only
    /// header fields, and installing again writes nothing. Returns the
    /// initial program counter (`CODE_BASE + entry`).
    pub fn install(&mut self, mmu: &mut Mmu) -> Result<u32, VmError> {
        let table = mem::take(&mut self.table);
        let body = mem::take(&mut self.body);
        mmu.install(LABEL_TABLE_BASE, &table)?;
        mmu.install(CODE_BASE, &body)?;
        debug!(
            "installed image: table {} bytes at {LABEL_TABLE_BASE:#x}, body {} bytes at {CODE_BASE:#x}",
            table.len(),
            body.len()
        );
        Ok(self.start_pc())
    }

    /// Entry offset from the header, relative to the program region.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Absolute address execution starts at.
    pub fn start_pc(&self) -> u32 {
        CODE_BASE + self.entry
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn compression(&self) -> u8 {
        self.compression
    }

    /// Stack capacity requested by the file.
    pub fn stack_size(&self) -> u8 {
        self.stack_size
    }

    /// Header checksum field, verbatim. All-zero means unchecked.
    pub fn checksum(&self) -> [u8; 4] {
        self.checksum
    }

    pub fn label_count(&self) -> u16 {
        self.label_count
    }

    /// Length of the instruction body as parsed from the file.
    pub fn body_len(&self) -> usize {
        self.body_len
    }
}

// ============================================================================
// Test image builders
// ============================================================================

/// Pack label records for `build_test_k27`.
///
/// Produces the in-memory table layout (6-byte `{id, offset}` records at
/// `6 * id`), zero-padded to a multiple of 4, together with the label-count
/// field value that makes a loader copy exactly these bytes.
pub fn pack_label_table(labels: &[(u16, u32)]) -> (u16, Vec<u8>) {
    let records = match labels.iter().map(|&(id, _)| id).max() {
        Some(max_id) => max_id as usize + 1,
        None => return (0, Vec::new()),
    };

    let mut table = vec![0u8; records * 6];
    for &(id, offset) in labels {
        let at = id as usize * 6;
        table[at..at + 2].copy_from_slice(&id.to_be_bytes());
        table[at + 2..at + 6].copy_from_slice(&offset.to_be_bytes());
    }

    // Pad so the 4-bytes-per-label count field covers every record byte.
    while table.len() % 4 != 0 {
        table.push(0);
    }
    ((table.len() / 4) as u16, table)
}

/// Build a K27 image for tests.
///
/// `label_count` and `table` must agree (`table.len() == 4 * label_count`);
/// use `pack_label_table` to produce the pair. When `with_checksum` is set
/// the header carries the CRC32 of `body`, otherwise the checksum field is
/// zero and loaders skip verification.
pub fn build_test_k27(
    entry: u32,
    stack_size: u8,
    label_count: u16,
    table: &[u8],
    body: &[u8],
    with_checksum: bool,
) -> Vec<u8> {
    assert_eq!(table.len(), label_count as usize * 4);

    let checksum = if with_checksum {
        crc32fast::hash(body).to_be_bytes()
    } else {
        [0; 4]
    };

    let mut image = Vec::with_capacity(HEADER_SIZE + table.len() + TERMINATOR_SIZE + body.len());
    image.extend_from_slice(&MAGIC);
    image.push(K27_VERSION);
    image.push(COMPRESS_RAW);
    image.extend_from_slice(&entry.to_be_bytes());
    image.push(stack_size);
    image.extend_from_slice(&checksum);
    image.extend_from_slice(&[0; 5]); // reserved
    image.extend_from_slice(&label_count.to_be_bytes());
    image.extend_from_slice(table);
    image.extend_from_slice(&[0xFF; TERMINATOR_SIZE]);
    image.extend_from_slice(body);
    image
}

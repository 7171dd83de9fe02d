use crate::TestcardError;
use emu_core::types::Region;
use std::path::Path;

pub const MAGIC: &[u8; 4] = b"TCRD";
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cartridge {
    pub region: Region,
    /// Offsets the green channel of every frame.
    pub seed: u8,
}

impl Cartridge {
    /// Header layout:
    /// bytes 0-3 = "TCRD"
    /// byte 4 = region (0 NTSC, 1 PAL)
    /// byte 5 = seed
    /// Anything after the header is ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TestcardError> {
        if data.len() < HEADER_LEN {
            return Err(TestcardError::InvalidRom("image shorter than header"));
        }
        if &data[0..4] != MAGIC {
            return Err(TestcardError::InvalidRom("missing TCRD magic"));
        }
        let region = match data[4] {
            0 => Region::Ntsc,
            1 => Region::Pal,
            _ => return Err(TestcardError::InvalidRom("unknown region byte")),
        };
        Ok(Self {
            region,
            seed: data[5],
        })
    }

    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self, TestcardError> {
        let data = std::fs::read(p)?;
        Self::from_bytes(&data)
    }

    /// Build a ROM image for `region` and `seed`.
    pub fn image(region: Region, seed: u8) -> Vec<u8> {
        let mut data = MAGIC.to_vec();
        data.push(match region {
            Region::Ntsc => 0,
            Region::Pal => 1,
        });
        data.push(seed);
        data
    }
}

//! Loading of LC-3 object images.
//!
//! An image is a sequence of big-endian words. The first is the origin, the rest are
//! copied into consecutive addresses starting there.

use std::{fs::File, io::Read, path::Path};

use anyhow::Result;

use super::{
    memory::{Memory, MEMORY_SIZE},
    EmuError,
};

/// Most bytes read from an image: the origin word, one word per address, and one more
/// word so truncation can be noticed.
const MAX_IMAGE_BYTES: u64 = 2 * (MEMORY_SIZE as u64 + 2);

/// Where an image ended up in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub origin: u16,
    /// Number of words copied after the origin word.
    pub len: usize,
}

impl LoadedImage {
    /// Address one past the last loaded word (wrapping).
    pub fn end(&self) -> u16 {
        self.origin.wrapping_add(self.len as u16)
    }
}

/// Copies an image from `reader` into `memory`.
///
/// Loading stops at the end of the stream or after address `0xFFFF`, whichever comes
/// first. A trailing odd byte is ignored.
pub fn load_image<R: Read>(reader: R, memory: &mut Memory) -> Result<LoadedImage> {
    let mut bytes = Vec::new();
    reader.take(MAX_IMAGE_BYTES).read_to_end(&mut bytes)?;
    let mut words = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));

    let origin = words.next().ok_or(EmuError::MissingOrigin)?;
    let room = 0x1_0000 - origin as usize;
    let mut len = 0;
    for (addr, word) in (origin..=u16::MAX).zip(words) {
        memory.write(addr, word);
        len += 1;
    }
    if bytes.len() / 2 > room + 1 {
        log::warn!("image truncated: it does not fit between x{:04X} and xFFFF", origin);
    }
    log::debug!("loaded {} words at x{:04X}", len, origin);
    Ok(LoadedImage { origin, len })
}

/// Opens `path` and loads it with [load_image].
pub fn load_image_file(path: impl AsRef<Path>, memory: &mut Memory) -> Result<LoadedImage> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| EmuError::ImageOpen {
        path: path.to_path_buf(),
        source,
    })?;
    load_image(file, memory)
}

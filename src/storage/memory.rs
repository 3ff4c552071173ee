//! Merging diff memory layers onto a full guest memory image.
//!
//! A diff snapshot's memory file is sparse: only pages dirtied since the
//! previous capture hold data, everything else reads back as zeros. Replaying
//! it means copying every non-zero block onto the base image in place.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Guest page size; diff layers are written in whole pages.
pub const MERGE_BLOCK_SIZE: usize = 4096;

/// Apply `layer` onto `base` in place, skipping all-zero blocks.
///
/// The base is never truncated and grows if the layer is longer. Returns the
/// number of bytes written.
pub fn merge_layer(base: &Path, layer: &Path, block_size: usize) -> io::Result<u64> {
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be non-zero",
        ));
    }
    let mut src = File::open(layer)?;
    let dst = OpenOptions::new().write(true).open(base)?;

    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;
    let mut written = 0u64;
    loop {
        let n = read_block(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        if block.iter().any(|&b| b != 0) {
            dst.write_all_at(block, offset)?;
            written += n as u64;
        }
        offset += n as u64;
    }
    dst.sync_all()?;
    Ok(written)
}

/// Fill `buf` as far as the file allows; short only at EOF.
fn read_block(src: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

//! Boot-image layout.
//!
//! A program image is a page-multiple byte blob: the first page starts with a
//! header whose words at [`TEXT_SIZE_OFFSET`] and [`DATA_SIZE_OFFSET`] give
//! the byte sizes of the initialized text and data regions, and the code
//! itself begins at [`ENTRY_OFFSET`] within that page. Flash devices carry one
//! image page per block, so block `n` of a device is page `n` of its image.

use crate::addressing::{KUSEG_BASE, PAGE_SIZE};

/// Header offset of the `.text` byte size.
pub const TEXT_SIZE_OFFSET: usize = 0x14;

/// Header offset of the `.data` byte size.
pub const DATA_SIZE_OFFSET: usize = 0x24;

/// Offset of the first instruction within the first page.
pub const ENTRY_OFFSET: u32 = 0xB0;

/// Virtual address of the first instruction of every program.
pub const ENTRY_VA: u32 = KUSEG_BASE + ENTRY_OFFSET;

/// Build an image from assembled code plus `data_pages` zero-initialized data
/// pages. The text region is the code rounded up to whole pages.
pub fn build_image(code: &[u32], data_pages: usize) -> Vec<u8> {
    let text_bytes = ENTRY_OFFSET as usize + code.len() * 4;
    let text_size = text_bytes.div_ceil(PAGE_SIZE as usize) * PAGE_SIZE as usize;
    let data_size = data_pages * PAGE_SIZE as usize;

    let mut image = vec![0u8; text_size + data_size];
    image[TEXT_SIZE_OFFSET..TEXT_SIZE_OFFSET + 4]
        .copy_from_slice(&(text_size as u32).to_le_bytes());
    image[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 4]
        .copy_from_slice(&(data_size as u32).to_le_bytes());
    for (i, w) in code.iter().enumerate() {
        let at = ENTRY_OFFSET as usize + i * 4;
        image[at..at + 4].copy_from_slice(&w.to_le_bytes());
    }
    image
}

/// Read the `.text` size word out of an image's first page.
pub fn text_size(page0: &[u8]) -> u32 {
    u32::from_le_bytes([
        page0[TEXT_SIZE_OFFSET],
        page0[TEXT_SIZE_OFFSET + 1],
        page0[TEXT_SIZE_OFFSET + 2],
        page0[TEXT_SIZE_OFFSET + 3],
    ])
}

/// Read the `.data` size word out of an image's first page.
pub fn data_size(page0: &[u8]) -> u32 {
    u32::from_le_bytes([
        page0[DATA_SIZE_OFFSET],
        page0[DATA_SIZE_OFFSET + 1],
        page0[DATA_SIZE_OFFSET + 2],
        page0[DATA_SIZE_OFFSET + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_padding() {
        let code = vec![0x1234_5678; 10];
        let image = build_image(&code, 2);
        assert_eq!(image.len(), 3 * PAGE_SIZE as usize);
        assert_eq!(text_size(&image), PAGE_SIZE);
        assert_eq!(data_size(&image), 2 * PAGE_SIZE);
        let at = ENTRY_OFFSET as usize;
        assert_eq!(
            u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]),
            0x1234_5678
        );
    }
}

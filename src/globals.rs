pub const KIB: usize = 1024;
/// Allocation granularity. Every object starts on a cell boundary.
pub const CELL_SIZE: usize = 8;

pub const FIXED_BLOCK_PAGE_SIZE: usize = 256 * KIB;
/// Largest block (in cells) served by fixed-block pages.
pub const FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE: usize = 128;
/// Enough occupancy bits for a page of one-cell blocks.
pub const FIXED_BLOCK_BITMAP_WORDS: usize = FIXED_BLOCK_PAGE_SIZE / CELL_SIZE / 64;

pub const NEXT_FIT_PAGE_SIZE: usize = 256 * KIB;

pub const EXTRA_OBJECT_PAGE_SIZE: usize = 64 * KIB;
/// Size of one auxiliary metadata slot.
pub const EXTRA_OBJECT_SIZE: usize = 64;
pub const EXTRA_OBJECT_BITMAP_WORDS: usize = EXTRA_OBJECT_PAGE_SIZE / EXTRA_OBJECT_SIZE / 64;

pub const fn round_up(x: usize, y: usize) -> usize {
    ((x) + (y - 1)) & !(y - 1)
}

/// Number of cells needed to hold `size` bytes. Zero-sized requests still take a cell.
pub const fn cells_for_size(size: usize) -> usize {
    let cells = round_up(size, CELL_SIZE) / CELL_SIZE;
    if cells == 0 {
        1
    } else {
        cells
    }
}

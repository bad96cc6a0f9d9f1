//! Size-class tables and span geometry.
//!
//! Class 0 represents size 0: allocation requests mapping to it return null
//! by contract.  Classes 1..NUM_CLASSES carry real block sizes — a linear
//! 16-byte ramp up to 128, then the doubling-step ladder up to 64KB.
//!
//! Every span lives at a `VIRTUAL_SPAN_SIZE`-aligned address so a block
//! pointer maps to its header with a single mask.  Only the first
//! `span_size(class)` bytes of the virtual slot are ever committed.

/// Virtual span slot size.  Power of two, ≥ the largest real span size;
/// the mask for pointer → header resolution.
pub(crate) const VIRTUAL_SPAN_SIZE: usize = 2 * 1024 * 1024;

/// Bytes reserved at the base of each span for the header.
pub(crate) const SPAN_HEADER_RESERVED: usize = 128;

/// Largest size served from spans.  The malloc shim routes anything larger
/// to its large-object path.
pub const MAX_SMALL_SIZE: usize = 65536;

/// Number of size classes, including class 0 (zero-size requests).
pub const NUM_CLASSES: usize = 45;

/// Block sizes per class.  Entry 0 is the zero-size sentinel class.
pub(crate) const CLASS_SIZES: [usize; NUM_CLASSES] = [
    0, 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896,
    1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288,
    14336, 16384, 20480, 24576, 28672, 32768, 40960, 49152, 57344, 65536,
];

const MIN_SPAN_SIZE: usize = 16 * 1024;

/// Rounds `x` up to the next multiple of `align` (any positive `align`).
pub(crate) const fn round_up(x: usize, align: usize) -> usize {
    x.div_ceil(align) * align
}

/// Block size for a class.
#[inline]
pub(crate) const fn block_size(class: usize) -> usize {
    CLASS_SIZES[class]
}

/// Real (committed) span size for a class.  Always a power of two between
/// 16KB and `VIRTUAL_SPAN_SIZE`, hence a page multiple.
#[inline]
pub(crate) const fn span_size(class: usize) -> usize {
    if class == 0 {
        return 0;
    }
    let target = CLASS_SIZES[class] * 64;
    let size = target.next_power_of_two();
    if size < MIN_SPAN_SIZE {
        MIN_SPAN_SIZE
    } else if size > VIRTUAL_SPAN_SIZE {
        VIRTUAL_SPAN_SIZE
    } else {
        size
    }
}

/// Offset of the first block within a span: the header reservation rounded
/// up so blocks sit on a `block_size` grid relative to this offset.
#[inline]
pub(crate) const fn first_block_offset(class: usize) -> usize {
    if class == 0 {
        return 0;
    }
    round_up(SPAN_HEADER_RESERVED, CLASS_SIZES[class])
}

/// Blocks per span for a class.
#[inline]
pub(crate) const fn blocks_per_span(class: usize) -> usize {
    if class == 0 {
        return 0;
    }
    (span_size(class) - first_block_offset(class)) / CLASS_SIZES[class]
}

/// O(1) size-to-class lookup table.  Index by `ceil(size / 16)`.
/// 4097 entries cover sizes 1..=65536 in 16-byte quanta; each entry is the
/// class index (1..=44).
static SIZE_CLASS_LUT: [u8; 4097] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; 4097] {
    let mut table = [0u8; 4097];
    // table[0] unused (size 0 maps to class 0 directly)
    let mut q: usize = 1;
    let mut sc: usize = 1;
    while sc < NUM_CLASSES {
        let class_quanta = CLASS_SIZES[sc] / 16;
        while q <= class_quanta {
            table[q] = sc as u8;
            q += 1;
        }
        sc += 1;
    }
    table
}

/// Map an allocation size to its class.
///
/// # Panics
///
/// Sizes above [`MAX_SMALL_SIZE`] are a caller contract violation (the shim
/// owns large objects) and abort with a diagnostic.
#[inline]
pub(crate) fn size_to_class(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    assert!(
        size <= MAX_SMALL_SIZE,
        "allocation size {size} exceeds the small-object limit {MAX_SMALL_SIZE}",
    );
    SIZE_CLASS_LUT[(size + 15) >> 4] as usize
}

// ---------------------------------------------------------------------------
// Compile-time geometry checks
// ---------------------------------------------------------------------------

const _: () = assert!(VIRTUAL_SPAN_SIZE.is_power_of_two());
const _: () = assert!(CLASS_SIZES[NUM_CLASSES - 1] == MAX_SMALL_SIZE);
const _: () = assert!(span_size(NUM_CLASSES - 1) <= VIRTUAL_SPAN_SIZE);
const _: () = assert!(blocks_per_span(NUM_CLASSES - 1) >= 1);
const _: () = assert!(span_size(1).is_power_of_two());
const _: () = {
    // Table must be strictly increasing in 16-byte multiples.
    let mut i = 1;
    while i < NUM_CLASSES {
        assert!(CLASS_SIZES[i] % 16 == 0);
        assert!(CLASS_SIZES[i] > CLASS_SIZES[i - 1]);
        i += 1;
    }
};
const _: () = {
    // Every class's blocks must fit its span with the header in front.
    let mut c = 1;
    while c < NUM_CLASSES {
        assert!(first_block_offset(c) >= SPAN_HEADER_RESERVED);
        assert!(first_block_offset(c) + blocks_per_span(c) * CLASS_SIZES[c] <= span_size(c));
        assert!(blocks_per_span(c) >= 1);
        c += 1;
    }
};

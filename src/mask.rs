//! Payload masking per
//! [RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3).
//!
//! Client frames XOR each payload byte with the masking key byte at the same
//! index modulo four. The operation is its own inverse, so the same routine
//! unmasks inbound payloads during decoding.

/// Applies the masking key to `buf` in place.
///
/// Dispatches on buffer size: small payloads go through the word-at-a-time
/// 32-bit path, larger ones through the 64-bit path.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    if buf.len() <= 128 {
        apply_mask_fast32(buf, mask)
    } else {
        apply_mask_fast64(buf, mask)
    }
}

/// Byte-wise reference implementation.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Masks aligned chunks four bytes at a time.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };
    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}

/// Masks aligned chunks eight bytes at a time.
#[inline]
fn apply_mask_fast64(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mask_u64 = ((mask_u32 as u64) << 32) | mask_u32 as u64;

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u64>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u64 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u64.rotate_left(8 * head as u32)
        } else {
            mask_u64.rotate_right(8 * head as u32)
        }
    } else {
        mask_u64
    };
    for word in words.iter_mut() {
        *word ^= mask_u64;
    }
    apply_mask_fallback(suffix, (mask_u64 as u32).to_ne_bytes());
}

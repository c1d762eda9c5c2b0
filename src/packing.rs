//! Logical-element <-> physical-word codec.
//!
//! The execution model stores 32-bit words. Sub-32-bit logical types pack
//! multiple elements per word (8-bit: 4 per word, 16-bit: 2 per word) and
//! 64-bit types split one element across two consecutive words (low, high).
//! Lane order within a word is little-endian: element `i` occupies bits
//! `(i % lanes) * width ..`.
//!
//! Writes that do not cover whole words at the edges carry keep-masks so the
//! word can be merged read-modify-write without touching neighboring packed
//! elements. Encoding and decoding happen only here and in the typed-buffer
//! layer; the rest of the runtime moves opaque words.

use crate::types::{Element, ElementType};

/// Physical word count backing `logical_len` elements of `ty`.
pub(crate) fn physical_word_len(ty: ElementType, logical_len: usize) -> usize {
    if ty.is_double_word() {
        logical_len * 2
    } else {
        let lanes = ty.lanes_per_word();
        logical_len.div_ceil(lanes)
    }
}

/// Word span `[word_offset, word_offset + word_count)` covering the logical
/// element range `[elem_offset, elem_offset + count)`.
pub(crate) fn word_span(ty: ElementType, elem_offset: usize, count: usize) -> (usize, usize) {
    if ty.is_double_word() {
        return (elem_offset * 2, count * 2);
    }
    let lanes = ty.lanes_per_word();
    if count == 0 {
        return (elem_offset / lanes, 0);
    }
    let first = elem_offset / lanes;
    let last = (elem_offset + count - 1) / lanes;
    (first, last - first + 1)
}

/// An encoded write: destination word range, payload words, and keep-masks
/// for partially covered edge words. A keep-mask selects the bits of the
/// EXISTING word that must survive the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedWrite {
    pub word_offset: usize,
    pub words: Vec<u32>,
    /// Keep-mask for the first word, when the write starts mid-word.
    pub head_keep: Option<u32>,
    /// Keep-mask for the last word, when the write ends mid-word.
    pub tail_keep: Option<u32>,
}

/// Merge a payload word into an existing word under a keep-mask.
pub(crate) fn merge_word(old: u32, new: u32, keep: u32) -> u32 {
    (old & keep) | (new & !keep)
}

/// Encode `data` for storage at logical element offset `elem_offset`.
pub(crate) fn encode_write<T: Element>(data: &[T], elem_offset: usize) -> EncodedWrite {
    let ty = T::ELEMENT_TYPE;
    let (word_offset, word_count) = word_span(ty, elem_offset, data.len());
    let mut words = vec![0u32; word_count];

    if data.is_empty() {
        return EncodedWrite {
            word_offset,
            words,
            head_keep: None,
            tail_keep: None,
        };
    }

    if ty.is_double_word() {
        for (i, &v) in data.iter().enumerate() {
            let bits = v.to_bits();
            words[i * 2] = bits as u32;
            words[i * 2 + 1] = (bits >> 32) as u32;
        }
        return EncodedWrite {
            word_offset,
            words,
            head_keep: None,
            tail_keep: None,
        };
    }

    let lanes = ty.lanes_per_word();
    let width = ty.size_bits();
    let lane_mask = if width == 32 { u32::MAX } else { (1u32 << width) - 1 };

    for (i, &v) in data.iter().enumerate() {
        let global = elem_offset + i;
        let word = global / lanes - word_offset;
        let shift = (global % lanes) * width;
        words[word] |= ((v.to_bits() as u32) & lane_mask) << shift;
    }

    // Keep-masks preserve the lanes outside [elem_offset, elem_offset + len).
    let head_lanes = elem_offset % lanes;
    let end = elem_offset + data.len();
    let tail_lanes = end % lanes;

    let mut head_keep = if head_lanes != 0 {
        Some((1u32 << (head_lanes * width)) - 1)
    } else {
        None
    };
    let mut tail_keep = if tail_lanes != 0 {
        Some(!(((1u64 << (tail_lanes * width)) - 1) as u32))
    } else {
        None
    };

    // A single partially covered word merges both masks.
    if word_count == 1 {
        if let (Some(h), Some(t)) = (head_keep, tail_keep) {
            head_keep = Some(h | t);
            tail_keep = None;
        } else if head_keep.is_none() {
            head_keep = tail_keep.take();
        }
    }

    EncodedWrite {
        word_offset,
        words,
        head_keep,
        tail_keep,
    }
}

/// Decode `count` elements starting at logical offset `elem_offset` from the
/// word slice covering that range (as computed by [`word_span`]).
pub(crate) fn decode_read<T: Element>(words: &[u32], elem_offset: usize, count: usize) -> Vec<T> {
    let ty = T::ELEMENT_TYPE;
    let mut out = Vec::with_capacity(count);

    if ty.is_double_word() {
        for i in 0..count {
            let low = words[i * 2] as u64;
            let high = words[i * 2 + 1] as u64;
            out.push(T::from_bits(low | (high << 32)));
        }
        return out;
    }

    let lanes = ty.lanes_per_word();
    let width = ty.size_bits();
    let lane_mask = if width == 32 { u32::MAX } else { (1u32 << width) - 1 };
    let first_word = elem_offset / lanes;

    for i in 0..count {
        let global = elem_offset + i;
        let word = global / lanes - first_word;
        let shift = (global % lanes) * width;
        out.push(T::from_bits(((words[word] >> shift) & lane_mask) as u64));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::F16;

    #[test]
    fn test_physical_word_len() {
        assert_eq!(physical_word_len(ElementType::I8, 0), 0);
        assert_eq!(physical_word_len(ElementType::I8, 1), 1);
        assert_eq!(physical_word_len(ElementType::I8, 4), 1);
        assert_eq!(physical_word_len(ElementType::I8, 17), 5);
        assert_eq!(physical_word_len(ElementType::U16, 3), 2);
        assert_eq!(physical_word_len(ElementType::F32, 7), 7);
        assert_eq!(physical_word_len(ElementType::F64, 3), 6);
    }

    #[test]
    fn test_word_span_edges() {
        // 8-bit: elements 2..6 touch words 0 and 1
        assert_eq!(word_span(ElementType::U8, 2, 4), (0, 2));
        // aligned full word
        assert_eq!(word_span(ElementType::U8, 4, 4), (1, 1));
        // zero count
        assert_eq!(word_span(ElementType::U8, 5, 0), (1, 0));
        // 64-bit
        assert_eq!(word_span(ElementType::U64, 3, 2), (6, 4));
    }

    #[test]
    fn test_encode_aligned_u8() {
        let enc = encode_write(&[1u8, 2, 3, 4], 0);
        assert_eq!(enc.word_offset, 0);
        assert_eq!(enc.words, vec![0x0403_0201]);
        assert_eq!(enc.head_keep, None);
        assert_eq!(enc.tail_keep, None);
    }

    #[test]
    fn test_encode_unaligned_u8_masks() {
        // One element at lane 1: keep lanes 0, 2, 3 of the existing word.
        let enc = encode_write(&[0xAAu8], 1);
        assert_eq!(enc.word_offset, 0);
        assert_eq!(enc.words, vec![0x0000_AA00]);
        assert_eq!(enc.head_keep, Some(0xFFFF_00FF));
        assert_eq!(enc.tail_keep, None);

        let old = 0x4433_2211u32;
        let merged = merge_word(old, enc.words[0], enc.head_keep.unwrap());
        assert_eq!(merged, 0x4433_AA11);
    }

    #[test]
    fn test_encode_spanning_u8() {
        // Elements 3..5 span the word boundary.
        let enc = encode_write(&[0x11u8, 0x22], 3);
        assert_eq!(enc.word_offset, 0);
        assert_eq!(enc.words, vec![0x1100_0000, 0x0000_0022]);
        assert_eq!(enc.head_keep, Some(0x00FF_FFFF));
        assert_eq!(enc.tail_keep, Some(0xFFFF_FF00));
    }

    #[test]
    fn test_encode_u16_half_word() {
        let enc = encode_write(&[0xBEEFu16], 1);
        assert_eq!(enc.words, vec![0xBEEF_0000]);
        assert_eq!(enc.head_keep, Some(0x0000_FFFF));
    }

    #[test]
    fn test_encode_u64_low_high() {
        let enc = encode_write(&[0x1122_3344_5566_7788u64], 2);
        assert_eq!(enc.word_offset, 4);
        assert_eq!(enc.words, vec![0x5566_7788, 0x1122_3344]);
        assert_eq!(enc.head_keep, None);
    }

    #[test]
    fn test_decode_mirrors_encode() {
        let data: Vec<i16> = vec![-1, 0, 32767, -32768, 5];
        let enc = encode_write(&data, 3);
        // Simulate a fresh store: masks irrelevant when surroundings are zero.
        let decoded: Vec<i16> = decode_read(&enc.words, 3, data.len());
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decode_f16_bits() {
        let data = vec![F16::from_f32(1.5), F16::from_f32(-2.0), F16::from_f32(0.25)];
        let enc = encode_write(&data, 0);
        let decoded: Vec<F16> = decode_read(&enc.words, 0, 3);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_zero_count() {
        let enc = encode_write::<u8>(&[], 7);
        assert!(enc.words.is_empty());
        let decoded: Vec<u8> = decode_read(&[], 7, 0);
        assert!(decoded.is_empty());
    }
}

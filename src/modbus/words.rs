//! 16-bit register word helpers shared by device parsing and the external
//! register server. 32-bit quantities span two words, high word first.

/// Split a u32 into two big-endian-ordered register words, high word first.
pub fn split_u32(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Join two register words (high word first) into a u32.
pub fn join_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Encode an engineering value into an unsigned register word.
/// Values are rounded, then clamped to the u16 range.
pub fn encode_u16(value: f64, scale: f64) -> u16 {
    (value * scale).round().clamp(0.0, u16::MAX as f64) as u16
}

/// Encode a signed engineering value into a two's-complement register word.
/// Values are rounded, then clamped to the i16 range.
pub fn encode_i16(value: f64, scale: f64) -> u16 {
    (value * scale).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16 as u16
}

/// Decode an unsigned register word back into engineering units.
pub fn decode_u16(word: u16, scale: f64) -> f64 {
    word as f64 / scale
}

/// Decode a two's-complement register word back into engineering units.
pub fn decode_i16(word: u16, scale: f64) -> f64 {
    word as i16 as f64 / scale
}

/// Whether a scaled signed value fits the i16 register range without
/// wrapping. A wrapped write would reverse command polarity, so callers
/// must check before encoding.
pub fn fits_i16(value: f64, scale: f64) -> bool {
    let scaled = (value * scale).round();
    (i16::MIN as f64..=i16::MAX as f64).contains(&scaled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn u32_words_are_high_first() {
        assert_eq!(split_u32(0x0001_0002), [1, 2]);
        assert_eq!(join_u32(1, 2), 0x0001_0002);
    }

    #[test]
    fn signed_round_trip() {
        let w = encode_i16(-120.0, 1.0);
        assert_eq!(decode_i16(w, 1.0), -120.0);
    }

    #[test]
    fn scaled_voltage_render() {
        assert_eq!(encode_u16(850.0, 10.0), 8500);
        assert_eq!(decode_u16(8500, 10.0), 850.0);
    }

    #[test]
    fn overflow_is_detected_not_wrapped() {
        assert!(!fits_i16(500.0, 100.0));
        assert!(fits_i16(300.0, 100.0));
        // Clamping never flips sign even when the caller skipped the check.
        assert_eq!(encode_i16(500.0, 100.0) as i16, i16::MAX);
    }

    proptest! {
        #[test]
        fn u32_split_join_round_trip(v in any::<u32>()) {
            let [hi, lo] = split_u32(v);
            prop_assert_eq!(join_u32(hi, lo), v);
        }

        #[test]
        fn i16_round_trip_within_range(v in -32768i32..=32767) {
            let w = encode_i16(v as f64, 1.0);
            prop_assert_eq!(decode_i16(w, 1.0), v as f64);
        }
    }
}

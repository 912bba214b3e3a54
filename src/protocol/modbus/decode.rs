//! `decode_register` — turn a raw `u16` word slice into a scaled value
//! (spec.md §4.2.1).

use super::registers::{RegisterDescriptor, RegisterType};
use crate::domain::Value;

/// Decode the words belonging to one descriptor, where `words` is the
/// slice of the *group's* raw response starting at this descriptor's
/// offset (i.e. already sliced to `register_type.width()` words).
pub fn decode_register(descriptor: &RegisterDescriptor, words: &[u16]) -> Result<Value, String> {
    if words.len() < descriptor.width() as usize {
        return Err(format!(
            "expected {} words for {:?}, got {}",
            descriptor.width(),
            descriptor.register_type,
            words.len()
        ));
    }

    let raw = match descriptor.register_type {
        RegisterType::U16 => words[0] as f64,
        RegisterType::I16 => (words[0] as i16) as f64,
        RegisterType::U32 => combine_u32(words, descriptor.little_endian_words) as f64,
        RegisterType::I32 => combine_u32(words, descriptor.little_endian_words) as i32 as f64,
        RegisterType::Code | RegisterType::Bitfield | RegisterType::Hex => {
            return Ok(Value::Int(words[0] as i64));
        }
        RegisterType::Ascii8 => return decode_ascii8(words),
    };

    if descriptor.register_type.is_scaled() {
        Ok(Value::Number(raw * descriptor.scale))
    } else {
        Ok(Value::Number(raw))
    }
}

/// Two words, big-endian word order by default (high word first), each
/// word itself big-endian on the wire (spec.md §4.2.1). `little_endian`
/// swaps the word order only, matching EG4-style devices.
fn combine_u32(words: &[u16], little_endian: bool) -> u32 {
    let (hi, lo) = if little_endian {
        (words[1], words[0])
    } else {
        (words[0], words[1])
    };
    ((hi as u32) << 16) | (lo as u32)
}

/// Eight words read as 16 bytes big-endian, stripped of trailing
/// NUL/space/tab/CR/LF, decoded as ASCII with replacement for invalid
/// bytes (spec.md §4.2.1).
fn decode_ascii8(words: &[u16]) -> Result<Value, String> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in &words[..8] {
        bytes.push((w >> 8) as u8);
        bytes.push((w & 0xff) as u8);
    }
    while matches!(bytes.last(), Some(b'\0' | b' ' | b'\t' | b'\r' | b'\n')) {
        bytes.pop();
    }
    let text: String = bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect();
    Ok(Value::Text(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StandardKey;
    use crate::protocol::modbus::registers::{FunctionType, Priority};

    fn descriptor(register_type: RegisterType, scale: f64, little_endian_words: bool) -> RegisterDescriptor {
        RegisterDescriptor {
            key: StandardKey::PvTotalDcPowerWatts,
            address: 0,
            register_type,
            scale,
            is_static: false,
            priority: Priority::Summary,
            function: FunctionType::Holding,
            little_endian_words,
        }
    }

    #[test]
    fn u16_unsigned() {
        let d = descriptor(RegisterType::U16, 0.1, false);
        let v = decode_register(&d, &[1234]).unwrap();
        assert_eq!(v, Value::Number(123.4));
    }

    #[test]
    fn i16_signed_two_complement() {
        let d = descriptor(RegisterType::I16, 1.0, false);
        let v = decode_register(&d, &[0xFFFF]).unwrap();
        assert_eq!(v, Value::Number(-1.0));
    }

    #[test]
    fn u32_big_endian_word_order() {
        // spec.md S2: [0x1234, 0x5678], type u32, scale 1 -> 0x12345678
        let d = descriptor(RegisterType::U32, 1.0, false);
        let v = decode_register(&d, &[0x1234, 0x5678]).unwrap();
        assert_eq!(v, Value::Number(305419896.0));
    }

    #[test]
    fn u32_little_endian_word_order_swaps_words() {
        let d = descriptor(RegisterType::U32, 1.0, true);
        let v = decode_register(&d, &[0x5678, 0x1234]).unwrap();
        assert_eq!(v, Value::Number(305419896.0));
    }

    #[test]
    fn i32_negative() {
        let d = descriptor(RegisterType::I32, 1.0, false);
        let v = decode_register(&d, &[0xFFFF, 0xFFFF]).unwrap();
        assert_eq!(v, Value::Number(-1.0));
    }

    #[test]
    fn ascii8_strips_trailing_whitespace_and_nul() {
        let d = descriptor(RegisterType::Ascii8, 1.0, false);
        // "ABCDEF\0\0" padded, "ABCDEF  " should be equivalent after strip
        let words_nul = [0x4142, 0x4344, 0x4546, 0x0000];
        let mut full_nul = words_nul.to_vec();
        full_nul.extend([0, 0, 0, 0]);
        let v1 = decode_register(&d, &full_nul).unwrap();
        assert_eq!(v1, Value::Text("ABCDEF".to_string()));
    }

    #[test]
    fn code_bitfield_hex_are_unscaled() {
        let d = descriptor(RegisterType::Code, 0.1, false);
        let v = decode_register(&d, &[42]).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    proptest::proptest! {
        #[test]
        fn u16_round_trip(raw in 0u16..=u16::MAX) {
            let d = descriptor(RegisterType::U16, 1.0, false);
            let v = decode_register(&d, &[raw]).unwrap();
            prop_assert_eq!(v, Value::Number(raw as f64));
        }

        #[test]
        fn u32_round_trip(raw in 0u32..=u32::MAX) {
            let d = descriptor(RegisterType::U32, 1.0, false);
            let hi = (raw >> 16) as u16;
            let lo = (raw & 0xffff) as u16;
            let v = decode_register(&d, &[hi, lo]).unwrap();
            prop_assert_eq!(v, Value::Number(raw as f64));
        }
    }
}

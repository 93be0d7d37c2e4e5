//! Bencode encoder. Dictionary keys are always emitted in ascending byte
//! order (guaranteed by `BValue::Dict` being a `BTreeMap`), so re-encoding a
//! parsed `info` dictionary reproduces the exact bytes the info-hash was
//! computed over.

use super::value::BValue;

pub fn encode(value: &BValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BValue, out: &mut Vec<u8>) {
    match value {
        BValue::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        BValue::Bytes(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s);
        }
        BValue::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BValue::Dict(dict) => {
            out.push(b'd');
            for (key, value) in dict {
                encode_into(&BValue::Bytes(key.clone()), out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::decoder::decode;
    use super::*;

    #[test]
    fn encode_decode_roundtrip_is_identity() {
        let cases: &[&[u8]] = &[
            b"i42e",
            b"i-42e",
            b"i0e",
            b"4:spam",
            b"0:",
            b"l4:spami42ee",
            b"d3:bar4:spam3:fooi42ee",
            b"d4:listl1:a1:b1:ce4:dictd1:x1:yee",
        ];
        for case in cases {
            let decoded = decode(case).unwrap();
            assert_eq!(encode(&decoded), *case);
        }
    }

    #[test]
    fn encode_sorts_dict_keys_regardless_of_insertion_order() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"zzz".to_vec(), BValue::Int(1));
        dict.insert(b"aaa".to_vec(), BValue::Int(2));
        let value = BValue::Dict(dict);
        assert_eq!(encode(&value), b"d3:aaai2e3:zzzi1ee");
    }
}

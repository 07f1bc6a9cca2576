use super::Value;

/// Encodes a `Value` back into its canonical bencoded byte form.
///
/// Dict keys are emitted in the order stored on the `Value` (see module
/// docs for why we don't re-sort): callers that built a `Value` from
/// `decode` and only mutate a few keys get byte-identical output for the
/// parts they didn't touch, and callers building a fresh `Value` from
/// scratch are expected to insert keys already in sorted order per BEP 3.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::decode::decode;
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let value = Value::Dict(vec![
            (b"cow".to_vec(), Value::bytes(*b"moo")),
            (b"list".to_vec(), Value::List(vec![Value::Int(-1), Value::Int(0)])),
            (b"nested".to_vec(), Value::Dict(vec![(b"a".to_vec(), Value::Int(7))])),
        ]);
        let bytes = encode(&value);
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn encodes_integers_canonically() {
        assert_eq!(encode(&Value::Int(0)), b"i0e");
        assert_eq!(encode(&Value::Int(-5)), b"i-5e");
    }
}

use super::{DecodeError, Value, MAX_DEPTH};

/// Decodes exactly one bencoded value starting at byte 0 of `input`.
///
/// Returns an error if trailing bytes remain after the value, since every
/// caller in this crate (`.torrent` files, tracker responses, KRPC packets)
/// expects the whole buffer to be a single top-level value.
pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
    let (value, consumed) = decode_value(input, 0, 0)?;
    if consumed != input.len() {
        return Err(DecodeError::TrailingBytes {
            count: input.len() - consumed,
        });
    }
    Ok(value)
}

fn decode_value(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::RecursionLimit {
            pos,
            max: MAX_DEPTH,
        });
    }
    let byte = *input
        .get(pos)
        .ok_or(DecodeError::UnexpectedEof { pos })?;
    match byte {
        b'i' => decode_int(input, pos),
        b'l' => decode_list(input, pos, depth),
        b'd' => decode_dict(input, pos, depth),
        b'0'..=b'9' => decode_bytes(input, pos),
        other => Err(DecodeError::InvalidLeadByte { pos, byte: other }),
    }
}

fn decode_int(input: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(input[pos], b'i');
    let body_start = pos + 1;
    let end = find_byte(input, body_start, b'e').ok_or(DecodeError::UnterminatedInt { pos })?;
    let text = &input[body_start..end];
    validate_int_text(text, pos)?;
    let as_str = std::str::from_utf8(text).map_err(|_| DecodeError::MalformedInt {
        pos,
        text: text.to_vec(),
    })?;
    let n: i64 = as_str.parse().map_err(|_| DecodeError::MalformedInt {
        pos,
        text: text.to_vec(),
    })?;
    Ok((Value::Int(n), end + 1 - pos))
}

fn validate_int_text(text: &[u8], pos: usize) -> Result<(), DecodeError> {
    if text.is_empty() {
        return Err(DecodeError::MalformedInt {
            pos,
            text: text.to_vec(),
        });
    }
    let (sign, digits) = match text[0] {
        b'-' => (true, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::MalformedInt {
            pos,
            text: text.to_vec(),
        });
    }
    if digits == b"0" && sign {
        return Err(DecodeError::NonCanonicalInt { pos });
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(DecodeError::NonCanonicalInt { pos });
    }
    Ok(())
}

fn decode_bytes(input: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let colon = find_byte(input, pos, b':').ok_or(DecodeError::UnexpectedEof { pos })?;
    let len_text = &input[pos..colon];
    let as_str = std::str::from_utf8(len_text).map_err(|_| DecodeError::MalformedInt {
        pos,
        text: len_text.to_vec(),
    })?;
    let len: usize = as_str.parse().map_err(|_| DecodeError::LengthOverflow { pos })?;
    if len_text.len() > 1 && len_text[0] == b'0' {
        return Err(DecodeError::NonCanonicalInt { pos });
    }
    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(len)
        .ok_or(DecodeError::LengthOverflow { pos })?;
    if data_end > input.len() {
        return Err(DecodeError::StringTooLong {
            pos,
            declared: len,
            remaining: input.len().saturating_sub(data_start),
        });
    }
    Ok((
        Value::Bytes(input[data_start..data_end].to_vec()),
        data_end - pos,
    ))
}

fn decode_list(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(input[pos], b'l');
    let mut cursor = pos + 1;
    let mut items = Vec::new();
    loop {
        match input.get(cursor) {
            None => return Err(DecodeError::UnexpectedEof { pos: cursor }),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            Some(_) => {
                let (value, len) = decode_value(input, cursor, depth + 1)?;
                items.push(value);
                cursor += len;
            }
        }
    }
    Ok((Value::List(items), cursor - pos))
}

fn decode_dict(input: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), DecodeError> {
    debug_assert_eq!(input[pos], b'd');
    let mut cursor = pos + 1;
    let mut entries = Vec::new();
    loop {
        match input.get(cursor) {
            None => return Err(DecodeError::UnexpectedEof { pos: cursor }),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            Some(_) => {
                let (key, key_len) = decode_bytes(input, cursor)?;
                cursor += key_len;
                let key_bytes = match key {
                    Value::Bytes(b) => b,
                    _ => unreachable!("decode_bytes always returns Value::Bytes"),
                };
                let (value, value_len) = decode_value(input, cursor, depth + 1)?;
                cursor += value_len;
                entries.push((key_bytes, value));
            }
        }
    }
    Ok((Value::Dict(entries), cursor - pos))
}

fn find_byte(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from..].iter().position(|&b| b == needle).map(|i| i + from)
}

/// Walks the bencode grammar starting at `start` and returns the exclusive
/// end offset of the value beginning there, without allocating or building a
/// `Value`. Used by the metadata parser to capture the raw byte span of the
/// `info` dictionary for info-hash computation (see `crate::metainfo`).
pub fn scan_value_span(input: &[u8], start: usize) -> Result<usize, DecodeError> {
    scan_value(input, start, 0)
}

fn scan_value(input: &[u8], pos: usize, depth: usize) -> Result<usize, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::RecursionLimit {
            pos,
            max: MAX_DEPTH,
        });
    }
    let byte = *input
        .get(pos)
        .ok_or(DecodeError::UnexpectedEof { pos })?;
    match byte {
        b'i' => {
            let end = find_byte(input, pos + 1, b'e').ok_or(DecodeError::UnterminatedInt { pos })?;
            validate_int_text(&input[pos + 1..end], pos)?;
            Ok(end + 1)
        }
        b'0'..=b'9' => {
            let colon = find_byte(input, pos, b':').ok_or(DecodeError::UnexpectedEof { pos })?;
            let len_text = &input[pos..colon];
            let as_str = std::str::from_utf8(len_text).map_err(|_| DecodeError::MalformedInt {
                pos,
                text: len_text.to_vec(),
            })?;
            let len: usize = as_str
                .parse()
                .map_err(|_| DecodeError::LengthOverflow { pos })?;
            let data_start = colon + 1;
            let data_end = data_start
                .checked_add(len)
                .ok_or(DecodeError::LengthOverflow { pos })?;
            if data_end > input.len() {
                return Err(DecodeError::StringTooLong {
                    pos,
                    declared: len,
                    remaining: input.len().saturating_sub(data_start),
                });
            }
            Ok(data_end)
        }
        b'l' | b'd' => {
            let mut cursor = pos + 1;
            loop {
                match input.get(cursor) {
                    None => return Err(DecodeError::UnexpectedEof { pos: cursor }),
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => {
                        cursor = scan_value(input, cursor, depth + 1)?;
                    }
                }
            }
        }
        other => Err(DecodeError::InvalidLeadByte { pos, byte: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn rejects_non_canonical_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i01e").is_err());
    }

    #[test]
    fn decodes_strings() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::bytes(*b"spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::bytes(Vec::<u8>::new()));
    }

    #[test]
    fn decodes_lists_and_dicts() {
        assert_eq!(
            decode(b"l4:spam4:eggse").unwrap(),
            Value::List(vec![Value::bytes(*b"spam"), Value::bytes(*b"eggs")])
        );
        assert_eq!(
            decode(b"d3:cow3:moo4:spam4:eggse").unwrap(),
            Value::Dict(vec![
                (b"cow".to_vec(), Value::bytes(*b"moo")),
                (b"spam".to_vec(), Value::bytes(*b"eggs")),
            ])
        );
    }

    #[test]
    fn rejects_oversized_string_length() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(decode(b"i1eGARBAGE").is_err());
    }

    #[test]
    fn scan_value_span_matches_decode_consumed_len() {
        let input = b"d4:infod6:lengthi100eee3:fooi1ee";
        let info_pos = 7; // position right after "d4:info"
        let end = scan_value_span(input, info_pos).unwrap();
        let info_bytes = &input[info_pos..end];
        assert_eq!(decode(info_bytes).unwrap().get("length").unwrap().as_int(), Some(100));
    }
}

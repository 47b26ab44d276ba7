//! DER encoder for entitlements.
//!
//! Converts an entitlements plist into the ASN.1 DER form carried in special
//! slot -7. Dictionaries encode as SETs of key/value SEQUENCEs, arrays as
//! SEQUENCEs, with BOOLEAN / INTEGER / UTF8String leaves.

use crate::{Error, Result};
use plist::Value;

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_UTF8STRING: u8 = 0x0c;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

/// Encode a DER length: short form below 128, long form otherwise.
fn encode_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        let byte_count = (64 - (length as u64).leading_zeros() as usize).div_ceil(8);
        out.push(0x80 | byte_count as u8);
        for i in (0..byte_count).rev() {
            out.push(((length >> (i * 8)) & 0xff) as u8);
        }
    }
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    out.push(TAG_UTF8STRING);
    encode_length(out, s.len());
    out.extend(s.as_bytes());
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(1);
            out.push(if *b { 0xff } else { 0 });
        }
        Value::Integer(i) => {
            let val = i.as_signed().unwrap_or(0);
            out.push(TAG_INTEGER);
            // Minimal two's-complement big-endian encoding.
            let bytes = val.to_be_bytes();
            let mut start = 0;
            while start < 7
                && ((bytes[start] == 0 && bytes[start + 1] & 0x80 == 0)
                    || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0))
            {
                start += 1;
            }
            encode_length(out, 8 - start);
            out.extend(&bytes[start..]);
        }
        Value::String(s) => encode_string(out, s),
        Value::Array(arr) => {
            let mut content = Vec::new();
            for item in arr {
                encode_value(item, &mut content)?;
            }
            out.push(TAG_SEQUENCE);
            encode_length(out, content.len());
            out.extend(content);
        }
        Value::Dictionary(dict) => {
            let mut content = Vec::new();
            // Keys are already lexicographically ordered by the caller; the
            // SET encoding preserves the order they arrive in.
            for (key, val) in dict {
                let mut pair = Vec::new();
                encode_string(&mut pair, key);
                encode_value(val, &mut pair)?;
                content.push(TAG_SEQUENCE);
                encode_length(&mut content, pair.len());
                content.extend(pair);
            }
            out.push(TAG_SET);
            encode_length(out, content.len());
            out.extend(content);
        }
        other => {
            return Err(Error::Signing(format!(
                "unsupported entitlement value type: {:?}",
                other
            )));
        }
    }
    Ok(())
}

/// Convert entitlements plist bytes (XML or binary) to DER.
pub fn entitlements_to_der(plist_bytes: &[u8]) -> Result<Vec<u8>> {
    let value: Value = plist::from_bytes(plist_bytes)?;
    let mut out = Vec::new();
    encode_value(&value, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(value, &mut out).unwrap();
        out
    }

    #[test]
    fn test_encode_length_short() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 10);
        assert_eq!(buf, vec![10]);
    }

    #[test]
    fn test_encode_length_long() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 256);
        assert_eq!(buf, vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_booleans() {
        assert_eq!(encode(&Value::Boolean(true)), vec![0x01, 0x01, 0xff]);
        assert_eq!(encode(&Value::Boolean(false)), vec![0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_string() {
        assert_eq!(
            encode(&Value::String("test".into())),
            vec![0x0c, 0x04, b't', b'e', b's', b't']
        );
    }

    #[test]
    fn test_encode_small_integer() {
        assert_eq!(encode(&Value::Integer(42.into())), vec![0x02, 0x01, 0x2a]);
    }

    #[test]
    fn test_encode_integer_high_bit_padded() {
        // 128 needs a leading zero so it is not read as negative
        assert_eq!(
            encode(&Value::Integer(128.into())),
            vec![0x02, 0x02, 0x00, 0x80]
        );
        assert_eq!(
            encode(&Value::Integer(255.into())),
            vec![0x02, 0x02, 0x00, 0xff]
        );
        assert_eq!(
            encode(&Value::Integer(256.into())),
            vec![0x02, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn test_empty_dict() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict/></plist>"#;
        assert_eq!(entitlements_to_der(xml).unwrap(), vec![0x31, 0x00]);
    }

    #[test]
    fn test_get_task_allow_dict() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>get-task-allow</key>
    <true/>
</dict>
</plist>"#;
        let der = entitlements_to_der(xml).unwrap();
        // SET { SEQUENCE { UTF8String "get-task-allow", BOOLEAN true } }
        assert_eq!(der[0], TAG_SET);
        assert_eq!(der[2], TAG_SEQUENCE);
        assert_eq!(&der[6..20], b"get-task-allow");
        assert_eq!(&der[20..], &[0x01, 0x01, 0xff]);
    }

    #[test]
    fn test_application_identifier_roundtrip_shape() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>application-identifier</key>
    <string>ABC1234567.com.ex.hello</string>
    <key>keychain-access-groups</key>
    <array>
        <string>ABC1234567.*</string>
    </array>
</dict>
</plist>"#;
        let der = entitlements_to_der(xml).unwrap();
        assert_eq!(der[0], TAG_SET);
        // Both keys present in output
        let hay = der.as_slice();
        assert!(hay
            .windows(22)
            .any(|w| w == b"application-identifier"));
        assert!(hay.windows(12).any(|w| w == b"ABC1234567.*"));
    }
}

//! Reversible header obfuscation: byte-wise XOR against the cycling bytes
//! of the shared per-account encoding key, then base64. Not encryption —
//! just enough to keep header values opaque in transit logs.

use crate::cat::CodecError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub fn obfuscate(value: &str, key: &str) -> Result<String, CodecError> {
    if key.is_empty() {
        return Err(CodecError::MissingKey);
    }
    let key_bytes = key.as_bytes();
    let mixed: Vec<u8> = value
        .as_bytes()
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key_bytes[i % key_bytes.len()])
        .collect();
    Ok(STANDARD.encode(mixed))
}

pub fn deobfuscate(value: &str, key: &str) -> Result<String, CodecError> {
    if key.is_empty() {
        return Err(CodecError::MissingKey);
    }
    let decoded = STANDARD
        .decode(value.trim())
        .map_err(|e| CodecError::Malformed(format!("invalid base64: {e}")))?;
    let key_bytes = key.as_bytes();
    let mixed: Vec<u8> = decoded
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key_bytes[i % key_bytes.len()])
        .collect();
    String::from_utf8(mixed).map_err(|e| CodecError::Malformed(format!("invalid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "d67afc830dab717fd163bfcb0b8b88423e9a1a3b";

    #[test]
    fn test_round_trip() {
        let value = r#"["9123#1234",\"WebTransaction/uri/test\",0.0,0.123,-1]"#;
        let obfuscated = obfuscate(value, KEY).expect("obfuscate");
        assert_ne!(obfuscated, value);
        let restored = deobfuscate(&obfuscated, KEY).expect("deobfuscate");
        assert_eq!(restored, value);
    }

    #[test]
    fn test_key_longer_than_value() {
        let obfuscated = obfuscate("x", KEY).expect("obfuscate");
        assert_eq!(deobfuscate(&obfuscated, KEY).expect("deobfuscate"), "x");
    }

    #[test]
    fn test_wrong_key_does_not_round_trip() {
        let obfuscated = obfuscate("payload", KEY).expect("obfuscate");
        match deobfuscate(&obfuscated, "another-key") {
            Ok(restored) => assert_ne!(restored, "payload"),
            Err(CodecError::Malformed(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(matches!(obfuscate("v", ""), Err(CodecError::MissingKey)));
        assert!(matches!(deobfuscate("dg==", ""), Err(CodecError::MissingKey)));
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        assert!(matches!(
            deobfuscate("!!!not base64!!!", KEY),
            Err(CodecError::Malformed(_))
        ));
    }
}

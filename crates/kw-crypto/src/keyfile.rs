//! Key file parsing and generation
//!
//! Accepted forms, tried in order:
//! 1. XML `<KeyFile>` with a `<Data>` element (version 2: hex with optional
//!    `Hash` check attribute; version 1: base64)
//! 2. exactly 32 bytes, used raw
//! 3. exactly 64 hex characters, decoded
//! 4. anything else: SHA-256 of the whole file

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use kw_core::{KwError, KwResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{random_bytes, KEY_SIZE};

/// Reduce key file contents to its 32-byte key component.
pub fn parse_key_file(data: &[u8]) -> KwResult<[u8; KEY_SIZE]> {
    if let Some(key) = parse_xml(data)? {
        return Ok(key);
    }
    if data.len() == KEY_SIZE {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(data);
        return Ok(key);
    }
    if data.len() == KEY_SIZE * 2 {
        let mut key = [0u8; KEY_SIZE];
        if hex::decode_to_slice(data, &mut key).is_ok() {
            return Ok(key);
        }
    }
    Ok(Sha256::digest(data).into())
}

/// Generate a version 2 XML key file with 32 random bytes.
pub fn generate_key_file() -> String {
    let key = Zeroizing::new(random_bytes::<KEY_SIZE>());
    let check = hex::encode_upper(&Sha256::digest(&*key)[..4]);
    let hex = hex::encode_upper(&*key);
    let groups: Vec<&str> = hex
        .as_bytes()
        .chunks(8)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <KeyFile>\n\
         \t<Meta>\n\t\t<Version>2.0</Version>\n\t</Meta>\n\
         \t<Key>\n\t\t<Data Hash=\"{check}\">\n\t\t\t{}\n\t\t</Data>\n\t</Key>\n\
         </KeyFile>\n",
        groups.join(" ")
    )
}

/// `Ok(None)` when the data is not an XML key file at all.
fn parse_xml(data: &[u8]) -> KwResult<Option<[u8; KEY_SIZE]>> {
    let Ok(text) = std::str::from_utf8(data) else {
        return Ok(None);
    };
    let text = text.trim_start_matches('\u{feff}').trim();
    if !text.starts_with('<') || !text.contains("<KeyFile>") {
        return Ok(None);
    }

    let version = element_text(text, "Version").unwrap_or("1.0").trim();
    let (attrs, body) = data_element(text)
        .ok_or_else(|| KwError::KeyDerivation("key file has no <Data> element".into()))?;

    let raw = if version.starts_with('2') {
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        let raw = Zeroizing::new(
            hex::decode(&compact)
                .map_err(|e| KwError::KeyDerivation(format!("key file data is not hex: {e}")))?,
        );
        if let Some(expected) = attribute(attrs, "Hash") {
            let actual = hex::encode_upper(&Sha256::digest(&*raw)[..4]);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(KwError::KeyDerivation(
                    "key file data does not match its hash".into(),
                ));
            }
        }
        raw
    } else if version.starts_with('1') {
        Zeroizing::new(
            B64.decode(body.trim())
                .map_err(|e| KwError::KeyDerivation(format!("key file data is not base64: {e}")))?,
        )
    } else {
        return Err(KwError::UnsupportedFormat(format!(
            "key file version {version}"
        )));
    };

    if raw.len() == KEY_SIZE {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&raw);
        Ok(Some(key))
    } else {
        Ok(Some(Sha256::digest(&*raw).into()))
    }
}

fn element_text<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = text.find(&open)? + open.len();
    let end = start + text[start..].find(&close)?;
    Some(&text[start..end])
}

/// Returns the attribute string and body of the `<Data ...>` element.
fn data_element(text: &str) -> Option<(&str, &str)> {
    let start = text.find("<Data")? + "<Data".len();
    let tag_end = start + text[start..].find('>')?;
    let attrs = &text[start..tag_end];
    let body_start = tag_end + 1;
    let body_end = body_start + text[body_start..].find("</Data>")?;
    Some((attrs, &text[body_start..body_end]))
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let end = start + attrs[start..].find('"')?;
    Some(&attrs[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_32_bytes() {
        let data = [0x42u8; 32];
        assert_eq!(parse_key_file(&data).unwrap(), data);
    }

    #[test]
    fn test_hex_64_chars() {
        let hex = "00".repeat(31) + "ff";
        let key = parse_key_file(hex.as_bytes()).unwrap();
        assert_eq!(key[31], 0xff);
        assert_eq!(key[0], 0);
    }

    #[test]
    fn test_arbitrary_file_hashed() {
        let data = b"just some file contents";
        let expected: [u8; 32] = Sha256::digest(data).into();
        assert_eq!(parse_key_file(data).unwrap(), expected);
    }

    #[test]
    fn test_64_non_hex_chars_hashed() {
        let data = "z".repeat(64);
        let expected: [u8; 32] = Sha256::digest(data.as_bytes()).into();
        assert_eq!(parse_key_file(data.as_bytes()).unwrap(), expected);
    }

    #[test]
    fn test_generated_xml_parses() {
        let xml = generate_key_file();
        let a = parse_key_file(xml.as_bytes()).unwrap();
        let b = parse_key_file(xml.as_bytes()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, <[u8; 32]>::from(Sha256::digest(xml.as_bytes())));
    }

    #[test]
    fn test_xml_hash_mismatch_rejected() {
        let xml = generate_key_file();
        let start = xml.find("Hash=\"").unwrap() + 6;
        let mut tampered = xml.clone();
        let replacement = if &xml[start..start + 1] == "0" { "1" } else { "0" };
        tampered.replace_range(start..start + 1, replacement);
        assert!(matches!(
            parse_key_file(tampered.as_bytes()),
            Err(KwError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_xml_version_1_base64() {
        let key = [0x11u8; 32];
        let xml = format!(
            "<?xml version=\"1.0\"?><KeyFile><Meta><Version>1.00</Version></Meta>\
             <Key><Data>{}</Data></Key></KeyFile>",
            B64.encode(key)
        );
        assert_eq!(parse_key_file(xml.as_bytes()).unwrap(), key);
    }
}

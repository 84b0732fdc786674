//! Signing key size checks for DKIM and ARC.

use base64::{engine::general_purpose, Engine as _};

use crate::{parse_tag_list, tag_value, DnsResolver, VerifyResult};

/// A signing key published under `<selector>._domainkey.<domain>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    /// RSA key with the given modulus length.
    Rsa(usize),
    /// Fixed-size key type (Ed25519) that a bit floor does not apply to.
    Fixed,
    /// No usable key record was found.
    Unknown,
}

impl KeySize {
    /// Whether the key is known to be shorter than `min_bits`.
    pub fn below(&self, min_bits: u32) -> bool {
        matches!(self, KeySize::Rsa(bits) if *bits < min_bits as usize)
    }
}

/// Looks up the key of `selector` in `domain` and measures it.
pub async fn key_size(
    resolver: &dyn DnsResolver,
    selector: &str,
    domain: &str,
) -> VerifyResult<KeySize> {
    let records = resolver
        .txt_lookup(&format!("{selector}._domainkey.{domain}"))
        .await?;
    Ok(records
        .iter()
        .map(|record| record_key_size(record))
        .find(|size| *size != KeySize::Unknown)
        .unwrap_or(KeySize::Unknown))
}

/// Measures the key in a `v=DKIM1` record.
pub fn record_key_size(record: &str) -> KeySize {
    let tags = parse_tag_list(record);
    if tag_value(&tags, "k").is_some_and(|kind| kind.eq_ignore_ascii_case("ed25519")) {
        return KeySize::Fixed;
    }
    let Some(encoded) = tag_value(&tags, "p") else {
        return KeySize::Unknown;
    };
    let encoded: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|der| rsa_modulus_bits(&der))
        .map_or(KeySize::Unknown, KeySize::Rsa)
}

/// Splits one DER element into its tag, its content and what follows.
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, input) = input.split_first()?;
    let (&first, input) = input.split_first()?;
    let (length, input) = if first < 0x80 {
        (first as usize, input)
    } else {
        let octets = (first & 0x7f) as usize;
        if octets == 0 || octets > 4 || input.len() < octets {
            return None;
        }
        let length = input[..octets]
            .iter()
            .fold(0usize, |length, byte| (length << 8) | *byte as usize);
        (length, &input[octets..])
    };
    if input.len() < length {
        return None;
    }
    Some((tag, &input[..length], &input[length..]))
}

/// Bit length of the modulus of an RSA public key, given either as a
/// SubjectPublicKeyInfo or as a bare PKCS#1 `RSAPublicKey`.
pub fn rsa_modulus_bits(der: &[u8]) -> Option<usize> {
    const SEQUENCE: u8 = 0x30;
    const INTEGER: u8 = 0x02;
    const BIT_STRING: u8 = 0x03;

    let (tag, body, _) = der_element(der)?;
    if tag != SEQUENCE {
        return None;
    }
    let (tag, first, rest) = der_element(body)?;
    let modulus = match tag {
        INTEGER => first,
        SEQUENCE => {
            let (tag, bits, _) = der_element(rest)?;
            if tag != BIT_STRING {
                return None;
            }
            let (tag, key, _) = der_element(bits.get(1..)?)?;
            if tag != SEQUENCE {
                return None;
            }
            let (tag, modulus, _) = der_element(key)?;
            if tag != INTEGER {
                return None;
            }
            modulus
        }
        _ => return None,
    };

    let start = modulus.iter().position(|byte| *byte != 0)?;
    let significant = &modulus[start..];
    Some(significant.len() * 8 - significant[0].leading_zeros() as usize)
}

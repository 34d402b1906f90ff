//! OSS V4 (`OSS4-HMAC-SHA256`) request signing.
//!
//! Structure mirrors AWS SigV4 with Alibaba-specific constants:
//!
//! ```text
//! CanonicalRequest =
//!   HTTPMethod + '\n' +
//!   CanonicalURI + '\n' +          -- /{bucket}/{object}
//!   CanonicalQueryString + '\n' +
//!   CanonicalHeaders + '\n' +      -- content-type, content-md5, x-oss-*
//!   AdditionalHeaders + '\n' +     -- always empty here
//!   HashedPayload                  -- UNSIGNED-PAYLOAD
//!
//! kDate    = HMAC-SHA256("aliyun_v4" + secret, yyyymmdd)
//! kRegion  = HMAC-SHA256(kDate, region)
//! kService = HMAC-SHA256(kRegion, "oss")
//! kSigning = HMAC-SHA256(kService, "aliyun_v4_request")
//! ```

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Signature algorithm identifier.
pub const OSS4_ALGORITHM: &str = "OSS4-HMAC-SHA256";

/// Payload hash sent in `x-oss-content-sha256`.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

const SERVICE: &str = "oss";
const TERMINATOR: &str = "aliyun_v4_request";

/// URI-encode per RFC 3986, leaving unreserved characters as-is.
///
/// `/` is kept when `encode_slash` is false (object paths).
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' || ch == '~' {
            encoded.push(ch);
        } else if ch == '/' && !encode_slash {
            encoded.push('/');
        } else {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).as_bytes() {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

/// Sorted, encoded query string. Empty values render as a bare name.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// True for headers that are always part of the signature.
pub fn is_signed_header(name: &str) -> bool {
    name == "content-type" || name == "content-md5" || name.starts_with("x-oss-")
}

/// Canonical header block; `headers` are `(lowercase name, value)` pairs.
pub fn canonical_headers(headers: &[(String, String)]) -> String {
    let mut signed: Vec<(&str, &str)> = headers
        .iter()
        .filter(|(name, _)| is_signed_header(name))
        .map(|(name, value)| (name.as_str(), value.trim()))
        .collect();
    signed.sort();
    signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect()
}

pub fn build_canonical_request(
    method: &str,
    canonical_uri: &str,
    query: &[(String, String)],
    headers: &[(String, String)],
) -> String {
    format!(
        "{method}\n{canonical_uri}\n{}\n{}\n\n{UNSIGNED_PAYLOAD}",
        canonical_query_string(query),
        canonical_headers(headers),
    )
}

/// `{date}/{region}/oss/aliyun_v4_request`
pub fn credential_scope(date_stamp: &str, region: &str) -> String {
    format!("{date_stamp}/{region}/{SERVICE}/{TERMINATOR}")
}

pub fn build_string_to_sign(timestamp: &str, scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{OSS4_ALGORITHM}\n{timestamp}\n{scope}\n{hash}")
}

pub fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_secret = format!("aliyun_v4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Value of the `Authorization` header.
pub fn authorization_header(access_key_id: &str, scope: &str, signature: &str) -> String {
    format!("{OSS4_ALGORITHM} Credential={access_key_id}/{scope},Signature={signature}")
}

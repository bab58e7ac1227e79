use std::sync::OnceLock;

use base64::prelude::*;
use regex::Regex;
use serde::de;

use crate::req::req_safe_read_body;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

/// Decodes unpadded base64url, tolerating trailing padding.
pub(crate) fn base64url_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))
}

pub(crate) async fn read_json<T: de::DeserializeOwned>(res: reqwest::Response) -> eyre::Result<T> {
    let res_body = req_safe_read_body(res).await;
    log::debug!("{res_body}");
    Ok(serde_json::from_str(&res_body)?)
}

static RE_DNS_NAME: OnceLock<Option<Regex>> = OnceLock::new();

/// Lowercase DNS name check used for CSR names and client-side identifiers.
///
/// Labels are alphanumeric with inner hyphens; the last label starts with a letter.
pub(crate) fn is_dns_name(name: &str) -> bool {
    RE_DNS_NAME
        .get_or_init(|| Regex::new(r"^([a-z0-9][a-z0-9-]{1,62}\.)+[a-z][a-z0-9-]{0,62}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

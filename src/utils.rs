//! Utility functions for identifiers and name handling

use crate::error::RequestError;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, RequestError> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| RequestError::Internal(format!("invalid id prefix {hrp}: {e}")))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| RequestError::Internal(format!("failed to encode id: {e}")))?;
    Ok(encode)
}

/// Request type names may only contain alphanumerics, underscores, and hyphens.
pub fn validate_request_type_name(name: &str) -> Result<(), RequestError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !valid {
        return Err(RequestError::InvalidArgument(
            "request type names may only contain alphanumerics, underscores, and hyphens".into(),
        ));
    }
    Ok(())
}

/// Drops the `@domain` suffix from a qualified username.
pub fn strip_domain(username: &str) -> &str {
    username.split_once('@').map_or(username, |(user, _)| user)
}

pub fn qualify_username(username: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) if !username.contains('@') => format!("{username}@{domain}"),
        _ => username.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_names() {
        assert!(validate_request_type_name("vice-chair-nomination").is_ok());
        assert!(validate_request_type_name("Access_Request_2").is_ok());
        assert!(validate_request_type_name("").is_err());
        assert!(validate_request_type_name("has space").is_err());
        assert!(validate_request_type_name("slash/name").is_err());
        assert!(validate_request_type_name("ünïcode").is_err());
    }

    #[test]
    fn usernames_round_trip_through_domain() {
        let qualified = qualify_username("ipcdev", Some("iplantcollaborative.org"));
        assert_eq!(qualified, "ipcdev@iplantcollaborative.org");
        assert_eq!(strip_domain(&qualified), "ipcdev");

        assert_eq!(qualify_username("ipcdev", None), "ipcdev");
        assert_eq!(qualify_username("a@b.org", Some("c.org")), "a@b.org");
    }

    #[test]
    fn generated_ids_carry_prefix() {
        let id = new_uuid_to_bech32("req_").unwrap();
        assert!(id.starts_with("req_1"));
        assert_ne!(id, new_uuid_to_bech32("req_").unwrap());
        assert!(new_uuid_to_bech32("").is_err());
    }
}

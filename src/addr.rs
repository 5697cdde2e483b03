//! Address tags — the `host/port/tlsbit` string used to carry destination
//! information through the standard byte-stream remote-address slot.

use std::fmt;

use crate::error::{ProxyError, ProxyResult};

/// A destination, stuffed into the "remote address" slot of a [`ProxyConn`]
/// so that downstream code that only sees a standard connection can still
/// recover the destination via address inspection.
///
/// [`ProxyConn`]: crate::conn::ProxyConn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTag {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl AddressTag {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    /// Parse a tag of the form `<host>/<port>/<0|1>`.
    pub fn decode(tag: &str) -> ProxyResult<Self> {
        let mut parts = tag.split('/');
        let (Some(host), Some(port), Some(tls_bit), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::MalformedAddressTag(tag.to_string()));
        };

        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::MalformedAddressTag(tag.to_string()))?;

        let use_tls = match tls_bit {
            "1" => true,
            "0" => false,
            _ => return Err(ProxyError::MalformedAddressTag(tag.to_string())),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            use_tls,
        })
    }
}

impl fmt::Display for AddressTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.host,
            self.port,
            if self.use_tls { 1 } else { 0 }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let tag = AddressTag::new("example.com", 443, true);
        let encoded = tag.to_string();
        assert_eq!(encoded, "example.com/443/1");
        assert_eq!(AddressTag::decode(&encoded).unwrap(), tag);
    }

    #[test]
    fn round_trip_plaintext() {
        let tag = AddressTag::new("example.com", 80, false);
        assert_eq!(tag.to_string(), "example.com/80/0");
        assert_eq!(AddressTag::decode(&tag.to_string()).unwrap(), tag);
    }

    #[test]
    fn decode_rejects_too_few_fields() {
        assert!(AddressTag::decode("example.com/80").is_err());
    }

    #[test]
    fn decode_rejects_too_many_fields() {
        assert!(AddressTag::decode("example.com/80/0/extra").is_err());
    }

    #[test]
    fn decode_rejects_non_numeric_port() {
        assert!(AddressTag::decode("example.com/notaport/0").is_err());
    }

    #[test]
    fn decode_rejects_bad_tls_bit() {
        assert!(AddressTag::decode("example.com/80/2").is_err());
    }

    #[test]
    fn decode_rejects_empty_string() {
        assert!(AddressTag::decode("").is_err());
    }
}

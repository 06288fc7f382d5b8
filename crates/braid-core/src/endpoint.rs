//! Structured endpoint addresses.
//!
//! An endpoint names a listening instance: the transport protocol, the
//! network address, an optional list of proxy routes, the instance's
//! [`RoutingId`], whether the instance serves a mount table, and the
//! blessing names it advertises. The external string form is a tagged,
//! backwards-compatible format:
//!
//! ```text
//! @6@tcp@127.0.0.1:8101@route1,route2@<32 hex digits>@m@alice,bob@@
//! ```
//!
//! The routing id and mount-table flag fields are mandatory; routes and
//! blessing names may be empty.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind};
use crate::rid::RoutingId;

/// String-format version tag emitted by [`fmt::Display`].
const FORMAT_VERSION: &str = "6";

/// A structured network address carrying a routing id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport protocol name: "tcp", "tcp4", "tcp6", "ws", "ws4", "ws6".
    pub protocol: String,
    /// host:port for the protocol.
    pub address: String,
    /// Routing ids (hex) of proxies to traverse, outermost first.
    pub routes: Vec<String>,
    /// The instance this endpoint names.
    pub rid: RoutingId,
    /// Whether the instance serves a mount table.
    pub serves_mount_table: bool,
    /// Blessing names the instance advertises.
    pub blessing_names: Vec<String>,
}

impl Endpoint {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>, rid: RoutingId) -> Self {
        Endpoint {
            protocol: protocol.into(),
            address: address.into(),
            routes: Vec::new(),
            rid,
            serves_mount_table: true,
            blessing_names: Vec::new(),
        }
    }

    /// An endpoint usable only as a listening hint.
    pub fn listen_hint(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Endpoint::new(protocol, address, RoutingId::NULL)
    }

    /// Endpoints must name an instance to be dialable.
    pub fn validate_for_dial(&self) -> Result<(), Error> {
        if self.rid.is_null() {
            return Err(Error::new(
                ErrorKind::HandshakeFailure,
                format!("endpoint {} has no routing id; cannot dial", self),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{}@{}@{}@{}@{}@{}@{}@@",
            FORMAT_VERSION,
            self.protocol,
            self.address,
            self.routes.join(","),
            self.rid,
            if self.serves_mount_table { "m" } else { "s" },
            self.blessing_names.join(","),
        )
    }
}

fn split_list(field: &str) -> Vec<String> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(',').map(str::to_string).collect()
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| {
            Error::new(
                ErrorKind::UnrecognizedMessage,
                format!("bad endpoint {:?}: {}", s, why),
            )
        };

        let inner = s
            .strip_prefix('@')
            .and_then(|r| r.strip_suffix("@@"))
            .ok_or_else(|| bad("missing @...@@ delimiters"))?;
        let fields: Vec<&str> = inner.split('@').collect();
        if fields.len() != 7 {
            return Err(bad("want 7 fields"));
        }
        if fields[0] != FORMAT_VERSION {
            return Err(bad("unsupported format version"));
        }

        let rid: RoutingId = fields[4].parse()?;
        let serves_mount_table = match fields[5] {
            "m" => true,
            "s" => false,
            _ => return Err(bad("mount-table flag must be 'm' or 's'")),
        };

        Ok(Endpoint {
            protocol: fields[1].to_string(),
            address: fields[2].to_string(),
            routes: split_list(fields[3]),
            rid,
            serves_mount_table,
            blessing_names: split_list(fields[6]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let mut ep = Endpoint::new("tcp", "127.0.0.1:8101", RoutingId::random());
        ep.routes = vec!["aa".repeat(16), "bb".repeat(16)];
        ep.blessing_names = vec!["root/server".to_string()];
        let parsed: Endpoint = ep.to_string().parse().unwrap();
        assert_eq!(ep, parsed);
    }

    #[test]
    fn empty_optional_fields_roundtrip() {
        let ep = Endpoint::listen_hint("ws", "[::1]:0");
        let parsed: Endpoint = ep.to_string().parse().unwrap();
        assert_eq!(ep, parsed);
        assert!(parsed.routes.is_empty());
        assert!(parsed.blessing_names.is_empty());
    }

    #[test]
    fn parse_literal_form() {
        let rid = RoutingId::random();
        let s = format!("@6@tcp@10.0.0.1:80@@{}@s@@@", rid);
        let ep: Endpoint = s.parse().unwrap();
        assert_eq!(ep.protocol, "tcp");
        assert_eq!(ep.address, "10.0.0.1:80");
        assert_eq!(ep.rid, rid);
        assert!(!ep.serves_mount_table);
    }

    #[test]
    fn rejects_malformed() {
        assert!("tcp:127.0.0.1:80".parse::<Endpoint>().is_err());
        assert!("@9@tcp@x@@00@m@@@".parse::<Endpoint>().is_err());
        assert!("@6@tcp@x@@nothex@m@@@".parse::<Endpoint>().is_err());
    }

    #[test]
    fn dial_requires_rid() {
        assert!(Endpoint::listen_hint("tcp", "x").validate_for_dial().is_err());
        assert!(Endpoint::new("tcp", "x", RoutingId::random())
            .validate_for_dial()
            .is_ok());
    }
}

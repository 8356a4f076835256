use std::str::FromStr;

use strum::{Display, EnumString};

use crate::bind::BindId;
use crate::error::Error;
use crate::runtime::Runtime;

/// Stable transport identifiers.
///
/// `DatagramRdmacmRc` is a known name whose driver is supplied by an
/// accelerated-transport framework; the core only ships the kernel socket
/// drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum ProtocolId {
    #[strum(serialize = "STREAM_SOCKET_TCP")]
    StreamSocketTcp,
    #[strum(serialize = "DATAGRAM_SOCKET_UDP")]
    DatagramSocketUdp,
    #[strum(serialize = "DATAGRAM_RDMACM_RC")]
    DatagramRdmacmRc,
}

/// Resolves a protocol name (case-insensitive) to its identifier.
pub fn protocol_lookup(name: &str) -> Result<ProtocolId, Error> {
    ProtocolId::from_str(name).map_err(|_| Error::UnknownProtocol(name.to_string()))
}

/// A transport adapter.
///
/// The vtable is the only surface between the core and a transport: the
/// runtime calls `connect`/`listen` to set up a bind's transport state and
/// event, `flush` when a send ring goes non-empty, and `close` from the
/// bind's close deferral. Everything else flows through the event handlers
/// the driver installs.
#[derive(Clone, Copy)]
pub struct Protocol {
    pub id: ProtocolId,
    pub name: &'static str,
    /// Ordered byte delivery (coalescing receive, segment callbacks).
    pub stream: bool,
    /// Connection-oriented; unconnected datagram transports carry a source
    /// address per message instead.
    pub connected: bool,
    pub connect: fn(&mut Runtime, BindId),
    pub listen: fn(&mut Runtime, BindId),
    pub close: fn(&mut Runtime, BindId),
    pub flush: fn(&mut Runtime, BindId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(
            protocol_lookup("stream_socket_tcp").unwrap(),
            ProtocolId::StreamSocketTcp
        );
        assert_eq!(
            protocol_lookup("DATAGRAM_SOCKET_UDP").unwrap(),
            ProtocolId::DatagramSocketUdp
        );
        assert_eq!(
            protocol_lookup("Datagram_Rdmacm_Rc").unwrap(),
            ProtocolId::DatagramRdmacmRc
        );
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        assert!(matches!(
            protocol_lookup("STREAM_SOCKET_SCTP"),
            Err(Error::UnknownProtocol(_))
        ));
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ProtocolId::StreamSocketTcp.to_string(), "STREAM_SOCKET_TCP");
    }
}

use thiserror::Error;

/// Errors surfaced through `Result` on the runtime's lookup/parse surface.
///
/// Everything else follows the aborting contract: transient I/O is absorbed
/// by the readiness machine, peer and protocol failures arrive as terminal
/// `Disconnected` notifications, and local resource exhaustion or contract
/// violations panic with a diagnostic.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid endpoint address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },
}

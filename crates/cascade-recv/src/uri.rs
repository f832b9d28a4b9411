//! Transfer URI parsing.
//!
//! `mcs://host[:port]/path` requests a PSK-sealed control channel and
//! encoded payload; `mc://host[:port]/path` runs in the clear. `path`
//! selects the payload below the server's root.

use cascade_core::error::TransferError;

/// Default control port when the URI does not name one.
pub const DEFAULT_CONTROL_PORT: u16 = 7650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUri {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl TransferUri {
    pub fn parse(input: &str) -> Result<Self, TransferError> {
        let (secure, rest) = if let Some(rest) = input.strip_prefix("mcs://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("mc://") {
            (false, rest)
        } else {
            return Err(TransferError::ConfigInvalid(format!(
                "{input:?} is not an mc:// or mcs:// uri"
            )));
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) if !path.is_empty() => (authority, path),
            _ => {
                return Err(TransferError::ConfigInvalid(format!(
                    "{input:?} is missing a payload path"
                )))
            }
        };

        // Bracketed IPv6 literals keep their colons.
        let (host, port) = if let Some(end) = authority.strip_prefix('[') {
            match end.split_once(']') {
                Some((host, "")) => (host.to_string(), DEFAULT_CONTROL_PORT),
                Some((host, port)) => {
                    let port = port.strip_prefix(':').ok_or_else(|| bad_port(input))?;
                    (host.to_string(), port.parse().map_err(|_| bad_port(input))?)
                }
                None => return Err(bad_port(input)),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => {
                    (host.to_string(), port.parse().map_err(|_| bad_port(input))?)
                }
                None => (authority.to_string(), DEFAULT_CONTROL_PORT),
            }
        };

        if host.is_empty() {
            return Err(TransferError::ConfigInvalid(format!(
                "{input:?} is missing a host"
            )));
        }

        Ok(Self { secure, host, port, path: path.to_string() })
    }

    pub fn control_endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn bad_port(input: &str) -> TransferError {
    TransferError::ConfigInvalid(format!("{input:?} has an invalid port"))
}

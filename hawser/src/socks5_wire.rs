//! Sans-IO SOCKS5 negotiation codec (RFC 1928, RFC 1929).
//!
//! Three exchanges, in order: method selection, optional
//! username/password authentication, then the CONNECT command. Parsers
//! return `Ok(None)` when the buffer does not yet hold a complete reply.

use std::net::IpAddr;

use crate::error::Error;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    UsernamePassword,
}

impl AuthMethod {
    fn code(self) -> u8 {
        match self {
            AuthMethod::None => 0x00,
            AuthMethod::UsernamePassword => 0x02,
        }
    }
}

/// Method-selection greeting offering exactly one method.
pub fn write_greeting(out: &mut Vec<u8>, auth: AuthMethod) {
    out.extend_from_slice(&[VERSION, 1, auth.code()]);
}

/// Server's method choice. Errors if the server picks a method we did
/// not offer or refuses outright (0xff).
pub fn parse_greeting_reply(buf: &[u8], offered: AuthMethod) -> Result<Option<usize>, Error> {
    let Some(reply) = buf.get(..2) else {
        return Ok(None);
    };
    if reply[0] != VERSION {
        return Err(Error::Proxy("SOCKS5 server sent a bad version".into()));
    }
    if reply[1] == 0xff {
        return Err(Error::Proxy(
            "SOCKS5 server accepts none of the offered auth methods".into(),
        ));
    }
    if reply[1] != offered.code() {
        return Err(Error::Proxy(format!(
            "SOCKS5 server selected unrequested auth method {:#04x}",
            reply[1]
        )));
    }
    Ok(Some(2))
}

/// RFC 1929 username/password sub-negotiation request.
pub fn write_auth(out: &mut Vec<u8>, username: &[u8], password: &[u8]) -> Result<(), Error> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::Proxy(
            "SOCKS5 credentials exceed 255 bytes".into(),
        ));
    }
    out.push(AUTH_VERSION);
    out.push(username.len() as u8);
    out.extend_from_slice(username);
    out.push(password.len() as u8);
    out.extend_from_slice(password);
    Ok(())
}

pub fn parse_auth_reply(buf: &[u8]) -> Result<Option<usize>, Error> {
    let Some(reply) = buf.get(..2) else {
        return Ok(None);
    };
    if reply[0] != AUTH_VERSION {
        return Err(Error::Proxy("SOCKS5 bad auth reply version".into()));
    }
    if reply[1] != 0 {
        return Err(Error::Proxy("SOCKS5 authentication rejected".into()));
    }
    Ok(Some(2))
}

/// CONNECT command for `host:port`. IP-literal hosts use the binary
/// address types; everything else is sent as a domain for the proxy to
/// resolve.
pub fn write_connect(out: &mut Vec<u8>, host: &[u8], port: u16) -> Result<(), Error> {
    out.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);
    match std::str::from_utf8(host).ok().and_then(|h| h.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(v4)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.octets());
        }
        None => {
            if host.len() > 255 {
                return Err(Error::Proxy("SOCKS5 hostname exceeds 255 bytes".into()));
            }
            out.push(ATYP_DOMAIN);
            out.push(host.len() as u8);
            out.extend_from_slice(host);
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// CONNECT reply. Success consumes the whole reply including the bound
/// address; any non-zero reply code is a proxy failure.
pub fn parse_connect_reply(buf: &[u8]) -> Result<Option<usize>, Error> {
    let Some(head) = buf.get(..4) else {
        return Ok(None);
    };
    let (version, code, atyp) = (head[0], head[1], head[3]);
    if version != VERSION {
        return Err(Error::Proxy("SOCKS5 server sent a bad version".into()));
    }
    if code != 0 {
        return Err(Error::Proxy(format!(
            "SOCKS5 server could not connect: {}",
            reply_code_message(code)
        )));
    }
    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => match buf.get(4) {
            Some(&len) => 1 + usize::from(len),
            None => return Ok(None),
        },
        _ => return Err(Error::Proxy("SOCKS5 bad address type in reply".into())),
    };
    let total = 4 + addr_len + 2;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

fn reply_code_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_round_trip() {
        let mut out = Vec::new();
        write_greeting(&mut out, AuthMethod::None);
        assert_eq!(out, [0x05, 0x01, 0x00]);
        assert_eq!(
            parse_greeting_reply(&[0x05, 0x00], AuthMethod::None).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn greeting_rejects_unoffered_method() {
        assert!(parse_greeting_reply(&[0x05, 0x02], AuthMethod::None).is_err());
        assert!(parse_greeting_reply(&[0x05, 0xff], AuthMethod::None).is_err());
    }

    #[test]
    fn auth_exchange() {
        let mut out = Vec::new();
        write_auth(&mut out, b"user", b"pass").unwrap();
        assert_eq!(out, b"\x01\x04user\x04pass");
        assert_eq!(parse_auth_reply(&[0x01, 0x00]).unwrap(), Some(2));
        assert!(parse_auth_reply(&[0x01, 0x01]).is_err());
    }

    #[test]
    fn connect_uses_domain_for_names() {
        let mut out = Vec::new();
        write_connect(&mut out, b"example.com", 443).unwrap();
        assert_eq!(out[..4], [0x05, 0x01, 0x00, 0x03]);
        assert_eq!(out[4], 11);
        assert_eq!(&out[5..16], b"example.com");
        assert_eq!(&out[16..], &443u16.to_be_bytes());
    }

    #[test]
    fn connect_uses_binary_for_ip_literals() {
        let mut out = Vec::new();
        write_connect(&mut out, b"127.0.0.1", 1080).unwrap();
        assert_eq!(out, [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);
    }

    #[test]
    fn connect_reply_lengths() {
        // IPv4 success: 10 bytes.
        let ok = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_connect_reply(&ok).unwrap(), Some(10));
        assert_eq!(parse_connect_reply(&ok[..6]).unwrap(), None);
        // Domain-form reply.
        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 0x03];
        reply.extend_from_slice(b"abc");
        reply.extend_from_slice(&[0, 80]);
        assert_eq!(parse_connect_reply(&reply).unwrap(), Some(10));
    }

    #[test]
    fn connect_refusal_surfaces_reason() {
        let refused = [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let err = parse_connect_reply(&refused).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}

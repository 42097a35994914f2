use ballast::error::{Error, Result};
use mio::net::TcpListener;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

/// Candidate addresses for a passive listener on every interface, IPv4
/// first.
pub fn resolve_server(port: u16) -> Result<Vec<SocketAddr>> {
    let mut candidates = Vec::new();

    for host in &["0.0.0.0", "::"] {
        match (*host, port).to_socket_addrs() {
            Ok(addrs) => candidates.extend(addrs),
            Err(err) => {
                if candidates.is_empty() {
                    return Err(Error::Resolve(err.to_string()));
                }
            }
        }
    }

    if candidates.is_empty() {
        return Err(Error::Resolve("no listen addresses".to_owned()));
    }
    Ok(candidates)
}

/// Candidate addresses for an outgoing connection.
pub fn resolve_client(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| Error::Resolve(err.to_string()))?
        .collect();

    if candidates.is_empty() {
        return Err(Error::Resolve(format!("no addresses for {}", host)));
    }
    Ok(candidates)
}

/// Binds a nonblocking listener to the first workable candidate. Address
/// reuse is enabled and the listen backlog is generous. When every
/// candidate fails, the last error is returned.
pub fn bind_listener(candidates: &[SocketAddr]) -> Result<TcpListener> {
    let mut last_err = Error::os(libc::EINVAL);

    for addr in candidates {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Error::from_io(&err),
        }
    }

    Err(last_err)
}

/// Connects to the first workable candidate with a blocking connect; the
/// caller flips the stream nonblocking before handing it to a poll set.
pub fn connect_stream(candidates: &[SocketAddr]) -> Result<TcpStream> {
    let mut last_err = Error::os(libc::EINVAL);

    for addr in candidates {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Error::from_io(&err),
        }
    }

    Err(last_err)
}

/// `IP:PORT` with numeric host and service.
pub fn format_endpoint(addr: &SocketAddr) -> String {
    addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_server_yields_wildcards() {
        let candidates = resolve_server(0).unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|addr| addr.ip().is_unspecified()));
    }

    #[test]
    fn test_resolve_client_numeric_host() {
        let candidates = resolve_client("127.0.0.1", 8080).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_bind_listener_first_success_wins() {
        let candidates = resolve_client("127.0.0.1", 0).unwrap();
        let listener = bind_listener(&candidates).unwrap();
        assert_eq!(listener.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_bind_listener_reports_last_error() {
        let err = bind_listener(&[]).unwrap_err();
        assert_eq!(err, Error::os(libc::EINVAL));
    }

    #[test]
    fn test_format_endpoint_is_numeric() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        assert_eq!(format_endpoint(&addr), "192.0.2.7:4242");
    }
}

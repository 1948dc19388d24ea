//! The external event listener.
//!
//! A non-blocking byte-stream endpoint polled once per generation step.
//! Clients connect over TCP (localhost) or an AF_UNIX socket and write
//! CR/LF-terminated lines; each non-blank line becomes an [`Event`].

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;

use crate::config::DEFAULT_LISTEN_PORT;
use crate::events::Event;
use crate::{Error, Result};

/// Where the listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP on localhost.
    Tcp(u16),
    /// AF_UNIX socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenAddr {
    /// Interpret a configured port string: a path if it starts with `/`,
    /// otherwise a TCP port number. `None` selects the default port.
    pub fn from_config(port: Option<&str>) -> Result<ListenAddr> {
        match port {
            None => Ok(ListenAddr::Tcp(DEFAULT_LISTEN_PORT)),
            Some(s) if s.starts_with('/') => {
                #[cfg(unix)]
                {
                    Ok(ListenAddr::Unix(PathBuf::from(s)))
                }
                #[cfg(not(unix))]
                {
                    Err(Error::InvalidConfig(format!(
                        "unix socket listener not supported on this platform: {s}"
                    )))
                }
            }
            Some(s) => s
                .parse()
                .map(ListenAddr::Tcp)
                .map_err(|_| Error::InvalidConfig(format!("bad listen port: {s}"))),
        }
    }
}

enum Acceptor {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener, PathBuf),
}

enum ConnStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for ConnStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ConnStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            ConnStream::Unix(s) => s.read(buf),
        }
    }
}

struct Conn {
    stream: ConnStream,
    pending: Vec<u8>,
}

/// Non-blocking line-delimited event endpoint.
pub struct Listener {
    acceptor: Acceptor,
    conns: Vec<Conn>,
}

impl Listener {
    pub fn open(addr: &ListenAddr) -> Result<Listener> {
        let acceptor = match addr {
            ListenAddr::Tcp(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port))?;
                listener.set_nonblocking(true)?;
                Acceptor::Tcp(listener)
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                let listener = std::os::unix::net::UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Acceptor::Unix(listener, path.clone())
            }
        };
        Ok(Listener {
            acceptor,
            conns: Vec::new(),
        })
    }

    /// The bound TCP address, if this is a TCP listener. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.acceptor {
            Acceptor::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Acceptor::Unix(..) => None,
        }
    }

    /// Accept pending connections and drain readable data, handing each
    /// completed non-blank line to `on_event` as a parsed [`Event`].
    pub fn poll(&mut self, mut on_event: impl FnMut(Event)) -> Result<()> {
        self.accept_pending();

        let mut index = 0;
        while index < self.conns.len() {
            match drain_conn(&mut self.conns[index], &mut on_event) {
                ConnState::Open => index += 1,
                ConnState::Closed => {
                    self.conns.swap_remove(index);
                }
            }
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            let stream = match &self.acceptor {
                Acceptor::Tcp(listener) => match listener.accept() {
                    Ok((stream, _)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        ConnStream::Tcp(stream)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!("listener accept failed: {e}");
                        break;
                    }
                },
                #[cfg(unix)]
                Acceptor::Unix(listener, _) => match listener.accept() {
                    Ok((stream, _)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        ConnStream::Unix(stream)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!("listener accept failed: {e}");
                        break;
                    }
                },
            };
            self.conns.push(Conn {
                stream,
                pending: Vec::new(),
            });
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Acceptor::Unix(_, path) = &self.acceptor {
            let _ = std::fs::remove_file(path);
        }
    }
}

enum ConnState {
    Open,
    Closed,
}

fn drain_conn(conn: &mut Conn, on_event: &mut impl FnMut(Event)) -> ConnState {
    let mut state = ConnState::Open;
    let mut chunk = [0u8; 1024];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                state = ConnState::Closed;
                break;
            }
            Ok(n) => conn.pending.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("listener connection dropped: {e}");
                state = ConnState::Closed;
                break;
            }
        }
    }

    let remainder = handle_by_lines(&conn.pending, on_event);
    conn.pending = remainder;
    state
}

/// Parse as many complete lines as possible out of `data`, passing each
/// non-blank one to the handler; returns the unterminated remainder.
/// Lines end at CR, LF, or CRLF.
fn handle_by_lines(data: &[u8], on_event: &mut impl FnMut(Event)) -> Vec<u8> {
    let mut rest: &[u8] = data;
    while let Some(pos) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
        let line = &rest[..pos];
        if let Some(event) = Event::parse(&String::from_utf8_lossy(line)) {
            on_event(event);
        }
        rest = &rest[pos + 1..];
    }
    rest.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect_lines(input: &[u8]) -> (Vec<Event>, Vec<u8>) {
        let mut events = Vec::new();
        let rest = handle_by_lines(input, &mut |ev| events.push(ev));
        (events, rest)
    }

    #[test]
    fn test_handle_by_lines() {
        let (events, rest) = collect_lines(b"hello world\ngoodbye\npart");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "hello");
        assert_eq!(events[0].args(), ["world"]);
        assert_eq!(events[1].name(), "goodbye");
        assert_eq!(rest, b"part");
    }

    #[test]
    fn test_handle_by_lines_cr_and_crlf() {
        let (events, rest) = collect_lines(b"one\r\ntwo\rthree\n");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].name(), "three");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_handle_by_lines_skips_blank() {
        let (events, _) = collect_lines(b"\n   \nreal\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "real");
    }

    #[test]
    fn test_listen_addr_from_config() {
        assert_eq!(
            ListenAddr::from_config(None).unwrap(),
            ListenAddr::Tcp(DEFAULT_LISTEN_PORT)
        );
        assert_eq!(
            ListenAddr::from_config(Some("9000")).unwrap(),
            ListenAddr::Tcp(9000)
        );
        assert!(ListenAddr::from_config(Some("not-a-port")).is_err());
        #[cfg(unix)]
        assert_eq!(
            ListenAddr::from_config(Some("/tmp/mur.sock")).unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/mur.sock"))
        );
    }

    #[test]
    fn test_tcp_listener_end_to_end() {
        let mut listener = Listener::open(&ListenAddr::Tcp(0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello world\n").unwrap();
        client.flush().unwrap();

        // Non-blocking endpoint: poll until the bytes arrive.
        let mut events = Vec::new();
        for _ in 0..100 {
            listener.poll(|ev| events.push(ev)).unwrap();
            if !events.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "hello");
        assert_eq!(events[0].args(), ["world"]);

        // A half line waits for its terminator.
        client.write_all(b"par").unwrap();
        client.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        events.clear();
        listener.poll(|ev| events.push(ev)).unwrap();
        assert!(events.is_empty());

        client.write_all(b"tial done\n").unwrap();
        client.flush().unwrap();
        for _ in 0..100 {
            listener.poll(|ev| events.push(ev)).unwrap();
            if !events.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "partial");
        assert_eq!(events[0].args(), ["done"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_listener_unlinks_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sock");
        let listener = Listener::open(&ListenAddr::Unix(path.clone())).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}

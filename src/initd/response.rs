use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd::write;
use tracing::{debug, error, info};

pub const REQUEST_OK: &[u8] = b"REQUEST OK\n";
pub const PROTOCOL_ERROR: &[u8] = b"PROTOCOL ERROR\n";
pub const INTERNAL_ERROR: &[u8] = b"INTERNAL ERROR\n";
#[allow(dead_code)]
pub const WAIT_TIMEOUT: &[u8] = b"WAIT TIMEOUT\n";

/// Bytes queued for a connection. Most replies are one of the static
/// protocol strings; STATUS builds its payload dynamically.
#[derive(Debug)]
pub enum Payload {
    Fixed(&'static [u8]),
    Dynamic(Vec<u8>),
}

impl Payload {
    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Fixed(bytes) => bytes,
            Payload::Dynamic(bytes) => bytes,
        }
    }
}

/// Outcome of a write pass over a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Fully sent; disconnect the peer.
    Done,
    /// The socket stopped accepting bytes; resume on writability.
    Pending,
    /// The peer is gone; disconnect without finishing.
    Failed,
}

/// A reply in flight. The descriptor was taken over from the request (or
/// waiter) that produced it; dropping the response closes the connection.
#[derive(Debug)]
pub struct Response {
    fd: OwnedFd,
    payload: Payload,
    written: usize,
}

impl Response {
    pub fn new(fd: OwnedFd, payload: Payload) -> Response {
        debug!(
            "[{}] initiating response: {}",
            fd.as_raw_fd(),
            String::from_utf8_lossy(payload.bytes()).trim_end()
        );
        Response {
            fd,
            payload,
            written: 0,
        }
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Writes until done or the socket would block.
    pub fn flush(&mut self) -> Flush {
        loop {
            let remaining = &self.payload.bytes()[self.written..];
            if remaining.is_empty() {
                info!("[{}] finished replying", self.raw_fd());
                return Flush::Done;
            }
            match write(&self.fd, remaining) {
                Ok(n) => self.written += n,
                Err(Errno::EAGAIN) => return Flush::Pending,
                Err(Errno::EINTR) => {}
                Err(e) => {
                    error!("[{}] error in write(): {}", self.raw_fd(), e);
                    return Flush::Failed;
                }
            }
        }
    }
}

impl AsFd for Response {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    #[test]
    fn writes_whole_payload() {
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut response = Response::new(server.into(), Payload::Fixed(REQUEST_OK));
        assert_eq!(response.flush(), Flush::Done);
        drop(response);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, REQUEST_OK);
    }

    #[test]
    fn resumes_after_backpressure() {
        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();

        // A payload far bigger than the socket buffer forces EAGAIN.
        let big = vec![b'x'; 4 * 1024 * 1024];
        let mut response = Response::new(server.into(), Payload::Dynamic(big.clone()));
        assert_eq!(response.flush(), Flush::Pending);

        let mut received = Vec::new();
        let mut chunk = [0u8; 65536];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    match response.flush() {
                        Flush::Done => {
                            drop(response);
                            // Drain whatever is still buffered after close.
                            client.set_nonblocking(false).unwrap();
                            client.read_to_end(&mut received).unwrap();
                            break;
                        }
                        Flush::Pending => continue,
                        Flush::Failed => panic!("write failed"),
                    }
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, big);
    }

    #[test]
    fn peer_close_fails_flush() {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        drop(client);
        let big = vec![b'x'; 4 * 1024 * 1024];
        let mut response = Response::new(server.into(), Payload::Dynamic(big));
        assert_eq!(response.flush(), Flush::Failed);
    }
}

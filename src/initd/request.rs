use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd::read;
use tracing::{debug, error};

/// Hard ceiling on the bytes a single request may allocate, arrays included.
pub const MAX_REQUEST_SIZE: u64 = 1024 * 1024;

/// A connection whose frame is still being read. The wire format is
/// line-oriented ASCII decimal headers around raw byte payloads:
///
/// ```text
/// <protocol-version>\n
/// <outer-len>\n
///  (
///   <inner-len>\n
///    ( <string-len>\n <bytes> )*
///  ){outer-len}
/// ```
///
/// The reader is incremental and non-blocking: integer states consume one
/// byte at a time, string states read straight into the destination buffer,
/// and a short read leaves the remainder pending for the next readiness
/// event.
pub struct Request {
    fd: OwnedFd,
    state: State,
    // Accumulator for the integer currently being read.
    acc: u64,
    outer_len: usize,
    inner_len: usize,
    string_len: usize,
    string_pos: usize,
    // Total allocation charged against this request.
    size: u64,
    data: Vec<Vec<Vec<u8>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Proto,
    OuterLen,
    InnerLen,
    StringLen,
    String,
}

/// Result of driving the reader over whatever bytes the socket has.
#[derive(Debug)]
pub enum Progress {
    /// The socket ran dry mid-frame; wait for more.
    Pending,
    /// A full frame is available via `take_data`.
    Complete,
    /// The frame is invalid; answer PROTOCOL ERROR and hang up.
    ProtocolError,
    /// Peer went away or the read failed; just hang up.
    Disconnected,
}

impl Request {
    pub fn new(fd: OwnedFd) -> Request {
        Request {
            fd,
            state: State::Proto,
            acc: 0,
            outer_len: 0,
            inner_len: 0,
            string_len: 0,
            string_pos: 0,
            size: 0,
            data: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Surrenders the connection for the response phase.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// The parsed argument groups. Only meaningful after `Complete`.
    pub fn take_data(&mut self) -> Vec<Vec<Vec<u8>>> {
        mem::take(&mut self.data)
    }

    /// Reads until the socket would block, the frame completes, or the
    /// connection fails.
    pub fn drive(&mut self) -> Progress {
        loop {
            let step = if self.state == State::String {
                self.read_string_bytes()
            } else {
                self.read_integer_byte()
            };
            match step {
                Step::More => {}
                Step::Done => return Progress::Complete,
                Step::Pending => return Progress::Pending,
                Step::Protocol => return Progress::ProtocolError,
                Step::Disconnected => return Progress::Disconnected,
            }
        }
    }

    fn read_integer_byte(&mut self) -> Step {
        let mut byte = [0u8; 1];
        match read(&self.fd, &mut byte) {
            Ok(0) => return Step::Disconnected,
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Step::Pending,
            Err(Errno::EINTR) => return Step::More,
            Err(e) => {
                error!("[{}] error in read(): {}", self.raw_fd(), e);
                return Step::Disconnected;
            }
        }

        match byte[0] {
            b'0'..=b'9' => {
                // Checked arithmetic: a header long enough to overflow is far
                // over budget anyway.
                match self
                    .acc
                    .checked_mul(10)
                    .and_then(|v| v.checked_add((byte[0] - b'0') as u64))
                {
                    Some(value) => self.acc = value,
                    None => {
                        error!("[{}] length header overflows", self.raw_fd());
                        return Step::Protocol;
                    }
                }
                Step::More
            }
            b'\n' => {
                let value = mem::take(&mut self.acc);
                self.finish_integer(value)
            }
            other => {
                error!(
                    "[{}] invalid byte in length header: {}",
                    self.raw_fd(),
                    other
                );
                Step::Protocol
            }
        }
    }

    /// A newline ended the current integer; advance the frame structure.
    fn finish_integer(&mut self, value: u64) -> Step {
        match self.state {
            State::Proto => {
                if value != 1 {
                    error!("[{}] unknown protocol version: {}", self.raw_fd(), value);
                    return Step::Protocol;
                }
                debug!("[{}] protocol={}", self.raw_fd(), value);
                self.state = State::OuterLen;
                Step::More
            }
            State::OuterLen => {
                if value == 0 {
                    error!("[{}] empty frame", self.raw_fd());
                    return Step::Protocol;
                }
                if let Some(fault) = self.charge(value, slot_cost::<Vec<Vec<u8>>>()) {
                    return fault;
                }
                self.outer_len = value as usize;
                self.data = Vec::with_capacity(self.outer_len);
                debug!("[{}] outer_len={}", self.raw_fd(), value);
                self.state = State::InnerLen;
                Step::More
            }
            State::InnerLen => {
                if let Some(fault) = self.charge(value, slot_cost::<Vec<u8>>()) {
                    return fault;
                }
                self.inner_len = value as usize;
                self.data.push(Vec::with_capacity(self.inner_len));
                debug!(
                    "[{}] outer_index={} inner_len={}",
                    self.raw_fd(),
                    self.data.len() - 1,
                    value
                );
                if self.inner_len == 0 {
                    self.group_done()
                } else {
                    self.state = State::StringLen;
                    Step::More
                }
            }
            State::StringLen => {
                if let Some(fault) = self.charge(value.saturating_add(1), 1) {
                    return fault;
                }
                self.string_len = value as usize;
                self.string_pos = 0;
                let group = self.data.last_mut().expect("group exists in StringLen");
                group.push(vec![0u8; value as usize]);
                if self.string_len == 0 {
                    self.string_done()
                } else {
                    self.state = State::String;
                    Step::More
                }
            }
            State::String => unreachable!("string bytes are not integers"),
        }
    }

    fn read_string_bytes(&mut self) -> Step {
        let fd = self.raw_fd();
        let group = self.data.last_mut().expect("group exists in String");
        let string = group.last_mut().expect("string exists in String");
        let target = &mut string[self.string_pos..];

        match read(&self.fd, target) {
            Ok(0) => Step::Disconnected,
            Ok(n) => {
                self.string_pos += n;
                if self.string_pos == self.string_len {
                    self.string_done()
                } else {
                    Step::More
                }
            }
            Err(Errno::EAGAIN) => Step::Pending,
            Err(Errno::EINTR) => Step::More,
            Err(e) => {
                error!("[{}] error in read(): {}", fd, e);
                Step::Disconnected
            }
        }
    }

    fn string_done(&mut self) -> Step {
        let group = self.data.last().expect("group exists");
        if group.len() < self.inner_len {
            self.state = State::StringLen;
            Step::More
        } else {
            self.group_done()
        }
    }

    fn group_done(&mut self) -> Step {
        if self.data.len() < self.outer_len {
            self.state = State::InnerLen;
            Step::More
        } else {
            debug!("[{}] request received", self.raw_fd());
            Step::Done
        }
    }

    /// Charges `count * unit` bytes against the request budget.
    fn charge(&mut self, count: u64, unit: u64) -> Option<Step> {
        if count > MAX_REQUEST_SIZE {
            error!(
                "[{}] request declares too many elements: {}",
                self.raw_fd(),
                count
            );
            return Some(Step::Protocol);
        }
        self.size = self.size.saturating_add(count.saturating_mul(unit));
        if self.size > MAX_REQUEST_SIZE {
            error!(
                "[{}] request exceeds the {} byte budget by {}",
                self.raw_fd(),
                MAX_REQUEST_SIZE,
                self.size - MAX_REQUEST_SIZE
            );
            return Some(Step::Protocol);
        }
        None
    }

    #[cfg(test)]
    fn charged(&self) -> u64 {
        self.size
    }
}

fn slot_cost<T>() -> u64 {
    mem::size_of::<T>() as u64
}

enum Step {
    More,
    Done,
    Pending,
    Protocol,
    Disconnected,
}

impl AsFd for Request {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn request_pair() -> (UnixStream, Request) {
        let (client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, Request::new(server.into()))
    }

    /// The framing writer, as a controller would produce it.
    fn encode(groups: &[Vec<Vec<u8>>]) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"1\n");
        wire.extend_from_slice(format!("{}\n", groups.len()).as_bytes());
        for group in groups {
            wire.extend_from_slice(format!("{}\n", group.len()).as_bytes());
            for string in group {
                wire.extend_from_slice(format!("{}\n", string.len()).as_bytes());
                wire.extend_from_slice(string);
            }
        }
        wire
    }

    fn parse_all(bytes: &[u8]) -> (Request, Progress) {
        let (mut client, mut request) = request_pair();
        client.write_all(bytes).unwrap();
        drop(client);
        let progress = request.drive();
        (request, progress)
    }

    #[test]
    fn parses_wait_frame() {
        let (mut request, progress) = parse_all(b"1\n1\n1\n5\nWAIT\n");
        assert!(matches!(progress, Progress::Complete));
        assert_eq!(request.take_data(), vec![vec![b"WAIT\n".to_vec()]]);
    }

    #[test]
    fn parses_nested_groups() {
        // Headers and payloads interleave with no separator after payloads.
        let frame = [
            b"1\n".as_slice(),
            b"3\n",
            b"2\n",
            b"4\n",
            b"EXEC",
            b"2\n",
            b"ls",
            b"3\n",
            b"0\n",
            b"3\n",
            b"A=1",
            b"3\n",
            b"B=2",
            b"1\n",
            b"4\n",
            b"C=33",
        ]
        .concat();
        let (mut request, progress) = parse_all(&frame);
        assert!(matches!(progress, Progress::Complete));
        assert_eq!(
            request.take_data(),
            vec![
                vec![b"EXEC".to_vec(), b"ls".to_vec()],
                vec![b"".to_vec(), b"A=1".to_vec(), b"B=2".to_vec()],
                vec![b"C=33".to_vec()],
            ]
        );
    }

    #[test]
    fn empty_group_is_valid() {
        let (mut request, progress) = parse_all(b"1\n2\n1\n6\nSTATUS0\n");
        assert!(matches!(progress, Progress::Complete));
        assert_eq!(
            request.take_data(),
            vec![vec![b"STATUS".to_vec()], Vec::<Vec<u8>>::new()]
        );
    }

    #[test]
    fn tolerates_byte_at_a_time_delivery() {
        let frame = b"1\n1\n2\n5\nWAIT 2\nok";
        let (mut client, mut request) = request_pair();
        for byte in frame.iter() {
            assert!(matches!(request.drive(), Progress::Pending));
            client.write_all(&[*byte]).unwrap();
        }
        assert!(matches!(request.drive(), Progress::Complete));
        assert_eq!(
            request.take_data(),
            vec![vec![b"WAIT ".to_vec(), b"ok".to_vec()]]
        );
    }

    #[test]
    fn rejects_unknown_protocol_version() {
        let (_, progress) = parse_all(b"2\n1\n1\n5\nWAIT\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn rejects_empty_frame() {
        let (_, progress) = parse_all(b"1\n0\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn rejects_non_digit_header() {
        let (_, progress) = parse_all(b"1\nx\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn rejects_oversized_outer_length() {
        // 2^30 groups would charge far past the budget before any payload.
        let (_, progress) = parse_all(b"1\n1073741824\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn rejects_oversized_string() {
        let (_, progress) = parse_all(b"1\n1\n1\n9999999\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn rejects_absurd_header_digits() {
        let (_, progress) = parse_all(b"1\n99999999999999999999999999\n");
        assert!(matches!(progress, Progress::ProtocolError));
    }

    #[test]
    fn budget_is_monotonic_and_bounded() {
        let (mut client, mut request) = request_pair();
        client.write_all(b"1\n1\n1\n5\nWAIT\n").unwrap();
        let mut last = 0;
        loop {
            let progress = request.drive();
            assert!(request.charged() >= last);
            assert!(request.charged() <= MAX_REQUEST_SIZE);
            last = request.charged();
            if matches!(progress, Progress::Complete) {
                break;
            }
        }
    }

    #[test]
    fn round_trips_arbitrary_structures() {
        let structures: Vec<Vec<Vec<Vec<u8>>>> = vec![
            vec![vec![b"WAIT".to_vec()]],
            vec![vec![]],
            vec![vec![b"".to_vec()]],
            vec![
                vec![b"START".to_vec(), b"name".to_vec()],
                vec![b"/bin/sh".to_vec(), b"-c".to_vec(), b"exit 0".to_vec()],
                vec![],
                vec![b"A=1".to_vec(), b"".to_vec()],
                vec![b"/dev/null".to_vec(), b"/dev/null".to_vec()],
                vec![b"0".to_vec(), b"0".to_vec()],
            ],
            vec![vec![vec![0u8; 4096]], vec![], vec![b"\n\n\n".to_vec()]],
        ];
        for structure in structures {
            let (mut request, progress) = parse_all(&encode(&structure));
            assert!(matches!(progress, Progress::Complete), "{:?}", structure);
            assert_eq!(request.take_data(), structure);
        }
    }

    #[test]
    fn disconnect_mid_frame() {
        let (mut client, mut request) = request_pair();
        client.write_all(b"1\n1\n2\n5\nWA").unwrap();
        assert!(matches!(request.drive(), Progress::Pending));
        drop(client);
        assert!(matches!(request.drive(), Progress::Disconnected));
    }
}

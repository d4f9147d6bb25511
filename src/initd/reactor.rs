use std::convert::Infallible;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info};

use super::command::{decode, Fault};
use super::handlers::{execute, Outcome};
use super::process::Supervisor;
use super::request::{Progress, Request};
use super::response::{Flush, Payload, Response, INTERNAL_ERROR, PROTOCOL_ERROR, REQUEST_OK};
use super::signals::SignalPipe;

/// Reap sweeps also run on this cadence as a recovery net for wakeups the
/// signal pipe may have lost.
const POLL_TIMEOUT_MS: u16 = 60_000;

/// A parked WAIT connection. It holds no request or response; the next
/// supervised-process termination answers it.
struct Waiter {
    fd: OwnedFd,
    since: Instant,
}

/// Single-threaded, level-triggered multiplexer over the listener, the
/// signal pipe, and every connection. Each connection lives in exactly one of
/// the three lists at any moment; handlers move it between them atomically by
/// moving the owned descriptor.
pub struct Reactor {
    listener: UnixListener,
    signals: SignalPipe,
    requests: Vec<Request>,
    responses: Vec<Response>,
    waiters: Vec<Waiter>,
    supervisor: Supervisor,
}

impl Reactor {
    pub fn new(listener: UnixListener, signals: SignalPipe) -> Reactor {
        Reactor {
            listener,
            signals,
            requests: Vec::new(),
            responses: Vec::new(),
            waiters: Vec::new(),
            supervisor: Supervisor::new(),
        }
    }

    pub fn run(mut self) -> Result<Infallible, anyhow::Error> {
        info!("starting initd");
        loop {
            self.turn();
        }
    }

    /// One poll round: wait for readiness, then handle every ready
    /// descriptor. Readiness is snapshotted up front because handlers mutate
    /// the lists they were derived from.
    fn turn(&mut self) {
        let watched = 2 + self.requests.len() + self.responses.len() + self.waiters.len();
        let mut pollfds = Vec::with_capacity(watched);
        let mut polled_fds = Vec::with_capacity(watched);

        pollfds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        polled_fds.push(self.listener.as_raw_fd());
        pollfds.push(PollFd::new(
            self.signals.reader().as_fd(),
            PollFlags::POLLIN,
        ));
        polled_fds.push(self.signals.reader().as_raw_fd());
        for request in &self.requests {
            pollfds.push(PollFd::new(request.as_fd(), PollFlags::POLLIN));
            polled_fds.push(request.raw_fd());
        }
        for response in &self.responses {
            pollfds.push(PollFd::new(response.as_fd(), PollFlags::POLLOUT));
            polled_fds.push(response.raw_fd());
        }
        for waiter in &self.waiters {
            // Error conditions only; POLLERR/POLLHUP need no registration.
            pollfds.push(PollFd::new(waiter.fd.as_fd(), PollFlags::empty()));
            polled_fds.push(waiter.fd.as_raw_fd());
        }

        let result = poll(&mut pollfds, PollTimeout::from(POLL_TIMEOUT_MS));
        let events: Vec<(i32, PollFlags)> = polled_fds
            .into_iter()
            .zip(&pollfds)
            .map(|(fd, p)| (fd, p.revents().unwrap_or(PollFlags::empty())))
            .collect();
        drop(pollfds);

        // A handler-side write error means a wakeup may have been swallowed;
        // drain and reap unconditionally to recover it.
        if let Some(errno) = self.signals.take_handler_errno() {
            error!(
                "the signal handler failed writing to the signal pipe ({}); \
                 zombies may not have been reaped until now",
                errno
            );
            self.signals.drain();
            self.reap_and_notify();
        }

        match result {
            Err(Errno::EINTR) => {
                debug!("poll was interrupted");
                self.reap_and_notify();
                return;
            }
            Err(e) => {
                error!("error in poll(): {}", e);
                return;
            }
            Ok(0) => {
                debug!("poll timed out");
                self.reap_and_notify();
                return;
            }
            Ok(n) => debug!("poll triggered on {} descriptors", n),
        }

        let flags_for = |fd: i32| {
            events
                .iter()
                .find(|(event_fd, _)| *event_fd == fd)
                .map(|(_, flags)| *flags)
                .unwrap_or(PollFlags::empty())
        };

        if flags_for(self.listener.as_raw_fd()).contains(PollFlags::POLLIN) {
            self.accept();
        }

        if flags_for(self.signals.reader().as_raw_fd()).contains(PollFlags::POLLIN) {
            // Drain before reaping: a signal landing mid-reap must leave the
            // pipe readable again.
            self.signals.drain();
            self.reap_and_notify();
        }

        // Snapshot both lists up front: connections changing role mid-turn
        // must not be driven again on stale readiness.
        let request_fds: Vec<i32> = self.requests.iter().map(|r| r.raw_fd()).collect();
        let response_fds: Vec<i32> = self.responses.iter().map(|r| r.raw_fd()).collect();

        // Requests. Readable connections drive the parser; a connection that
        // is neither readable nor errored is left pending.
        for fd in request_fds {
            let flags = flags_for(fd);
            if flags.contains(PollFlags::POLLIN) {
                self.drive_request(fd);
            } else if flags
                .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
            {
                info!("[{}] closing the connection", fd);
                self.requests.retain(|r| r.raw_fd() != fd);
            }
        }

        // Responses.
        for fd in response_fds {
            let flags = flags_for(fd);
            if flags.contains(PollFlags::POLLOUT) {
                self.drive_response(fd);
            } else if flags
                .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
            {
                info!("[{}] closing the connection", fd);
                self.responses.retain(|r| r.raw_fd() != fd);
            }
        }

        // Waiters only ever leave on peer failure or fan-out.
        self.waiters.retain(|w| {
            let flags = flags_for(w.fd.as_raw_fd());
            if flags.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                info!("[{}] closing waiting connection", w.fd.as_raw_fd());
                false
            } else {
                true
            }
        });
    }

    fn accept(&mut self) {
        let (stream, _addr) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
            Err(e) => {
                error!("error in accept(): {}", e);
                return;
            }
        };
        let fd = OwnedFd::from(stream);
        info!("[{}] new request received", fd.as_raw_fd());
        if let Err(e) = super::signals::set_nonblocking(fd.as_raw_fd()) {
            error!("[{}] closing connection: {:#}", fd.as_raw_fd(), e);
            return;
        }
        self.requests.push(Request::new(fd));
    }

    fn drive_request(&mut self, fd: i32) {
        let index = match self.requests.iter().position(|r| r.raw_fd() == fd) {
            Some(index) => index,
            None => return,
        };
        match self.requests[index].drive() {
            Progress::Pending => {}
            Progress::Complete => {
                let mut request = self.requests.swap_remove(index);
                let data = request.take_data();
                let fd = request.into_fd();
                self.dispatch(fd, data);
            }
            Progress::ProtocolError => {
                let request = self.requests.swap_remove(index);
                self.respond(request.into_fd(), Payload::Fixed(PROTOCOL_ERROR));
            }
            Progress::Disconnected => {
                info!("[{}] closing the connection", fd);
                self.requests.swap_remove(index);
            }
        }
    }

    /// Runs a completed frame through decode and the handlers, then moves the
    /// connection to whichever list its outcome demands.
    fn dispatch(&mut self, fd: OwnedFd, data: Vec<Vec<Vec<u8>>>) {
        let raw = fd.as_raw_fd();
        match decode(raw, data).and_then(|cmd| execute(raw, cmd, &mut self.supervisor)) {
            Ok(Outcome::Reply(payload)) => self.respond(fd, payload),
            Ok(Outcome::Park) => {
                info!("[{}] added to the waiting queue", raw);
                self.waiters.push(Waiter {
                    fd,
                    since: Instant::now(),
                });
            }
            Err(Fault::Protocol) => self.respond(fd, Payload::Fixed(PROTOCOL_ERROR)),
            Err(Fault::Internal) => self.respond(fd, Payload::Fixed(INTERNAL_ERROR)),
        }
    }

    fn respond(&mut self, fd: OwnedFd, payload: Payload) {
        self.responses.push(Response::new(fd, payload));
    }

    fn drive_response(&mut self, fd: i32) {
        let index = match self.responses.iter().position(|r| r.raw_fd() == fd) {
            Some(index) => index,
            None => return,
        };
        match self.responses[index].flush() {
            Flush::Pending => {}
            Flush::Done | Flush::Failed => {
                info!("[{}] closing the connection", fd);
                self.responses.swap_remove(index);
            }
        }
    }

    /// Reaps exited children; when a tracked process terminated, every parked
    /// waiter gets a REQUEST OK and the waiter set empties.
    fn reap_and_notify(&mut self) {
        if !self.supervisor.reap() {
            return;
        }
        debug!("notifying waiting connections");
        for waiter in self.waiters.drain(..) {
            debug!(
                "[{}] waited {:?}",
                waiter.fd.as_raw_fd(),
                waiter.since.elapsed()
            );
            self.responses
                .push(Response::new(waiter.fd, Payload::Fixed(REQUEST_OK)));
        }
    }
}

use std::ffi::{CString, OsString};
use std::mem;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::error;

use super::process::valid_name;

/// Faults a handler can produce. Both are answered on the connection and
/// never disturb the rest of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("protocol error")]
    Protocol,
    #[error("internal error")]
    Internal,
}

/// A validated request, decoded from the triple-nested frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Chroot { dir: PathBuf, privileged: bool },
    SetHostname { name: OsString },
    Exec(ExecSpec),
    Start { name: Option<Vec<u8>>, spec: StartSpec },
    Status,
    Wait,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ExecSpec {
    pub argv: Vec<CString>,
    pub env: Vec<CString>,
    pub stdout_path: Vec<u8>,
    pub stderr_path: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct StartSpec {
    pub argv: Vec<CString>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<CString>,
    pub stdout_path: Vec<u8>,
    pub stderr_path: Vec<u8>,
    pub user: Vec<u8>,
    pub group: Vec<u8>,
}

/// Decodes a completed frame. Every shape violation is a protocol fault: the
/// arity of each command is exact, unknown and missing tokens included.
pub fn decode(fd: i32, data: Vec<Vec<Vec<u8>>>) -> Result<Command, Fault> {
    let token = match data.first().and_then(|group| group.first()) {
        Some(token) if !token.is_empty() => token.as_slice(),
        _ => {
            error!("[{}] command is missing from request", fd);
            return Err(Fault::Protocol);
        }
    };
    // Controllers terminate the command token with a newline; it is not part
    // of the name.
    let token = token.strip_suffix(b"\n").unwrap_or(token);

    match token {
        b"CHROOT" => decode_chroot(fd, data),
        b"SETHOSTNAME" => decode_sethostname(fd, data),
        b"EXEC" => decode_exec(fd, data),
        b"START" => decode_start(fd, data),
        b"STATUS" => decode_plain(fd, data, Command::Status),
        b"WAIT" => decode_plain(fd, data, Command::Wait),
        other => {
            error!(
                "[{}] unknown command: {}",
                fd,
                String::from_utf8_lossy(other)
            );
            Err(Fault::Protocol)
        }
    }
}

/// `{ CHROOT, dir, privileged }`
fn decode_chroot(fd: i32, mut data: Vec<Vec<Vec<u8>>>) -> Result<Command, Fault> {
    match &mut data[..] {
        [group] => match &mut group[..] {
            [_token, dir, privileged] => {
                // Only the exact spelling "true" grants a privileged pivot.
                let privileged = &privileged[..] == b"true";
                Ok(Command::Chroot {
                    dir: PathBuf::from(OsString::from_vec(mem::take(dir))),
                    privileged,
                })
            }
            _ => protocol_error(fd),
        },
        _ => protocol_error(fd),
    }
}

/// `{ SETHOSTNAME, name }`
fn decode_sethostname(fd: i32, mut data: Vec<Vec<Vec<u8>>>) -> Result<Command, Fault> {
    match &mut data[..] {
        [group] => match &mut group[..] {
            [_token, name] => Ok(Command::SetHostname {
                name: OsString::from_vec(mem::take(name)),
            }),
            _ => protocol_error(fd),
        },
        _ => protocol_error(fd),
    }
}

/// `{ EXEC }, { cmd, args... }, { env... }, { stdout_fn, stderr_fn }`
fn decode_exec(fd: i32, mut data: Vec<Vec<Vec<u8>>>) -> Result<Command, Fault> {
    match &mut data[..] {
        [header, argv, env, logs] => {
            if header.len() != 1 || argv.is_empty() {
                return protocol_error(fd);
            }
            let (stdout_path, stderr_path) = match &mut logs[..] {
                [stdout_path, stderr_path] => (mem::take(stdout_path), mem::take(stderr_path)),
                _ => return protocol_error(fd),
            };
            Ok(Command::Exec(ExecSpec {
                argv: to_cstrings(fd, mem::take(argv))?,
                env: to_cstrings(fd, mem::take(env))?,
                stdout_path,
                stderr_path,
            }))
        }
        _ => protocol_error(fd),
    }
}

/// `{ START[, name] }, { cmd, args... }, { workdir }, { env... },
/// { stdout_fn, stderr_fn }, { uid, gid }`
fn decode_start(fd: i32, mut data: Vec<Vec<Vec<u8>>>) -> Result<Command, Fault> {
    match &mut data[..] {
        [header, argv, workdir, env, logs, ids] => {
            if header.len() > 2 || argv.is_empty() || workdir.len() > 1 {
                return protocol_error(fd);
            }

            let name = match header.get(1) {
                Some(name) if !name.is_empty() => {
                    if !valid_name(name) {
                        error!("[{}] invalid process name", fd);
                        return Err(Fault::Protocol);
                    }
                    Some(name.clone())
                }
                _ => None,
            };
            let (stdout_path, stderr_path) = match &mut logs[..] {
                [stdout_path, stderr_path] => (mem::take(stdout_path), mem::take(stderr_path)),
                _ => return protocol_error(fd),
            };
            let (user, group) = match &mut ids[..] {
                [user, group] => (mem::take(user), mem::take(group)),
                _ => return protocol_error(fd),
            };
            // Presence is what counts: a present entry is used verbatim, even
            // an empty string (the child's chdir then fails and it exits).
            let workdir = workdir
                .first_mut()
                .map(mem::take)
                .map(|dir| PathBuf::from(OsString::from_vec(dir)));

            Ok(Command::Start {
                name,
                spec: StartSpec {
                    argv: to_cstrings(fd, mem::take(argv))?,
                    workdir,
                    env: to_cstrings(fd, mem::take(env))?,
                    stdout_path,
                    stderr_path,
                    user,
                    group,
                },
            })
        }
        _ => protocol_error(fd),
    }
}

/// `{ TOKEN }` with no arguments at all.
fn decode_plain(fd: i32, data: Vec<Vec<Vec<u8>>>, command: Command) -> Result<Command, Fault> {
    if data.len() != 1 || data[0].len() != 1 {
        return protocol_error(fd);
    }
    Ok(command)
}

fn protocol_error(fd: i32) -> Result<Command, Fault> {
    error!("[{}] protocol error", fd);
    Err(Fault::Protocol)
}

fn to_cstrings(fd: i32, strings: Vec<Vec<u8>>) -> Result<Vec<CString>, Fault> {
    strings
        .into_iter()
        .map(|s| CString::new(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| {
            error!("[{}] argument contains a NUL byte", fd);
            Fault::Protocol
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! frame {
        ($([$($s:expr),* $(,)?]),* $(,)?) => {{
            let groups: Vec<Vec<Vec<u8>>> = vec![$(vec![$($s.to_vec()),*]),*];
            groups
        }};
    }

    #[test]
    fn wait_with_newline_terminated_token() {
        assert_eq!(decode(3, frame![[b"WAIT\n"]]), Ok(Command::Wait));
        assert_eq!(decode(3, frame![[b"WAIT"]]), Ok(Command::Wait));
    }

    #[test]
    fn status_rejects_arguments() {
        assert_eq!(decode(3, frame![[b"STATUS"]]), Ok(Command::Status));
        assert_eq!(decode(3, frame![[b"STATUS", b"x"]]), Err(Fault::Protocol));
        assert_eq!(decode(3, frame![[b"STATUS"], []]), Err(Fault::Protocol));
    }

    #[test]
    fn chroot_requires_exact_arity() {
        // Missing privileged argument.
        assert_eq!(decode(3, frame![[b"CHROOT\n", b"/"]]), Err(Fault::Protocol));
        // Extra argument.
        assert_eq!(
            decode(3, frame![[b"CHROOT", b"/", b"true", b"x"]]),
            Err(Fault::Protocol)
        );
        // Extra group.
        assert_eq!(
            decode(3, frame![[b"CHROOT", b"/", b"true"], []]),
            Err(Fault::Protocol)
        );
    }

    #[test]
    fn chroot_privileged_accepts_only_exact_true() {
        let spellings: &[(&[u8], bool)] = &[
            (b"true", true),
            (b"TRUE", false),
            (b"True", false),
            (b"1", false),
            (b"yes", false),
            (b"true\n", false),
        ];
        for (spelling, expected) in spellings {
            match decode(3, frame![[b"CHROOT", b"/newroot", spelling]]) {
                Ok(Command::Chroot { privileged, .. }) => assert_eq!(privileged, *expected),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn sethostname_shape() {
        assert_eq!(
            decode(3, frame![[b"SETHOSTNAME", b"box"]]),
            Ok(Command::SetHostname {
                name: OsString::from("box")
            })
        );
        assert_eq!(decode(3, frame![[b"SETHOSTNAME"]]), Err(Fault::Protocol));
        assert_eq!(
            decode(3, frame![[b"SETHOSTNAME", b"box", b"extra"]]),
            Err(Fault::Protocol)
        );
    }

    #[test]
    fn exec_shape() {
        let cmd = decode(
            3,
            frame![
                [b"EXEC"],
                [b"/bin/ls", b"-l"],
                [b"HOME=/root"],
                [b"/log/out", b"/log/err"],
            ],
        )
        .unwrap();
        match cmd {
            Command::Exec(spec) => {
                assert_eq!(spec.argv.len(), 2);
                assert_eq!(spec.argv[0].as_bytes(), b"/bin/ls");
                assert_eq!(spec.env.len(), 1);
                assert_eq!(spec.stdout_path, b"/log/out");
                assert_eq!(spec.stderr_path, b"/log/err");
            }
            other => panic!("unexpected: {:?}", other),
        }

        // EXEC itself takes no inline arguments.
        assert_eq!(
            decode(
                3,
                frame![
                    [b"EXEC", b"x"],
                    [b"/bin/ls"],
                    [],
                    [b"/log/out", b"/log/err"],
                ]
            ),
            Err(Fault::Protocol)
        );
        // Command group must not be empty.
        assert_eq!(
            decode(3, frame![[b"EXEC"], [], [], [b"o", b"e"]]),
            Err(Fault::Protocol)
        );
        // Both log paths are required.
        assert_eq!(
            decode(3, frame![[b"EXEC"], [b"/bin/ls"], [], [b"o"]]),
            Err(Fault::Protocol)
        );
    }

    #[test]
    fn start_shape() {
        let cmd = decode(
            3,
            frame![
                [b"START", b"sleep1"],
                [b"/bin/sleep", b"1"],
                [b"/work"],
                [],
                [b"/dev/null", b"/dev/null"],
                [b"0", b"0"],
            ],
        )
        .unwrap();
        match cmd {
            Command::Start { name, spec } => {
                assert_eq!(name.as_deref(), Some(&b"sleep1"[..]));
                assert_eq!(spec.workdir.as_deref(), Some(std::path::Path::new("/work")));
                assert_eq!(spec.user, b"0");
                assert_eq!(spec.group, b"0");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn start_name_is_optional_and_workdir_group_may_be_absent() {
        let cmd = decode(
            3,
            frame![
                [b"START"],
                [b"/bin/true"],
                [],
                [],
                [b"o", b"e"],
                [b"0", b"0"],
            ],
        )
        .unwrap();
        match cmd {
            Command::Start { name, spec } => {
                assert_eq!(name, None);
                assert_eq!(spec.workdir, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn start_keeps_a_present_workdir_verbatim() {
        // An explicitly sent empty string is not the same as an empty group;
        // it reaches the child unchanged and makes its chdir fail there.
        let cmd = decode(
            3,
            frame![
                [b"START"],
                [b"/bin/true"],
                [b""],
                [],
                [b"o", b"e"],
                [b"0", b"0"],
            ],
        )
        .unwrap();
        match cmd {
            Command::Start { spec, .. } => {
                assert_eq!(spec.workdir, Some(PathBuf::new()));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn start_rejects_bad_names() {
        let long_name = vec![b'a'; 101];
        let base = frame![
            [b"START"],
            [b"/bin/true"],
            [],
            [],
            [b"o", b"e"],
            [b"0", b"0"],
        ];
        for bad in [&long_name[..], b"a\nb"] {
            let mut data = base.clone();
            data[0].push(bad.to_vec());
            assert_eq!(decode(3, data), Err(Fault::Protocol));
        }
    }

    #[test]
    fn start_rejects_wrong_group_counts() {
        // Missing the uid/gid group entirely.
        assert_eq!(
            decode(3, frame![[b"START"], [b"/bin/true"], [], [], [b"o", b"e"]]),
            Err(Fault::Protocol)
        );
        // Workdir group with two entries.
        assert_eq!(
            decode(
                3,
                frame![
                    [b"START"],
                    [b"/bin/true"],
                    [b"/a", b"/b"],
                    [],
                    [b"o", b"e"],
                    [b"0", b"0"],
                ]
            ),
            Err(Fault::Protocol)
        );
    }

    #[test]
    fn unknown_and_missing_commands() {
        assert_eq!(decode(3, frame![[b"NOPE"]]), Err(Fault::Protocol));
        assert_eq!(decode(3, frame![[]]), Err(Fault::Protocol));
        assert_eq!(decode(3, frame![[b""]]), Err(Fault::Protocol));
    }

    #[test]
    fn interior_nul_rejected() {
        assert_eq!(
            decode(3, frame![[b"EXEC"], [b"/bin\0/ls"], [], [b"o", b"e"]]),
            Err(Fault::Protocol)
        );
    }
}

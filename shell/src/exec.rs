//! Command execution: redirections, pipelines, `;`/`&&`/`||` sequencing,
//! the five built-ins, and the `spawn` `.b`-suffix fallback.
//!
//! Built-ins run inline in the shell's own process so they can affect its
//! own state (`cd`, `declare`, ...); everything else goes through
//! [`ProcessIo::try_spawn`], which collapses fork+exec+wait into one call
//! since this crate has no real process to fork.
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use snafu::Snafu;

use crate::ast::{Joiner, Line, Pipeline, Redirect, Simple};
use crate::expand::expand;
use crate::history::History;

/// A file descriptor number.
pub type Fd = i32;

/// Standard input.
pub const STDIN: Fd = 0;
/// Standard output.
pub const STDOUT: Fd = 1;

/// Errors raised while running a parsed command line.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum Error {
    /// Neither `name` nor its `.b`-toggled form could be spawned.
    #[snafu(display("{name}: command not found"))]
    NotFound {
        /// The command name that couldn't be resolved.
        name: String,
    },
    /// A redirection target couldn't be opened.
    #[snafu(display("{path}: cannot open"))]
    CannotOpen {
        /// The path that failed to open.
        path: String,
    },
    /// A readonly variable assignment or unset was rejected.
    #[snafu(display("{name}: readonly variable"))]
    ReadonlyVar {
        /// The variable name.
        name: String,
    },
    /// `cd` was given a path that doesn't resolve.
    #[snafu(display("{path}: no such directory"))]
    NoSuchDirectory {
        /// The path that failed to resolve.
        path: String,
    },
}

/// The operating-system surface built-ins and external commands run
/// against. A real binary backs this with syscalls; tests back it with an
/// in-memory fake.
pub trait ProcessIo {
    /// Attempts to spawn exactly `argv[0]` (no suffix fallback — that's
    /// [`spawn_with_fallback`]'s job) with the given stdin/stdout fds,
    /// waits for it, and returns its exit status.
    fn try_spawn(&mut self, argv: &[String], stdin: Fd, stdout: Fd) -> Result<i32, Error>;

    /// Creates a pipe, returning `(read_end, write_end)`.
    fn pipe(&mut self) -> Result<(Fd, Fd), Error>;

    /// Opens `path` for redirection. `append` positions at EOF instead of
    /// truncating.
    fn open_redirect(&mut self, path: &str, append: bool) -> Result<Fd, Error>;

    /// Closes a descriptor returned by [`Self::pipe`]/[`Self::open_redirect`].
    fn close(&mut self, fd: Fd);

    /// The current working directory.
    fn cwd(&self) -> String;

    /// Changes the working directory, resolving `path` against [`Self::cwd`].
    fn set_cwd(&mut self, path: &str) -> Result<(), Error>;

    /// Declares or updates a shell variable.
    fn declare_var(
        &mut self,
        name: &str,
        value: &str,
        readonly: bool,
        exported: bool,
    ) -> Result<(), Error>;

    /// Looks up a variable's value.
    fn get_var(&self, name: &str) -> Option<String>;

    /// Removes a variable.
    fn unset_var(&mut self, name: &str) -> Result<(), Error>;

    /// Writes a line of built-in output (e.g. `pwd`, `history`) to stdout.
    fn write_line(&mut self, line: &str);
}

/// Spawns `argv`, retrying once with the `.b` suffix toggled (stripped if
/// present, appended otherwise) if the first attempt fails.
pub fn spawn_with_fallback<IO: ProcessIo>(
    io: &mut IO,
    argv: &[String],
    stdin: Fd,
    stdout: Fd,
) -> Result<i32, Error> {
    match io.try_spawn(argv, stdin, stdout) {
        Ok(status) => Ok(status),
        Err(_) => {
            let mut toggled = argv.to_vec();
            let name = &argv[0];
            toggled[0] = if let Some(stripped) = name.strip_suffix(".b") {
                stripped.to_string()
            } else {
                format!("{name}.b")
            };
            io.try_spawn(&toggled, stdin, stdout)
                .map_err(|_| Error::NotFound { name: name.clone() })
        }
    }
}

fn expand_argv<IO: ProcessIo>(io: &IO, argv: &[String]) -> Vec<String> {
    argv.iter()
        .map(|w| expand(w, |name| io.get_var(name)))
        .collect()
}

fn run_builtin<IO: ProcessIo>(
    io: &mut IO,
    history: &mut History,
    argv: &[String],
) -> Option<Result<i32, Error>> {
    match argv[0].as_str() {
        "cd" => {
            let target = argv.get(1).map(String::as_str).unwrap_or("/");
            Some(io.set_cwd(target).map(|()| 0))
        }
        "pwd" => {
            let cwd = io.cwd();
            io.write_line(&cwd);
            Some(Ok(0))
        }
        "declare" => {
            let mut readonly = false;
            let mut exported = false;
            let mut rest = &argv[1..];
            while let Some(flag) = rest.first() {
                match flag.as_str() {
                    "-r" => readonly = true,
                    "-x" => exported = true,
                    _ => break,
                }
                rest = &rest[1..];
            }
            let Some(assignment) = rest.first() else {
                return Some(Ok(0));
            };
            let (name, value) = match assignment.split_once('=') {
                Some((n, v)) => (n, v),
                None => (assignment.as_str(), ""),
            };
            Some(io.declare_var(name, value, readonly, exported).map(|()| 0))
        }
        "unset" => {
            let Some(name) = argv.get(1) else {
                return Some(Ok(0));
            };
            Some(io.unset_var(name).map(|()| 0))
        }
        "history" => {
            for entry in history.in_order() {
                io.write_line(entry);
            }
            Some(Ok(0))
        }
        _ => None,
    }
}

fn apply_redirect<IO: ProcessIo>(
    io: &mut IO,
    redirect: &Redirect,
    stdin: &mut Fd,
    stdout: &mut Fd,
    opened: &mut Vec<Fd>,
) -> Result<(), Error> {
    match redirect {
        Redirect::In(path) => {
            let fd = io.open_redirect(path, false)?;
            opened.push(fd);
            *stdin = fd;
        }
        Redirect::Out(path) => {
            let fd = io.open_redirect(path, false)?;
            opened.push(fd);
            *stdout = fd;
        }
        Redirect::Append(path) => {
            let fd = io.open_redirect(path, true)?;
            opened.push(fd);
            *stdout = fd;
        }
    }
    Ok(())
}

fn run_simple<IO: ProcessIo>(
    io: &mut IO,
    history: &mut History,
    simple: &Simple,
    default_stdin: Fd,
    default_stdout: Fd,
) -> Result<i32, Error> {
    let argv = expand_argv(io, &simple.argv);
    let mut stdin = default_stdin;
    let mut stdout = default_stdout;
    let mut opened = Vec::new();
    for redirect in &simple.redirects {
        apply_redirect(io, redirect, &mut stdin, &mut stdout, &mut opened)?;
    }

    let result = if let Some(builtin) = run_builtin(io, history, &argv) {
        builtin
    } else {
        spawn_with_fallback(io, &argv, stdin, stdout)
    };

    for fd in opened {
        io.close(fd);
    }
    result
}

/// Runs a full pipeline left to right, wiring each adjacent pair through a
/// pipe. Returns the last command's exit status, matching shell pipeline
/// semantics.
pub fn run_pipeline<IO: ProcessIo>(
    io: &mut IO,
    history: &mut History,
    pipeline: &Pipeline,
) -> Result<i32, Error> {
    let mut status = 0;
    let mut carried_stdin = STDIN;
    let n = pipeline.commands.len();
    for (i, simple) in pipeline.commands.iter().enumerate() {
        let is_last = i + 1 == n;
        let (stdout, next_stdin) = if is_last {
            (STDOUT, None)
        } else {
            let (read_end, write_end) = io.pipe()?;
            (write_end, Some(read_end))
        };
        status = run_simple(io, history, simple, carried_stdin, stdout)?;
        if !is_last {
            io.close(stdout);
        }
        if carried_stdin != STDIN {
            io.close(carried_stdin);
        }
        if let Some(next) = next_stdin {
            carried_stdin = next;
        }
    }
    Ok(status)
}

/// Runs a full parsed line, honoring `;`/`&&`/`||` short-circuiting, and
/// records it in `history` unless it was whitespace-only.
pub fn run_line<IO: ProcessIo>(
    io: &mut IO,
    history: &mut History,
    raw_line: &str,
    line: &Line,
) -> Result<i32, Error> {
    history.record(raw_line);
    let mut status = run_pipeline(io, history, &line.first)?;
    for (joiner, pipeline) in &line.rest {
        let should_run = match joiner {
            Joiner::Seq => true,
            Joiner::And => status == 0,
            Joiner::Or => status != 0,
        };
        if should_run {
            status = run_pipeline(io, history, pipeline)?;
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    #[derive(Default)]
    struct FakeIo {
        vars: BTreeMap<String, (String, bool)>,
        cwd: String,
        output: Vec<String>,
        next_fd: Fd,
        spawned: Vec<Vec<String>>,
        fail_names: Vec<String>,
    }

    impl FakeIo {
        fn new() -> Self {
            FakeIo {
                cwd: "/".into(),
                next_fd: 2,
                ..Default::default()
            }
        }
    }

    impl ProcessIo for FakeIo {
        fn try_spawn(&mut self, argv: &[String], _stdin: Fd, _stdout: Fd) -> Result<i32, Error> {
            self.spawned.push(argv.to_vec());
            if self.fail_names.contains(&argv[0]) {
                return NotFoundSnafu { name: argv[0].clone() }.fail();
            }
            if argv[0] == "echo" {
                self.output.push(argv[1..].join(" "));
            }
            Ok(0)
        }

        fn pipe(&mut self) -> Result<(Fd, Fd), Error> {
            let r = self.next_fd;
            let w = self.next_fd + 1;
            self.next_fd += 2;
            Ok((r, w))
        }

        fn open_redirect(&mut self, _path: &str, _append: bool) -> Result<Fd, Error> {
            let fd = self.next_fd;
            self.next_fd += 1;
            Ok(fd)
        }

        fn close(&mut self, _fd: Fd) {}

        fn cwd(&self) -> String {
            self.cwd.clone()
        }

        fn set_cwd(&mut self, path: &str) -> Result<(), Error> {
            self.cwd = if let Some(stripped) = path.strip_prefix('/') {
                format!("/{stripped}")
            } else {
                format!("{}/{}", self.cwd.trim_end_matches('/'), path)
            };
            Ok(())
        }

        fn declare_var(
            &mut self,
            name: &str,
            value: &str,
            readonly: bool,
            _exported: bool,
        ) -> Result<(), Error> {
            if let Some((_, ro)) = self.vars.get(name) {
                if *ro {
                    return ReadonlyVarSnafu { name }.fail();
                }
            }
            self.vars.insert(name.into(), (value.into(), readonly));
            Ok(())
        }

        fn get_var(&self, name: &str) -> Option<String> {
            self.vars.get(name).map(|(v, _)| v.clone())
        }

        fn unset_var(&mut self, name: &str) -> Result<(), Error> {
            if let Some((_, true)) = self.vars.get(name) {
                return ReadonlyVarSnafu { name }.fail();
            }
            self.vars.remove(name);
            Ok(())
        }

        fn write_line(&mut self, line: &str) {
            self.output.push(line.to_string());
        }
    }

    fn parse(s: &str) -> Line {
        crate::parser::parse(crate::tokenizer::tokenize(s, |_| String::new())).unwrap()
    }

    #[test]
    fn and_or_short_circuit() {
        let mut io = FakeIo::new();
        io.fail_names.push("false".into());
        let mut h = History::new();
        let line = parse("false && echo a || echo b");
        run_line(&mut io, &mut h, "false && echo a || echo b", &line).unwrap();
        assert_eq!(io.output, vec!["b"]);
    }

    #[test]
    fn declare_then_expand_in_later_word() {
        let mut io = FakeIo::new();
        let mut h = History::new();
        let line = parse("declare NAME=world");
        run_line(&mut io, &mut h, "declare NAME=world", &line).unwrap();
        let line = parse("echo $NAME");
        run_line(&mut io, &mut h, "echo $NAME", &line).unwrap();
        assert_eq!(io.output, vec!["world"]);
    }

    #[test]
    fn readonly_var_rejects_unset() {
        let mut io = FakeIo::new();
        io.declare_var("X", "1", true, false).unwrap();
        assert_eq!(
            io.unset_var("X"),
            Err(Error::ReadonlyVar { name: "X".into() })
        );
    }

    #[test]
    fn pipeline_status_is_the_last_commands() {
        let mut io = FakeIo::new();
        let mut h = History::new();
        let line = parse("echo a | echo b");
        let status = run_line(&mut io, &mut h, "echo a | echo b", &line).unwrap();
        assert_eq!(status, 0);
        assert_eq!(io.output, vec!["a", "b"]);
    }

    #[test]
    fn cd_updates_cwd() {
        let mut io = FakeIo::new();
        let mut h = History::new();
        let line = parse("cd etc");
        run_line(&mut io, &mut h, "cd etc", &line).unwrap();
        assert_eq!(io.cwd(), "/etc");
    }

    #[test]
    fn spawn_retries_with_b_suffix_toggled() {
        let mut io = FakeIo::new();
        io.fail_names.push("tool".into());
        let status = spawn_with_fallback(
            &mut io,
            &["tool".to_string()],
            STDIN,
            STDOUT,
        );
        assert_eq!(status, Ok(0));
        assert_eq!(io.spawned[1][0], "tool.b");
    }
}

use std::convert::Infallible;
use std::ffi::{CString, NulError};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStringExt;

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, ForkResult};
use thiserror::Error;
use tracing::debug;

use crate::error::{PipexError, Result};
use crate::job::StageHandle;
use crate::plan::StagePlan;
use crate::search::Resolver;
use crate::types::Command;

const STDIN: RawFd = libc::STDIN_FILENO;
const STDOUT: RawFd = libc::STDOUT_FILENO;
const FIRST_FREE_FD: RawFd = 3;

/// A command turned into exec arguments before any fork. `program` is
/// `None` when the name did not resolve; that stage still runs and exits 127.
#[derive(Debug, Clone)]
pub struct PreparedCommand {
	name: String,
	program: Option<CString>,
	argv: Vec<CString>,
}

impl PreparedCommand {
	pub fn new(command: &Command, resolver: &Resolver) -> Result<PreparedCommand> {
		let nul = |_: NulError| PipexError::Argument(format!("NUL byte in command: {:?}", command.argv.join(" ")));
		let mut argv = command.argv.iter()
			.map(|a| CString::new(a.as_bytes()))
			.collect::<std::result::Result<Vec<CString>, NulError>>()
			.map_err(nul)?;
		let program = match resolver.lookup(command.name()) {
			Ok(path) => {
				let path = CString::new(path.into_os_string().into_vec()).map_err(nul)?;
				argv[0] = path.clone();
				Some(path)
			},
			Err(e) => {
				debug!(command = command.name(), "{}", e);
				None
			},
		};
		Ok(PreparedCommand { name: command.name().to_string(), program, argv })
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn program(&self) -> Option<&CString> {
		self.program.as_ref()
	}

	pub fn argv(&self) -> &[CString] {
		&self.argv
	}
}

/// Starts one stage of a planned pipeline.
pub trait Spawner {
	fn spawn(&mut self, stage: &StagePlan, envp: &[CString]) -> nix::Result<StageHandle>;
}

/// fork + dup2 + execve.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkSpawner;

impl Spawner for ForkSpawner {
	fn spawn(&mut self, stage: &StagePlan, envp: &[CString]) -> nix::Result<StageHandle> {
		// the child only touches memory prepared before the fork and leaves
		// through execve or _exit
		match unsafe { unistd::fork() }? {
			ForkResult::Parent { child } => {
				debug!(stage = stage.index, pid = %child, command = stage.command.name(), "spawned");
				Ok(StageHandle::new(child, stage.index))
			},
			ForkResult::Child => exec_stage(stage, envp),
		}
	}
}

#[derive(Debug, Error)]
enum ExecError {
	#[error("command not found")]
	NotFound,
	#[error("cannot redirect stdio: {}", .0.desc())]
	Redirect(Errno),
	#[error("{}", .0.desc())]
	Exec(Errno),
}

impl ExecError {
	fn status(&self) -> i32 {
		match *self {
			ExecError::NotFound | ExecError::Exec(Errno::ENOENT) => 127,
			_ => 126,
		}
	}
}

/// Unbuffered, lock-free stderr for use between fork and exec.
struct RawStderr;

impl Write for RawStderr {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, buf.len()) };
		if n < 0 {
			Err(io::Error::last_os_error())
		} else {
			Ok(n as usize)
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// Puts `src` on `target`. A descriptor already in place only loses its
/// close-on-exec flag.
fn install(src: RawFd, target: RawFd) -> nix::Result<()> {
	if src == target {
		fcntl::fcntl(target, FcntlArg::F_SETFD(FdFlag::empty()))?;
	} else {
		unistd::dup2(src, target)?;
	}
	Ok(())
}

fn do_exec_stage(stage: &StagePlan, envp: &[CString]) -> std::result::Result<Infallible, ExecError> {
	// the parent runs with SIGPIPE ignored and that disposition survives exec
	unsafe {
		let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigDfl);
	}

	let stdin = stage.stdin.as_raw_fd();
	let mut stdout = stage.stdout.as_raw_fd();
	if stdout == STDIN && stdin != STDIN {
		stdout = fcntl::fcntl(stdout, FcntlArg::F_DUPFD_CLOEXEC(FIRST_FREE_FD)).map_err(ExecError::Redirect)?;
	}
	install(stdin, STDIN).map_err(ExecError::Redirect)?;
	install(stdout, STDOUT).map_err(ExecError::Redirect)?;

	for &fd in stage.close.iter().chain(&[stdin, stdout, stage.stdout.as_raw_fd()]) {
		if fd != STDIN && fd != STDOUT {
			let _ = unistd::close(fd);
		}
	}

	let program = stage.command.program.as_ref().ok_or(ExecError::NotFound)?;
	unistd::execve(program, &stage.command.argv, envp).map_err(ExecError::Exec)
}

fn exec_stage(stage: &StagePlan, envp: &[CString]) -> ! {
	let err = match do_exec_stage(stage, envp) {
		Ok(never) => match never {},
		Err(e) => e,
	};
	let _ = writeln!(RawStderr, "pipex: {}: {}", stage.command.name, err);
	unsafe { libc::_exit(err.status()) }
}

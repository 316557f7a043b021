use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::PipexError;

/// How a reaped stage ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StageStatus {
	Exited(i32),
	Signaled(Signal),
}

impl StageStatus {
	/// Shell convention: the exit code, or 128 + signal number.
	pub fn code(self) -> i32 {
		match self {
			StageStatus::Exited(code) => code,
			StageStatus::Signaled(sig) => 128 + sig as i32,
		}
	}

	pub fn success(self) -> bool {
		self == StageStatus::Exited(0)
	}
}

impl fmt::Display for StageStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			StageStatus::Exited(code) => write!(f, "exit {}", code),
			StageStatus::Signaled(sig) => write!(f, "killed by {}", sig),
		}
	}
}

trait WaitStatusExt {
	fn stage_status(self) -> Option<StageStatus>;
}

impl WaitStatusExt for WaitStatus {
	fn stage_status(self) -> Option<StageStatus> {
		match self {
			WaitStatus::Exited(_, code) => Some(StageStatus::Exited(code)),
			WaitStatus::Signaled(_, sig, _) => Some(StageStatus::Signaled(sig)),
			_ => None,
		}
	}
}

/// A spawned, not yet reaped stage. Reaping consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct StageHandle {
	pid: Pid,
	index: usize,
}

impl StageHandle {
	pub(crate) fn new(pid: Pid, index: usize) -> StageHandle {
		StageHandle { pid, index }
	}

	pub fn pid(&self) -> Pid {
		self.pid
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn reap(self) -> nix::Result<StageStatus> {
		loop {
			match wait::waitpid(self.pid, None) {
				Ok(status) => {
					if let Some(s) = status.stage_status() {
						return Ok(s);
					}
				},
				Err(Errno::EINTR) => {},
				Err(e) => return Err(e),
			}
		}
	}
}

/// The stages of one pipeline. Whatever is still held when the job is
/// dropped gets SIGKILL and is reaped, so an aborted construction never
/// leaves a child behind.
#[derive(Debug, Default)]
pub struct Job {
	stages: Vec<StageHandle>,
}

impl Job {
	pub fn with_capacity(n: usize) -> Job {
		Job { stages: Vec::with_capacity(n) }
	}

	pub fn push(&mut self, handle: StageHandle) {
		self.stages.push(handle);
	}

	pub fn len(&self) -> usize {
		self.stages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.stages.is_empty()
	}

	pub fn pids(&self) -> Vec<Pid> {
		self.stages.iter().map(|h| h.pid).collect()
	}

	/// Reaps every stage once, in stage order. A failed reap does not stop
	/// the others from being reaped; the first failure is returned.
	pub fn wait(mut self) -> Result<Vec<StageStatus>, PipexError> {
		let handles = std::mem::take(&mut self.stages);
		let mut statuses = Vec::with_capacity(handles.len());
		let mut failure = None;
		for handle in handles {
			let (index, pid) = (handle.index, handle.pid);
			match handle.reap() {
				Ok(status) => {
					debug!(stage = index, %pid, %status, "reaped");
					statuses.push(status);
				},
				Err(e) => {
					warn!(stage = index, %pid, error = %e, "reap failed");
					failure.get_or_insert(PipexError::Reap { stage: index, source: e });
				},
			}
		}
		match failure {
			Some(e) => Err(e),
			None => Ok(statuses),
		}
	}
}

impl Drop for Job {
	fn drop(&mut self) {
		for handle in self.stages.drain(..) {
			let (index, pid) = (handle.index, handle.pid);
			let _ = signal::kill(pid, Signal::SIGKILL);
			match handle.reap() {
				Ok(status) => debug!(stage = index, %pid, %status, "killed and reaped"),
				Err(e) => warn!(stage = index, %pid, error = %e, "reap after kill failed"),
			}
		}
	}
}

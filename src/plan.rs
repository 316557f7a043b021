use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::pipes::PipeSet;
use crate::spawn::PreparedCommand;

/// Every descriptor the orchestrator owns for one pipeline run. Dropping it
/// closes all of them.
#[derive(Debug)]
pub struct Wiring {
	head: OwnedFd,
	feed: Option<OwnedFd>,
	tail: OwnedFd,
	pipes: PipeSet,
}

impl Wiring {
	/// `head` becomes stage 0's stdin and `tail` the last stage's stdout.
	/// `feed` is the parent's write end of a heredoc head, if any.
	pub fn new(head: OwnedFd, feed: Option<OwnedFd>, tail: OwnedFd, pipes: PipeSet) -> Wiring {
		Wiring { head, feed, tail, pipes }
	}

	pub fn stages(&self) -> usize {
		self.pipes.len() + 1
	}

	pub fn raw_fds(&self) -> Vec<RawFd> {
		let mut fds = vec![self.head.as_raw_fd(), self.tail.as_raw_fd()];
		fds.extend(self.feed.as_ref().map(|f| f.as_raw_fd()));
		fds.extend(self.pipes.raw_fds());
		fds
	}

	fn stdin_of(&self, index: usize) -> BorrowedFd<'_> {
		if index == 0 {
			self.head.as_fd()
		} else {
			self.pipes.get(index - 1).read.as_fd()
		}
	}

	fn stdout_of(&self, index: usize) -> BorrowedFd<'_> {
		if index + 1 == self.stages() {
			self.tail.as_fd()
		} else {
			self.pipes.get(index).write.as_fd()
		}
	}

	pub fn take_feed(&mut self) -> Option<OwnedFd> {
		self.feed.take()
	}
}

#[derive(Debug)]
pub struct StagePlan<'a> {
	pub index: usize,
	pub command: &'a PreparedCommand,
	pub stdin: BorrowedFd<'a>,
	pub stdout: BorrowedFd<'a>,
	/// Descriptors the child closes besides its own stdin/stdout sources.
	pub close: Vec<RawFd>,
}

/// Descriptor assignments for every stage, computed once and walked by
/// both spawning and teardown.
#[derive(Debug)]
pub struct PipelinePlan<'a> {
	stages: Vec<StagePlan<'a>>,
}

impl<'a> PipelinePlan<'a> {
	pub(crate) fn new(wiring: &'a Wiring, commands: &'a [PreparedCommand]) -> PipelinePlan<'a> {
		assert_eq!(commands.len(), wiring.stages(), "one command per stage");
		let all = wiring.raw_fds();
		let stages = commands.iter().enumerate().map(|(index, command)| {
			let stdin = wiring.stdin_of(index);
			let stdout = wiring.stdout_of(index);
			let own = [stdin.as_raw_fd(), stdout.as_raw_fd()];
			let close = all.iter().cloned().filter(|fd| !own.contains(fd)).collect();
			StagePlan { index, command, stdin, stdout, close }
		}).collect();
		PipelinePlan { stages }
	}

	pub fn stages(&self) -> &[StagePlan<'a>] {
		&self.stages
	}

	pub fn len(&self) -> usize {
		self.stages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.stages.is_empty()
	}
}

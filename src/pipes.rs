use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd;
use tracing::debug;

/// One OS pipe. Both ends close when dropped.
#[derive(Debug)]
pub struct PipeEndpoint {
	pub read: OwnedFd,
	pub write: OwnedFd,
}

impl PipeEndpoint {
	pub fn open() -> nix::Result<PipeEndpoint> {
		let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
		Ok(PipeEndpoint { read, write })
	}

	pub fn raw_fds(&self) -> [RawFd; 2] {
		[self.read.as_raw_fd(), self.write.as_raw_fd()]
	}
}

/// The N-1 pipes between N stages. Endpoint `i` joins stage `i` to stage `i + 1`.
#[derive(Debug, Default)]
pub struct PipeSet {
	endpoints: Vec<PipeEndpoint>,
}

impl PipeSet {
	pub fn allocate(count: usize) -> nix::Result<PipeSet> {
		PipeSet::allocate_with(count, |_| PipeEndpoint::open())
	}

	/// All-or-nothing: on the first failure every endpoint already made is
	/// dropped, and so closed, before the error is returned.
	pub fn allocate_with<F>(count: usize, mut open: F) -> nix::Result<PipeSet>
		where F: FnMut(usize) -> nix::Result<PipeEndpoint>
	{
		let mut endpoints = Vec::with_capacity(count);
		for k in 0 .. count {
			match open(k) {
				Ok(endpoint) => endpoints.push(endpoint),
				Err(e) => {
					debug!(pipe = k, allocated = endpoints.len(), error = %e, "pipe allocation failed");
					return Err(e);
				},
			}
		}
		Ok(PipeSet { endpoints })
	}

	pub fn len(&self) -> usize {
		self.endpoints.len()
	}

	pub fn is_empty(&self) -> bool {
		self.endpoints.is_empty()
	}

	pub fn get(&self, i: usize) -> &PipeEndpoint {
		&self.endpoints[i]
	}

	pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
		self.endpoints.iter().flat_map(|e| e.raw_fds())
	}
}

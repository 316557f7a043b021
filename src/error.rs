use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	Argument,
	Resource,
	Io,
}

#[derive(Debug, Error)]
pub enum PipexError {
	#[error("{0}")]
	Argument(String),

	#[error("{}: {}", path.display(), source)]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("pipe allocation failed: {0}")]
	Pipe(#[source] nix::Error),

	#[error("failed to spawn stage {stage}: {source}")]
	Spawn {
		stage: usize,
		#[source]
		source: nix::Error,
	},

	#[error("failed to reap stage {stage}: {source}")]
	Reap {
		stage: usize,
		#[source]
		source: nix::Error,
	},
}

impl PipexError {
	pub fn kind(&self) -> ErrorKind {
		match *self {
			PipexError::Argument(..) => ErrorKind::Argument,
			PipexError::Io { .. } => ErrorKind::Io,
			PipexError::Pipe(..) | PipexError::Spawn { .. } | PipexError::Reap { .. } => ErrorKind::Resource,
		}
	}
}

pub type Result<T> = std::result::Result<T, PipexError>;

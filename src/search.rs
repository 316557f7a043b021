use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{self, AccessFlags};
use thiserror::Error;
use tracing::trace;

const PATH_KEY: &str = "PATH";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("command not found: {0}")]
pub struct NotFound(pub String);

/// Resolves program names against a search path captured once.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
	search_path: Option<OsString>,
}

fn is_executable(path: &Path) -> bool {
	let is_file = fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
	is_file && unistd::access(path, AccessFlags::X_OK).is_ok()
}

impl Resolver {
	pub fn new(search_path: Option<OsString>) -> Resolver {
		Resolver { search_path }
	}

	pub fn from_env() -> Resolver {
		Resolver::new(env::var_os(PATH_KEY))
	}

	pub fn search_path(&self) -> Option<&OsStr> {
		self.search_path.as_deref()
	}

	pub fn lookup(&self, name: &str) -> Result<PathBuf, NotFound> {
		if name.is_empty() {
			return Err(NotFound(name.to_string()));
		}
		if name.contains('/') {
			let path = PathBuf::from(name);
			return if is_executable(&path) { Ok(path) } else { Err(NotFound(name.to_string())) };
		}
		let search_path = self.search_path.as_ref().ok_or_else(|| NotFound(name.to_string()))?;
		for dir in env::split_paths(search_path) {
			// empty entries are skipped rather than meaning the cwd
			if dir.as_os_str().is_empty() {
				continue;
			}
			let candidate = dir.join(name);
			trace!(candidate = %candidate.display(), "probing");
			if is_executable(&candidate) {
				return Ok(candidate);
			}
		}
		Err(NotFound(name.to_string()))
	}
}

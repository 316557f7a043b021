use std::env;
use std::ffi::{CString, OsString};
use std::io::{self, IsTerminal};
use std::os::unix::ffi::OsStringExt;

use crate::search;

pub const DEFAULT_OUTPUT_MODE: u32 = 0o644;
pub const HEREDOC_PROMPT: &str = "heredoc> ";

/// Everything read from the process environment, captured once in the
/// parent so that no stage has to consult it after forking.
#[derive(Debug, Clone)]
pub struct State {
	pub resolver: search::Resolver,
	pub envp: Vec<CString>,
	pub output_mode: u32,
	pub heredoc_prompt: Option<String>,
}

fn capture_envp() -> Vec<CString> {
	// variables whose key or value holds a NUL cannot be passed to execve
	env::vars_os()
		.filter_map(|(mut k, v)| {
			k.push(OsString::from("="));
			k.push(v);
			CString::new(k.into_vec()).ok()
		})
		.collect()
}

impl State {
	pub fn new(resolver: search::Resolver) -> State {
		State {
			resolver,
			envp: capture_envp(),
			output_mode: DEFAULT_OUTPUT_MODE,
			heredoc_prompt: None,
		}
	}

	pub fn from_env() -> State {
		let mut state = State::new(search::Resolver::from_env());
		if io::stdin().is_terminal() {
			state.heredoc_prompt = Some(HEREDOC_PROMPT.to_string());
		}
		state
	}

	pub fn with_output_mode(mut self, mode: u32) -> State {
		self.output_mode = mode;
		self
	}

	pub fn with_heredoc_prompt(mut self, prompt: Option<String>) -> State {
		self.heredoc_prompt = prompt;
		self
	}
}

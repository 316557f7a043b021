use std::io::{self, BufRead, Write};

use tracing::{debug, warn};

/// How a heredoc feed ended. `lines` counts lines delivered downstream.
#[derive(Debug)]
pub enum FeedOutcome {
	Delimiter { lines: usize },
	EndOfInput { lines: usize },
	/// The reading stage went away; what was already written stays in the pipe.
	WriteFailed { lines: usize, error: io::Error },
}

impl FeedOutcome {
	pub fn lines(&self) -> usize {
		match *self {
			FeedOutcome::Delimiter { lines } |
			FeedOutcome::EndOfInput { lines } |
			FeedOutcome::WriteFailed { lines, .. } => lines,
		}
	}
}

/// Copies lines from `input` to `output` until a line equal to the
/// delimiter. Only the trailing `\n` is stripped before comparing.
pub struct Feeder<'a> {
	delimiter: &'a [u8],
	prompt: Option<&'a [u8]>,
}

impl<'a> Feeder<'a> {
	pub fn new(delimiter: &'a str) -> Feeder<'a> {
		Feeder { delimiter: delimiter.as_bytes(), prompt: None }
	}

	/// Written to stderr before each line is read.
	pub fn with_prompt(mut self, prompt: Option<&'a str>) -> Feeder<'a> {
		self.prompt = prompt.map(str::as_bytes);
		self
	}

	fn show_prompt(&self) {
		if let Some(prompt) = self.prompt {
			let mut stderr = io::stderr();
			let _ = stderr.write_all(prompt);
			let _ = stderr.flush();
		}
	}

	/// Errors only when reading `input` fails. Write failures end the feed
	/// and are reported through the outcome.
	pub fn feed<R, W>(&self, input: &mut R, output: &mut W) -> io::Result<FeedOutcome>
		where R: BufRead, W: Write
	{
		let mut lines = 0;
		let mut line: Vec<u8> = vec![];
		loop {
			self.show_prompt();
			line.clear();
			if input.read_until(b'\n', &mut line)? == 0 {
				debug!(lines, "heredoc input ended before delimiter");
				return Ok(FeedOutcome::EndOfInput { lines });
			}
			if line.last() == Some(&b'\n') {
				line.pop();
			}
			if line == self.delimiter {
				debug!(lines, "heredoc delimiter reached");
				return Ok(FeedOutcome::Delimiter { lines });
			}
			line.push(b'\n');
			if let Err(error) = output.write_all(&line) {
				warn!(lines, %error, "heredoc write failed, feeding stopped");
				return Ok(FeedOutcome::WriteFailed { lines, error });
			}
			lines += 1;
		}
	}
}

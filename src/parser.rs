use std::path::PathBuf;

use crate::error::{PipexError, Result};
use crate::types::*;

pub const HEREDOC_KEYWORD: &str = "here_doc";
const MIN_ARGS: usize = 4;
const MIN_HEREDOC_ARGS: usize = 5;

pub const USAGE: &str = "\
Usage: pipex file1 cmd1 cmd2 file2
       pipex file1 cmd1 cmd2 cmd3 ... cmdn file2
       pipex here_doc LIMITER cmd1 cmd2 ... cmdn file";

struct Parser<'a> {
	line: &'a str,
	i: usize,
}

impl<'a> Parser<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.as_bytes().get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n')
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Parser::is_whitespace);
	}

	fn read_word(&mut self) -> &'a str {
		let orig = self.i;
		self.proceed_while(|c| !Parser::is_whitespace(c));
		&self.line[orig .. self.i]
	}

	fn parse_command(&mut self) -> Result<Command> {
		let mut argv: Vec<String> = vec![];
		loop {
			self.skip_whitespaces();
			let word = self.read_word();
			if word.is_empty() {
				break;
			}
			argv.push(word.to_string());
		}
		if argv.is_empty() {
			return Err(PipexError::Argument(format!("empty command: {:?}", self.line)));
		}
		Ok(Command { argv })
	}
}

/// Splits a command string on spaces, tabs and newlines. No quoting.
pub fn split_command(line: &str) -> Result<Command> {
	let mut parser = Parser { line, i: 0 };
	parser.parse_command()
}

fn parse_commands(args: &[String]) -> Result<Vec<Command>> {
	args.iter().map(|a| split_command(a)).collect()
}

/// Classifies the positional arguments into the basic or heredoc form.
pub fn parse(args: &[String]) -> Result<Pipeline> {
	if args.first().map(String::as_str) == Some(HEREDOC_KEYWORD) {
		if args.len() < MIN_HEREDOC_ARGS {
			return Err(PipexError::Argument(format!(
				"here_doc needs at least {} arguments, got {}", MIN_HEREDOC_ARGS, args.len())));
		}
		let last = args.len() - 1;
		return Ok(Pipeline {
			commands: parse_commands(&args[2 .. last])?,
			head: HeadSource::Heredoc(args[1].clone()),
			tail: PathBuf::from(&args[last]),
		});
	}

	if args.len() < MIN_ARGS {
		return Err(PipexError::Argument(format!(
			"not enough arguments: need at least {}, got {}", MIN_ARGS, args.len())));
	}
	let last = args.len() - 1;
	Ok(Pipeline {
		commands: parse_commands(&args[1 .. last])?,
		head: HeadSource::File(PathBuf::from(&args[0])),
		tail: PathBuf::from(&args[last]),
	})
}

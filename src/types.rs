use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
	pub argv: Vec<String>,
}

impl Command {
	pub fn name(&self) -> &str {
		&self.argv[0]
	}
}

/// Where stage 0 reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadSource {
	File(PathBuf),
	/// Lines of the invoking process's stdin, up to this delimiter.
	Heredoc(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
	pub commands: Vec<Command>,
	pub head: HeadSource,
	pub tail: PathBuf,
}

impl Pipeline {
	pub fn len(&self) -> usize {
		self.commands.len()
	}

	pub fn is_heredoc(&self) -> bool {
		matches!(self.head, HeadSource::Heredoc(_))
	}
}

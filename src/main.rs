use std::env;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pipex::{eval, global, parser};

const LOG_ENV: &str = "PIPEX_LOG";

/// Run `cmd1 | cmd2 | ... | cmdN` between an input file (or a here-document)
/// and an output file.
#[derive(Debug, Parser)]
#[command(name = "pipex", version)]
struct Cli {
	/// Permission bits, in octal, for a newly created output file
	#[arg(long, default_value = "644", value_parser = parse_mode)]
	mode: u32,

	/// Never print the here-document prompt
	#[arg(long)]
	no_prompt: bool,

	#[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
	args: Vec<String>,
}

fn parse_mode(s: &str) -> Result<u32, String> {
	u32::from_str_radix(s, 8)
		.ok()
		.filter(|m| *m <= 0o7777)
		.ok_or_else(|| format!("invalid octal mode: {}", s))
}

/// Logging stays off unless PIPEX_LOG holds a filter such as `debug`.
fn init_tracing() {
	let Some(directives) = env::var_os(LOG_ENV) else {
		return;
	};
	let filter = EnvFilter::try_new(directives.to_string_lossy())
		.unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

fn usage_error(message: &str) -> ExitCode {
	eprintln!("pipex: {}", message);
	eprintln!("{}", parser::USAGE);
	ExitCode::from(1)
}

fn main() -> ExitCode {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
		Err(e) => {
			let _ = e.print();
			eprintln!("{}", parser::USAGE);
			return ExitCode::from(1);
		},
	};
	init_tracing();

	let pipeline = match parser::parse(&cli.args) {
		Ok(p) => p,
		Err(e) => return usage_error(&e.to_string()),
	};

	let mut state = global::State::from_env().with_output_mode(cli.mode);
	if cli.no_prompt {
		state = state.with_heredoc_prompt(None);
	}

	match eval::run(&state, &pipeline) {
		Ok(report) => ExitCode::from(report.exit_code() as u8),
		Err(e) => {
			error!(kind = ?e.kind(), "{}", e);
			eprintln!("pipex: {}", e);
			ExitCode::from(1)
		},
	}
}

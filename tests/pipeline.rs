//! End-to-end runs of the orchestrator against real programs.
//!
//! Every test here is `#[serial]`: some of them compare the process
//! descriptor table before and after a run.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs;
use std::io::Cursor;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use serial_test::serial;

use pipex::error::{ErrorKind, PipexError};
use pipex::eval::{self, PipelineReport};
use pipex::global::State;
use pipex::heredoc::FeedOutcome;
use pipex::job::{StageHandle, StageStatus};
use pipex::parser::split_command;
use pipex::plan::StagePlan;
use pipex::search::Resolver;
use pipex::spawn::{ForkSpawner, Spawner};
use pipex::types::{HeadSource, Pipeline};

fn state() -> State {
	State::new(Resolver::from_env())
}

fn pipeline(head: HeadSource, commands: &[&str], tail: &Path) -> Pipeline {
	Pipeline {
		commands: commands.iter().map(|c| split_command(c).unwrap()).collect(),
		head,
		tail: tail.to_path_buf(),
	}
}

struct Scratch {
	dir: tempfile::TempDir,
}

impl Scratch {
	fn new() -> Scratch {
		Scratch { dir: tempfile::tempdir().unwrap() }
	}

	fn input(&self, content: &[u8]) -> HeadSource {
		let path = self.dir.path().join("in");
		fs::write(&path, content).unwrap();
		HeadSource::File(path)
	}

	fn output(&self) -> PathBuf {
		self.dir.path().join("out")
	}
}

fn run_file(input: &[u8], commands: &[&str]) -> (PipelineReport, Vec<u8>) {
	let scratch = Scratch::new();
	let p = pipeline(scratch.input(input), commands, &scratch.output());
	let report = eval::run_with(&state(), &p, &mut ForkSpawner, &mut Cursor::new(vec![])).unwrap();
	let output = fs::read(scratch.output()).unwrap();
	(report, output)
}

fn open_fds() -> BTreeSet<String> {
	fs::read_dir("/proc/self/fd").unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
		.collect()
}

fn upper(s: &str) -> String {
	s.to_uppercase()
}

fn lower(s: &str) -> String {
	s.to_lowercase()
}

fn reverse_lines(s: &str) -> String {
	s.lines().rev().map(|l| format!("{}\n", l)).collect()
}

fn head3(s: &str) -> String {
	s.lines().take(3).map(|l| format!("{}\n", l)).collect()
}

#[test]
#[serial]
fn identity_round_trip() {
	let big: Vec<u8> = (0 .. 200_000u32).map(|i| (i % 251) as u8).collect();
	for input in [&b""[..], &b"x"[..], &big[..]] {
		let (report, output) = run_file(input, &["cat"]);
		assert_eq!(report.statuses, vec![StageStatus::Exited(0)]);
		assert_eq!(output, input);
	}
}

#[test]
#[serial]
fn large_input_through_several_pipes() {
	let big: Vec<u8> = (0 .. 300_000u32).map(|i| b'a' + (i % 26) as u8).collect();
	let (report, output) = run_file(&big, &["cat", "cat", "cat"]);
	assert!(report.success());
	assert_eq!(output.len(), big.len());
	assert_eq!(output, big);
}

#[test]
#[serial]
fn stages_compose_in_order() {
	let input = "alpha\nbeta\ngamma\ndelta\nepsilon\n";
	let filters: [(&str, fn(&str) -> String); 5] = [
		("tr a-z A-Z", upper),
		("tac", reverse_lines),
		("head -n 3", head3),
		("tac", reverse_lines),
		("tr A-Z a-z", lower),
	];
	for n in [2, 3, 5] {
		let commands: Vec<&str> = filters[.. n].iter().map(|f| f.0).collect();
		let expected = filters[.. n].iter().fold(input.to_string(), |acc, f| (f.1)(&acc));
		let (report, output) = run_file(input.as_bytes(), &commands);
		assert_eq!(report.statuses.len(), n);
		assert!(report.success(), "{:?}", report.statuses);
		assert_eq!(String::from_utf8(output).unwrap(), expected, "with {} stages", n);
	}
}

#[test]
#[serial]
fn no_descriptor_survives_a_run() {
	let before = open_fds();
	let (report, output) = run_file(b"one\ntwo\n", &["cat", "tac", "cat"]);
	assert!(report.success());
	assert_eq!(output, b"two\none\n");
	assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn heredoc_feeds_until_delimiter() {
	let scratch = Scratch::new();
	let p = pipeline(HeadSource::Heredoc("STOP".to_string()), &["cat", "tr a-z A-Z"], &scratch.output());
	let mut input = Cursor::new(b"a\nb\nSTOP\nc\n".to_vec());
	let before = open_fds();
	let report = eval::run_with(&state(), &p, &mut ForkSpawner, &mut input).unwrap();

	assert_eq!(fs::read(scratch.output()).unwrap(), b"A\nB\n");
	assert!(matches!(report.feed, Some(Ok(FeedOutcome::Delimiter { lines: 2 }))));
	assert_eq!(input.position(), 9);
	assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn heredoc_stops_when_the_reader_exits() {
	let scratch = Scratch::new();
	let p = pipeline(HeadSource::Heredoc("EOF".to_string()), &["head -n 1"], &scratch.output());
	let text: String = (0 .. 100_000).map(|i| format!("line{}\n", i)).collect();
	let mut input = Cursor::new(text.into_bytes());
	let report = eval::run_with(&state(), &p, &mut ForkSpawner, &mut input).unwrap();

	assert!(report.success());
	assert_eq!(fs::read(scratch.output()).unwrap(), b"line0\n");
	match report.feed {
		Some(Ok(FeedOutcome::WriteFailed { lines, .. })) => assert!(lines < 100_000),
		other => panic!("unexpected feed outcome {:?}", other),
	}
}

#[test]
#[serial]
fn unresolvable_stage_is_contained() {
	let started = Instant::now();
	let (report, output) = run_file(b"hi\n", &["cat", "nonexistent_cmd", "cat"]);
	assert_eq!(report.statuses.len(), 3);
	assert_eq!(report.statuses[1], StageStatus::Exited(127));
	assert_eq!(report.statuses[2], StageStatus::Exited(0));
	assert!(output.is_empty());
	assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
#[serial]
fn last_stage_decides_success() {
	let (report, _) = run_file(b"x\n", &["cat", "false"]);
	assert!(!report.success());
	assert_eq!(report.exit_code(), 1);

	let (report, output) = run_file(b"x\n", &["false", "cat"]);
	assert!(report.success());
	assert_eq!(report.exit_code(), 0);
	assert!(output.is_empty());
}

#[test]
#[serial]
fn output_is_truncated() {
	let scratch = Scratch::new();
	fs::write(scratch.output(), b"previous content that is long\n").unwrap();
	let p = pipeline(scratch.input(b"new\n"), &["cat"], &scratch.output());
	eval::run_with(&state(), &p, &mut ForkSpawner, &mut Cursor::new(vec![])).unwrap();
	assert_eq!(fs::read(scratch.output()).unwrap(), b"new\n");
}

#[test]
#[serial]
fn missing_input_fails_before_spawning() {
	let scratch = Scratch::new();
	let missing = HeadSource::File(scratch.dir.path().join("does-not-exist"));
	let p = pipeline(missing, &["cat", "cat"], &scratch.output());
	let before = open_fds();
	let err = eval::run_with(&state(), &p, &mut ForkSpawner, &mut Cursor::new(vec![])).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Io);
	assert!(scratch.output().exists());
	assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn unwritable_output_is_an_io_error() {
	let scratch = Scratch::new();
	let tail = scratch.dir.path().join("no-such-dir").join("out");
	let p = pipeline(scratch.input(b"x"), &["cat"], &tail);
	let err = eval::run_with(&state(), &p, &mut ForkSpawner, &mut Cursor::new(vec![])).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Io);
}

/// Spawns normally until stage `fail_at`, then reports resource exhaustion.
struct FailAt {
	fail_at: usize,
	spawned: Vec<Pid>,
}

impl Spawner for FailAt {
	fn spawn(&mut self, stage: &StagePlan, envp: &[CString]) -> nix::Result<StageHandle> {
		if stage.index == self.fail_at {
			return Err(Errno::EAGAIN);
		}
		let handle = ForkSpawner.spawn(stage, envp)?;
		self.spawned.push(handle.pid());
		Ok(handle)
	}
}

#[test]
#[serial]
fn partial_construction_is_unwound() {
	let scratch = Scratch::new();
	let p = pipeline(scratch.input(b"data\n"), &["sleep 30"; 5], &scratch.output());
	let mut spawner = FailAt { fail_at: 2, spawned: vec![] };
	let before = open_fds();
	let started = Instant::now();

	let err = eval::run_with(&state(), &p, &mut spawner, &mut Cursor::new(vec![])).unwrap_err();

	assert!(started.elapsed() < Duration::from_secs(10));
	assert_eq!(err.kind(), ErrorKind::Resource);
	assert!(matches!(err, PipexError::Spawn { stage: 2, source: Errno::EAGAIN }));
	assert_eq!(spawner.spawned.len(), 2);
	for pid in spawner.spawned {
		// already reaped: the pid is no longer our child
		assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
	}
	assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn spawn_failure_at_first_stage_leaves_nothing() {
	let scratch = Scratch::new();
	let p = pipeline(scratch.input(b""), &["cat", "cat"], &scratch.output());
	let mut spawner = FailAt { fail_at: 0, spawned: vec![] };
	let before = open_fds();
	let err = eval::run_with(&state(), &p, &mut spawner, &mut Cursor::new(vec![])).unwrap_err();
	assert!(matches!(err, PipexError::Spawn { stage: 0, .. }));
	assert!(spawner.spawned.is_empty());
	assert_eq!(open_fds(), before);
}

/// Lowers the soft descriptor limit until dropped.
struct FdLimit {
	soft: libc::rlim_t,
	hard: libc::rlim_t,
}

impl FdLimit {
	/// Leaves exactly `free` unused descriptor slots below the limit.
	fn leaving(free: usize) -> FdLimit {
		let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
		let mut left = free;
		let mut fd: RawFd = 0;
		loop {
			if fcntl(fd, FcntlArg::F_GETFD) == Err(Errno::EBADF) {
				if left == 0 {
					break;
				}
				left -= 1;
			}
			fd += 1;
		}
		setrlimit(Resource::RLIMIT_NOFILE, fd as libc::rlim_t, hard).unwrap();
		FdLimit { soft, hard }
	}
}

impl Drop for FdLimit {
	fn drop(&mut self) {
		let _ = setrlimit(Resource::RLIMIT_NOFILE, self.soft, self.hard);
	}
}

#[test]
#[serial]
fn pipe_exhaustion_releases_opened_files() {
	let scratch = Scratch::new();
	let p = pipeline(scratch.input(b"data\n"), &["cat"; 5], &scratch.output());
	let state = state();
	let before = open_fds();

	// tail, head and two pipes fit; the third pipe does not
	let limit = FdLimit::leaving(7);
	let result = eval::run_with(&state, &p, &mut ForkSpawner, &mut Cursor::new(vec![]));
	drop(limit);

	let err = result.unwrap_err();
	assert!(matches!(err, PipexError::Pipe(Errno::EMFILE)), "{:?}", err);
	assert_eq!(err.kind(), ErrorKind::Resource);
	assert!(scratch.output().exists());
	assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn heredoc_pipe_exhaustion_releases_output() {
	let scratch = Scratch::new();
	let p = pipeline(HeadSource::Heredoc("EOF".to_string()), &["cat", "cat"], &scratch.output());
	let state = state();
	let before = open_fds();

	let limit = FdLimit::leaving(2);
	let result = eval::run_with(&state, &p, &mut ForkSpawner, &mut Cursor::new(b"x\nEOF\n".to_vec()));
	drop(limit);

	assert!(matches!(result, Err(PipexError::Pipe(Errno::EMFILE))), "{:?}", result.map(|r| r.statuses));
	assert_eq!(open_fds(), before);
}

/// Runs the pipeline in a forked copy of this process with `closed` shut
/// beforehand, so the files pipex opens land on those slots. Returns the
/// copy's exit code, 100 for a construction error.
fn run_with_closed(closed: &[RawFd], state: &State, p: &Pipeline) -> i32 {
	match unsafe { unistd::fork() }.unwrap() {
		ForkResult::Child => {
			for &fd in closed {
				let _ = unistd::close(fd);
			}
			let code = match eval::run_with(state, p, &mut ForkSpawner, &mut Cursor::new(vec![])) {
				Ok(report) => report.exit_code(),
				Err(_) => 100,
			};
			unsafe { libc::_exit(code) }
		},
		ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
			WaitStatus::Exited(_, code) => code,
			other => panic!("unexpected wait status {:?}", other),
		},
	}
}

#[test]
#[serial]
fn works_when_standard_descriptors_are_closed() {
	let state = state();
	// [0, 1]: output lands on 0 and input on 1, so the last stage must move
	// its stdout source off 0 before installing stdin.
	// [1]: output lands on 1 and the last stage keeps it in place.
	for closed in [&[0, 1][..], &[1][..]] {
		let scratch = Scratch::new();
		let p = pipeline(scratch.input(b"b\nc\na\n"), &["cat", "sort"], &scratch.output());
		assert_eq!(run_with_closed(closed, &state, &p), 0, "with {:?} closed", closed);
		assert_eq!(fs::read(scratch.output()).unwrap(), b"a\nb\nc\n", "with {:?} closed", closed);
	}
}

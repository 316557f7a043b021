use std::fs::{File, OpenOptions};
use std::io::{self, BufRead};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{PipexError, Result};
use crate::global;
use crate::heredoc::{FeedOutcome, Feeder};
use crate::job::{Job, StageStatus};
use crate::pipes::{PipeEndpoint, PipeSet};
use crate::plan::{PipelinePlan, Wiring};
use crate::spawn::{ForkSpawner, PreparedCommand, Spawner};
use crate::types::{HeadSource, Pipeline};

/// Construction order of a pipeline run. `Failed` is reachable from every
/// phase before `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Initializing,
	SourcesOpen,
	PipesAllocated,
	Spawning(usize),
	ParentCleanup,
	Feeding,
	Reaping,
	Done,
	Failed,
}

#[derive(Debug)]
pub struct PipelineReport {
	/// One entry per stage, in stage order.
	pub statuses: Vec<StageStatus>,
	pub feed: Option<io::Result<FeedOutcome>>,
}

impl PipelineReport {
	/// A pipeline succeeds iff its final stage exited 0.
	pub fn success(&self) -> bool {
		self.statuses.last().map_or(false, |s| s.success())
	}

	pub fn exit_code(&self) -> i32 {
		self.statuses.last().map_or(1, |s| s.code())
	}
}

struct Run {
	phase: Phase,
}

impl Run {
	fn enter(&mut self, phase: Phase) {
		debug!(from = ?self.phase, to = ?phase, "pipeline phase");
		self.phase = phase;
	}
}

fn open_tail(path: &Path, mode: u32) -> Result<OwnedFd> {
	OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(mode)
		.open(path)
		.map(OwnedFd::from)
		.map_err(|source| PipexError::Io { path: path.to_path_buf(), source })
}

fn open_head(path: &Path) -> Result<OwnedFd> {
	File::open(path)
		.map(OwnedFd::from)
		.map_err(|source| PipexError::Io { path: path.to_path_buf(), source })
}

/// Runs the pipeline with fork/exec stages, feeding a heredoc head from
/// this process's stdin.
pub fn run(state: &global::State, pipeline: &Pipeline) -> Result<PipelineReport> {
	let stdin = io::stdin();
	let mut input = stdin.lock();
	run_with(state, pipeline, &mut ForkSpawner, &mut input)
}

pub fn run_with<S, R>(state: &global::State, pipeline: &Pipeline, spawner: &mut S, input: &mut R) -> Result<PipelineReport>
	where S: Spawner, R: BufRead
{
	let mut run = Run { phase: Phase::Initializing };
	let result = execute(&mut run, state, pipeline, spawner, input);
	if let Err(ref e) = result {
		debug!(phase = ?run.phase, error = %e, "pipeline construction failed");
		run.enter(Phase::Failed);
	}
	result
}

fn execute<S, R>(run: &mut Run, state: &global::State, pipeline: &Pipeline, spawner: &mut S, input: &mut R) -> Result<PipelineReport>
	where S: Spawner, R: BufRead
{
	let n = pipeline.len();
	if n == 0 {
		return Err(PipexError::Argument("pipeline has no commands".to_string()));
	}
	let commands = pipeline.commands.iter()
		.map(|c| PreparedCommand::new(c, &state.resolver))
		.collect::<Result<Vec<_>>>()?;
	for c in commands.iter().filter(|c| c.program().is_none()) {
		warn!(command = c.name(), "command not found, its stage will exit 127");
	}

	// declared before the descriptors so it is dropped after them: on an
	// early return every pipe is closed before spawned stages are killed
	let mut job = Job::with_capacity(n);

	let tail = open_tail(&pipeline.tail, state.output_mode)?;
	let (head, feed) = match pipeline.head {
		HeadSource::File(ref path) => (open_head(path)?, None),
		HeadSource::Heredoc(_) => {
			let endpoint = PipeEndpoint::open().map_err(PipexError::Pipe)?;
			(endpoint.read, Some(endpoint.write))
		},
	};
	run.enter(Phase::SourcesOpen);

	let pipes = PipeSet::allocate(n - 1).map_err(PipexError::Pipe)?;
	run.enter(Phase::PipesAllocated);

	let mut wiring = Wiring::new(head, feed, tail, pipes);
	{
		let plan = PipelinePlan::new(&wiring, &commands);
		for stage in plan.stages() {
			run.enter(Phase::Spawning(stage.index));
			let handle = spawner.spawn(stage, &state.envp)
				.map_err(|source| PipexError::Spawn { stage: stage.index, source })?;
			job.push(handle);
		}
	}

	run.enter(Phase::ParentCleanup);
	let feed = wiring.take_feed();
	drop(wiring);

	let feed = match (feed, &pipeline.head) {
		(Some(fd), &HeadSource::Heredoc(ref delimiter)) => {
			run.enter(Phase::Feeding);
			let mut writer = File::from(fd);
			let outcome = Feeder::new(delimiter)
				.with_prompt(state.heredoc_prompt.as_deref())
				.feed(input, &mut writer);
			if let Err(ref e) = outcome {
				warn!(error = %e, "reading heredoc input failed");
			}
			Some(outcome)
		},
		_ => None,
	};

	run.enter(Phase::Reaping);
	let statuses = job.wait()?;
	run.enter(Phase::Done);

	let report = PipelineReport { statuses, feed };
	if report.success() {
		info!(stages = n, statuses = ?report.statuses, "pipeline finished");
	} else {
		warn!(stages = n, statuses = ?report.statuses, "pipeline finished with a failing last stage");
	}
	Ok(report)
}

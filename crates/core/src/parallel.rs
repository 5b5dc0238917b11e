//! Parallel file transfer.
//!
//! When a command runs with `--parallel`, the server hands the client a
//! [`TransferPlan`]. The coordinator splits the plan's records into batches
//! and drains them with a pool of worker threads. Each worker opens its own
//! connection with the initiating session's settings and credentials and runs
//! the plan's sub-command once per batch. A registered
//! [`ParallelTransferCallback`] replaces the worker connections: every batch
//! is handed to the callback instead.
//!
//! Workers stop at their next checkpoint when the initiating command is
//! cancelled. Errors a worker hits are added to the initiating command's
//! error list, tagged with the worker index, followed by one summary record
//! when any worker failed.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use p4_protocol::{ErrorSeverity, ServerReply, TaggedRecord, TransferPlan, codes};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::broadcast::panic_message;
use crate::error::{ConnectFailure, Result};
use crate::registry::{CancelToken, Checkpoint, CommandHandle, CommandId, ParallelSummary};
use crate::results::{ErrorKind, ErrorRecord, ResultEvent};
use crate::session::{LiveConnection, SessionInner};
use crate::transport::{CommandIo, CommandRequest, Flow, TransferOutcome, Transport, TransportFault};

pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_BATCH: usize = 8;
/// Fewer records than this are transferred by a single worker.
pub const DEFAULT_MIN: usize = 9;

/// Worker pool shape parsed from a `--parallel` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
	pub threads: usize,
	/// Records per batch.
	pub batch: usize,
	pub min: usize,
}

impl Default for ParallelOptions {
	fn default() -> Self {
		Self {
			threads: DEFAULT_THREADS,
			batch: DEFAULT_BATCH,
			min: DEFAULT_MIN,
		}
	}
}

impl ParallelOptions {
	/// Reads `--parallel threads=N,batch=M,min=K` (or `--parallel=...`) from command arguments.
	///
	/// A bare number sets the thread count. Unknown keys such as `batchsize`
	/// are accepted and ignored. Returns `None` when there is no `--parallel` argument.
	pub fn from_args(args: &[String]) -> Option<Self> {
		let value = args.iter().enumerate().find_map(|(index, arg)| {
			if arg == "--parallel" {
				Some(args.get(index + 1).map(String::as_str).unwrap_or_default())
			} else {
				arg.strip_prefix("--parallel=")
			}
		})?;

		let mut options = Self::default();
		for part in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
			if let Ok(threads) = part.parse() {
				options.threads = threads;
				continue;
			}
			let Some((key, raw)) = part.split_once('=') else {
				continue;
			};
			let Ok(number) = raw.trim().parse::<usize>() else {
				debug!(target = "p4.parallel", key, raw, "ignoring non-numeric parallel option");
				continue;
			};
			match key.trim() {
				"threads" => options.threads = number,
				"batch" => options.batch = number,
				"min" => options.min = number,
				_ => {}
			}
		}
		Some(options)
	}

	/// Splits `records` into batches.
	///
	/// Everything goes into one batch when parallelism is off or there are fewer than `min` records.
	pub fn partition(&self, records: &[TaggedRecord]) -> Vec<Vec<TaggedRecord>> {
		if records.is_empty() {
			return Vec::new();
		}
		if self.threads <= 1 || records.len() < self.min {
			return vec![records.to_vec()];
		}
		records.chunks(self.batch.max(1)).map(<[TaggedRecord]>::to_vec).collect()
	}
}

/// One batch handed to a [`ParallelTransferCallback`].
#[derive(Debug)]
pub struct TransferBatch<'a> {
	pub command: CommandId,
	pub worker: usize,
	/// Position of the batch in the plan.
	pub batch: usize,
	pub threads: usize,
	pub sub_command: &'a str,
	pub args: &'a [String],
	records: &'a [TaggedRecord],
	cancel: CancelToken,
}

impl TransferBatch<'_> {
	pub fn records(&self) -> impl Iterator<Item = &TaggedRecord> {
		self.records.iter()
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	/// Whether the initiating command has been cancelled.
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDecision {
	Continue,
	/// Stop handing out batches and fail the transfer.
	Abort,
}

/// Handles batches in place of worker connections.
pub type ParallelTransferCallback = Arc<dyn Fn(&TransferBatch<'_>) -> TransferDecision + Send + Sync>;

struct Batch {
	index: usize,
	records: Vec<TaggedRecord>,
}

#[derive(Debug, Default)]
struct WorkerReport {
	errors: Vec<ErrorRecord>,
	batches: usize,
}

impl WorkerReport {
	/// Whether the worker hit a failure of its own, not just the command being stopped.
	fn failed(&self) -> bool {
		self.errors
			.iter()
			.any(|err| err.is_failure() && !matches!(err.kind, ErrorKind::Cancelled | ErrorKind::Timeout))
	}
}

enum Executor {
	Callback(ParallelTransferCallback),
	Connection(Arc<dyn Transport>),
}

/// Shared state of one parallel run.
struct Run<'p> {
	plan: &'p TransferPlan,
	threads: usize,
	queue: Mutex<VecDeque<Batch>>,
	aborted: AtomicBool,
}

struct WorkerCount<'a>(&'a AtomicUsize);

impl<'a> WorkerCount<'a> {
	fn enter(count: &'a AtomicUsize) -> Self {
		count.fetch_add(1, Ordering::SeqCst);
		Self(count)
	}
}

impl Drop for WorkerCount<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Runs a transfer plan on behalf of one command.
pub(crate) struct ParallelTransferCoordinator<'a> {
	session: &'a SessionInner,
	handle: &'a CommandHandle,
	live: &'a LiveConnection,
}

impl<'a> ParallelTransferCoordinator<'a> {
	pub(crate) fn new(session: &'a SessionInner, handle: &'a CommandHandle, live: &'a LiveConnection) -> Self {
		Self { session, handle, live }
	}

	/// Transfers every batch and blocks until all workers have stopped.
	pub(crate) fn run(&self, plan: &TransferPlan, options: &ParallelOptions) -> TransferOutcome {
		let batches = options.partition(&plan.records);
		if batches.is_empty() {
			return TransferOutcome::default();
		}
		let batch_count = batches.len();
		let workers = options.threads.clamp(1, batch_count);
		let run = Run {
			plan,
			threads: workers,
			queue: Mutex::new(batches.into_iter().enumerate().map(|(index, records)| Batch { index, records }).collect()),
			aborted: AtomicBool::new(false),
		};
		let callback = self.session.parallel_callback.read().clone();
		info!(target = "p4.parallel", id = %self.handle.id(), workers, batches = batch_count, callback = callback.is_some(), "parallel transfer started");

		let reports: Vec<WorkerReport> = thread::scope(|scope| {
			let spawned: Vec<_> = (0..workers)
				.map(|index| {
					let (run, callback) = (&run, callback.clone());
					thread::Builder::new()
						.name(format!("p4-parallel-{index}"))
						.spawn_scoped(scope, move || self.worker(index, run, callback))
				})
				.collect();

			spawned
				.into_iter()
				.enumerate()
				.map(|(index, spawned)| match spawned {
					Ok(worker) => worker.join().unwrap_or_else(|panic| WorkerReport {
						errors: vec![worker_error(index, format!("parallel worker panicked: {}", panic_message(panic.as_ref())))],
						batches: 0,
					}),
					Err(err) => WorkerReport {
						errors: vec![worker_error(index, format!("parallel worker could not start: {err}"))],
						batches: 0,
					},
				})
				.collect()
		});

		let failed = reports.iter().filter(|report| report.failed()).count();
		let completed: usize = reports.iter().map(|report| report.batches).sum();
		for record in reports.into_iter().flat_map(|report| report.errors) {
			self.session.deliver(self.handle, ResultEvent::Error(record));
		}
		if failed > 0 {
			self.handle.set_parallel_summary(ParallelSummary { workers, failed });
			let summary = ErrorRecord::new(
				ErrorSeverity::Failed,
				codes::PARALLEL_FAILED,
				format!("{failed} of {workers} parallel transfer workers failed."),
				ErrorKind::Aggregate,
			);
			self.session.deliver(self.handle, ResultEvent::Error(summary));
		}

		let aborted = run.aborted.load(Ordering::SeqCst) || completed < batch_count;
		info!(target = "p4.parallel", id = %self.handle.id(), workers, batches = completed, failed, aborted, "parallel transfer finished");
		TransferOutcome {
			workers,
			batches: completed,
			failed,
			aborted,
		}
	}

	fn worker(&self, index: usize, run: &Run<'_>, callback: Option<ParallelTransferCallback>) -> WorkerReport {
		let _count = WorkerCount::enter(&self.session.parallel_workers);
		let mut report = WorkerReport::default();

		let executor = match callback {
			Some(callback) => Executor::Callback(callback),
			None => match self.open_connection() {
				Ok(transport) => Executor::Connection(transport),
				Err(err) => {
					warn!(target = "p4.parallel", worker = index, error = %err, "worker connection failed");
					report.errors.push(ErrorRecord::from_error(&err).with_worker(index));
					return report;
				}
			},
		};

		loop {
			if self.handle.checkpoint() != Checkpoint::Continue || run.aborted.load(Ordering::SeqCst) {
				break;
			}
			let Some(batch) = run.queue.lock().pop_front() else {
				break;
			};
			trace!(target = "p4.parallel", worker = index, batch = batch.index, records = batch.records.len(), "batch taken");

			let keep_going = match &executor {
				Executor::Callback(callback) => self.hand_to_callback(index, run, callback, &batch, &mut report),
				Executor::Connection(transport) => self.transfer(index, run, transport.as_ref(), batch, &mut report),
			};
			report.batches += 1;
			if !keep_going {
				break;
			}
		}
		let checkpoint = self.handle.checkpoint();
		if checkpoint != Checkpoint::Continue {
			self.drain_queue(index, run, checkpoint, &mut report);
		}
		debug!(target = "p4.parallel", worker = index, batches = report.batches, errors = report.errors.len(), "worker finished");
		report
	}

	/// Takes the batches no worker started and reports them once.
	fn drain_queue(&self, index: usize, run: &Run<'_>, checkpoint: Checkpoint, report: &mut WorkerReport) {
		let left: Vec<Batch> = run.queue.lock().drain(..).collect();
		if left.is_empty() {
			return;
		}
		let records: usize = left.iter().map(|batch| batch.records.len()).sum();
		debug!(target = "p4.parallel", worker = index, batches = left.len(), records, "queued batches dropped");
		report.errors.push(stopped_error(
			index,
			checkpoint,
			format!("{} queued batch(es) with {records} record(s) were not transferred.", left.len()),
		));
	}

	fn open_connection(&self) -> Result<Arc<dyn Transport>> {
		let connection = self.session.connector.connect(&self.live.target)?;
		connection.transport.authenticate(self.live.target.user(), &self.live.auth)?;
		Ok(connection.transport)
	}

	fn hand_to_callback(&self, index: usize, run: &Run<'_>, callback: &ParallelTransferCallback, batch: &Batch, report: &mut WorkerReport) -> bool {
		let view = TransferBatch {
			command: self.handle.id(),
			worker: index,
			batch: batch.index,
			threads: run.threads,
			sub_command: &run.plan.sub_command,
			args: &run.plan.args,
			records: &batch.records,
			cancel: self.handle.cancel_token(),
		};
		match catch_unwind(AssertUnwindSafe(|| callback(&view))) {
			Ok(TransferDecision::Continue) => true,
			Ok(TransferDecision::Abort) => {
				run.aborted.store(true, Ordering::SeqCst);
				report.errors.push(worker_error(index, format!("Parallel transfer aborted by callback at batch {}.", batch.index)));
				false
			}
			Err(panic) => {
				let message = panic_message(panic.as_ref());
				warn!(target = "p4.parallel", worker = index, panic = %message, "transfer callback panicked");
				report.errors.push(worker_error(index, format!("Transfer callback failed: {message}")));
				true
			}
		}
	}

	fn transfer(&self, index: usize, run: &Run<'_>, transport: &dyn Transport, batch: Batch, report: &mut WorkerReport) -> bool {
		let (position, count) = (batch.index, batch.records.len());
		let values = self.live.target.values();
		let request = CommandRequest {
			id: self.handle.id(),
			name: run.plan.sub_command.clone(),
			args: run.plan.args.clone(),
			tagged: true,
			program_name: values.program_name.clone(),
			program_version: values.program_version.clone(),
			protocol: values.protocol.clone(),
			records: batch.records,
		};
		let mut io = WorkerIo {
			handle: self.handle,
			worker: index,
			errors: &mut report.errors,
		};
		match transport.run(&request, &mut io) {
			Ok(()) => true,
			Err(TransportFault::Aborted) => {
				report.errors.push(stopped_error(
					index,
					self.handle.checkpoint(),
					format!("Transfer of batch {position} with {count} record(s) stopped before it finished."),
				));
				false
			}
			Err(TransportFault::Lost(message)) => {
				report.errors.push(
					ErrorRecord::new(ErrorSeverity::Failed, codes::CONNECTION_LOST, message, ErrorKind::Connect(ConnectFailure::ConnectionLost))
						.with_worker(index),
				);
				false
			}
		}
	}
}

fn worker_error(index: usize, message: String) -> ErrorRecord {
	ErrorRecord::new(ErrorSeverity::Failed, codes::PARALLEL_FAILED, message, ErrorKind::Command).with_worker(index)
}

/// Partial-failure record of a worker stopped by its command.
fn stopped_error(index: usize, checkpoint: Checkpoint, message: String) -> ErrorRecord {
	let (code, kind) = match checkpoint {
		Checkpoint::Cancelled => (codes::COMMAND_CANCELLED, ErrorKind::Cancelled),
		Checkpoint::TimedOut => (codes::COMMAND_TIMEOUT, ErrorKind::Timeout),
		Checkpoint::Continue => (codes::PARALLEL_FAILED, ErrorKind::Command),
	};
	ErrorRecord::new(ErrorSeverity::Failed, code, message, kind).with_worker(index)
}

/// [`CommandIo`] for a worker's sub-command: keeps errors, drops other output.
struct WorkerIo<'a> {
	handle: &'a CommandHandle,
	worker: usize,
	errors: &'a mut Vec<ErrorRecord>,
}

impl CommandIo for WorkerIo<'_> {
	fn emit(&mut self, reply: ServerReply) -> Flow {
		match reply {
			ServerReply::Error(err) => self.errors.push(ErrorRecord::from(err).with_worker(self.worker)),
			other => trace!(target = "p4.parallel", worker = self.worker, channel = ?other.channel(), "worker output"),
		}
		self.keepalive()
	}

	fn keepalive(&mut self) -> Flow {
		match self.handle.checkpoint() {
			Checkpoint::Continue => Flow::Continue,
			Checkpoint::Cancelled | Checkpoint::TimedOut => Flow::Abort,
		}
	}

	fn prompt(&mut self, _message: &str, _echo: bool) -> Option<String> {
		None
	}

	fn data_set(&self) -> Option<String> {
		None
	}

	fn parallel_transfer(&mut self, _plan: TransferPlan) -> TransferOutcome {
		TransferOutcome::default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(list: &[&str]) -> Vec<String> {
		list.iter().map(|arg| arg.to_string()).collect()
	}

	fn records(count: usize) -> Vec<TaggedRecord> {
		(0..count).map(|index| TaggedRecord::new().with("depotFile", format!("//depot/f{index}"))).collect()
	}

	#[test]
	fn parses_separate_value_and_ignores_unknown_keys() {
		let options = ParallelOptions::from_args(&args(&["--parallel", "threads=4,batch=8,batchsize=1,min=1,minsize=1", "//depot/..."])).unwrap();
		assert_eq!(options, ParallelOptions { threads: 4, batch: 8, min: 1 });
	}

	#[test]
	fn parses_inline_value_and_bare_thread_count() {
		let options = ParallelOptions::from_args(&args(&["-f", "--parallel=6"])).unwrap();
		assert_eq!(options.threads, 6);
		assert_eq!(options.batch, DEFAULT_BATCH);
	}

	#[test]
	fn no_parallel_flag_means_no_options() {
		assert!(ParallelOptions::from_args(&args(&["-f", "//depot/..."])).is_none());
	}

	#[test]
	fn small_plans_stay_in_one_batch() {
		let options = ParallelOptions { threads: 4, batch: 2, min: 9 };
		assert_eq!(options.partition(&records(5)).len(), 1);
	}

	#[test]
	fn large_plans_split_by_batch_size() {
		let options = ParallelOptions { threads: 4, batch: 3, min: 1 };
		let batches = options.partition(&records(8));
		let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
		assert_eq!(sizes, vec![3, 3, 2]);
	}

	#[test]
	fn empty_plan_has_no_batches() {
		assert!(ParallelOptions::default().partition(&[]).is_empty());
	}
}

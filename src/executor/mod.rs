//! Distributed executor.
//!
//! Any member may submit a task; any member that registered a consumer
//! runner may execute it. The coordinator, the first member of the
//! current view, owns the queue of pending requests and pairs them FIFO
//! with advertised consumers. Ownership of a submission is the pair
//! `(submitter address, request id)`, which also keys the duplicate
//! suppression that makes re-sends after coordinator failover harmless.

mod frame;
mod runner;
mod service;
mod task;

pub use {
	frame::{ExecHeader, Owner},
	runner::{ExecutionRunner, RunnerGuard},
	service::{CompletedTask, CompletionService, ExecutionService, TaskHandle},
	task::{RemoteTask, TaskContext, TaskError, TaskRegistry},
};

pub(crate) use task::TaskOutcome;

use {
	crate::{
		address::Address,
		config::reject_unknown_properties,
		error::ConfigError,
		event::{Event, EventKind},
		message::{Header, Message},
		stack::{Neighbors, Protocol, ProtocolId, UpHandler, registry::BuildContext},
		view::View,
	},
	bytes::Bytes,
	dashmap::DashMap,
	std::{
		any::Any,
		collections::{HashMap, HashSet, VecDeque},
		sync::{
			Arc,
			Mutex,
			atomic::{AtomicBool, AtomicU64, Ordering},
		},
	},
	tokio::sync::{mpsc, watch},
	tokio_util::sync::CancellationToken,
};

/// The executor layer: coordinator queueing and dispatch, submitter
/// ownership tracking, consumer-side task routing.
pub struct CentralExecutor {
	neighbors: Arc<Neighbors>,
	local: Mutex<Option<Address>>,
	members: Mutex<Vec<Address>>,

	next_request_id: AtomicU64,
	next_runner_id: AtomicU64,

	/// Coordinator-role state. One lock guards all four queues so that a
	/// snapshot taken for assertions sees a consistent picture.
	coord: Mutex<CoordinatorState>,

	/// Submitter-role state: outstanding local submissions by request id.
	pending: DashMap<u64, PendingSubmission>,

	/// Consumer-role state: registered local runners by runner id.
	runners: Mutex<HashMap<u64, RunnerSlot>>,

	/// Tasks currently executing on this node, by owner.
	running: Mutex<HashMap<Owner, CancellationToken>>,

	/// Cancellations that arrived before the runner picked the task up.
	pre_cancelled: Mutex<HashSet<Owner>>,

	/// Test hook: swallow outgoing run requests while closed.
	#[cfg(feature = "test-utils")]
	run_requests_paused: AtomicBool,
}

#[derive(Default)]
struct CoordinatorState {
	/// Owners of queued submissions, FIFO. The authoritative record of
	/// who owes whom.
	run_requests: VecDeque<Owner>,

	/// The queued tasks themselves, same order as `run_requests`.
	awaiting_consumer: VecDeque<PendingTask>,

	/// Idle consumer advertisements, FIFO.
	consumers: VecDeque<Owner>,

	/// Dispatched-but-unfinished tasks and the consumer running each.
	dispatched: HashMap<Owner, Owner>,
}

struct PendingTask {
	owner: Owner,
	payload: Bytes,
}

struct PendingSubmission {
	outcome: watch::Sender<Option<TaskOutcome>>,
	dispatched: watch::Sender<bool>,
	/// Kept for re-sending after coordinator failover.
	payload: Bytes,
}

/// What a registered runner receives from the protocol.
pub(crate) struct RunnerRegistration {
	pub consumer: Owner,
	pub tasks: mpsc::UnboundedReceiver<DispatchedTask>,
	pub busy: Arc<AtomicBool>,
}

pub(crate) struct DispatchedTask {
	pub owner: Owner,
	pub payload: Bytes,
}

struct RunnerSlot {
	consumer: Owner,
	tasks: mpsc::UnboundedSender<DispatchedTask>,
	busy: Arc<AtomicBool>,
}

impl CentralExecutor {
	pub const ID: ProtocolId = 4;
	pub const NAME: &'static str = "executor";

	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			neighbors: Arc::new(Neighbors::default()),
			local: Mutex::new(None),
			members: Mutex::new(Vec::new()),
			next_request_id: AtomicU64::new(0),
			next_runner_id: AtomicU64::new(0),
			coord: Mutex::new(CoordinatorState::default()),
			pending: DashMap::new(),
			runners: Mutex::new(HashMap::new()),
			running: Mutex::new(HashMap::new()),
			pre_cancelled: Mutex::new(HashSet::new()),
			#[cfg(feature = "test-utils")]
			run_requests_paused: AtomicBool::new(false),
		})
	}

	pub(crate) fn build(
		cx: &BuildContext,
	) -> Result<Arc<dyn Protocol>, ConfigError> {
		reject_unknown_properties(Self::NAME, &cx.properties, &[])?;
		Ok(Self::new())
	}
}

/// Read-only snapshots of the coordinator queues, taken under the same
/// lock that guards mutation.
impl CentralExecutor {
	pub fn run_requests_snapshot(&self) -> Vec<Owner> {
		let coord = self.coord.lock().expect("executor lock poisoned");
		coord.run_requests.iter().copied().collect()
	}

	pub fn awaiting_consumer_snapshot(&self) -> Vec<Owner> {
		let coord = self.coord.lock().expect("executor lock poisoned");
		coord.awaiting_consumer.iter().map(|t| t.owner).collect()
	}

	pub fn consumers_snapshot(&self) -> Vec<Owner> {
		let coord = self.coord.lock().expect("executor lock poisoned");
		coord.consumers.iter().copied().collect()
	}

	/// Dispatched-but-unfinished tasks as `(owner, consumer)` pairs.
	pub fn dispatched_snapshot(&self) -> Vec<(Owner, Owner)> {
		let coord = self.coord.lock().expect("executor lock poisoned");
		coord.dispatched.iter().map(|(o, c)| (*o, *c)).collect()
	}
}

/// Test hooks.
#[cfg(feature = "test-utils")]
impl CentralExecutor {
	/// Swallows outgoing `RunRequest` frames until resumed; stands in for
	/// a request blocked in transit.
	pub fn pause_run_requests(&self) {
		self.run_requests_paused.store(true, Ordering::SeqCst);
	}

	/// Resumes sending and re-offers every undispatched local submission
	/// to the current coordinator.
	pub fn resume_run_requests(&self) {
		self.run_requests_paused.store(false, Ordering::SeqCst);
		if let Some(coordinator) = self.coordinator() {
			self.resend_pending(coordinator);
		}
	}
}

/// Submitter side.
impl CentralExecutor {
	fn local_address(&self) -> Option<Address> {
		*self.local.lock().expect("executor lock poisoned")
	}

	fn coordinator(&self) -> Option<Address> {
		self
			.members
			.lock()
			.expect("executor lock poisoned")
			.first()
			.copied()
	}

	fn is_coordinator(&self) -> bool {
		let coordinator = self.coordinator();
		coordinator.is_some() && coordinator == self.local_address()
	}

	/// Records a submission and offers it to the coordinator. Returns the
	/// owner plus the watches the handle observes.
	pub(crate) fn submit_raw(
		&self,
		payload: Bytes,
	) -> Result<
		(Owner, watch::Receiver<Option<TaskOutcome>>, watch::Receiver<bool>),
		TaskError,
	> {
		let local = self.local_address().ok_or(TaskError::NotConnected)?;
		let coordinator = self.coordinator().ok_or(TaskError::NotConnected)?;

		let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
		let owner = Owner { address: local, request_id };

		let outcome = watch::Sender::new(None);
		let dispatched = watch::Sender::new(false);
		let outcome_rx = outcome.subscribe();
		let dispatched_rx = dispatched.subscribe();
		self.pending.insert(request_id, PendingSubmission {
			outcome,
			dispatched,
			payload: payload.clone(),
		});

		tracing::debug!(%owner, %coordinator, "submitting task");
		self.send_request(
			coordinator,
			ExecHeader::RunRequest { owner },
			payload,
		);

		Ok((owner, outcome_rx, dispatched_rx))
	}

	/// Asks the coordinator to abandon a submission.
	pub(crate) fn request_cancel(&self, owner: Owner, interrupt: bool) {
		let Some(coordinator) = self.coordinator() else {
			return;
		};
		self.send_request(
			coordinator,
			ExecHeader::CancelRequest { owner, interrupt },
			Bytes::new(),
		);
	}

	fn resolve(&self, owner: Owner, outcome: TaskOutcome) {
		let Some((_, submission)) = self.pending.remove(&owner.request_id)
		else {
			tracing::debug!(%owner, "completion for an unknown submission");
			return;
		};
		submission.outcome.send_replace(Some(outcome));
	}

	/// Re-offers every undispatched, unresolved submission. Duplicate
	/// suppression at the coordinator keys on the owner, so a request
	/// that did arrive earlier is inserted exactly once.
	fn resend_pending(&self, coordinator: Address) {
		let Some(local) = self.local_address() else { return };
		for entry in self.pending.iter() {
			let submission = entry.value();
			if *submission.dispatched.borrow() || submission.outcome.borrow().is_some()
			{
				continue;
			}
			let owner = Owner {
				address: local,
				request_id: *entry.key(),
			};
			tracing::debug!(%owner, %coordinator, "re-sending run request");
			self.send_request(
				coordinator,
				ExecHeader::RunRequest { owner },
				submission.payload.clone(),
			);
		}
	}
}

/// Coordinator side.
impl CentralExecutor {
	fn handle_run_request(&self, owner: Owner, payload: Bytes) {
		let dispatches = {
			let mut coord = self.coord.lock().expect("executor lock poisoned");
			if coord.run_requests.contains(&owner)
				|| coord.dispatched.contains_key(&owner)
			{
				tracing::debug!(%owner, "duplicate run request ignored");
				return;
			}
			coord.run_requests.push_back(owner);
			coord.awaiting_consumer.push_back(PendingTask { owner, payload });
			Self::match_waiting(&mut coord)
		};
		self.send_dispatches(dispatches);
	}

	fn handle_consumer_ready(&self, consumer: Owner) {
		let dispatches = {
			let mut coord = self.coord.lock().expect("executor lock poisoned");
			// a consumer is serial: a fresh advertisement means its
			// previous task finished
			coord.dispatched.retain(|_, c| *c != consumer);
			if !coord.consumers.contains(&consumer) {
				coord.consumers.push_back(consumer);
			}
			Self::match_waiting(&mut coord)
		};
		self.send_dispatches(dispatches);
	}

	fn handle_consumer_unready(&self, consumer: Owner) {
		let mut coord = self.coord.lock().expect("executor lock poisoned");
		coord.consumers.retain(|c| *c != consumer);
	}

	/// Pairs queued tasks with idle consumers, FIFO on both sides.
	fn match_waiting(
		coord: &mut CoordinatorState,
	) -> Vec<(Owner, Owner, Bytes)> {
		let mut dispatches = Vec::new();
		while !coord.consumers.is_empty() && !coord.awaiting_consumer.is_empty()
		{
			let consumer = coord.consumers.pop_front().expect("checked non-empty");
			let task = coord
				.awaiting_consumer
				.pop_front()
				.expect("checked non-empty");
			coord.run_requests.retain(|o| *o != task.owner);
			coord.dispatched.insert(task.owner, consumer);
			dispatches.push((task.owner, consumer, task.payload));
		}
		dispatches
	}

	fn send_dispatches(&self, dispatches: Vec<(Owner, Owner, Bytes)>) {
		for (owner, consumer, payload) in dispatches {
			tracing::debug!(%owner, %consumer, "dispatching task");
			self.send_request(
				consumer.address,
				ExecHeader::TaskDispatch { owner, consumer },
				payload,
			);
		}
	}

	fn handle_cancel_request(&self, owner: Owner, interrupt: bool) {
		enum Action {
			Purged,
			Forward(Address),
			CancelLocally,
			Ignore,
		}

		if !self.is_coordinator() {
			// forwarded by the coordinator to the executing consumer
			self.cancel_local_task(owner);
			return;
		}

		let action = {
			let mut coord = self.coord.lock().expect("executor lock poisoned");
			if coord.awaiting_consumer.iter().any(|t| t.owner == owner) {
				coord.awaiting_consumer.retain(|t| t.owner != owner);
				coord.run_requests.retain(|o| *o != owner);
				Action::Purged
			} else if let Some(consumer) = coord.dispatched.get(&owner).copied() {
				if !interrupt {
					Action::Ignore
				} else if Some(consumer.address) == self.local_address() {
					Action::CancelLocally
				} else {
					Action::Forward(consumer.address)
				}
			} else {
				Action::Ignore
			}
		};

		match action {
			Action::Purged => {
				tracing::debug!(%owner, "cancelled before dispatch");
				self.send_request(
					owner.address,
					ExecHeader::TaskCancelled { owner },
					Bytes::new(),
				);
			}
			Action::Forward(consumer) => {
				self.send_request(
					consumer,
					ExecHeader::CancelRequest { owner, interrupt },
					Bytes::new(),
				);
			}
			Action::CancelLocally => self.cancel_local_task(owner),
			Action::Ignore => {
				tracing::debug!(%owner, interrupt, "cancel request ignored");
			}
		}
	}
}

/// Consumer side.
impl CentralExecutor {
	pub(crate) fn register_runner(
		&self,
	) -> Result<RunnerRegistration, TaskError> {
		let local = self.local_address().ok_or(TaskError::NotConnected)?;
		let runner_id = self.next_runner_id.fetch_add(1, Ordering::SeqCst);
		let consumer = Owner {
			address: local,
			request_id: runner_id,
		};

		let (tx, rx) = mpsc::unbounded_channel();
		let busy = Arc::new(AtomicBool::new(false));
		self
			.runners
			.lock()
			.expect("executor lock poisoned")
			.insert(runner_id, RunnerSlot {
				consumer,
				tasks: tx,
				busy: Arc::clone(&busy),
			});

		self.advertise_ready(consumer);

		Ok(RunnerRegistration {
			consumer,
			tasks: rx,
			busy,
		})
	}

	pub(crate) fn advertise_ready(&self, consumer: Owner) {
		let Some(coordinator) = self.coordinator() else {
			return;
		};
		self.send_request(
			coordinator,
			ExecHeader::ConsumerReady { consumer },
			Bytes::new(),
		);
	}

	pub(crate) fn unregister_runner(&self, consumer: Owner) {
		self
			.runners
			.lock()
			.expect("executor lock poisoned")
			.remove(&consumer.request_id);
		if let Some(coordinator) = self.coordinator() {
			self.send_request(
				coordinator,
				ExecHeader::ConsumerUnready { consumer },
				Bytes::new(),
			);
		}
	}

	pub(crate) fn note_running(&self, owner: Owner, cancel: CancellationToken) {
		if self
			.pre_cancelled
			.lock()
			.expect("executor lock poisoned")
			.remove(&owner)
		{
			cancel.cancel();
		}
		self
			.running
			.lock()
			.expect("executor lock poisoned")
			.insert(owner, cancel);
	}

	pub(crate) fn clear_running(&self, owner: Owner) {
		self
			.running
			.lock()
			.expect("executor lock poisoned")
			.remove(&owner);
	}

	/// Interrupts a task executing on this node, or remembers the
	/// cancellation if the runner has not picked it up yet.
	fn cancel_local_task(&self, owner: Owner) {
		if let Some(cancel) = self
			.running
			.lock()
			.expect("executor lock poisoned")
			.get(&owner)
		{
			tracing::debug!(%owner, "interrupting running task");
			cancel.cancel();
			return;
		}
		self
			.pre_cancelled
			.lock()
			.expect("executor lock poisoned")
			.insert(owner);
	}

	fn handle_task_dispatch(&self, owner: Owner, consumer: Owner, payload: Bytes) {
		// the submitter must stop re-sending this request on failover
		self.send_request(
			owner.address,
			ExecHeader::TaskAccepted { owner },
			Bytes::new(),
		);

		let delivered = {
			let runners = self.runners.lock().expect("executor lock poisoned");
			match runners.get(&consumer.request_id) {
				Some(slot) => {
					slot.tasks.send(DispatchedTask { owner, payload }).is_ok()
				}
				None => false,
			}
		};

		if !delivered {
			tracing::warn!(%owner, %consumer, "dispatch for a departed runner");
			self.send_request(
				owner.address,
				ExecHeader::TaskException { owner },
				crate::encoding::serialize(&"consumer is gone".to_owned()),
			);
		}
	}

	pub(crate) fn send_result(&self, owner: Owner, outcome: &TaskOutcome) {
		let (header, payload) = match outcome {
			TaskOutcome::Ok(bytes) => {
				(ExecHeader::TaskResult { owner }, bytes.clone())
			}
			TaskOutcome::Err(text) => (
				ExecHeader::TaskException { owner },
				crate::encoding::serialize(text),
			),
			TaskOutcome::Cancelled => {
				(ExecHeader::TaskCancelled { owner }, Bytes::new())
			}
		};
		self.send_request(owner.address, header, payload);
	}
}

/// Membership.
impl CentralExecutor {
	fn handle_view_change(&self, view: &View) {
		let old_coordinator = {
			let mut members = self.members.lock().expect("executor lock poisoned");
			let old = members.first().copied();
			members.clear();
			members.extend_from_slice(&view.members);
			old
		};
		let new_coordinator = view.coordinator();
		let local = self.local_address();

		// purge departed members from the coordinator queues
		let failures = {
			let mut coord = self.coord.lock().expect("executor lock poisoned");
			coord.consumers.retain(|c| view.contains(&c.address));
			coord
				.awaiting_consumer
				.retain(|t| view.contains(&t.owner.address));
			coord.run_requests.retain(|o| view.contains(&o.address));

			let mut failures = Vec::new();
			coord.dispatched.retain(|owner, consumer| {
				if view.contains(&consumer.address) {
					return true;
				}
				if view.contains(&owner.address) {
					failures.push(*owner);
				}
				false
			});
			failures
		};

		if new_coordinator.is_some() && new_coordinator == local {
			for owner in failures {
				tracing::warn!(
					%owner,
					"consumer left the group while executing, failing the task"
				);
				self.send_request(
					owner.address,
					ExecHeader::TaskException { owner },
					crate::encoding::serialize(&"consumer left the group".to_owned()),
				);
			}
		}

		// failover: offer outstanding work to the new coordinator
		if old_coordinator != new_coordinator {
			if let Some(coordinator) = new_coordinator {
				self.resend_pending(coordinator);

				let idle: Vec<Owner> = {
					let runners = self.runners.lock().expect("executor lock poisoned");
					runners
						.values()
						.filter(|slot| !slot.busy.load(Ordering::SeqCst))
						.map(|slot| slot.consumer)
						.collect()
				};
				for consumer in idle {
					self.send_request(
						coordinator,
						ExecHeader::ConsumerReady { consumer },
						Bytes::new(),
					);
				}
			}
		}
	}
}

/// Wire plumbing.
impl CentralExecutor {
	fn send_request(&self, dest: Address, header: ExecHeader, payload: Bytes) {
		#[cfg(feature = "test-utils")]
		if matches!(header, ExecHeader::RunRequest { .. })
			&& self.run_requests_paused.load(Ordering::SeqCst)
		{
			tracing::debug!(%dest, "run request swallowed by test gate");
			return;
		}

		let msg = Message::unicast(dest, payload)
			.put_header(Self::ID, Header::Exec(header));
		self.neighbors.pass_down(Event::Msg(msg));
	}

	fn handle_frame(&self, header: ExecHeader, payload: Bytes) {
		match header {
			ExecHeader::RunRequest { owner } => {
				self.handle_run_request(owner, payload);
			}
			ExecHeader::ConsumerReady { consumer } => {
				self.handle_consumer_ready(consumer);
			}
			ExecHeader::ConsumerUnready { consumer } => {
				self.handle_consumer_unready(consumer);
			}
			ExecHeader::TaskDispatch { owner, consumer } => {
				self.handle_task_dispatch(owner, consumer, payload);
			}
			ExecHeader::TaskAccepted { owner } => {
				if let Some(submission) = self.pending.get(&owner.request_id) {
					submission.dispatched.send_replace(true);
				}
			}
			ExecHeader::TaskResult { owner } => {
				self.resolve(owner, TaskOutcome::Ok(payload));
			}
			ExecHeader::TaskException { owner } => {
				let text: String = crate::encoding::deserialize(&payload)
					.unwrap_or_else(|_| "unintelligible task exception".to_owned());
				self.resolve(owner, TaskOutcome::Err(text));
			}
			ExecHeader::TaskCancelled { owner } => {
				self.resolve(owner, TaskOutcome::Cancelled);
			}
			ExecHeader::CancelRequest { owner, interrupt } => {
				self.handle_cancel_request(owner, interrupt);
			}
		}
	}
}

impl UpHandler for CentralExecutor {
	fn up(&self, event: Event) -> Option<Event> {
		match event {
			Event::Msg(msg) => {
				let Some(Header::Exec(header)) = msg.header(Self::ID) else {
					return self.neighbors.pass_up(Event::Msg(msg));
				};
				let header = header.clone();
				self.handle_frame(header, msg.payload().clone());
				None
			}
			Event::ViewChange(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_up(Event::ViewChange(view))
			}
			Event::TmpView(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_up(Event::TmpView(view))
			}
			other => self.neighbors.pass_up(other),
		}
	}
}

impl Protocol for CentralExecutor {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	fn id(&self) -> ProtocolId {
		Self::ID
	}

	fn neighbors(&self) -> &Neighbors {
		&self.neighbors
	}

	fn required_down_services(&self) -> &'static [EventKind] {
		&[EventKind::Msg]
	}

	fn down(&self, event: Event) -> Option<Event> {
		match event {
			Event::ViewChange(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_down(Event::ViewChange(view))
			}
			Event::TmpView(view) => {
				self.handle_view_change(&view);
				self.neighbors.pass_down(Event::TmpView(view))
			}
			Event::SetLocalAddress(addr) => {
				*self.local.lock().expect("executor lock poisoned") = Some(addr);
				self.neighbors.pass_down(Event::SetLocalAddress(addr))
			}
			other => self.neighbors.pass_down(other),
		}
	}

	fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::{
	bank::CounterBank,
	error::{new_error, Error, ErrorKind},
	event::EventConfig,
	regs::RegisterIo,
};

/// Slot index of a request that does not hold a counter.
pub(crate) const UNASSIGNED: usize = usize::MAX;

bitflags! {
	/// Hardware state of a request holding a counter slot.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub(crate) struct HwState: u32 {
		/// The counter is not counting.
		const STOPPED = 1 << 0;
		/// `count` reflects everything the counter saw before it stopped.
		const UPTODATE = 1 << 1;
	}
}

/// Where a [`Request`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	/// Initialised but never opened.
	Uninitialized,
	/// Holds a counter slot; the counter is parked.
	Stopped,
	/// Holds a counter slot and is counting.
	Running,
	/// Closed, the slot has been given back. The request can be opened again.
	Released,
}

/// Configure monitoring request parameters.
///
/// Unless a sample period is given, requests are allocated in counting mode
/// and never deliver samples.
///
/// ```
/// # use iohpm::{BankConfig, GlobalRegistry, RequestConfig, sim::SimRegisters};
/// let bank = BankConfig::default()
///     .dev_name("doc-request-config")
///     .build(SimRegisters::new(8, u64::MAX), GlobalRegistry)?;
///
/// let walks = RequestConfig::default().init(&bank, "g_pt_walks")?;
/// let misses = RequestConfig::default()
///     .sample_period(10_000)
///     .init(&bank, "tlb_miss,did_gscid=3,filter_did_gscid")?;
///
/// assert!(!walks.is_sampling());
/// assert!(misses.is_sampling());
/// #
/// # Ok::<(), iohpm::error::Error>(())
/// ```
#[derive(Debug, Default, Clone)]
pub struct RequestConfig {
	sample_period: Option<u64>,
}

impl RequestConfig {
	/// Deliver a sample every `period` events.
	pub fn sample_period(self, period: u64) -> Self {
		Self {
			sample_period: Some(period),
		}
	}

	/// Parse `event_spec` and initialise a request for it on `bank`.
	///
	/// See [`EventConfig`] for the accepted syntax.
	pub fn init<R: RegisterIo>(
		&self,
		bank: &CounterBank<R>,
		event_spec: impl AsRef<str>,
	) -> Result<Arc<Request>, Error> {
		let config: EventConfig = event_spec.as_ref().parse()?;
		bank.init(config, self.sample_period)
	}
}

/// A logical monitoring request, multiplexed onto one counter of a
/// [`CounterBank`] while open.
///
/// Requests are shared between their owner and the bank's slot table, and are
/// read from interrupt context while the owner reads them, so all mutable
/// state is atomic.
#[derive(Debug)]
pub struct Request {
	config: EventConfig,
	sampling: bool,
	sample_period: u64,

	idx: AtomicUsize,
	state: AtomicU32,
	released: AtomicBool,
	// Odd while the counter and `prev_count` are being replaced.
	reload_seq: AtomicU32,

	last_period: AtomicU64,
	period_left: AtomicI64,
	prev_count: AtomicU64,
	count: AtomicU64,
}

impl Request {
	/// `max_period` is the counter mask of the bank the request will run on.
	pub(crate) fn new(
		config: EventConfig,
		sample_period: Option<u64>,
		max_period: u64,
	) -> Result<Self, Error> {
		config.validate()?;

		let (sampling, period) = match sample_period {
			Some(0) => return Err(new_error(ErrorKind::InvalidPeriod)),
			Some(p) if p > i64::MAX as u64 => return Err(new_error(ErrorKind::InvalidPeriod)),
			Some(p) => (true, p),
			// Keep counting runs well clear of overtaking the last snapshot.
			None => (false, max_period >> 1),
		};

		Ok(Request {
			config,
			sampling,
			sample_period: period,
			idx: AtomicUsize::new(UNASSIGNED),
			state: AtomicU32::new((HwState::STOPPED | HwState::UPTODATE).bits()),
			released: AtomicBool::new(false),
			reload_seq: AtomicU32::new(0),
			last_period: AtomicU64::new(period),
			period_left: AtomicI64::new(period as i64),
			prev_count: AtomicU64::new(0),
			count: AtomicU64::new(0),
		})
	}

	/// The event descriptor this request counts.
	pub fn config(&self) -> EventConfig {
		self.config
	}

	/// True if the request delivers samples on counter overflow.
	pub fn is_sampling(&self) -> bool {
		self.sampling
	}

	/// Events between samples. For counting requests this is the reload
	/// distance used to keep the counter from wrapping unnoticed.
	pub fn sample_period(&self) -> u64 {
		self.sample_period
	}

	/// The period that ended with the most recent sample.
	pub fn last_period(&self) -> u64 {
		self.last_period.load(Ordering::Acquire)
	}

	/// Events remaining until the next sample is due.
	pub fn period_left(&self) -> i64 {
		self.period_left.load(Ordering::Acquire)
	}

	/// The accumulated event count, as of the last read, stop or overflow.
	pub fn count(&self) -> u64 {
		self.count.load(Ordering::Acquire)
	}

	/// The counter slot held by this request.
	pub fn slot(&self) -> Option<usize> {
		match self.idx.load(Ordering::Acquire) {
			UNASSIGNED => None,
			idx => Some(idx),
		}
	}

	/// Where the request is in its lifecycle.
	pub fn state(&self) -> State {
		if self.slot().is_none() {
			if self.released.load(Ordering::Acquire) {
				return State::Released;
			}
			return State::Uninitialized;
		}

		if self.hw_state().contains(HwState::STOPPED) {
			State::Stopped
		} else {
			State::Running
		}
	}

	pub(crate) fn hw_state(&self) -> HwState {
		HwState::from_bits_truncate(self.state.load(Ordering::SeqCst))
	}

	pub(crate) fn set_hw_state(&self, state: HwState) {
		self.state.store(state.bits(), Ordering::SeqCst);
	}

	/// Returns the previous state.
	pub(crate) fn insert_hw_state(&self, state: HwState) -> HwState {
		HwState::from_bits_truncate(self.state.fetch_or(state.bits(), Ordering::SeqCst))
	}

	pub(crate) fn assign(&self, idx: usize) {
		self.idx.store(idx, Ordering::Release);
		self.set_hw_state(HwState::STOPPED | HwState::UPTODATE);
	}

	pub(crate) fn unassign(&self) {
		self.idx.store(UNASSIGNED, Ordering::Release);
		self.released.store(true, Ordering::Release);
	}

	pub(crate) fn set_last_period(&self, period: u64) {
		self.last_period.store(period, Ordering::Release);
	}

	pub(crate) fn set_period_left(&self, left: i64) {
		self.period_left.store(left, Ordering::Release);
	}

	pub(crate) fn set_prev_count(&self, prev: u64) {
		self.prev_count.store(prev, Ordering::SeqCst);
	}

	/// Run `f`, which replaces the counter value and the snapshot together.
	///
	/// [`accumulate`] never pairs a snapshot with a counter value from the
	/// other side of a reload.
	///
	/// [`accumulate`]: #method.accumulate
	pub(crate) fn reload<T, F>(&self, f: F) -> T
	where
		F: FnOnce() -> T,
	{
		self.reload_seq.fetch_add(1, Ordering::SeqCst);
		let ret = f();
		self.reload_seq.fetch_add(1, Ordering::SeqCst);
		ret
	}

	/// Fold the events counted since the last snapshot into the total.
	///
	/// `sample` reads the live counter. The snapshot is only replaced if no
	/// other context replaced it in the meantime; on conflict the counter is
	/// read again, so every event is accounted exactly once without taking a
	/// lock. Returns the delta.
	///
	/// Nothing is folded in while a reload is under way: the reloading
	/// context brought the total up to date before it started.
	pub(crate) fn accumulate<F>(&self, mask: u64, sample: F) -> u64
	where
		F: Fn() -> u64,
	{
		let (prev, now) = loop {
			let seq = self.reload_seq.load(Ordering::SeqCst);
			if seq & 1 != 0 {
				return 0;
			}

			let prev = self.prev_count.load(Ordering::SeqCst);
			let now = sample();
			if self.reload_seq.load(Ordering::SeqCst) != seq {
				continue;
			}

			if self
				.prev_count
				.compare_exchange_weak(prev, now, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				break (prev, now);
			}
		};

		let delta = crate::period::delta(prev, now, mask);
		self.count.fetch_add(delta, Ordering::AcqRel);
		self.period_left.fetch_sub(delta as i64, Ordering::AcqRel);
		delta
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::Event;
	use std::cell::Cell;

	#[test]
	fn test_counting_defaults_to_half_range() {
		let req = Request::new(Event::TlbMiss.into(), None, 0xffff_ffff).unwrap();

		assert!(!req.is_sampling());
		assert_eq!(req.sample_period(), 0x7fff_ffff);
		assert_eq!(req.last_period(), 0x7fff_ffff);
		assert_eq!(req.period_left(), 0x7fff_ffff);
		assert_eq!(req.state(), State::Uninitialized);
		assert_eq!(req.slot(), None);
	}

	#[test]
	fn test_invalid_period() {
		for &p in &[0, i64::MAX as u64 + 1, u64::MAX] {
			let err = Request::new(Event::TlbMiss.into(), Some(p), u64::MAX).unwrap_err();
			assert_eq!(err.kind(), &ErrorKind::InvalidPeriod);
		}
	}

	#[test]
	fn test_invalid_descriptor() {
		let err = Request::new(EventConfig::from_raw(0x100), None, u64::MAX).unwrap_err();
		assert_eq!(err.kind(), &ErrorKind::InvalidEventSpec);
	}

	#[test]
	fn test_state_transitions() {
		let req = Request::new(Event::TlbMiss.into(), Some(10), u64::MAX).unwrap();

		req.assign(3);
		assert_eq!(req.slot(), Some(3));
		assert_eq!(req.state(), State::Stopped);

		req.set_hw_state(HwState::empty());
		assert_eq!(req.state(), State::Running);

		assert_eq!(req.insert_hw_state(HwState::STOPPED), HwState::empty());
		assert_eq!(req.state(), State::Stopped);

		req.unassign();
		assert_eq!(req.state(), State::Released);
	}

	#[test]
	fn test_accumulate_wraps() {
		let req = Request::new(Event::TlbMiss.into(), Some(100), 0xffff).unwrap();
		req.set_prev_count(0xfff0);

		assert_eq!(req.accumulate(0xffff, || 0x10), 0x20);
		assert_eq!(req.count(), 0x20);
		assert_eq!(req.period_left(), 100 - 0x20);

		assert_eq!(req.accumulate(0xffff, || 0x10), 0);
		assert_eq!(req.count(), 0x20);
	}

	#[test]
	fn test_accumulate_retries_on_conflict() {
		let req = Request::new(Event::TlbMiss.into(), Some(100), 0xffff).unwrap();
		let reads = Cell::new(0);

		// Another context folds in 5 events between our snapshot load and the
		// exchange; only the remainder may be counted here.
		let delta = req.accumulate(0xffff, || {
			reads.set(reads.get() + 1);
			if reads.get() == 1 {
				req.prev_count.store(5, Ordering::Release);
				req.count.fetch_add(5, Ordering::AcqRel);
			}
			12
		});

		assert!(reads.get() >= 2);
		assert_eq!(delta, 7);
		assert_eq!(req.count(), 12);
	}

	#[test]
	fn test_accumulate_during_reload() {
		let req = Request::new(Event::TlbMiss.into(), Some(1000), 0xffff_ffff).unwrap();
		req.set_prev_count((-1000i64) as u64);
		req.accumulate(0xffff_ffff, || 0);
		assert_eq!(req.count(), 1000);

		// The counter is already reloaded but the snapshot is not: a read in
		// between must not pair the two.
		let inner = req.reload(|| req.accumulate(0xffff_ffff, || 0xffff_fc18));
		assert_eq!(inner, 0);
		assert_eq!(req.count(), 1000);

		req.reload(|| req.set_prev_count((-1000i64) as u64));
		assert_eq!(req.accumulate(0xffff_ffff, || 0xffff_fc22), 10);
		assert_eq!(req.count(), 1010);
	}

	#[test]
	fn test_accumulate_retries_across_reload() {
		let req = Request::new(Event::TlbMiss.into(), Some(100), 0xffff).unwrap();
		let reads = Cell::new(0);

		// A whole reload lands between the snapshot load and the exchange.
		let delta = req.accumulate(0xffff, || {
			reads.set(reads.get() + 1);
			if reads.get() == 1 {
				req.reload(|| req.set_prev_count(0xff00));
				return 0x0040;
			}
			0xff05
		});

		assert!(reads.get() >= 2);
		assert_eq!(delta, 5);
		assert_eq!(req.count(), 5);
	}
}

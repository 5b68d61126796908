//! The counter bank: slot allocation, request lifecycle and the overflow
//! interrupt handler.
//!
//! A bank owns every piece of mutable state that is not per-request: the
//! bitmap of occupied counters and the table mapping a counter back to the
//! [`Request`] using it. `open` and `close` change them under a spin lock.
//! The interrupt handler never takes a lock: it reads the bitmap and table
//! through atomics, and a closed request is only dropped once no handler can
//! still be looking at it.
//!
//! A request marked stopped is left alone by the handler. `start` programs
//! the counter before clearing the mark; `stop` sets it, then waits for any
//! handler already past its check before touching the registers.

use std::hint::spin_loop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace};
use spin::Mutex;

use crate::{
	counter::{HwState, Request},
	error::{new_error, Error, ErrorKind},
	event::{Event, EventConfig},
	period::next_period,
	registry::Registry,
	regs::{counters_mask, RegisterIo, Registers, MAX_COUNTERS},
};

/// Counters implemented by the hardware performance monitor.
pub const DEFAULT_NUM_COUNTERS: usize = 32;

/// Configure a counter bank.
///
/// ```
/// # use iohpm::{BankConfig, GlobalRegistry, sim::SimRegisters};
/// let bank = BankConfig::default()
///     .dev_name("doc-bank-config")
///     .num_counters(8)
///     .counter_mask(0xffff_ffff)
///     .build(SimRegisters::new(8, 0xffff_ffff), GlobalRegistry)?;
///
/// assert_eq!(bank.name(), "iohpm_doc-bank-config");
/// #
/// # Ok::<(), iohpm::error::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct BankConfig {
	dev_name: String,
	num_counters: usize,
	counter_mask: u64,
}

impl Default for BankConfig {
	fn default() -> Self {
		BankConfig {
			dev_name: String::from("iommu"),
			num_counters: DEFAULT_NUM_COUNTERS,
			counter_mask: u64::MAX,
		}
	}
}

impl BankConfig {
	/// Name of the device owning the bank; the bank registers as
	/// `iohpm_<dev_name>`.
	pub fn dev_name(self, dev_name: impl Into<String>) -> Self {
		Self {
			dev_name: dev_name.into(),
			..self
		}
	}

	/// Number of counters, including the cycle counter. At most 32.
	pub fn num_counters(self, num_counters: usize) -> Self {
		Self {
			num_counters,
			..self
		}
	}

	/// Mask of the implemented counter bits, `2^width - 1`.
	pub fn counter_mask(self, counter_mask: u64) -> Self {
		Self {
			counter_mask,
			..self
		}
	}

	/// Register the bank with `registry` and park every counter.
	///
	/// A registration failure is returned as is and leaves the registers
	/// untouched.
	pub fn build<R, G>(&self, regs: R, registry: G) -> Result<CounterBank<R>, Error>
	where
		R: RegisterIo,
		G: Registry + 'static,
	{
		if self.num_counters == 0 || self.num_counters > MAX_COUNTERS {
			return Err(new_error(ErrorKind::InvalidConfig));
		}

		// A contiguous run of low bits, wide enough to have a half range.
		let mask = self.counter_mask;
		if mask >> 1 == 0 || mask & mask.wrapping_add(1) != 0 {
			return Err(new_error(ErrorKind::InvalidConfig));
		}

		let name = format!("iohpm_{}", self.dev_name);
		if let Err(e) = registry.register(&name, self.num_counters) {
			error!("failed to register {}: {}", name, e);
			return Err(e);
		}

		let bank = CounterBank {
			regs: Registers::new(regs, self.num_counters, mask),
			num_counters: self.num_counters,
			mask,
			owners: Mutex::new(vec![None; self.num_counters]),
			table: (0..self.num_counters)
				.map(|_| AtomicPtr::new(ptr::null_mut()))
				.collect(),
			used: AtomicU32::new(0),
			readers: Readers::default(),
			registry: Box::new(registry),
			registered: true,
			name,
		};

		// Counters start when a request is started.
		bank.regs.stop_all();

		info!("{}: registered with {} counters", bank.name, bank.num_counters);

		Ok(bank)
	}
}

/// Whether an interrupt was raised by this bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
	/// No counter had overflowed; another device on the line raised it.
	None,
	/// At least one overflow was serviced.
	Handled,
}

/// The sampling consumer's verdict on a delivered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleAction {
	/// Keep sampling.
	Continue,
	/// Stop the request, for instance because a sample limit was reached.
	Stop,
}

/// A sample delivered from the overflow handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleData {
	/// The counter that overflowed.
	pub slot: usize,
	/// Events covered by this sample.
	pub period: u64,
}

/// Contexts reading the slot table without the lock.
#[derive(Debug, Default)]
struct Readers(AtomicUsize);

impl Readers {
	fn enter(&self) -> ReadGuard<'_> {
		self.0.fetch_add(1, Ordering::SeqCst);
		ReadGuard(self)
	}

	fn wait_idle(&self) {
		while self.0.load(Ordering::SeqCst) != 0 {
			spin_loop();
		}
	}
}

struct ReadGuard<'a>(&'a Readers);

impl Drop for ReadGuard<'_> {
	fn drop(&mut self) {
		(self.0).0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// A bank of hardware performance-monitor counters shared by any number of
/// monitoring requests.
///
/// Counter 0 counts cycles and is reserved for the [`Event::Cycle`] event; the
/// remaining counters are handed out lowest first. Requests that do not fit
/// are refused with [`ErrorKind::Busy`] and may be opened again later.
///
/// ```
/// # use iohpm::{BankConfig, Event, GlobalRegistry, State, sim::SimRegisters};
/// let sim = SimRegisters::new(4, u64::MAX);
/// let bank = BankConfig::default()
///     .dev_name("doc-counter-bank")
///     .num_counters(4)
///     .build(sim.clone(), GlobalRegistry)?;
///
/// let misses = bank.init(Event::TlbMiss.into(), None)?;
/// assert_eq!(bank.open(&misses, true)?, 1);
/// assert_eq!(misses.state(), State::Running);
///
/// sim.advance(1, 42);
/// assert_eq!(bank.read(&misses), 42);
///
/// bank.close(&misses);
/// assert_eq!(misses.state(), State::Released);
/// #
/// # Ok::<(), iohpm::error::Error>(())
/// ```
pub struct CounterBank<R: RegisterIo> {
	name: String,
	regs: Registers<R>,
	num_counters: usize,
	mask: u64,
	// Strong references to the requests in `table`, changed under the lock.
	owners: Mutex<Vec<Option<Arc<Request>>>>,
	table: Vec<AtomicPtr<Request>>,
	used: AtomicU32,
	readers: Readers,
	registry: Box<dyn Registry>,
	registered: bool,
}

impl<R: RegisterIo> CounterBank<R> {
	/// The name the bank is registered under.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Number of counters, including the cycle counter.
	pub fn num_counters(&self) -> usize {
		self.num_counters
	}

	/// Mask of the implemented counter bits.
	pub fn counter_mask(&self) -> u64 {
		self.mask
	}

	/// Bitmap of the occupied counters.
	pub fn used_counters(&self) -> u32 {
		self.used.load(Ordering::SeqCst)
	}

	/// The request occupying counter `idx`, if any.
	pub fn request_at(&self, idx: usize) -> Option<Arc<Request>> {
		let guard = self.readers.enter();
		let request = self.published(&guard, idx)?;

		// SAFETY: `published` borrows from a strong reference held in
		// `owners`, which outlives the guard.
		unsafe {
			let ptr: *const Request = request;
			Arc::increment_strong_count(ptr);
			Some(Arc::from_raw(ptr))
		}
	}

	fn published<'g>(&self, _guard: &'g ReadGuard<'_>, idx: usize) -> Option<&'g Request> {
		let ptr = self.table.get(idx)?.load(Ordering::SeqCst);

		// SAFETY: a request leaves `owners` only after it left the table and
		// every reader that could have loaded it is gone.
		unsafe { ptr.as_ref() }
	}

	fn holds(&self, request: &Request, idx: usize) -> bool {
		match self.table.get(idx) {
			Some(entry) => ptr::eq(entry.load(Ordering::SeqCst), request),
			None => false,
		}
	}

	/// Create a request counting `config`.
	///
	/// With a `sample_period` the request delivers a sample every
	/// `sample_period` events from [`handle_irq`]. Without, it only counts,
	/// and its counter is reloaded every half counter range so it can never
	/// wrap between two reads unnoticed.
	///
	/// [`handle_irq`]: #method.handle_irq
	pub fn init(&self, config: EventConfig, sample_period: Option<u64>) -> Result<Arc<Request>, Error> {
		let max_period = if config.is_cycle() {
			self.regs.counter_mask(0)
		} else {
			self.regs.counter_mask(1)
		};

		Request::new(config, sample_period, max_period).map(Arc::new)
	}

	/// Assign a counter to `request`, and start it if `start` is set.
	///
	/// Returns the counter index. Fails with [`ErrorKind::Busy`] if no counter
	/// able to count the event is free, and with
	/// [`ErrorKind::AlreadyAssigned`] if the request is already open, on this
	/// bank or another.
	pub fn open(&self, request: &Arc<Request>, start: bool) -> Result<usize, Error> {
		let idx = self.assign(request)?;
		debug!("{}: {} assigned counter {}", self.name, request.config(), idx);

		if start {
			self.start(request);
		}

		Ok(idx)
	}

	fn assign(&self, request: &Arc<Request>) -> Result<usize, Error> {
		let mut owners = self.owners.lock();

		if request.slot().is_some() {
			return Err(new_error(ErrorKind::AlreadyAssigned));
		}

		let used = self.used.load(Ordering::SeqCst);
		let idx = if request.config().is_cycle() {
			// Counter 0 counts cycles and nothing else.
			if used & 1 != 0 {
				return Err(new_error(ErrorKind::Busy));
			}
			0
		} else {
			let free = !used & counters_mask(self.num_counters) & !1;
			if free == 0 {
				return Err(new_error(ErrorKind::Busy));
			}
			free.trailing_zeros() as usize
		};

		request.assign(idx);
		owners[idx] = Some(Arc::clone(request));
		self.table[idx].store(Arc::as_ptr(request) as *mut Request, Ordering::SeqCst);
		self.used.fetch_or(1 << idx, Ordering::SeqCst);

		Ok(idx)
	}

	fn release(&self, request: &Request, idx: usize) {
		let owner = {
			let mut owners = self.owners.lock();

			self.table[idx].store(ptr::null_mut(), Ordering::SeqCst);
			self.used.fetch_and(!(1 << idx), Ordering::SeqCst);
			self.readers.wait_idle();

			request.unassign();
			owners[idx].take()
		};

		drop(owner);
	}

	fn slot_of(&self, request: &Request) -> Option<usize> {
		let idx = match request.slot() {
			Some(idx) => idx,
			None => {
				warn_on_once!(true, "{}: {} used without a counter", self.name, request.config());
				return None;
			}
		};

		if warn_on_once!(
			!self.holds(request, idx),
			"{}: {} holds counter {} of another bank",
			self.name,
			request.config(),
			idx
		) {
			return None;
		}

		Some(idx)
	}

	/// Program the first period, select the event and let the counter run.
	///
	/// Starting a running request is a caller bug: it is reported once and
	/// ignored.
	pub fn start(&self, request: &Request) {
		let idx = match self.slot_of(request) {
			Some(idx) => idx,
			None => return,
		};

		if warn_on_once!(
			!request.hw_state().contains(HwState::STOPPED),
			"{}: counter {} started twice",
			self.name,
			idx
		) {
			return;
		}

		// Stays marked stopped until programmed.
		request.set_hw_state(HwState::STOPPED);

		self.set_period(request, idx);
		self.regs.set_event(idx, request.config().raw());
		self.regs.enable_ovf_intr(idx);

		request.set_hw_state(HwState::empty());
		self.regs.enable_counter(idx);
	}

	/// Park the counter of `request`, folding in its final count if `update`
	/// is set.
	///
	/// Stopping a stopped request is a caller bug: it is reported once and
	/// ignored.
	pub fn stop(&self, request: &Request, update: bool) {
		let idx = match self.slot_of(request) {
			Some(idx) => idx,
			None => return,
		};

		let was = request.insert_hw_state(HwState::STOPPED);
		if warn_on_once!(
			was.contains(HwState::STOPPED),
			"{}: counter {} stopped twice",
			self.name,
			idx
		) {
			return;
		}

		self.readers.wait_idle();
		self.stop_counter(request, idx, update);
	}

	fn stop_counter(&self, request: &Request, idx: usize, update: bool) {
		self.regs.set_event(idx, u64::from(Event::DontCount.id()));
		self.regs.disable_counter(idx);

		if update && !request.hw_state().contains(HwState::UPTODATE) {
			self.update(request, idx);
		}

		request.insert_hw_state(HwState::STOPPED | HwState::UPTODATE);
	}

	/// Fold the events counted so far into the request's total and return it.
	///
	/// Safe to call from any context, including concurrently with
	/// [`handle_irq`] servicing the same request.
	///
	/// [`handle_irq`]: #method.handle_irq
	pub fn read(&self, request: &Request) -> u64 {
		if let Some(idx) = self.slot_of(request) {
			self.update(request, idx);
		}
		request.count()
	}

	/// Stop `request` if it is running, then give its counter back.
	///
	/// The request keeps its count and may be opened again.
	pub fn close(&self, request: &Request) {
		let idx = match self.slot_of(request) {
			Some(idx) => idx,
			None => return,
		};

		if !request.insert_hw_state(HwState::STOPPED).contains(HwState::STOPPED) {
			self.readers.wait_idle();
			self.stop_counter(request, idx, true);
		}

		self.release(request, idx);
		debug!("{}: counter {} released", self.name, idx);
	}

	fn update(&self, request: &Request, idx: usize) -> u64 {
		let mask = self.regs.counter_mask(idx);
		request.accumulate(mask, || self.regs.get_counter(idx))
	}

	/// Reload the counter for the next period. Returns true if the previous
	/// period ended.
	fn set_period(&self, request: &Request, idx: usize) -> bool {
		let period = request.sample_period() as i64;
		let next = next_period(request.period_left(), period, self.regs.counter_mask(idx));

		if next.overflow {
			request.set_period_left(next.left);
			request.set_last_period(request.sample_period());
		}

		request.reload(|| {
			self.regs.set_counter(idx, next.load);
			request.set_prev_count(next.prev);
		});

		next.overflow
	}

	/// Service the bank's overflow interrupt.
	///
	/// Every counter is frozen while the overflowed ones are folded in and
	/// reloaded, then the running counters are restarted together. `deliver`
	/// is handed a sample for every sampling request whose period ended, along
	/// with `ctx` (whatever describes where the interrupt landed), and may ask
	/// for the request to be stopped.
	///
	/// Returns [`IrqReturn::None`] if no counter had overflowed, so a shared
	/// interrupt line can be passed on.
	///
	/// The handler takes no lock and may interrupt any other operation on the
	/// bank. It must not run concurrently with itself on the same bank, and
	/// `deliver` must not start, stop or close requests on this bank; return
	/// [`SampleAction::Stop`] instead.
	pub fn handle_irq<C, F>(&self, ctx: &C, mut deliver: F) -> IrqReturn
	where
		F: FnMut(&Request, &SampleData, &C) -> SampleAction,
	{
		let ovf = self.regs.overflow_status();
		if ovf == 0 {
			return IrqReturn::None;
		}

		let guard = self.readers.enter();
		self.regs.freeze();

		let mut pending = ovf & counters_mask(self.num_counters);
		while pending != 0 {
			let idx = pending.trailing_zeros() as usize;
			pending &= pending - 1;

			let request = match self.published(&guard, idx) {
				Some(request) => request,
				None => {
					warn_on_once!(true, "{}: overflow on free counter {}", self.name, idx);
					continue;
				}
			};

			// Parked by a previous sample limit; its flag stays raised.
			if request.hw_state().contains(HwState::STOPPED) {
				continue;
			}

			if warn_on_once!(
				!request.is_sampling(),
				"{}: overflow on counting request on counter {}",
				self.name,
				idx
			) {
				continue;
			}

			self.update(request, idx);
			if !self.set_period(request, idx) {
				continue;
			}

			let data = SampleData {
				slot: idx,
				period: request.last_period(),
			};
			trace!("{}: counter {} overflowed, period {}", self.name, idx, data.period);

			if deliver(request, &data, ctx) == SampleAction::Stop {
				self.stop_counter(request, idx, false);
				self.regs.disable_ovf_intr(idx);
			}
		}

		self.start_all(&guard);
		self.regs.thaw();

		IrqReturn::Handled
	}

	// Re-arms the running counters; the thaw lets them count again.
	fn start_all(&self, guard: &ReadGuard<'_>) {
		let mut used = self.used.load(Ordering::SeqCst);
		while used != 0 {
			let idx = used.trailing_zeros() as usize;
			used &= used - 1;

			if let Some(request) = self.published(guard, idx) {
				if !request.hw_state().contains(HwState::STOPPED) {
					self.regs.enable_ovf_intr(idx);
				}
			}
		}
	}

	/// Park every occupied counter, disarm its interrupt and unregister the
	/// bank.
	///
	/// Requests still open lose their counter and may be opened on another
	/// bank. Dropping the bank does the same.
	pub fn uninit(mut self) {
		self.teardown();
	}

	fn teardown(&mut self) {
		if !self.registered {
			return;
		}

		let mut used = *self.used.get_mut();
		while used != 0 {
			let idx = used.trailing_zeros() as usize;
			used &= used - 1;

			self.regs.disable_counter(idx);
			self.regs.disable_ovf_intr(idx);
		}

		for entry in &mut self.table {
			*entry.get_mut() = ptr::null_mut();
		}
		*self.used.get_mut() = 0;

		for owner in self.owners.get_mut().iter_mut() {
			if let Some(request) = owner.take() {
				request.unassign();
			}
		}

		self.registry.unregister(&self.name);
		self.registered = false;

		debug!("{}: unregistered", self.name);
	}
}

impl<R: RegisterIo> Drop for CounterBank<R> {
	fn drop(&mut self) {
		self.teardown();
	}
}

impl<R: RegisterIo> std::fmt::Debug for CounterBank<R> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CounterBank")
			.field("name", &self.name)
			.field("num_counters", &self.num_counters)
			.field("mask", &self.mask)
			.field("used", &self.used_counters())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::counter::State;
	use crate::regs::{counter_offset, OVERFLOW_FLAG};
	use crate::sim::SimRegisters;
	use crate::GlobalRegistry;

	struct RefuseAll;

	impl Registry for RefuseAll {
		fn register(&self, _name: &str, _num_counters: usize) -> Result<(), Error> {
			Err(new_error(ErrorKind::Registration))
		}

		fn unregister(&self, _name: &str) {
			unreachable!("never registered")
		}
	}

	fn bank(name: &str, num_counters: usize, mask: u64) -> (SimRegisters, CounterBank<SimRegisters>) {
		let sim = SimRegisters::new(num_counters, mask);
		let bank = BankConfig::default()
			.dev_name(name)
			.num_counters(num_counters)
			.counter_mask(mask)
			.build(sim.clone(), GlobalRegistry)
			.expect("failed to build bank");
		(sim, bank)
	}

	#[test]
	fn test_build_parks_all_counters() {
		let (sim, bank) = bank("bank-test-parks", 8, u64::MAX);

		assert_eq!(sim.inhibit(), 0xff);
		assert!(GlobalRegistry::is_registered("iohpm_bank-test-parks"));

		bank.uninit();
		assert!(!GlobalRegistry::is_registered("iohpm_bank-test-parks"));
	}

	#[test]
	fn test_build_rejects_bad_config() {
		for &(n, mask) in &[(0, u64::MAX), (33, u64::MAX), (8, 0), (8, 1), (8, 0xff00), (8, 0x8000_0001)] {
			let err = BankConfig::default()
				.dev_name("bank-test-bad-config")
				.num_counters(n)
				.counter_mask(mask)
				.build(SimRegisters::new(8, u64::MAX), GlobalRegistry)
				.unwrap_err();
			assert_eq!(err.kind(), &ErrorKind::InvalidConfig, "n={} mask={:#x}", n, mask);
		}
		assert!(!GlobalRegistry::is_registered("iohpm_bank-test-bad-config"));
	}

	#[test]
	fn test_registration_failure_leaves_registers_alone() {
		let sim = SimRegisters::new(4, u64::MAX);
		let err = BankConfig::default()
			.num_counters(4)
			.build(sim.clone(), RefuseAll)
			.unwrap_err();

		assert_eq!(err.kind(), &ErrorKind::Registration);
		assert_eq!(sim.inhibit(), 0);
	}

	#[test]
	fn test_duplicate_bank_name() {
		let (_sim, _bank) = bank("bank-test-dup", 4, u64::MAX);

		let err = BankConfig::default()
			.dev_name("bank-test-dup")
			.num_counters(4)
			.build(SimRegisters::new(4, u64::MAX), GlobalRegistry)
			.unwrap_err();
		assert_eq!(err.kind(), &ErrorKind::AlreadyRegistered);
	}

	#[test]
	fn test_cycle_event_owns_counter_zero() {
		let (_sim, bank) = bank("bank-test-cycle", 4, u64::MAX);

		let a = bank.init(Event::TlbMiss.into(), None).unwrap();
		let cycles = bank.init(Event::Cycle.into(), None).unwrap();
		let more_cycles = bank.init(Event::Cycle.into(), None).unwrap();

		assert_eq!(bank.open(&a, false).unwrap(), 1);
		assert_eq!(bank.open(&cycles, false).unwrap(), 0);
		assert_eq!(bank.open(&more_cycles, false).unwrap_err().kind(), &ErrorKind::Busy);

		bank.close(&cycles);
		assert_eq!(bank.open(&more_cycles, false).unwrap(), 0);
	}

	#[test]
	fn test_open_twice() {
		let (_sim, bank) = bank("bank-test-open-twice", 4, u64::MAX);
		let a = bank.init(Event::TlbMiss.into(), None).unwrap();

		bank.open(&a, false).unwrap();
		assert_eq!(bank.open(&a, false).unwrap_err().kind(), &ErrorKind::AlreadyAssigned);
		assert_eq!(bank.used_counters(), 0b10);
	}

	#[test]
	fn test_start_programs_counter() {
		let (sim, bank) = bank("bank-test-start", 8, 0xffff_ffff);
		let req = bank.init(Event::TlbMiss.into(), Some(1000)).unwrap();

		bank.open(&req, false).unwrap();
		assert_eq!(req.state(), State::Stopped);
		assert_eq!(sim.inhibit(), 0xff);

		bank.start(&req);
		assert_eq!(req.state(), State::Running);
		assert_eq!(sim.counter(1), 0xffff_fc18);
		assert_eq!(sim.event(1), u64::from(Event::TlbMiss.id()));
		assert!(!sim.overflow_flag(1));
		assert_eq!(sim.inhibit(), 0xfd);

		// A second start changes nothing.
		sim.advance(1, 10);
		bank.start(&req);
		assert_eq!(sim.counter(1), 0xffff_fc22);
	}

	#[test]
	fn test_stop_parks_counter() {
		let (sim, bank) = bank("bank-test-stop", 4, u64::MAX);
		let req = bank.init(Event::AtsTransReq.into(), None).unwrap();

		bank.open(&req, true).unwrap();
		sim.advance(1, 25);

		bank.stop(&req, true);
		assert_eq!(req.state(), State::Stopped);
		assert_eq!(req.count(), 25);
		assert_eq!(sim.event(1), 0);
		assert_eq!(sim.inhibit() & 0b10, 0b10);

		// Parked counters ignore events and reads find nothing new.
		sim.advance(1, 25);
		assert_eq!(bank.read(&req), 25);

		// Stopping again is ignored.
		bank.stop(&req, true);
		assert_eq!(req.state(), State::Stopped);
	}

	#[test]
	fn test_restart_continues_count() {
		let (sim, bank) = bank("bank-test-restart", 4, u64::MAX);
		let req = bank.init(Event::TranslatedReq.into(), None).unwrap();

		bank.open(&req, true).unwrap();
		sim.advance(1, 5);
		bank.stop(&req, true);
		bank.start(&req);
		sim.advance(1, 7);

		assert_eq!(bank.read(&req), 12);
	}

	#[test]
	fn test_unassigned_request_is_ignored() {
		let (sim, bank) = bank("bank-test-unassigned", 4, u64::MAX);
		let req = bank.init(Event::TlbMiss.into(), None).unwrap();

		bank.start(&req);
		bank.stop(&req, true);
		bank.close(&req);

		assert_eq!(bank.read(&req), 0);
		assert_eq!(req.state(), State::Uninitialized);
		assert_eq!(sim.inhibit(), 0xf);
	}

	#[test]
	fn test_close_running_request_updates() {
		let (sim, bank) = bank("bank-test-close-running", 4, u64::MAX);
		let req = bank.init(Event::TlbMiss.into(), None).unwrap();

		bank.open(&req, true).unwrap();
		sim.advance(1, 9);
		bank.close(&req);

		assert_eq!(req.count(), 9);
		assert_eq!(req.state(), State::Released);
		assert_eq!(bank.used_counters(), 0);
		assert!(bank.request_at(1).is_none());
		assert_eq!(sim.inhibit(), 0xf);
	}

	#[test]
	fn test_spurious_interrupt() {
		let (_sim, bank) = bank("bank-test-spurious", 4, u64::MAX);

		let ret = bank.handle_irq(&(), |_, _, _| panic!("no sample expected"));
		assert_eq!(ret, IrqReturn::None);
	}

	#[test]
	fn test_cycle_counter_sampling() {
		let (sim, bank) = bank("bank-test-cycle-sampling", 4, u64::MAX);
		let req = bank.init(Event::Cycle.into(), Some(100)).unwrap();

		bank.open(&req, true).unwrap();
		assert_eq!(sim.counter(0), (-100i64) as u64 & !OVERFLOW_FLAG);

		assert!(sim.advance(0, 100));
		assert_eq!(sim.read64(counter_offset(0)), OVERFLOW_FLAG);

		let mut samples = vec![];
		let ret = bank.handle_irq(&(), |_, data, _| {
			samples.push(*data);
			SampleAction::Continue
		});

		assert_eq!(ret, IrqReturn::Handled);
		assert_eq!(samples, vec![SampleData { slot: 0, period: 100 }]);
		assert_eq!(req.count(), 100);
		assert!(!sim.overflow_flag(0));
		assert_eq!(sim.inhibit() & 1, 0);
	}

	#[test]
	fn test_sample_limit_stops_request() {
		let (sim, bank) = bank("bank-test-limit", 4, u64::MAX);
		let a = bank.init(Event::TlbMiss.into(), Some(10)).unwrap();
		let b = bank.init(Event::DdtWalks.into(), Some(10)).unwrap();

		bank.open(&a, true).unwrap();
		bank.open(&b, true).unwrap();

		sim.advance(1, 10);
		sim.advance(2, 10);

		let ret = bank.handle_irq(&(), |req, _, _| {
			if req.config().event() == Some(Event::TlbMiss) {
				SampleAction::Stop
			} else {
				SampleAction::Continue
			}
		});
		assert_eq!(ret, IrqReturn::Handled);

		assert_eq!(a.state(), State::Stopped);
		assert_eq!(b.state(), State::Running);
		assert_eq!(sim.inhibit() & 0b110, 0b010);
		assert!(sim.overflow_flag(1));
		assert!(!sim.overflow_flag(2));

		// The parked request is left alone by later interrupts.
		sim.advance(2, 10);
		let mut delivered = 0;
		bank.handle_irq(&(), |req, _, _| {
			assert_eq!(req.config().event(), Some(Event::DdtWalks));
			delivered += 1;
			SampleAction::Continue
		});
		assert_eq!(delivered, 1);
		assert_eq!(a.count(), 10);
		assert_eq!(b.count(), 20);
	}

	#[test]
	fn test_counting_overflow_is_not_sampled() {
		let (sim, bank) = bank("bank-test-counting-overflow", 4, 0xff);
		let req = bank.init(Event::TlbMiss.into(), None).unwrap();

		bank.open(&req, true).unwrap();
		// Half range of an 8-bit counter.
		assert_eq!(sim.counter(1), 0x81);

		assert!(sim.advance(1, 0x7f));
		let ret = bank.handle_irq(&(), |_, _, _| panic!("counting requests never sample"));

		assert_eq!(ret, IrqReturn::Handled);
		assert_eq!(bank.read(&req), 0x7f);
		assert_eq!(req.state(), State::Running);
	}

	#[test]
	fn test_handler_skips_never_started_requests() {
		let (sim, bank) = bank("bank-test-never-started", 4, u64::MAX);
		let idle = bank.init(Event::TlbMiss.into(), None).unwrap();
		let busy = bank.init(Event::PdtWalks.into(), Some(3)).unwrap();

		bank.open(&idle, false).unwrap();
		bank.open(&busy, true).unwrap();

		sim.advance(2, 3);
		bank.handle_irq(&(), |_, _, _| SampleAction::Continue);

		// Counter 1 was opened but never started: it stays inhibited.
		assert_eq!(sim.inhibit() & 0b110, 0b010);
	}

	#[test]
	fn test_drop_tears_down() {
		let sim;
		let req;
		{
			let (s, bank) = bank("bank-test-drop", 4, u64::MAX);
			sim = s;
			req = bank.init(Event::TlbMiss.into(), Some(10)).unwrap();
			bank.open(&req, true).unwrap();
			assert!(!sim.overflow_flag(1));
		}

		assert!(sim.overflow_flag(1));
		assert_eq!(sim.inhibit() & 0b10, 0b10);
		assert!(!GlobalRegistry::is_registered("iohpm_bank-test-drop"));

		// The request outlives the bank and can move to a new one.
		assert_eq!(req.state(), State::Released);
		assert_eq!(req.slot(), None);
		let (_sim, other) = bank("bank-test-drop-reopen", 4, u64::MAX);
		assert_eq!(other.open(&req, true).unwrap(), 1);
		assert_eq!(req.state(), State::Running);
	}

	#[test]
	fn test_request_of_larger_bank_is_ignored() {
		let (_sim_a, a) = bank("bank-test-foreign-large", 32, u64::MAX);
		let (sim_b, b) = bank("bank-test-foreign-small", 4, u64::MAX);

		let reqs: Vec<_> = (1..=20)
			.map(|_| a.init(Event::TlbMiss.into(), None).unwrap())
			.collect();
		for r in &reqs {
			a.open(r, true).unwrap();
		}
		let far = &reqs[19];
		assert_eq!(far.slot(), Some(20));

		b.start(far);
		b.stop(far, true);
		b.close(far);
		assert_eq!(b.read(far), 0);

		assert_eq!(far.state(), State::Running);
		assert_eq!(a.request_at(20).map(|r| Arc::ptr_eq(&r, far)), Some(true));
		assert_eq!(sim_b.inhibit(), 0xf);
	}

	#[test]
	fn test_request_of_same_size_bank_is_ignored() {
		let (sim_a, a) = bank("bank-test-foreign-a", 4, u64::MAX);
		let (sim_b, b) = bank("bank-test-foreign-b", 4, u64::MAX);

		let ra = a.init(Event::TlbMiss.into(), None).unwrap();
		let rb = b.init(Event::DdtWalks.into(), None).unwrap();
		a.open(&ra, true).unwrap();
		b.open(&rb, true).unwrap();
		assert_eq!(ra.slot(), rb.slot());

		sim_a.advance(1, 3);
		sim_b.advance(1, 4);

		b.stop(&ra, true);
		b.close(&ra);

		assert_eq!(b.used_counters(), 0b10);
		assert_eq!(rb.state(), State::Running);
		assert_eq!(sim_b.event(1), u64::from(Event::DdtWalks.id()));
		assert_eq!(sim_b.inhibit(), 0b1101);
		assert_eq!(b.read(&rb), 4);

		assert_eq!(ra.state(), State::Running);
		assert_eq!(a.read(&ra), 3);
	}

	#[test]
	fn test_consumer_may_inspect_bank() {
		let (sim, bank) = bank("bank-test-consumer-inspects", 4, u64::MAX);
		let req = bank.init(Event::TlbMiss.into(), Some(5)).unwrap();
		let other = bank.init(Event::PdtWalks.into(), None).unwrap();
		bank.open(&req, true).unwrap();
		bank.open(&other, true).unwrap();

		sim.advance(1, 5);
		let mut seen = None;
		bank.handle_irq(&(), |r, data, _| {
			let at = bank.request_at(data.slot).unwrap();
			assert!(std::ptr::eq(&*at, r));
			assert!(format!("{:?}", bank).contains("bank-test-consumer-inspects"));
			seen = Some(bank.used_counters());
			SampleAction::Continue
		});

		assert_eq!(seen, Some(0b110));
	}
}

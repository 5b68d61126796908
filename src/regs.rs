//! Register access for the hardware performance monitor.
//!
//! ```text
//! +--------------------+---------+----------------------------------------+
//! | Offset             | Width   | Register                               |
//! +--------------------+---------+----------------------------------------+
//! | 0x058              | 32      | overflow status, one bit per counter   |
//! | 0x05C              | 32      | count inhibit, one bit per counter     |
//! | 0x060              | 64      | cycle counter (counter 0), OF = bit 63 |
//! | 0x068 + 8*(n-1)    | 64      | event counter n                        |
//! | 0x160 + 8*(n-1)    | 64      | event selector n, OF = bit 63          |
//! +--------------------+---------+----------------------------------------+
//! ```
//!
//! There is no selector for counter 0: it only ever counts cycles.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Overflow status register (read-only mirror of the OF flags).
pub const IOCOUNTOVF: usize = 0x58;

/// Count inhibit register. A set bit stops the counter.
pub const IOCOUNTINH: usize = 0x5c;

/// Counter 0, the free-running cycle counter. The counter array continues
/// from here with an 8 byte stride.
pub const IOHPMCYCLES: usize = 0x60;

/// Selector for counter 1. The selector array has no entry for counter 0.
pub const IOHPMEVT_BASE: usize = 0x160;

/// Overflow flag, stored in bit 63 of the cycle counter and of every
/// selector.
pub const OVERFLOW_FLAG: u64 = 1 << 63;

/// Bits of the cycle counter register holding the count.
pub const CYCLES_COUNTER_MASK: u64 = !OVERFLOW_FLAG;

/// The most counters a bank can have: one bit each in the 32-bit status and
/// inhibit registers.
pub const MAX_COUNTERS: usize = 32;

/// Raw register access supplied by the device layer.
///
/// Offsets are in bytes from the start of the register bank. Accesses must use
/// the stated width; nothing here is atomic across calls.
pub trait RegisterIo: Send + Sync {
	/// Read a 32-bit register.
	fn read32(&self, offset: usize) -> u32;

	/// Write a 32-bit register.
	fn write32(&self, offset: usize, value: u32);

	/// Read a 64-bit register.
	fn read64(&self, offset: usize) -> u64;

	/// Write a 64-bit register.
	fn write64(&self, offset: usize, value: u64);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
	fn read32(&self, offset: usize) -> u32 {
		(**self).read32(offset)
	}

	fn write32(&self, offset: usize, value: u32) {
		(**self).write32(offset, value)
	}

	fn read64(&self, offset: usize) -> u64 {
		(**self).read64(offset)
	}

	fn write64(&self, offset: usize, value: u64) {
		(**self).write64(offset, value)
	}
}

/// Memory-mapped registers.
#[derive(Debug)]
pub struct Mmio {
	base: NonNull<u8>,
}

// The bank is device memory: every access is a single volatile load/store.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
	/// Wrap the mapped register bank at `base`.
	///
	/// # Safety
	///
	/// `base` must point to the mapped performance monitor registers, valid
	/// for 64-bit volatile accesses up to the end of the selector array, for
	/// as long as the returned value is alive.
	pub unsafe fn new(base: NonNull<u8>) -> Self {
		Mmio { base }
	}

	fn addr(&self, offset: usize) -> *mut u8 {
		// SAFETY: the caller of `new` promised the whole bank is mapped.
		unsafe { self.base.as_ptr().add(offset) }
	}
}

impl RegisterIo for Mmio {
	fn read32(&self, offset: usize) -> u32 {
		unsafe { std::ptr::read_volatile(self.addr(offset) as *const u32) }
	}

	fn write32(&self, offset: usize, value: u32) {
		unsafe { std::ptr::write_volatile(self.addr(offset) as *mut u32, value) }
	}

	fn read64(&self, offset: usize) -> u64 {
		unsafe { std::ptr::read_volatile(self.addr(offset) as *const u64) }
	}

	fn write64(&self, offset: usize, value: u64) {
		unsafe { std::ptr::write_volatile(self.addr(offset) as *mut u64, value) }
	}
}

/// Typed access to the counter, selector and control registers of one bank.
///
/// Every per-counter operation checks the index; an out-of-range index is a
/// caller bug, reported once and otherwise ignored so neighbouring registers
/// are never touched.
///
/// The inhibit register is shared by every counter and may be changed from
/// several contexts at once, the overflow handler included. It is never
/// read back: the wanted value lives in `inhibit`, and every change writes
/// that value out until the register matches it. While the bank is frozen
/// the register is held at all-ones instead.
#[derive(Debug)]
pub(crate) struct Registers<R> {
	io: R,
	num_counters: usize,
	mask: u64,
	inhibit: AtomicU32,
	frozen: AtomicU32,
}

/// Offset of counter `idx`.
pub const fn counter_offset(idx: usize) -> usize {
	IOHPMCYCLES + idx * 8
}

/// Offset of the selector of counter `idx`, which must not be 0.
pub const fn event_offset(idx: usize) -> usize {
	IOHPMEVT_BASE + (idx - 1) * 8
}

/// All-ones over the low `num_counters` bits.
pub(crate) fn counters_mask(num_counters: usize) -> u32 {
	((1u64 << num_counters) - 1) as u32
}

impl<R: RegisterIo> Registers<R> {
	pub(crate) fn new(io: R, num_counters: usize, mask: u64) -> Self {
		Registers {
			io,
			num_counters,
			mask,
			inhibit: AtomicU32::new(0),
			frozen: AtomicU32::new(0),
		}
	}

	fn bad_index(&self, idx: usize) -> bool {
		warn_on_once!(
			idx >= self.num_counters,
			"counter index {} out of range (bank has {} counters)",
			idx,
			self.num_counters
		)
	}

	/// The bits of counter `idx` that hold the count.
	pub(crate) fn counter_mask(&self, idx: usize) -> u64 {
		if idx == 0 {
			self.mask & CYCLES_COUNTER_MASK
		} else {
			self.mask
		}
	}

	pub(crate) fn get_counter(&self, idx: usize) -> u64 {
		if self.bad_index(idx) {
			return 0;
		}

		self.io.read64(counter_offset(idx)) & self.counter_mask(idx)
	}

	/// Load counter `idx`. The overflow flag of the cycle counter is kept.
	pub(crate) fn set_counter(&self, idx: usize, value: u64) {
		if self.bad_index(idx) {
			return;
		}

		let value = value & self.counter_mask(idx);
		if idx == 0 {
			let flag = self.io.read64(counter_offset(0)) & OVERFLOW_FLAG;
			self.io.write64(counter_offset(0), value | flag);
		} else {
			self.io.write64(counter_offset(idx), value);
		}
	}

	pub(crate) fn get_event(&self, idx: usize) -> u64 {
		if self.bad_index(idx) || idx == 0 {
			return 0;
		}

		self.io.read64(event_offset(idx))
	}

	pub(crate) fn set_event(&self, idx: usize, config: u64) {
		if self.bad_index(idx) || idx == 0 {
			return;
		}

		self.io.write64(event_offset(idx), config);
	}

	/// Let counter `idx` count by clearing its inhibit bit.
	pub(crate) fn enable_counter(&self, idx: usize) {
		if self.bad_index(idx) {
			return;
		}

		self.inhibit.fetch_and(!(1 << idx), Ordering::SeqCst);
		self.write_inhibit();
	}

	/// Stop counter `idx` by setting its inhibit bit.
	pub(crate) fn disable_counter(&self, idx: usize) {
		if self.bad_index(idx) {
			return;
		}

		self.inhibit.fetch_or(1 << idx, Ordering::SeqCst);
		self.write_inhibit();
	}

	/// Inhibit every counter with a single write.
	pub(crate) fn stop_all(&self) {
		self.inhibit
			.store(counters_mask(self.num_counters), Ordering::SeqCst);
		self.write_inhibit();
	}

	/// Hold every counter still until the matching [`thaw`], without
	/// forgetting which counters were running.
	///
	/// Freezes nest, and may be taken from several contexts at once.
	///
	/// [`thaw`]: #method.thaw
	pub(crate) fn freeze(&self) {
		self.frozen.fetch_add(1, Ordering::SeqCst);
		self.write_inhibit();
	}

	pub(crate) fn thaw(&self) {
		self.frozen.fetch_sub(1, Ordering::SeqCst);
		self.write_inhibit();
	}

	fn wanted_inhibit(&self) -> u32 {
		if self.frozen.load(Ordering::SeqCst) != 0 {
			counters_mask(self.num_counters)
		} else {
			self.inhibit.load(Ordering::SeqCst)
		}
	}

	// A writer racing another may put out a stale value, but then finds the
	// wanted value moved and writes again; the last write always matches.
	fn write_inhibit(&self) {
		loop {
			let want = self.wanted_inhibit();
			self.io.write32(IOCOUNTINH, want);
			if self.wanted_inhibit() == want {
				return;
			}
		}
	}

	pub(crate) fn overflow_status(&self) -> u32 {
		self.io.read32(IOCOUNTOVF)
	}

	/// Arm the overflow interrupt of counter `idx` by clearing its OF flag.
	pub(crate) fn enable_ovf_intr(&self, idx: usize) {
		self.update_overflow_flag(idx, |raw| raw & !OVERFLOW_FLAG)
	}

	/// Disarm the overflow interrupt of counter `idx` by setting its OF flag.
	pub(crate) fn disable_ovf_intr(&self, idx: usize) {
		self.update_overflow_flag(idx, |raw| raw | OVERFLOW_FLAG)
	}

	fn update_overflow_flag<F>(&self, idx: usize, f: F)
	where
		F: FnOnce(u64) -> u64,
	{
		if self.bad_index(idx) {
			return;
		}

		if idx == 0 {
			let raw = self.io.read64(counter_offset(0));
			self.io.write64(counter_offset(0), f(raw));
		} else {
			let raw = self.get_event(idx);
			self.set_event(idx, f(raw));
		}
	}
}

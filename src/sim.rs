//! A software model of the counter bank.
//!
//! [`SimRegisters`] implements [`RegisterIo`] on top of plain memory so the
//! multiplexer can be driven without the hardware. Events are fed in with
//! [`SimRegisters::advance`], which counts them on an enabled counter and
//! raises the (modelled) interrupt line when the counter wraps with its
//! overflow flag clear, as the device does.
//!
//! Clones share the same registers.
//!
//! ```
//! # use iohpm::sim::SimRegisters;
//! # use iohpm::RegisterIo;
//! let sim = SimRegisters::new(8, 0xffff);
//!
//! // Counters power up enabled and armed.
//! sim.write64(iohpm::regs::counter_offset(3), 0xfffe);
//! sim.write64(iohpm::regs::event_offset(3), 4);
//!
//! assert!(!sim.advance(3, 1));
//! assert!(sim.advance(3, 1));
//! assert_eq!(sim.read32(iohpm::regs::IOCOUNTOVF), 1 << 3);
//! ```

use std::sync::Arc;

use spin::Mutex;

use crate::regs::{
	counters_mask, RegisterIo, CYCLES_COUNTER_MASK, IOCOUNTINH, IOCOUNTOVF, IOHPMCYCLES,
	IOHPMEVT_BASE, MAX_COUNTERS, OVERFLOW_FLAG,
};

#[derive(Debug)]
struct State {
	num_counters: usize,
	mask: u64,
	counters: Vec<u64>,
	// Index 0 is the selector of counter 1.
	events: Vec<u64>,
	inhibit: u32,
	irq_pending: bool,
}

impl State {
	fn width(&self, idx: usize) -> u64 {
		if idx == 0 {
			self.mask & CYCLES_COUNTER_MASK
		} else {
			self.mask
		}
	}

	fn overflow_flag(&self, idx: usize) -> bool {
		if idx == 0 {
			self.counters[0] & OVERFLOW_FLAG != 0
		} else {
			self.events[idx - 1] & OVERFLOW_FLAG != 0
		}
	}

	fn set_overflow_flag(&mut self, idx: usize) {
		if idx == 0 {
			self.counters[0] |= OVERFLOW_FLAG;
		} else {
			self.events[idx - 1] |= OVERFLOW_FLAG;
		}
	}

	fn counter_index(&self, offset: usize) -> Option<usize> {
		let end = IOHPMCYCLES + self.num_counters * 8;
		if offset >= IOHPMCYCLES && offset < end && offset % 8 == 0 {
			return Some((offset - IOHPMCYCLES) / 8);
		}
		None
	}

	fn event_index(&self, offset: usize) -> Option<usize> {
		let end = IOHPMEVT_BASE + (self.num_counters - 1) * 8;
		if offset >= IOHPMEVT_BASE && offset < end && offset % 8 == 0 {
			return Some((offset - IOHPMEVT_BASE) / 8);
		}
		None
	}
}

/// Shared handle to a modelled register bank.
#[derive(Debug, Clone)]
pub struct SimRegisters {
	state: Arc<Mutex<State>>,
}

impl SimRegisters {
	/// Model a bank of `num_counters` counters, `mask` bits wide.
	///
	/// # Panics
	///
	/// Panics if `num_counters` is not in `1..=32`.
	pub fn new(num_counters: usize, mask: u64) -> Self {
		assert!(
			num_counters >= 1 && num_counters <= MAX_COUNTERS,
			"unsupported counter count {}",
			num_counters
		);

		SimRegisters {
			state: Arc::new(Mutex::new(State {
				num_counters,
				mask,
				counters: vec![0; num_counters],
				events: vec![0; num_counters - 1],
				inhibit: 0,
				irq_pending: false,
			})),
		}
	}

	/// Count `n` events on counter `idx`.
	///
	/// Inhibited counters, and event counters whose selector is set to "don't
	/// count", ignore the events. Returns true if the counter wrapped with its
	/// overflow flag clear, which raises the interrupt line.
	pub fn advance(&self, idx: usize, n: u64) -> bool {
		let mut s = self.state.lock();

		if s.inhibit & (1 << idx) != 0 {
			return false;
		}
		if idx > 0 && s.events[idx - 1] & crate::event::EVENT_ID_MASK == 0 {
			return false;
		}

		let width = s.width(idx);
		let sum = u128::from(s.counters[idx] & width) + u128::from(n);
		let value = (sum & u128::from(width)) as u64;
		s.counters[idx] = (s.counters[idx] & !width) | value;

		if sum <= u128::from(width) {
			return false;
		}

		if s.overflow_flag(idx) {
			return false;
		}

		s.set_overflow_flag(idx);
		s.irq_pending = true;
		true
	}

	/// Returns and clears the interrupt line.
	pub fn take_irq(&self) -> bool {
		let mut s = self.state.lock();
		let pending = s.irq_pending;
		s.irq_pending = false;
		pending
	}

	/// The raw content of counter `idx`, overflow flag included.
	pub fn counter(&self, idx: usize) -> u64 {
		self.state.lock().counters[idx]
	}

	/// The raw content of the selector of counter `idx` (`idx >= 1`).
	pub fn event(&self, idx: usize) -> u64 {
		self.state.lock().events[idx - 1]
	}

	/// The count inhibit register.
	pub fn inhibit(&self) -> u32 {
		self.state.lock().inhibit
	}

	/// The OF flag of counter `idx`.
	pub fn overflow_flag(&self, idx: usize) -> bool {
		self.state.lock().overflow_flag(idx)
	}
}

impl RegisterIo for SimRegisters {
	fn read32(&self, offset: usize) -> u32 {
		let s = self.state.lock();
		match offset {
			IOCOUNTOVF => (0..s.num_counters)
				.filter(|&idx| s.overflow_flag(idx))
				.fold(0, |ovf, idx| ovf | 1 << idx),
			IOCOUNTINH => s.inhibit,
			_ => panic!("unmapped 32-bit register access at {:#x}", offset),
		}
	}

	fn write32(&self, offset: usize, value: u32) {
		let mut s = self.state.lock();
		match offset {
			// Read-only.
			IOCOUNTOVF => {}
			IOCOUNTINH => s.inhibit = value & counters_mask(s.num_counters),
			_ => panic!("unmapped 32-bit register access at {:#x}", offset),
		}
	}

	fn read64(&self, offset: usize) -> u64 {
		let s = self.state.lock();
		if let Some(idx) = s.counter_index(offset) {
			return s.counters[idx];
		}
		if let Some(idx) = s.event_index(offset) {
			return s.events[idx];
		}
		panic!("unmapped 64-bit register access at {:#x}", offset)
	}

	fn write64(&self, offset: usize, value: u64) {
		let mut s = self.state.lock();
		if let Some(idx) = s.counter_index(offset) {
			let keep = if idx == 0 { OVERFLOW_FLAG } else { 0 };
			s.counters[idx] = value & (s.width(idx) | keep);
			return;
		}
		if let Some(idx) = s.event_index(offset) {
			s.events[idx] = value;
			return;
		}
		panic!("unmapped 64-bit register access at {:#x}", offset)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::regs::{counter_offset, event_offset};

	#[test]
	fn test_inhibited_counter_does_not_count() {
		let sim = SimRegisters::new(4, u64::MAX);
		sim.write64(event_offset(1), 1);
		sim.write32(IOCOUNTINH, 0b0010);

		sim.advance(1, 10);
		assert_eq!(sim.counter(1), 0);

		sim.write32(IOCOUNTINH, 0);
		sim.advance(1, 10);
		assert_eq!(sim.counter(1), 10);
	}

	#[test]
	fn test_dont_count_selector() {
		let sim = SimRegisters::new(4, u64::MAX);

		sim.advance(2, 10);
		assert_eq!(sim.counter(2), 0);

		// The cycle counter has no selector and always counts.
		sim.advance(0, 10);
		assert_eq!(sim.counter(0), 10);
	}

	#[test]
	fn test_overflow_raises_once() {
		let sim = SimRegisters::new(4, 0xff);
		sim.write64(event_offset(3), 4);
		sim.write64(counter_offset(3), 0xf0);

		assert!(sim.advance(3, 0x20));
		assert_eq!(sim.counter(3), 0x10);
		assert!(sim.overflow_flag(3));
		assert_eq!(sim.read32(IOCOUNTOVF), 1 << 3);
		assert!(sim.take_irq());
		assert!(!sim.take_irq());

		// Flag still set: wrapping again stays silent.
		assert!(!sim.advance(3, 0x100));
		assert!(!sim.take_irq());
	}

	#[test]
	fn test_cycle_counter_flag_lives_in_counter() {
		let sim = SimRegisters::new(2, u64::MAX);
		sim.write64(counter_offset(0), CYCLES_COUNTER_MASK);

		assert!(sim.advance(0, 1));
		assert_eq!(sim.counter(0), OVERFLOW_FLAG);
		assert_eq!(sim.read32(IOCOUNTOVF), 1);
	}

	#[test]
	#[should_panic(expected = "unmapped")]
	fn test_unmapped_access() {
		let sim = SimRegisters::new(4, u64::MAX);
		sim.read64(event_offset(4));
	}
}

#![warn(missing_docs)]

//! `iohpm` multiplexes monitoring requests onto the hardware performance
//! monitor of a [RISC-V IOMMU].
//!
//! The IOMMU carries a small bank of counters (up to 32): counter 0 counts
//! cycles and cannot be reprogrammed, every other counter counts whichever
//! event its selector names, optionally filtered by process or device id
//! (see [`EventConfig`]). Any number of [`Request`]s may be created against a
//! [`CounterBank`]; opening one assigns it a free counter, starting it
//! programs the counter, and reading it folds the counted events into the
//! request's running total.
//!
//! Sampling requests ask for a sample every N events. The counter is loaded so
//! that it overflows after N events; the overflow raises the bank's interrupt,
//! and [`CounterBank::handle_irq`] hands a [`SampleData`] to the caller's
//! consumer, reloads the counter and lets it run again.
//!
//! The bank talks to the hardware through [`RegisterIo`]: [`Mmio`] for mapped
//! device registers, [`sim::SimRegisters`] for a software model of the bank.
//!
//! ```
//! use iohpm::{BankConfig, GlobalRegistry, RequestConfig, SampleAction, sim::SimRegisters};
//!
//! let sim = SimRegisters::new(8, 0xffff_ffff);
//! let bank = BankConfig::default()
//!     .dev_name("doc-crate")
//!     .num_counters(8)
//!     .counter_mask(0xffff_ffff)
//!     .build(sim.clone(), GlobalRegistry)?;
//!
//! let misses = RequestConfig::default()
//!     .sample_period(1000)
//!     .init(&bank, "tlb_miss")?;
//! let slot = bank.open(&misses, true)?;
//!
//! // 1000 IOTLB misses later the counter overflows.
//! if sim.advance(slot, 1000) {
//!     bank.handle_irq(&(), |_, sample, _| {
//!         assert_eq!(sample.period, 1000);
//!         SampleAction::Continue
//!     });
//! }
//!
//! assert_eq!(misses.count(), 1000);
//! #
//! # Ok::<(), iohpm::error::Error>(())
//! ```
//!
//! [RISC-V IOMMU]: https://github.com/riscv-non-isa/riscv-iommu

#[macro_use]
extern crate lazy_static;
extern crate libc;

#[macro_use]
mod macros;

pub mod error;
pub mod regs;
pub mod sim;

mod period;
pub use self::period::{delta, next_period, Period};

mod event;
pub use self::event::{Event, EventConfig, Filter};

mod counter;
pub use self::counter::{Request, RequestConfig, State};

mod registry;
pub use self::registry::{GlobalRegistry, Registry};

mod bank;
pub use self::bank::{BankConfig, CounterBank, IrqReturn, SampleAction, SampleData, DEFAULT_NUM_COUNTERS};

pub use self::regs::{Mmio, RegisterIo};

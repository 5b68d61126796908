use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{new_error, new_error_with_cause, Error, ErrorKind};

/// Bits `[0:14]` of the descriptor hold the event id.
pub const EVENT_ID_MASK: u64 = 0x7fff;

const PID_PSCID_SHIFT: u32 = 16;
const PID_PSCID_MASK: u64 = (1 << 20) - 1;

const DID_GSCID_SHIFT: u32 = 36;
const DID_GSCID_MASK: u64 = (1 << 24) - 1;

/// Bit 63 is the selector register's overflow flag and never part of a
/// descriptor.
const DESCRIPTOR_MASK: u64 = !(1 << 63);

/// Event ids reserved for implementation specific events.
const CUSTOM_EVENTS: std::ops::RangeInclusive<u16> = 0x4000..=0x7ffe;

bitflags! {
	/// Single-bit filter controls of an [`EventConfig`].
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Filter: u64 {
		/// Match the device id using the partial (masked) comparison.
		const PARTIAL_MATCH = 1 << 15;
		/// Only count transactions whose PID/PSCID equals the descriptor's.
		const PID_PSCID = 1 << 60;
		/// Only count transactions whose DID/GSCID equals the descriptor's.
		const DID_GSCID = 1 << 61;
		/// Compare against the guest ids (GSCID/PSCID) instead of DID/PID.
		const ID_TYPE = 1 << 62;
	}
}

/// The events every IOMMU implementing the hardware performance monitor
/// supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Event {
	/// Free-running cycle counter, always placed in counter slot 0.
	Cycle = 0x7fff,
	/// Do not count. Written to a selector to park the counter.
	DontCount = 0,
	/// Untranslated requests.
	UntranslatedReq = 1,
	/// Translated requests.
	TranslatedReq = 2,
	/// ATS translation requests.
	AtsTransReq = 3,
	/// IOTLB misses.
	TlbMiss = 4,
	/// Device directory walks.
	DdtWalks = 5,
	/// Process directory walks.
	PdtWalks = 6,
	/// First-stage (S/VS) page table walks.
	SVsPtWalks = 7,
	/// Second-stage (G) page table walks.
	GPtWalks = 8,
}

impl Event {
	/// Every named event, in the order they are listed to users.
	pub const ALL: [Event; 10] = [
		Event::Cycle,
		Event::DontCount,
		Event::UntranslatedReq,
		Event::TranslatedReq,
		Event::AtsTransReq,
		Event::TlbMiss,
		Event::DdtWalks,
		Event::PdtWalks,
		Event::SVsPtWalks,
		Event::GPtWalks,
	];

	/// The event id programmed into the selector.
	pub fn id(self) -> u16 {
		self as u16
	}

	/// The user-facing event name.
	pub fn name(self) -> &'static str {
		match self {
			Event::Cycle => "cycle",
			Event::DontCount => "dont_count",
			Event::UntranslatedReq => "untranslated_req",
			Event::TranslatedReq => "translated_req",
			Event::AtsTransReq => "ats_trans_req",
			Event::TlbMiss => "tlb_miss",
			Event::DdtWalks => "ddt_walks",
			Event::PdtWalks => "pdt_walks",
			Event::SVsPtWalks => "s_vs_pt_walks",
			Event::GPtWalks => "g_pt_walks",
		}
	}

	/// Looks up a named event by id.
	pub fn from_id(id: u16) -> Option<Event> {
		Event::ALL.iter().copied().find(|e| e.id() == id)
	}
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for Event {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Event::ALL
			.iter()
			.copied()
			.find(|e| e.name() == s)
			.ok_or_else(|| new_error(ErrorKind::InvalidEventSpec))
	}
}

/// A packed event descriptor, as written to a counter's event selector.
///
/// ```text
///  62  61  60  59        36 35        16  15  14         0
/// +---+---+---+------------+------------+---+------------+
/// |IDT|DV |PV | DID/GSCID  | PID/PSCID  |DMK|  event id  |
/// +---+---+---+------------+------------+---+------------+
/// ```
///
/// Descriptors are usually built from their textual form:
///
/// ```
/// # use iohpm::{Event, EventConfig, Filter};
/// let config: EventConfig = "tlb_miss,pid_pscid=0x2a,filter_pid_pscid".parse()?;
///
/// assert_eq!(config.event_id(), Event::TlbMiss.id());
/// assert_eq!(config.pid_pscid(), 42);
/// assert!(config.filters().contains(Filter::PID_PSCID));
/// #
/// # Ok::<(), iohpm::error::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventConfig(u64);

impl EventConfig {
	/// Wrap a raw descriptor. Bit 63 is not part of the descriptor and is
	/// rejected when the request is initialised.
	pub const fn from_raw(raw: u64) -> Self {
		EventConfig(raw)
	}

	/// A descriptor counting `event` with no filters.
	pub fn new(event: Event) -> Self {
		EventConfig(u64::from(event.id()))
	}

	/// The packed descriptor.
	pub fn raw(&self) -> u64 {
		self.0
	}

	/// Bits `[0:14]`.
	pub fn event_id(&self) -> u16 {
		(self.0 & EVENT_ID_MASK) as u16
	}

	/// The named event, if the id is not a custom one.
	pub fn event(&self) -> Option<Event> {
		Event::from_id(self.event_id())
	}

	/// True for the cycle event, which may only run on counter 0.
	pub fn is_cycle(&self) -> bool {
		self.event_id() == Event::Cycle.id()
	}

	/// Bits `[16:35]`.
	pub fn pid_pscid(&self) -> u32 {
		((self.0 >> PID_PSCID_SHIFT) & PID_PSCID_MASK) as u32
	}

	/// Bits `[36:59]`.
	pub fn did_gscid(&self) -> u32 {
		((self.0 >> DID_GSCID_SHIFT) & DID_GSCID_MASK) as u32
	}

	/// The single-bit filter controls.
	pub fn filters(&self) -> Filter {
		Filter::from_bits_truncate(self.0)
	}

	/// Replace the event id, truncated to 15 bits.
	pub fn with_event_id(self, id: u16) -> Self {
		EventConfig((self.0 & !EVENT_ID_MASK) | (u64::from(id) & EVENT_ID_MASK))
	}

	/// Replace the PID/PSCID filter value, truncated to 20 bits.
	pub fn with_pid_pscid(self, id: u32) -> Self {
		let field = PID_PSCID_MASK << PID_PSCID_SHIFT;
		EventConfig((self.0 & !field) | ((u64::from(id) & PID_PSCID_MASK) << PID_PSCID_SHIFT))
	}

	/// Replace the DID/GSCID filter value, truncated to 24 bits.
	pub fn with_did_gscid(self, id: u32) -> Self {
		let field = DID_GSCID_MASK << DID_GSCID_SHIFT;
		EventConfig((self.0 & !field) | ((u64::from(id) & DID_GSCID_MASK) << DID_GSCID_SHIFT))
	}

	/// Set `filters` in addition to those already set.
	pub fn with_filters(self, filters: Filter) -> Self {
		EventConfig(self.0 | filters.bits())
	}

	/// Checks the descriptor can be written to a selector.
	pub(crate) fn validate(&self) -> Result<(), Error> {
		if self.0 & !DESCRIPTOR_MASK != 0 {
			return Err(new_error(ErrorKind::InvalidEventSpec));
		}

		let id = self.event_id();
		if Event::from_id(id).is_none() && !CUSTOM_EVENTS.contains(&id) {
			return Err(new_error(ErrorKind::InvalidEventSpec));
		}

		Ok(())
	}
}

impl From<Event> for EventConfig {
	fn from(event: Event) -> Self {
		EventConfig::new(event)
	}
}

impl fmt::Display for EventConfig {
	/// Prints the canonical textual form accepted by [`FromStr`].
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.event() {
			Some(e) => write!(f, "{}", e)?,
			None => write!(f, "event={:#x}", self.event_id())?,
		}

		if self.pid_pscid() != 0 {
			write!(f, ",pid_pscid={:#x}", self.pid_pscid())?;
		}
		if self.did_gscid() != 0 {
			write!(f, ",did_gscid={:#x}", self.did_gscid())?;
		}

		let filters = self.filters();
		for (flag, name) in &[
			(Filter::PARTIAL_MATCH, "partial_matching"),
			(Filter::PID_PSCID, "filter_pid_pscid"),
			(Filter::DID_GSCID, "filter_did_gscid"),
			(Filter::ID_TYPE, "filter_id_type"),
		] {
			if filters.contains(*flag) {
				write!(f, ",{}", name)?;
			}
		}

		Ok(())
	}
}

impl FromStr for EventConfig {
	type Err = Error;

	/// Parses `term[,term...]` where a term is an event name, a field
	/// assignment `field=value` or a bare field name (meaning `field=1`).
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut config = EventConfig::default();
		let mut have_event = false;

		for term in s.split(',').map(str::trim) {
			if term.is_empty() {
				return Err(new_error(ErrorKind::InvalidEventSpec));
			}

			let (field, value) = match term.find('=') {
				Some(pos) => (&term[..pos], Some(parse_value(&term[pos + 1..])?)),
				None => (term, None),
			};

			match field {
				"event" => {
					let id = value.ok_or_else(|| new_error(ErrorKind::InvalidEventSpec))?;
					config = config.with_event_id(check_width(id, EVENT_ID_MASK)? as u16);
					have_event = true;
				}
				"pid_pscid" => {
					let v = check_width(value.unwrap_or(1), PID_PSCID_MASK)?;
					config = config.with_pid_pscid(v as u32);
				}
				"did_gscid" => {
					let v = check_width(value.unwrap_or(1), DID_GSCID_MASK)?;
					config = config.with_did_gscid(v as u32);
				}
				"partial_matching" => config = set_flag(config, Filter::PARTIAL_MATCH, value)?,
				"filter_pid_pscid" => config = set_flag(config, Filter::PID_PSCID, value)?,
				"filter_did_gscid" => config = set_flag(config, Filter::DID_GSCID, value)?,
				"filter_id_type" => config = set_flag(config, Filter::ID_TYPE, value)?,
				name if value.is_none() => {
					let event: Event = name.parse()?;
					config = config.with_event_id(event.id());
					have_event = true;
				}
				_ => return Err(new_error(ErrorKind::InvalidEventSpec)),
			}
		}

		if !have_event {
			return Err(new_error(ErrorKind::InvalidEventSpec));
		}

		Ok(config)
	}
}

fn parse_value(v: &str) -> Result<u64, Error> {
	let parsed = if v.starts_with("0x") || v.starts_with("0X") {
		u64::from_str_radix(&v[2..], 16)
	} else {
		v.parse::<u64>()
	};

	parsed.map_err(|e| new_error_with_cause(ErrorKind::InvalidEventSpec, e))
}

fn check_width(v: u64, mask: u64) -> Result<u64, Error> {
	if v & !mask != 0 {
		return Err(new_error(ErrorKind::InvalidEventSpec));
	}
	Ok(v)
}

fn set_flag(config: EventConfig, flag: Filter, value: Option<u64>) -> Result<EventConfig, Error> {
	match value.unwrap_or(1) {
		0 => Ok(EventConfig(config.0 & !flag.bits())),
		1 => Ok(config.with_filters(flag)),
		_ => Err(new_error(ErrorKind::InvalidEventSpec)),
	}
}

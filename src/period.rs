/// The outcome of reprogramming a counter for its next sample period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
	/// Events remaining until the next period boundary.
	pub left: i64,

	/// Value to load into the counter register.
	pub load: u64,

	/// The counter snapshot matching `load`, before masking. Deltas are
	/// always masked, so the sign-extended form is as good as the load value.
	pub prev: u64,

	/// True if a period boundary was crossed and a sample is due.
	pub overflow: bool,
}

/// Computes the counter value that makes the counter overflow once the
/// current period is used up.
///
/// `left` is the number of events remaining in the current period (negative
/// once the counter ran past it), `period` the sample period and `max_period`
/// the counter mask. A counter is never programmed further than half its range
/// from overflowing, so it cannot run all the way round to the value about to
/// be loaded before the interrupt is serviced.
pub fn next_period(left: i64, period: i64, max_period: u64) -> Period {
	let mut left = left;
	let mut overflow = false;

	if left <= -period {
		left = period;
		overflow = true;
	}

	if left <= 0 {
		left += period;
		overflow = true;
	}

	let limit = (max_period >> 1) as i64;
	let distance = if left > limit { limit } else { left };
	let prev = distance.wrapping_neg() as u64;

	Period {
		left,
		load: prev & max_period,
		prev,
		overflow,
	}
}

/// Events counted between two snapshots of a counter `mask` bits wide.
pub fn delta(prev: u64, now: u64, mask: u64) -> u64 {
	now.wrapping_sub(prev) & mask
}

#![allow(missing_docs)]

use std::{error, fmt};

#[derive(Debug)]
pub struct Error {
	kind: ErrorKind,
	cause: Option<Box<dyn error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// An unknown error
	Unknown,

	/// Every counter slot able to hold the requested event is in use.
	///
	/// This is an expected condition: the caller should retry once another
	/// request has been closed.
	Busy,

	/// The provided event specification is not recognised.
	///
	/// Returned both for textual specifications that fail to parse and for
	/// packed descriptors naming a reserved event id or setting bit 63.
	InvalidEventSpec,

	/// The requested sample period is zero or does not fit the signed period
	/// arithmetic.
	InvalidPeriod,

	/// The [`BankConfig`] describes a counter bank this crate cannot drive.
	///
	/// [`BankConfig`]: ../struct.BankConfig.html
	InvalidConfig,

	/// The [`Request`] already holds a counter slot.
	///
	/// [`Request`]: ../struct.Request.html
	AlreadyAssigned,

	/// A counter bank with the same name is already registered.
	AlreadyRegistered,

	/// The monitoring registry refused the counter bank.
	Registration,
}

impl ErrorKind {
	fn description(&self) -> &'static str {
		match *self {
			ErrorKind::Busy => "no free counter slot",
			ErrorKind::InvalidEventSpec => "invalid event specification",
			ErrorKind::InvalidPeriod => "invalid sample period",
			ErrorKind::InvalidConfig => "invalid counter bank configuration",
			ErrorKind::AlreadyAssigned => "request already holds a counter slot",
			ErrorKind::AlreadyRegistered => "counter bank already registered",
			ErrorKind::Registration => "failed to register counter bank",
			ErrorKind::Unknown => "unknown error",
		}
	}
}

impl error::Error for Error {
	fn source(&self) -> Option<&(dyn error::Error + 'static)> {
		match self.cause {
			None => None,
			Some(ref b) => Some(b.as_ref()),
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self.cause {
			None => write!(f, "{}", self.kind.description()),
			Some(ref cause) => write!(f, "{}: {}", self.kind.description(), cause),
		}
	}
}

#[doc(hidden)]
impl PartialEq for Error {
	fn eq(&self, other: &Error) -> bool {
		self.kind == other.kind
	}
}

impl Error {
	pub fn kind(&self) -> &ErrorKind {
		&self.kind
	}

	/// The negated-errno convention used by the monitoring front-end.
	///
	/// Returns the positive `libc` errno value; callers speaking the kernel
	/// convention negate it themselves.
	pub fn errno(&self) -> i32 {
		match self.kind {
			ErrorKind::Busy => libc::EAGAIN,
			ErrorKind::InvalidEventSpec
			| ErrorKind::InvalidPeriod
			| ErrorKind::InvalidConfig => libc::EINVAL,
			ErrorKind::AlreadyAssigned => libc::EBUSY,
			ErrorKind::AlreadyRegistered => libc::EEXIST,
			ErrorKind::Registration | ErrorKind::Unknown => libc::EIO,
		}
	}
}

pub(crate) fn new_error(kind: ErrorKind) -> Error {
	Error { kind, cause: None }
}

pub(crate) fn new_error_with_cause<E>(kind: ErrorKind, cause: E) -> Error
where
	E: Into<Box<dyn error::Error + Send + Sync>>,
{
	Error {
		kind,
		cause: Some(cause.into()),
	}
}

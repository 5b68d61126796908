use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{new_error, new_error_with_cause, Error, ErrorKind};

lazy_static! {
	static ref REGISTERED: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// The monitoring front-end a counter bank announces itself to.
///
/// A bank registers once when it is built and unregisters when it is torn
/// down. A failed registration is fatal for the bank being built.
pub trait Registry: Send + Sync {
	/// Make the bank `name` with `num_counters` counters available.
	fn register(&self, name: &str, num_counters: usize) -> Result<(), Error>;

	/// Withdraw the bank `name`.
	fn unregister(&self, name: &str);
}

impl<T: Registry + ?Sized> Registry for Box<T> {
	fn register(&self, name: &str, num_counters: usize) -> Result<(), Error> {
		(**self).register(name, num_counters)
	}

	fn unregister(&self, name: &str) {
		(**self).unregister(name)
	}
}

/// A process-wide registry of bank names.
///
/// Registering a name twice fails with [`ErrorKind::AlreadyRegistered`] until
/// the first bank is torn down.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalRegistry;

impl GlobalRegistry {
	/// Returns true if a bank named `name` is currently registered.
	pub fn is_registered(name: &str) -> bool {
		match REGISTERED.lock() {
			Ok(names) => names.contains(name),
			Err(poisoned) => poisoned.into_inner().contains(name),
		}
	}
}

impl Registry for GlobalRegistry {
	fn register(&self, name: &str, _num_counters: usize) -> Result<(), Error> {
		let mut names = REGISTERED
			.lock()
			.map_err(|e| new_error_with_cause(ErrorKind::Registration, e.to_string()))?;

		if !names.insert(name.to_owned()) {
			return Err(new_error(ErrorKind::AlreadyRegistered));
		}

		Ok(())
	}

	fn unregister(&self, name: &str) {
		let mut names = match REGISTERED.lock() {
			Ok(names) => names,
			Err(poisoned) => poisoned.into_inner(),
		};
		names.remove(name);
	}
}

/// Evaluates `$cond` and logs a warning the first time it holds at this call
/// site. Returns the condition so it can guard an early return.
macro_rules! warn_on_once {
	($cond:expr, $($arg:tt)+) => {{
		static WARNED: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);

		let cond: bool = $cond;
		if cond && !WARNED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
			log::warn!($($arg)+);
		}
		cond
	}};
}

use std::sync::Once;

/// Installs a fmt subscriber when `TEST_TRACE` asks for one. Called from
/// the test helpers; safe to call any number of times.
pub fn init_test_logging() {
	static INIT: Once = Once::new();
	INIT.call_once(|| {
		let Ok(v) = std::env::var("TEST_TRACE") else {
			return;
		};
		let level = match v.as_str() {
			"true" | "debug" | "on" => tracing::Level::DEBUG,
			"trace" => tracing::Level::TRACE,
			"info" => tracing::Level::INFO,
			"warn" => tracing::Level::WARN,
			"error" => tracing::Level::ERROR,
			_ => return,
		};

		let _ = tracing_subscriber::fmt()
			.with_max_level(level)
			.with_test_writer()
			.try_init();
	});
}

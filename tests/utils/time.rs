use core::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutElapsed(pub Duration);

pub async fn timeout_s<F>(count: u64, future: F) -> Result<F::Output, TimeoutElapsed>
where
	F: IntoFuture,
{
	let duration = Duration::from_secs(count);
	tokio::time::timeout(duration, future)
		.await
		.map_err(|_| TimeoutElapsed(duration))
}

pub async fn timeout_ms<F>(count: u64, future: F) -> Result<F::Output, TimeoutElapsed>
where
	F: IntoFuture,
{
	let duration = Duration::from_millis(count);
	tokio::time::timeout(duration, future)
		.await
		.map_err(|_| TimeoutElapsed(duration))
}

/// Polls a condition until it holds or the timeout elapses.
pub async fn wait_until(
	timeout: Duration,
	mut condition: impl FnMut() -> bool,
) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if condition() {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

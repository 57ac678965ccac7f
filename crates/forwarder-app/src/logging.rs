use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console layer filtered by `level`, plus an optional non-blocking file
/// layer with its own `file_level`. The returned guard must be held for the
/// lifetime of the process so buffered file output is flushed on exit.
pub fn init(
	level: &str,
	file_level: &str,
	file_path: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
	let console_filter = EnvFilter::try_new(level)
		.map_err(|e| anyhow::anyhow!("invalid log-level {level:?}: {e}"))?;
	let console = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.with_filter(console_filter);

	let (file, guard) = match file_path {
		Some(path) => {
			let file_filter = EnvFilter::try_new(file_level)
				.map_err(|e| anyhow::anyhow!("invalid log-file-level {file_level:?}: {e}"))?;
			let file = std::fs::File::options()
				.create(true)
				.append(true)
				.open(path)
				.map_err(|e| anyhow::anyhow!("open log file {}: {e}", path.display()))?;
			let (writer, guard) = tracing_appender::non_blocking(file);
			let layer = tracing_subscriber::fmt::layer()
				.with_ansi(false)
				.with_writer(writer)
				.with_filter(file_filter);
			(Some(layer), Some(guard))
		},
		None => (None, None),
	};

	tracing_subscriber::registry().with(console).with(file).init();
	Ok(guard)
}

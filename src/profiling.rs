//! Chrome trace output behind the `profiling` feature.
//!
//! The chunk loop, the encoder, the pitch estimators and the synthesizer
//! carry spans; with the feature on, [`init`] records them to a JSON trace
//! that opens in `chrome://tracing` or [Perfetto](https://ui.perfetto.dev).
//! Without the feature [`init`] is a no-op returning `None`.

use std::path::Path;

/// Default trace file, relative to the working directory.
pub const TRACE_FILE: &str = "trace.json";

/// Flushes the trace when dropped; keep it alive for the whole run.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Record to [`TRACE_FILE`].
///
/// ```rust,ignore
/// let _trace = rvc_infer::profiling::init();
/// converter.convert(&request)?;
/// ```
pub fn init() -> Option<ProfilingGuard> {
    init_with_file(Path::new(TRACE_FILE))
}

/// Record to `path`. Installs the global subscriber, so call at most once.
#[cfg_attr(not(feature = "profiling"), allow(unused_variables))]
pub fn init_with_file(path: &Path) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();
        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!(trace = %path.display(), "profiling enabled");
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        None
    }
}

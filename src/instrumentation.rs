use tracing::level_filters::LevelFilter;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::prelude::*;

/// Level for a number of `-v` flags: warnings by default, then info, debug and trace.
pub fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Log events to stderr.
///
/// With `chrome_trace` set, spans are also recorded for chrome://tracing or
/// https://ui.perfetto.dev/. Make sure to store the returned guard in a variable in the scope to
/// be instrumented, otherwise the trace will be disabled immediately.
pub fn init(verbosity: u8, chrome_trace: bool) -> Option<FlushGuard> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level_filter(verbosity));

    if chrome_trace {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(fmt_layer).init();
        None
    }
}

//! tracing-subscriber setup for the CLI and for tests.
//!
//! Library code only emits events; installing a subscriber is the caller's job.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Outermost process: timestamps, levels, color on a TTY
    Interactive,
    /// Output captured and re-logged by a parent: no time, level or color,
    /// but targets stay so nesting is visible
    SubProcess,
}

fn env_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

pub fn init(mode: LogMode) {
    match mode {
        LogMode::SubProcess => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(true)
                .without_time()
                .with_level(false)
                .with_ansi(false)
                .init();
        }
        LogMode::Interactive => {
            let use_color = atty::is(atty::Stream::Stdout);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(true)
                .with_ansi(use_color)
                .init();
        }
    }
}

/// Test-writer subscriber; safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_target(true)
        .with_test_writer()
        .try_init();
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An unpublished crate containing testing utilities for the communication subsystem.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Once, mpsc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Upper bound for anything a test waits on: a poller that should have drained, a collective
/// every rank should have entered, a finalize that should have returned.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Why [`within_timeout()`] produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandoned {
    /// The function panicked, e.g. because it awaited an operation the communication resource
    /// dropped after a native failure.
    Panicked,

    /// The function was still running after [`TEST_TIMEOUT`]. Its thread is left behind.
    TimedOut,
}

/// Runs `f` on a fresh thread and waits up to [`TEST_TIMEOUT`] for it.
///
/// Blocking waits on communication futures either complete, panic or hang forever. This turns
/// the last two into values a test can assert on.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
pub fn within_timeout<F, R>(f: F) -> Result<R, Abandoned>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    thread::spawn(move || {
        _ = sender.send(catch_unwind(AssertUnwindSafe(f)));
    });

    match receiver.recv_timeout(TEST_TIMEOUT) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_payload)) => Err(Abandoned::Panicked),
        Err(_timeout) => Err(Abandoned::TimedOut),
    }
}

/// Sends INFO and above to the test output, tagged with thread names so that work on the
/// dedicated communication threads can be told apart.
///
/// Calling this more than once is harmless.
pub fn log_to_stdout() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .with_filter(LevelFilter::INFO);

        // Another test may already have installed a subscriber.
        _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// Log output produced by the current thread while running a closure. See [`capture_logs()`].
#[derive(Debug)]
pub struct CapturedLogs {
    text: String,
}

impl CapturedLogs {
    /// Asserts that some captured line contains `expected`.
    ///
    /// # Panics
    ///
    /// Panics if no captured output contains `expected`.
    pub fn assert_contains(&self, expected: &str) {
        assert!(
            self.text.contains(expected),
            "log output does not contain '{expected}', got:\n{}",
            self.text
        );
    }
}

/// Runs `f` with every event emitted on the current thread captured as formatted text.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, CapturedLogs) {
    let buffer = SharedBuffer::default();

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_filter(LevelFilter::TRACE),
    );

    let result = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8_lossy(&buffer.0.lock()).into_owned();

    (result, CapturedLogs { text })
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

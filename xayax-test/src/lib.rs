//! Utilities shared by the test suites of the Xaya X crates; not meant for
//! library or application users.

pub mod fake_chain;
pub mod subscriber;

pub use fake_chain::FakeChain;

use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Initialises tracing and error reporting for a test.  Idempotent, so
/// every test can call it first thing.
pub fn init() {
    INIT.call_once(|| {
        let fmt = tracing_subscriber::fmt::layer().with_test_writer();
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt)
            .with(tracing_error::ErrorLayer::default())
            .init();

        color_eyre::install().expect("color-eyre installs once");
    });
}

/// Sleeps for a short amount of time, enough to let other threads run.
pub fn sleep_some() {
    std::thread::sleep(Duration::from_millis(10));
}

//! Test-only support: logger bootstrap and the timeout-based assertion macros
//! used throughout this crate's test suites.

use std::sync::Once;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

static INIT: Once = Once::new();

#[macro_export]
macro_rules! init_logger {
    ($level:expr) => {
        $crate::testing::init_logger_level($level)
    };
    () => {
        $crate::testing::init_logger_level(log::LevelFilter::Trace)
    };
}

/// Initializes the logger with the specified log level, once per process.
pub fn init_logger_level(level: LevelFilter) {
    INIT.call_once(|| {
        log4rs::init_config(
            Config::builder()
                .appender(
                    Appender::builder().build(
                        "stdout",
                        Box::new(
                            ConsoleAppender::builder()
                                .encoder(Box::new(PatternEncoder::new(
                                    "\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[37m---\x1B[0m \x1B[36m{t:<40.40}\x1B[0m \x1B[37m:\x1B[0m {m}{n}",
                                )))
                                .build(),
                        ),
                    ),
                )
                .logger(Logger::builder().build("fx_callback", LevelFilter::Info))
                .logger(Logger::builder().build("httpmock::server", LevelFilter::Debug))
                .logger(Logger::builder().build("hyper", LevelFilter::Info))
                .logger(Logger::builder().build("hyper_util", LevelFilter::Info))
                .logger(Logger::builder().build("mio", LevelFilter::Info))
                .logger(Logger::builder().build("rustls", LevelFilter::Info))
                .logger(Logger::builder().build("want", LevelFilter::Info))
                .build(Root::builder().appender("stdout").build(level))
                .unwrap(),
        )
        .unwrap();
    })
}

/// Polls `$condition` every 10ms until it is true or `$timeout` elapses, at which point it panics.
#[macro_export]
macro_rules! assert_timeout {
    ($timeout:expr, $condition:expr) => {{
        assert_timeout!($timeout, $condition, "")
    }};
    ($timeout:expr, $condition:expr, $message:expr) => {{
        use std::time::Duration;
        use tokio::select;
        use tokio::time;

        let result = select! {
            _ = time::sleep($timeout) => false,
            result = async {
                loop {
                    if $condition {
                        return true;
                    }

                    time::sleep(Duration::from_millis(10)).await;
                }
            } => result,
        };

        if !result {
            assert!(
                false,
                concat!("timeout assertion failed after {:?}: ", $message),
                $timeout
            );
        }
    }};
}

/// Receives from `$receiver` or panics once `$timeout` elapses.
#[macro_export]
macro_rules! recv_timeout {
    ($receiver:expr, $timeout:expr) => {
        $crate::testing::recv_timeout($receiver, $timeout, "expected to receive an instance").await
    };
    ($receiver:expr, $timeout:expr, $message:expr) => {
        $crate::testing::recv_timeout($receiver, $timeout, $message).await
    };
}

/// Receives a single message from an unbounded channel, panicking on timeout.
pub async fn recv_timeout<T>(
    receiver: &mut tokio::sync::mpsc::UnboundedReceiver<T>,
    timeout: std::time::Duration,
    message: &str,
) -> T {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => panic!("receiver timed out after {}ms, {}", timeout.as_millis(), message),
        result = receiver.recv() => result.expect(message),
    }
}

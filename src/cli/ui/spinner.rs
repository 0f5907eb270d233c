use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use super::painter::Painter;

/// Progress spinner shown on stderr while a camera operation runs.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Runs `operation` under a spinner, leaving a ✓ or ✗ line behind.
    pub(crate) async fn run<F, Fut, T, E>(
        &self,
        painter: &Painter,
        message: &str,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.enabled {
            return operation().await;
        }

        let spinner = new_spinner(message);
        let result = operation().await;
        let finished = match &result {
            Ok(_) => format!("{} {message}", painter.success("✓")),
            Err(error) => format!("{} {message}: {error}", painter.failure("✗")),
        };
        spinner.finish_with_message(finished);
        result
    }
}

fn new_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(spinner_style());
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(90));
    spinner
}

fn spinner_style() -> ProgressStyle {
    let base_style = ProgressStyle::default_spinner();
    let templated =
        ProgressStyle::with_template("{spinner:.cyan.bold} {msg}").unwrap_or(base_style);
    templated.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
}

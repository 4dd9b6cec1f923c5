//! Console output: status events printed above a spinner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use media_intake::notify::{Notifier, StatusEvent, render};
use media_intake::queue::DownloadQueue;

/// Prints rendered events, through the spinner when one is running.
pub(crate) struct ConsoleNotifier {
    bar: Option<ProgressBar>,
}

impl ConsoleNotifier {
    pub(crate) fn new(bar: Option<ProgressBar>) -> Self {
        Self { bar }
    }
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, event: StatusEvent) {
        let text = render(&event);
        match &self.bar {
            Some(bar) => bar.println(text),
            None => println!("{text}"),
        }
    }
}

/// Creates the spinner, or `None` when output is quiet.
pub(crate) fn new_spinner(enabled: bool) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    Some(spinner)
}

/// Keeps the spinner message in line with the queue snapshot until `stop`.
pub(crate) fn spawn_snapshot_updates(
    spinner: ProgressBar,
    queue: DownloadQueue,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while !stop.load(Ordering::SeqCst) {
            let snapshot = queue.snapshot().await;
            spinner.set_message(format!(
                "active {}/{}, queued {}, done {}, failed {}",
                snapshot.active,
                snapshot.concurrency_limit,
                snapshot.queued + snapshot.retrying,
                snapshot.completed,
                snapshot.failed,
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        spinner.finish_and_clear();
    })
}

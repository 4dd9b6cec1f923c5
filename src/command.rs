//! Operator commands.
//!
//! Commands arrive as text (`/cancel 4`, `/resolve 2 movie Cleaner 2025`),
//! are parsed into a finite [`Command`] enum and carried out by
//! [`CommandHandler`], which answers with [`StatusEvent`]s.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::classify::MediaCategory;
use crate::config::SettingsSummary;
use crate::manual::{EntryId, ManualError, ManualResolutionQueue, MetadataOverride};
use crate::notify::{Notifier, StatusEvent};
use crate::queue::{CancelOutcome, DownloadQueue, ItemId};

/// Usage and description for every command, in help order.
pub const COMMAND_HELP: [(&str, &str); 11] = [
    ("/start", "show the welcome message"),
    ("/help", "list commands"),
    ("/status", "show active downloads"),
    ("/queue", "show queued downloads"),
    ("/stats", "show download statistics"),
    ("/cancel <id>", "cancel a queued or active download"),
    ("/retry <id>", "retry a failed download"),
    ("/settings", "show the active settings"),
    ("/pending", "list files awaiting manual resolution"),
    (
        "/resolve <id> movie|tv <title> [year] [season]",
        "file a pending entry under the given category",
    ),
    ("/skip <id>", "move a pending entry to the unmatched folder"),
];

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start`
    Start,
    /// `/help`
    Help,
    /// `/status`
    Status,
    /// `/queue`
    Queue,
    /// `/stats`
    Stats,
    /// `/cancel <id>`
    Cancel(ItemId),
    /// `/retry <id>`
    Retry(ItemId),
    /// `/settings`
    Settings,
    /// `/pending`
    Pending,
    /// `/resolve <id> movie|tv [title] [year] [season]`
    Resolve {
        /// Manual entry.
        entry: EntryId,
        /// Forced category.
        category: MediaCategory,
        /// Operator metadata.
        metadata: MetadataOverride,
    },
    /// `/skip <id>`
    Skip(EntryId),
}

/// Errors from parsing command text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    /// The text does not start with `/`.
    #[error("not a command: {0}")]
    NotACommand(String),

    /// Unrecognized command name.
    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    /// A required argument is absent.
    #[error("/{command} needs {argument}")]
    MissingArgument {
        /// Command name.
        command: &'static str,
        /// Argument description.
        argument: &'static str,
    },

    /// An argument could not be read.
    #[error("/{command}: {message}")]
    InvalidArgument {
        /// Command name.
        command: &'static str,
        /// What is wrong.
        message: String,
    },
}

impl Command {
    /// Parses command text. A `@botname` suffix on the command is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CommandParseError`] for anything that is not a known command
    /// with valid arguments.
    pub fn parse(text: &str) -> Result<Self, CommandParseError> {
        let text = text.trim();
        let Some(body) = text.strip_prefix('/') else {
            return Err(CommandParseError::NotACommand(text.to_string()));
        };
        let mut tokens = body.split_whitespace();
        let name = tokens
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();

        match name.as_str() {
            "start" => Ok(Self::Start),
            "help" => Ok(Self::Help),
            "status" => Ok(Self::Status),
            "queue" => Ok(Self::Queue),
            "stats" => Ok(Self::Stats),
            "settings" => Ok(Self::Settings),
            "pending" => Ok(Self::Pending),
            "cancel" => Ok(Self::Cancel(item_arg("cancel", &args)?)),
            "retry" => Ok(Self::Retry(item_arg("retry", &args)?)),
            "skip" => Ok(Self::Skip(entry_arg("skip", &args)?)),
            "resolve" => parse_resolve(&args),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

fn item_arg(command: &'static str, args: &[&str]) -> Result<ItemId, CommandParseError> {
    let raw = args.first().ok_or(CommandParseError::MissingArgument {
        command,
        argument: "an item id",
    })?;
    raw.parse()
        .map_err(|message| CommandParseError::InvalidArgument { command, message })
}

fn entry_arg(command: &'static str, args: &[&str]) -> Result<EntryId, CommandParseError> {
    let raw = args.first().ok_or(CommandParseError::MissingArgument {
        command,
        argument: "an entry id",
    })?;
    raw.parse()
        .map_err(|message| CommandParseError::InvalidArgument { command, message })
}

/// `<id> movie|tv [title words...] [year] [season]`
fn parse_resolve(args: &[&str]) -> Result<Command, CommandParseError> {
    const NAME: &str = "resolve";
    let entry = entry_arg(NAME, args)?;
    let raw_category = args.get(1).ok_or(CommandParseError::MissingArgument {
        command: NAME,
        argument: "a category (movie or tv)",
    })?;
    let category: MediaCategory = raw_category
        .parse()
        .map_err(|message| CommandParseError::InvalidArgument {
            command: NAME,
            message,
        })?;
    if category == MediaCategory::Unmatched {
        return Err(CommandParseError::InvalidArgument {
            command: NAME,
            message: "category must be movie or tv; use /skip for unmatched".to_string(),
        });
    }

    let mut rest: Vec<&str> = args[2..].to_vec();
    let mut metadata = MetadataOverride::default();

    if category == MediaCategory::TvShow
        && rest.len() > 1
        && let Some(season) = rest.last().and_then(|t| parse_season(t))
    {
        metadata.season = Some(season);
        rest.pop();
    }
    if let Some(year) = rest.last().and_then(|t| parse_year(t))
        && rest.len() > 1
    {
        metadata.year = Some(year);
        rest.pop();
    }

    let title = rest.join(" ");
    if !title.is_empty() {
        metadata.title = Some(title);
    }

    Ok(Command::Resolve {
        entry,
        category,
        metadata,
    })
}

fn parse_year(token: &str) -> Option<u16> {
    let year: u16 = token.trim_matches(|c| c == '(' || c == ')').parse().ok()?;
    (1900..=2099).contains(&year).then_some(year)
}

/// `3`, `S03` or `s3`; years are not seasons.
fn parse_season(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix('S')
        .or_else(|| token.strip_prefix('s'))
        .unwrap_or(token);
    let season: u32 = digits.parse().ok()?;
    (season < 1000).then_some(season)
}

/// Carries out operator commands against the queue and the manual queue.
pub struct CommandHandler {
    queue: DownloadQueue,
    manual: Arc<ManualResolutionQueue>,
    settings: SettingsSummary,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Creates a handler. `settings` is what `/start` and `/settings` report.
    #[must_use]
    pub fn new(
        queue: DownloadQueue,
        manual: Arc<ManualResolutionQueue>,
        settings: SettingsSummary,
    ) -> Self {
        Self {
            queue,
            manual,
            settings,
        }
    }

    /// Parses and handles command text, sending the reply to `notifier`.
    pub async fn handle_text(&self, text: &str, notifier: &dyn Notifier) {
        let reply = match Command::parse(text) {
            Ok(command) => self.handle(command).await,
            Err(e) => Some(StatusEvent::CommandError {
                message: e.to_string(),
            }),
        };
        if let Some(event) = reply {
            notifier.notify(event);
        }
    }

    /// Handles one command.
    ///
    /// Returns the reply, or `None` when the queue already emitted the
    /// relevant status (cancelling a waiting item, an accepted retry) or
    /// when a cancel had nothing left to do.
    #[instrument(skip(self))]
    pub async fn handle(&self, command: Command) -> Option<StatusEvent> {
        debug!("handling command");
        match command {
            Command::Start => Some(StatusEvent::Welcome {
                concurrency: self.queue.settings().concurrency,
                max_speed_mbps: self.settings.max_speed_mbps,
            }),
            Command::Help => Some(StatusEvent::Help),
            Command::Settings => Some(StatusEvent::Settings {
                settings: self.settings.clone(),
            }),
            Command::Status => Some(StatusEvent::QueueListing {
                snapshot: self.queue.snapshot().await,
                active: self.queue.active_items().await,
                queued: Vec::new(),
            }),
            Command::Queue => Some(StatusEvent::QueueListing {
                snapshot: self.queue.snapshot().await,
                active: Vec::new(),
                queued: self.queue.queued_items().await,
            }),
            Command::Stats => Some(StatusEvent::Statistics {
                stats: self.queue.statistics().await,
                snapshot: self.queue.snapshot().await,
            }),
            Command::Cancel(id) => self.cancel(id).await,
            Command::Retry(id) => match self.queue.retry(id).await {
                Ok(_) => None,
                Err(e) => Some(StatusEvent::CommandError {
                    message: e.to_string(),
                }),
            },
            Command::Pending => Some(StatusEvent::PendingListing {
                entries: self.manual.list().await,
            }),
            Command::Resolve {
                entry,
                category,
                metadata,
            } => Some(match self.manual.resolve(entry, category, metadata).await {
                Ok(resolved) => StatusEvent::Placed {
                    id: resolved.entry.download.id,
                    filename: resolved.entry.download.filename,
                    category: resolved.category,
                    destination: resolved.destination,
                },
                Err(e) => manual_error_event(&e),
            }),
            Command::Skip(entry) => Some(match self.manual.skip(entry).await {
                Ok(skipped) => StatusEvent::Skipped {
                    entry,
                    filename: skipped.entry.download.filename,
                    destination: skipped.destination,
                },
                Err(e) => manual_error_event(&e),
            }),
        }
    }

    /// Repeated, late and unknown cancels are silent.
    async fn cancel(&self, id: ItemId) -> Option<StatusEvent> {
        match self.queue.cancel(id).await {
            CancelOutcome::Requested => Some(StatusEvent::CancelRequested { id }),
            CancelOutcome::Removed
            | CancelOutcome::AlreadyRequested
            | CancelOutcome::AlreadyTerminal
            | CancelOutcome::Unknown => None,
        }
    }
}

fn manual_error_event(error: &ManualError) -> StatusEvent {
    StatusEvent::CommandError {
        message: error.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::download::{FileSource, SourceRef, SpeedLimiter, TransferWorker, WorkerSettings};
    use crate::notify::ChannelNotifier;
    use crate::placement::{ConflictPolicy, LibraryRoots, PlacementExecutor};
    use crate::queue::QueueSettings;

    /// Handler over a queue whose dispatch loop is not running, so admitted
    /// items stay queued. Queue events and command replies share one channel.
    fn idle_handler(
        dir: &TempDir,
    ) -> (
        CommandHandler,
        Arc<ChannelNotifier>,
        mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let (notifier, events) = ChannelNotifier::new();
        let notifier = Arc::new(notifier);
        let worker = TransferWorker::new(
            Arc::new(FileSource::new()),
            Arc::new(SpeedLimiter::disabled()),
            WorkerSettings::default(),
        );
        let settings = QueueSettings {
            temp_dir: dir.path().join("tmp"),
            ..QueueSettings::default()
        };
        let (queue, _completed) = DownloadQueue::new(settings, worker, notifier.clone()).unwrap();
        let placement = PlacementExecutor::new(
            LibraryRoots::under(&dir.path().join("library")),
            ConflictPolicy::Report,
        );
        let manual = Arc::new(ManualResolutionQueue::new(placement));
        let handler = CommandHandler::new(queue, manual, SettingsSummary::default());
        (handler, notifier, events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("/start").unwrap(), Command::Start);
        assert_eq!(Command::parse(" /HELP ").unwrap(), Command::Help);
        assert_eq!(Command::parse("/status@intake_bot").unwrap(), Command::Status);
        assert_eq!(Command::parse("/queue").unwrap(), Command::Queue);
        assert_eq!(Command::parse("/stats").unwrap(), Command::Stats);
        assert_eq!(Command::parse("/settings").unwrap(), Command::Settings);
        assert_eq!(Command::parse("/pending").unwrap(), Command::Pending);
    }

    #[test]
    fn test_parse_id_commands() {
        assert_eq!(
            Command::parse("/cancel 4").unwrap(),
            Command::Cancel(ItemId::new(4))
        );
        assert_eq!(
            Command::parse("/retry #7").unwrap(),
            Command::Retry(ItemId::new(7))
        );
        assert_eq!(
            Command::parse("/skip 2").unwrap(),
            Command::Skip(EntryId::new(2))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Command::parse("hello"),
            Err(CommandParseError::NotACommand(_))
        ));
        assert!(matches!(
            Command::parse("/dance"),
            Err(CommandParseError::Unknown(_))
        ));
        assert!(matches!(
            Command::parse("/cancel"),
            Err(CommandParseError::MissingArgument { .. })
        ));
        assert!(matches!(
            Command::parse("/cancel abc"),
            Err(CommandParseError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::parse("/resolve 1 music Thing"),
            Err(CommandParseError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_parse_resolve_movie_with_year() {
        assert_eq!(
            Command::parse("/resolve 3 movie Cleaner 2025").unwrap(),
            Command::Resolve {
                entry: EntryId::new(3),
                category: MediaCategory::Movie,
                metadata: MetadataOverride {
                    title: Some("Cleaner".to_string()),
                    year: Some(2025),
                    season: None,
                },
            }
        );
    }

    #[test]
    fn test_parse_resolve_year_only_title_is_title() {
        let Command::Resolve { metadata, .. } = Command::parse("/resolve 1 movie 1917").unwrap()
        else {
            panic!("expected resolve");
        };
        assert_eq!(metadata.title.as_deref(), Some("1917"));
        assert_eq!(metadata.year, None);
    }

    #[test]
    fn test_parse_resolve_tv_with_season() {
        let Command::Resolve {
            category, metadata, ..
        } = Command::parse("/resolve 1 tv The Office 2005 S02").unwrap()
        else {
            panic!("expected resolve");
        };
        assert_eq!(category, MediaCategory::TvShow);
        assert_eq!(metadata.title.as_deref(), Some("The Office"));
        assert_eq!(metadata.year, Some(2005));
        assert_eq!(metadata.season, Some(2));
    }

    #[test]
    fn test_parse_resolve_without_title() {
        let Command::Resolve { metadata, .. } = Command::parse("/resolve 5 movie").unwrap() else {
            panic!("expected resolve");
        };
        assert_eq!(metadata, MetadataOverride::default());
    }

    #[test]
    fn test_help_table_covers_every_command() {
        for name in [
            "start", "help", "status", "queue", "stats", "cancel", "retry", "settings", "pending",
            "resolve", "skip",
        ] {
            assert!(
                COMMAND_HELP
                    .iter()
                    .any(|(usage, _)| usage.starts_with(&format!("/{name}"))),
                "missing help for /{name}"
            );
        }
    }
    #[tokio::test]
    async fn test_repeated_cancel_is_silent() {
        let dir = TempDir::new().unwrap();
        let (handler, notifier, mut events) = idle_handler(&dir);
        let admission = handler
            .queue
            .enqueue(SourceRef::parse("/incoming/Heat.1995.mkv"), "Heat.1995.mkv", None)
            .await
            .unwrap();
        let cancel = format!("/cancel {}", admission.id);

        handler.handle_text(&cancel, notifier.as_ref()).await;
        handler.handle_text(&cancel, notifier.as_ref()).await;
        assert_eq!(handler.handle(Command::Cancel(admission.id)).await, None);
        assert_eq!(handler.handle(Command::Cancel(ItemId::new(404))).await, None);

        let seen = drain(&mut events);
        let cancelled = seen
            .iter()
            .filter(|e| matches!(e, StatusEvent::Cancelled { .. }))
            .count();
        assert_eq!(cancelled, 1);
        assert!(!seen.iter().any(|e| matches!(e, StatusEvent::CommandError { .. })));
    }

    #[tokio::test]
    async fn test_settings_reply_carries_summary() {
        let dir = TempDir::new().unwrap();
        let (handler, notifier, mut events) = idle_handler(&dir);

        handler.handle_text("/settings", notifier.as_ref()).await;

        let seen = drain(&mut events);
        assert_eq!(
            seen,
            vec![StatusEvent::Settings {
                settings: SettingsSummary::default()
            }]
        );
    }
}

//! Line-oriented console front-end for `ytq run`.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::control::ControlSurface;
use crate::models::{HistoryStatus, ItemStatus, QueueEvent, QueueItem, Source, Submission};

const HELP: &str = "\
Commands:
  add <url> [quality] [format] [bitrate]   queue a download (e.g. add https://youtu.be/x 720 mp4)
  list                                     show the queue
  start                                    process queued items
  pause                                    stop after the current item
  cancel                                   abort the current item
  clear                                    remove every item (not while downloading)
  history [n]                              show the last n history entries
  log [n]                                  last n output lines of the last finished item
  progress                                 current download progress
  help                                     this text
  quit                                     exit";

#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Add(Submission),
    List,
    Start,
    Pause,
    Cancel,
    Clear,
    History(usize),
    Log(usize),
    Progress,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_command(line: &str) -> ConsoleCommand {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return ConsoleCommand::Empty;
    };
    let count = |word: Option<&str>, default: usize| word.and_then(|w| w.parse().ok()).unwrap_or(default);

    match verb.to_lowercase().as_str() {
        "add" => ConsoleCommand::Add(Submission {
            url: words.next().unwrap_or_default().to_string(),
            quality: words.next().map(str::to_string),
            format: words.next().map(str::to_string),
            audio_bitrate: words.next().map(str::to_string),
        }),
        "list" | "ls" => ConsoleCommand::List,
        "start" => ConsoleCommand::Start,
        "pause" => ConsoleCommand::Pause,
        "cancel" => ConsoleCommand::Cancel,
        "clear" => ConsoleCommand::Clear,
        "history" => ConsoleCommand::History(count(words.next(), 20)),
        "log" => ConsoleCommand::Log(count(words.next(), 10)),
        "progress" => ConsoleCommand::Progress,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Unknown(other.to_string()),
    }
}

fn status_icon(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Queued => "⏳",
        ItemStatus::Downloading => "🔄",
        ItemStatus::Completed => "✅",
        ItemStatus::Failed => "❌",
    }
}

fn queue_row(index: usize, item: &QueueItem) -> String {
    let bitrate = item.audio_bitrate.as_deref().map(|b| format!(" @{b}")).unwrap_or_default();
    let origin = if item.source == Source::Remote { " [remote]" } else { "" };
    format!(
        "{:>3}. {} {:<11} {} ({} / {}{}){}",
        index + 1,
        status_icon(item.status),
        format!("{:?}", item.status),
        item.title,
        item.quality,
        item.format,
        bitrate,
        origin
    )
}

fn describe(event: &QueueEvent) -> Option<String> {
    match event {
        QueueEvent::Enqueued { item } => Some(format!("➕ Added to queue: {}", item.title)),
        QueueEvent::Started { title, .. } => Some(format!("📥 Downloading: {}", title)),
        QueueEvent::Progress { .. } => None,
        QueueEvent::Finished { title, failure: None, .. } => Some(format!("✅ Completed: {}", title)),
        QueueEvent::Finished { title, failure: Some(reason), .. } => {
            Some(format!("❌ Failed: {} ({})", title, reason.hint()))
        }
        QueueEvent::Paused => Some("⏸️ Queue paused".to_string()),
        QueueEvent::Idle => Some("🎉 Queue finished".to_string()),
        QueueEvent::Synced { count } => Some(format!("📥 Synced {} item(s) from the API", count)),
        QueueEvent::Cleared { count } => Some(format!("🗑️ Cleared {} item(s)", count)),
    }
}

/// Reads commands from stdin until `quit` or end of input.
pub async fn run(control: ControlSurface) -> Result<()> {
    let mut events = control.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(text) = describe(&event) {
                        println!("{}", text);
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Console skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            ConsoleCommand::Add(submission) => {
                println!("🔍 Getting video information...");
                if let Err(e) = control.enqueue(submission, Source::Local).await {
                    println!("Error: {}", e);
                }
            }
            ConsoleCommand::List => {
                let items = control.list();
                if items.is_empty() {
                    println!("Queue is empty");
                }
                for (index, item) in items.iter().enumerate() {
                    println!("{}", queue_row(index, item));
                }
            }
            ConsoleCommand::Start => {
                if control.list().iter().all(|i| i.status != ItemStatus::Queued) {
                    println!("No queued items");
                } else if let Err(e) = control.start() {
                    println!("{}", e);
                }
            }
            ConsoleCommand::Pause => {
                if !control.pause() {
                    println!("Queue is not currently running");
                }
            }
            ConsoleCommand::Cancel => {
                if !control.cancel_current() {
                    println!("Nothing is downloading");
                }
            }
            ConsoleCommand::Clear => {
                if let Err(e) = control.clear() {
                    println!("{}", e);
                }
            }
            ConsoleCommand::History(n) => {
                let history = control.history();
                let skip = history.len().saturating_sub(n);
                for entry in history.iter().skip(skip) {
                    let icon = if entry.status == HistoryStatus::Success { "✅" } else { "❌" };
                    println!(
                        "{} {} {} ({} / {}, {})",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        icon,
                        entry.title,
                        entry.quality,
                        entry.format,
                        entry.size
                    );
                }
            }
            ConsoleCommand::Log(n) => {
                match control.last_report() {
                    Some(report) => {
                        println!("Last finished: {} ({:?})", report.item.title, report.item.status);
                        if let Some(reason) = &report.failure {
                            println!("Hint: {}", reason.hint());
                        }
                        for line in control.last_output(n) {
                            println!("  {}", line);
                        }
                    }
                    None => println!("No finished downloads yet"),
                }
            }
            ConsoleCommand::Progress => {
                if control.is_running() {
                    println!("Downloading... {:.1}%", control.progress());
                } else {
                    println!("Idle");
                }
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => break,
            ConsoleCommand::Empty => {}
            ConsoleCommand::Unknown(verb) => println!("Unknown command `{}`; type `help`", verb),
        }
    }

    printer.abort();
    Ok(())
}

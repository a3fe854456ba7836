use std::io::Write;
use std::ops::ControlFlow;

use ikiganiro::app::ChatApp;
use ikiganiro::command::{Command, HELP_TEXT};
use ikiganiro::composer::{LineComposer, read_attachment};
use ikiganiro::settings::{SettingsStore, ThemeMode};
use ikiganiro_storage::{ChatMessage, ChatSession, MessageId, MessageRole, MessageStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() {
    // Logs go to stderr and stay at `warn` unless RUST_LOG says otherwise.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = SettingsStore::load();
    tracing::debug!(path = ?settings.config_path(), "loaded settings");
    let mut app = ChatApp::init(settings);

    println!(
        "ikiganiro · {} ({}) · /help for commands",
        app.orchestrator().client().id(),
        app.orchestrator().client().model()
    );
    if app.sidebar_open() {
        print_sessions(&app);
    }
    if let Some(session) = app.store().current() {
        print_transcript(session, app.theme_mode());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut composer = LineComposer::new();

    loop {
        print_prompt(&app, composer.is_continuing());
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read from stdin");
                break;
            }
        };

        let Some(input) = composer.push_line(&line) else {
            continue;
        };
        if handle_command(&mut app, Command::parse(&input)).await.is_break() {
            break;
        }
    }
}

async fn handle_command(app: &mut ChatApp, command: Command) -> ControlFlow<()> {
    match command {
        Command::Send(text) => {
            if text.trim().is_empty() && app.attachment().is_none() {
                return ControlFlow::Continue(());
            }
            let file = app.detach();
            let mut printer = ReplyPrinter::new(app.theme_mode());
            if let Err(rejection) = app
                .orchestrator_mut()
                .send(&text, file, |session| printer.observe(session))
                .await
            {
                println!("{rejection}");
            }
        }
        Command::New => {
            app.new_session();
            println!("started a new chat");
            if app.sidebar_open() {
                print_sessions(app);
            }
        }
        Command::List => print_sessions(app),
        Command::Select(index) => match app.select_index(index) {
            Some(_) => {
                if let Some(session) = app.store().current() {
                    print_transcript(session, app.theme_mode());
                }
            }
            None => println!("no chat number {index}"),
        },
        Command::Delete(index) => match app.delete_index(index) {
            Some(_) => {
                println!("deleted chat {index}");
                if app.sidebar_open() {
                    print_sessions(app);
                }
            }
            None => println!("no chat number {index}"),
        },
        Command::Rename(title) => {
            if !app.rename_current(&title) {
                println!("no current chat to rename");
            }
        }
        Command::Attach(path) => match read_attachment(&path).await {
            Ok(file) => {
                println!("attached {} ({})", file.name, file.mime_type);
                app.attach(file);
            }
            Err(error) => println!("{error}"),
        },
        Command::Detach => match app.detach() {
            Some(file) => println!("removed {}", file.name),
            None => println!("nothing attached"),
        },
        Command::Retry => match app.last_failed_message() {
            Some((session_id, message_id)) => {
                let mut printer = ReplyPrinter::new(app.theme_mode());
                if let Err(rejection) = app
                    .orchestrator_mut()
                    .retry(session_id, message_id, |session| printer.observe(session))
                    .await
                {
                    println!("{rejection}");
                }
            }
            None => println!("nothing to retry"),
        },
        Command::Regenerate => match app.store().current_id() {
            Some(session_id) => {
                let mut printer = ReplyPrinter::new(app.theme_mode());
                if let Err(rejection) = app
                    .orchestrator_mut()
                    .regenerate(session_id, |session| printer.observe(session))
                    .await
                {
                    println!("{rejection}");
                }
            }
            None => println!("nothing to regenerate"),
        },
        Command::ToggleTheme => match app.toggle_theme() {
            Ok(theme_mode) => println!("theme: {}", theme_mode.name()),
            Err(error) => println!("{error}"),
        },
        Command::ToggleSidebar => match app.toggle_sidebar() {
            Ok(true) => print_sessions(app),
            Ok(false) => println!("chat list hidden"),
            Err(error) => println!("{error}"),
        },
        Command::Help => println!("{HELP_TEXT}"),
        Command::Quit => return ControlFlow::Break(()),
        Command::Invalid(message) => println!("{message}"),
    }

    ControlFlow::Continue(())
}

fn accent(theme_mode: ThemeMode) -> &'static str {
    match theme_mode {
        ThemeMode::Light => "\x1b[34m",
        ThemeMode::Dark => "\x1b[96m",
    }
}

fn print_prompt(app: &ChatApp, continuing: bool) {
    let accent = accent(app.theme_mode());
    if continuing {
        print!("{accent}...{RESET} ");
    } else {
        let attachment = app
            .attachment()
            .map(|file| format!(" [{}]", file.name))
            .unwrap_or_default();
        print!("{accent}you{attachment}>{RESET} ");
    }
    let _ = std::io::stdout().flush();
}

fn print_sessions(app: &ChatApp) {
    let current = app.store().current_id();
    if app.store().list().is_empty() {
        println!("no chats yet");
        return;
    }
    for (position, session) in app.store().list().iter().enumerate() {
        let marker = if Some(session.id) == current { '*' } else { ' ' };
        println!(
            "{marker} {:>2}. {} ({} messages)",
            position + 1,
            session.title,
            session.messages.len()
        );
    }
}

fn print_transcript(session: &ChatSession, theme_mode: ThemeMode) {
    let accent = accent(theme_mode);
    println!("── {} ──", session.title);
    for message in &session.messages {
        print_message(message, accent);
    }
}

fn print_message(message: &ChatMessage, accent: &str) {
    let attachment = message
        .file
        .as_ref()
        .map(|file| format!(" [{}]", file.name))
        .unwrap_or_default();
    match (message.role, message.status) {
        (MessageRole::User, MessageStatus::Error) => {
            println!("you{attachment}> {} (failed, /retry)", message.text);
        }
        (MessageRole::User, _) => println!("you{attachment}> {}", message.text),
        (MessageRole::Model, _) => {
            println!("{accent}ikiganiro>{RESET} {}", message.text);
            print_citations(message);
        }
    }
}

fn print_citations(message: &ChatMessage) {
    for (position, citation) in message.citations.iter().flatten().enumerate() {
        println!("  [{}] {} <{}>", position + 1, citation.title, citation.uri);
    }
}

/// How newly streamed reply text relates to what is already on screen.
#[derive(Debug, PartialEq, Eq)]
enum ReplyDelta<'a> {
    Append(&'a str),
    Rewrite(&'a str),
}

fn reply_delta<'a>(printed: &str, text: &'a str) -> ReplyDelta<'a> {
    match text.strip_prefix(printed) {
        Some(rest) => ReplyDelta::Append(rest),
        None => ReplyDelta::Rewrite(text),
    }
}

/// Prints a streaming reply incrementally from successive session snapshots.
///
/// The reply is tracked by id from the first pending model message seen, so a
/// retried reply in the middle of the transcript is followed too.
struct ReplyPrinter {
    accent: &'static str,
    reply_id: Option<MessageId>,
    printed: String,
    finished: bool,
}

impl ReplyPrinter {
    fn new(theme_mode: ThemeMode) -> Self {
        Self {
            accent: accent(theme_mode),
            reply_id: None,
            printed: String::new(),
            finished: false,
        }
    }

    fn observe(&mut self, session: &ChatSession) {
        if self.finished {
            return;
        }

        let reply = match self.reply_id {
            Some(reply_id) => session.message(reply_id),
            None => session
                .messages
                .iter()
                .find(|message| message.role == MessageRole::Model && message.is_pending()),
        };
        let Some(reply) = reply else {
            // The placeholder is dropped when the send fails.
            if self.reply_id.is_some() {
                println!();
            }
            println!("reply failed; /retry to send again");
            self.finished = true;
            return;
        };

        if self.reply_id.is_none() {
            print!("{}ikiganiro>{RESET} ", self.accent);
            self.reply_id = Some(reply.id);
        }
        match reply_delta(&self.printed, &reply.text) {
            ReplyDelta::Append(delta) => print!("{delta}"),
            ReplyDelta::Rewrite(text) => {
                println!();
                print!("{}ikiganiro>{RESET} {text}", self.accent);
            }
        }
        self.printed.clone_from(&reply.text);

        if reply.status == MessageStatus::Complete {
            println!();
            print_citations(reply);
            self.finished = true;
        }
        let _ = std::io::stdout().flush();
    }
}

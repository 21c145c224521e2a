//! parley: talk to the interaction loop from a terminal.
//!
//! Type a line to send it. Slash commands drive the microphone and speaker;
//! `/help` lists them. Without API keys replies are echoed, and without the
//! `device` feature there is no microphone or speaker.

use parley_core::{InMemoryMessageStore, LoopConfig, Message, MessageKind, Mode, Sender};
use parley_voice::{
    Adapters, InteractionLoop, LoopCommand, LoopEvent, NoticeKind, OpenRouterGenerator,
};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const HELP: &str = "\
Commands:
  <text>          send a message
  /listen         start listening
  /stop           stop listening (turns auto-loop off)
  /auto on|off    hands-free mode
  /speech on|off  speak replies
  /hush           stop speaking
  /reset          forget the conversation
  /quit           exit";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(LoopCommand),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(LoopCommand::Submit(line.to_string()));
    };
    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();
    let arg = words.next();
    match (name, arg) {
        ("listen", None) => Input::Send(LoopCommand::StartListening),
        ("stop", None) => Input::Send(LoopCommand::StopListening),
        ("auto", Some("on")) => Input::Send(LoopCommand::SetAutoLoop(true)),
        ("auto", Some("off")) => Input::Send(LoopCommand::SetAutoLoop(false)),
        ("speech", Some("on")) => Input::Send(LoopCommand::SetSpeechOutput(true)),
        ("speech", Some("off")) => Input::Send(LoopCommand::SetSpeechOutput(false)),
        ("hush", None) => Input::Send(LoopCommand::StopSpeaking),
        ("reset", None) => Input::Send(LoopCommand::Reset),
        ("help", None) => Input::Help,
        ("quit", None) | ("exit", None) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

fn build_adapters(config: &LoopConfig) -> Adapters {
    let mut adapters = Adapters::offline();
    match OpenRouterGenerator::new(&config.llm) {
        Ok(generator) => {
            info!(model = %config.llm.model, "🧠 Replies from {}", config.llm.api_url);
            adapters.generator = Arc::new(generator);
        }
        Err(e) => warn!("{} (replies will echo)", e),
    }
    #[cfg(feature = "device")]
    attach_devices(config, &mut adapters);
    adapters
}

#[cfg(feature = "device")]
fn attach_devices(config: &LoopConfig, adapters: &mut Adapters) {
    use parley_voice::{MicRecognizer, OpenRouterStt, OpenRouterTts, RodioSink};

    match (RodioSink::new(), OpenRouterTts::new(&config.speech)) {
        (Ok(sink), Ok(tts)) => {
            adapters.sink = Arc::new(sink);
            adapters.synthesizer = Arc::new(tts);
        }
        (Err(e), _) | (_, Err(e)) => warn!("{} (replies stay silent)", e),
    }
    match OpenRouterStt::new(&config.speech) {
        Ok(stt) => adapters.recognizer = Arc::new(MicRecognizer::new(Arc::new(stt))),
        Err(e) => warn!("{} (voice input disabled)", e),
    }
}

/// Prints loop events. Assistant text is redrawn in place while it streams.
struct Printer {
    finished: HashSet<Uuid>,
}

impl Printer {
    fn render(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::ModeChanged { to, .. } => match to {
                Mode::Listening => println!("🎤 listening..."),
                Mode::Speaking => println!("🔊 speaking..."),
                _ => {}
            },
            LoopEvent::TranscriptUpdated(text) if !text.is_empty() => {
                print!("\r🎤 {}", text);
            }
            LoopEvent::TranscriptUpdated(_) => {}
            LoopEvent::MessageUpdated(message) => self.render_message(message),
            LoopEvent::Notice { kind, text } => {
                let prefix = match kind {
                    NoticeKind::Info => "ℹ️ ",
                    NoticeKind::Hint => "💡",
                    NoticeKind::Error => "⚠️ ",
                };
                println!("{} {}", prefix, text);
            }
        }
        let _ = std::io::stdout().flush();
    }

    fn render_message(&mut self, message: &Message) {
        if self.finished.contains(&message.id) {
            return;
        }
        match (message.sender, message.kind) {
            (Sender::User, _) => println!("\rYou: {}", message.text()),
            (Sender::Assistant, MessageKind::Error) => println!("⚠️  {}", message.text()),
            (Sender::Assistant, MessageKind::Text) => {
                print!("\rParley: {}", message.text());
                if !message.is_streaming() {
                    println!();
                }
            }
        }
        if !message.is_streaming() {
            self.finished.insert(message.id);
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<LoopEvent>) {
    let mut printer = Printer {
        finished: HashSet::new(),
    };
    loop {
        match events.recv().await {
            Ok(event) => printer.render(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind the loop"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley] .env not loaded: {} (using system environment)", e);
    }
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = LoopConfig::load()?;
    config.validate()?;
    info!(language = %config.language, auto_loop = config.auto_loop, "🚀 parley starting");

    let adapters = build_adapters(&config);
    let (handle, task) =
        InteractionLoop::spawn(config, adapters, Arc::new(InMemoryMessageStore::new()));
    let printer = tokio::spawn(print_events(handle.subscribe()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Input::Send(command) => handle.send(command).await?,
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
            Input::Empty => {}
            Input::Unknown(line) => println!("Unknown command {:?}; try /help", line),
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Loop already stopped: {}", e);
    }
    task.await??;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_submitted_trimmed() {
        assert_eq!(
            parse_line("  what's the weather  "),
            Input::Send(LoopCommand::Submit("what's the weather".into()))
        );
        assert_eq!(parse_line("   "), Input::Empty);
    }

    #[test]
    fn slash_commands_map_to_loop_commands() {
        assert_eq!(parse_line("/listen"), Input::Send(LoopCommand::StartListening));
        assert_eq!(parse_line("/auto on"), Input::Send(LoopCommand::SetAutoLoop(true)));
        assert_eq!(
            parse_line("/speech off"),
            Input::Send(LoopCommand::SetSpeechOutput(false))
        );
        assert_eq!(parse_line("/hush"), Input::Send(LoopCommand::StopSpeaking));
        assert_eq!(parse_line("/quit"), Input::Quit);
        assert_eq!(parse_line("/auto maybe"), Input::Unknown("/auto maybe".into()));
    }

    #[test]
    fn finished_replies_print_once() {
        let mut printer = Printer {
            finished: HashSet::new(),
        };
        let mut reply = Message::assistant_streaming();
        reply.apply_chunk("Hi").unwrap();
        printer.render_message(&reply);
        assert!(printer.finished.is_empty());
        reply.finish();
        printer.render_message(&reply);
        assert!(printer.finished.contains(&reply.id));
    }
}

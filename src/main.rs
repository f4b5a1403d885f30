use anyhow::Result;
use clap::{Arg, Command};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use proofchat::app::{Session, SessionEvent};
use proofchat::dialogue::{ProofAction, CLARIFY_PREFIX, PARAPHRASE_PREFIX, QUESTION_PREFIX};
use proofchat::messages::Message;
use proofchat::nostr::{
    ChatMode, RelayConfig, RelayConnection, RelayUpdate, SchnorrSigner, WsTransport,
};
use proofchat::pipeline::PublishPipeline;
use proofchat::wallet::NoWallet;

const DEFAULT_RELAY: &str = "wss://relay.damus.io";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = Command::new("proofchat")
        .version("0.2.0")
        .about("Two-party proof-of-understanding dialogue over Nostr relays")
        .arg(
            Arg::new("relay")
                .long("relay")
                .value_name("URL")
                .help("Relay websocket URL"),
        )
        .arg(
            Arg::new("recipient")
                .long("to")
                .value_name("ADDRESS")
                .help("Peer address (npub or hex), may also be set later with /to"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("NAME")
                .help("Display name for this session"),
        )
        .get_matches();

    let relay_url = matches
        .get_one::<String>("relay")
        .map(String::as_str)
        .unwrap_or(DEFAULT_RELAY);

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(WsTransport::new(relay_url, signal_tx)?);
    let connection = RelayConnection::new(transport, RelayConfig::default(), signal_rx, updates_tx);

    let mut session = Session::new(
        connection,
        Arc::new(SchnorrSigner::new()),
        Box::new(NoWallet),
        PublishPipeline::default(),
    );
    if let Some(address) = matches.get_one::<String>("recipient") {
        session.set_recipient(address.clone());
    }
    let display_name = matches.get_one::<String>("name").cloned();

    status(&format!("proofchat v0.2.0 - relay {relay_url}"));
    status("type /init to create an identity, /help for commands");
    if session.connect().await.is_err() {
        status("relay connection pending, retrying in the background");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            maybe_update = updates_rx.recv() => {
                match maybe_update {
                    Some(update) => render_update(&mut session, update),
                    None => break,
                }
            }
            maybe_line = lines.next_line() => {
                match maybe_line? {
                    Some(line) => {
                        if !handle_line(&mut session, line.trim(), display_name.as_deref()).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn status(message: &str) {
    println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), message);
}

fn render_update(session: &mut Session, update: RelayUpdate) {
    match session.apply_update(update) {
        Some(SessionEvent::Status(line)) => status(&line),
        Some(SessionEvent::MessageReceived(message)) => {
            render_message(&message);
            render_actions(session);
        }
        None => {}
    }
}

fn render_message(message: &Message) {
    let direction = if message.is_from_me { "me" } else { "peer" };
    let marker = match message.content.mode {
        ChatMode::Proof => " (proof)",
        ChatMode::Normal => "",
    };
    status(&format!("<{direction}>{marker} {}", message.content.text));
}

fn render_actions(session: &Session) {
    let actions = session.permitted_actions();
    if actions.is_empty() {
        return;
    }
    let labels: Vec<&str> = actions
        .iter()
        .map(|action| match action {
            ProofAction::AskQuestion => "/ask",
            ProofAction::Paraphrase => "/paraphrase",
            ProofAction::Clarify => "/clarify",
            ProofAction::ConfirmUnderstanding => "/confirm",
        })
        .collect();
    status(&format!("you may respond with: {}", labels.join(", ")));
}

/// Handle one input line. Returns false when the user asked to quit.
async fn handle_line(
    session: &mut Session,
    line: &str,
    display_name: Option<&str>,
) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }

    if !line.starts_with('/') {
        send_and_report(session, ChatMode::Normal, line).await;
        return Ok(true);
    }

    let mut parts = line[1..].splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default().to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match command.as_str() {
        "init" => match session
            .initialize_identity(display_name.map(str::to_string))
            .await
        {
            Ok(address) => {
                status("new session identity created, previous history cleared");
                status(&format!("your address: {address}"));
            }
            Err(error) => status(&format!("initialization failed: {error:#}")),
        },
        "to" => {
            if rest.is_empty() {
                status("usage: /to <npub or hex address>");
            } else {
                session.set_recipient(rest.to_string());
                status(&format!("recipient set to {rest}"));
            }
        }
        "connect" => match session.connect().await {
            Ok(()) => status("connected to relay"),
            Err(_) => status("connection failed, automatic retries continue"),
        },
        "proof" => {
            if rest.is_empty() {
                status("usage: /proof <statement to be understood>");
            } else {
                send_and_report(session, ChatMode::Proof, rest).await;
            }
        }
        "ask" => prefixed_proof(session, QUESTION_PREFIX, rest, "/ask <question>").await,
        "paraphrase" => {
            prefixed_proof(session, PARAPHRASE_PREFIX, rest, "/paraphrase <restatement>").await
        }
        "clarify" => prefixed_proof(session, CLARIFY_PREFIX, rest, "/clarify <clarification>").await,
        "confirm" => match session.confirm_understanding() {
            Ok(()) => status("understanding confirmed, dialogue completed"),
            Err(error) => status(&format!("cannot confirm: {error}")),
        },
        "exit-dialogue" => {
            session.exit_dialogue();
            status("left the current dialogue; it can be resumed or restarted");
        }
        "status" => render_status(session).await,
        "history" => {
            for message in session.store().iter() {
                render_message(message);
            }
        }
        "wallet" => match rest {
            "connect" => match session.wallet_connect().await {
                Ok(summary) => status(&summary),
                Err(error) => status(&format!("{error:#}")),
            },
            "disconnect" => match session.wallet_disconnect().await {
                Ok(()) => status("wallet disconnected"),
                Err(error) => status(&format!("{error:#}")),
            },
            _ => status(&session.wallet_status().await),
        },
        "mint" => {
            // Persistent completion records are not implemented yet.
            status("minting a completion record is coming soon");
        }
        "help" | "commands" => show_help(),
        "quit" | "exit" | "q" => return Ok(false),
        other => status(&format!(
            "unknown command: /{other}, type /help for available commands"
        )),
    }

    Ok(true)
}

async fn prefixed_proof(session: &mut Session, prefix: &str, text: &str, usage: &str) {
    if text.is_empty() {
        status(&format!("usage: {usage}"));
        return;
    }
    let full = format!("{prefix}{text}");
    send_and_report(session, ChatMode::Proof, &full).await;
}

async fn send_and_report(session: &mut Session, mode: ChatMode, text: &str) {
    match session.send_message(mode, text).await {
        Ok(message) => render_message(&message),
        Err(error) => status(&format!("send failed: {error}")),
    }
}

async fn render_status(session: &Session) {
    match session.identity() {
        Some(identity) => status(&format!(
            "identity: {} ({})",
            identity.display_name, identity.public_key
        )),
        None => status("identity: not initialized"),
    }
    match session.recipient() {
        Some(recipient) => status(&format!("recipient: {recipient}")),
        None => status("recipient: not set"),
    }
    let dialogue = session.engine().state();
    status(&format!(
        "dialogue: {}{}{}",
        dialogue.stage.as_wire(),
        if dialogue.is_active { ", active" } else { "" },
        if dialogue.is_completed {
            ", completed"
        } else {
            ""
        },
    ));
    status(&format!("messages: {}", session.store().len()));
    status(&session.wallet_status().await);
}

fn show_help() {
    let help_text = [
        "proofchat commands:",
        "/init - create a fresh session identity (clears history)",
        "/to <address> - set the peer's npub or hex address",
        "/connect - reconnect to the relay after retries gave up",
        "<text> - send a free-form chat message",
        "/proof <statement> - open a proof-of-understanding dialogue",
        "/ask <question> - ask about the statement (as responder)",
        "/paraphrase <restatement> - restate the statement (as responder)",
        "/clarify <clarification> - clarify the statement",
        "/confirm - confirm understanding after a paraphrase (as initiator)",
        "/exit-dialogue - leave the dialogue without completing it",
        "/status - identity, recipient, dialogue and relay summary",
        "/history - replay stored messages in timestamp order",
        "/wallet [connect|disconnect] - wallet info (optional)",
        "/mint - record a completed dialogue (coming soon)",
        "/quit - exit proofchat",
    ];
    for line in help_text {
        status(line);
    }
}

//! CLI command implementations.

use anyhow::{anyhow, Context, Result};
use p2pmsg_core::config::Config;
use p2pmsg_core::events::{DisconnectReason, Event, MessageKind};
use p2pmsg_core::identity::Fingerprint;
use p2pmsg_core::messenger::Messenger;
use p2pmsg_core::storage::Direction;
use std::io::Write;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Environment variable consulted before prompting for the passphrase.
const PASSPHRASE_ENV: &str = "P2PMSG_PASSPHRASE";

fn read_passphrase(prompt: &str) -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    print!("{prompt}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let passphrase = line.trim_end_matches(['\r', '\n']).to_string();
    if passphrase.is_empty() {
        return Err(anyhow!("empty passphrase"));
    }
    Ok(passphrase)
}

fn parse_fingerprint(s: &str) -> Result<Fingerprint> {
    Fingerprint::from_str(s).context("invalid fingerprint")
}

/// `init` - create the vault and print the new fingerprint.
pub async fn init(config: Config) -> Result<()> {
    let core = Messenger::new(config);
    let passphrase = read_passphrase("New vault passphrase")?;
    let fingerprint = core.initialize_vault(&passphrase).await?;
    println!("Vault initialized.");
    println!("Your fingerprint: {fingerprint}");
    Ok(())
}

/// `fingerprint` - print the local fingerprint.
pub async fn fingerprint(config: Config) -> Result<()> {
    let core = Messenger::new(config);
    let passphrase = read_passphrase("Vault passphrase")?;
    let fingerprint = core.open_vault(&passphrase).await?;
    println!("{fingerprint}");
    Ok(())
}

/// `listen` - wait for one peer and chat.
pub async fn listen(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let core = Messenger::new(config);
    let passphrase = read_passphrase("Vault passphrase")?;
    core.open_vault(&passphrase).await?;

    let events = core.events();
    let bound = core.listen(port).await?;
    println!("Listening on port {bound}. Waiting for a peer…");
    chat_loop(&core, events).await
}

/// `dial` - connect to a peer and chat.
pub async fn dial(config: Config, addr: &str, port: Option<u16>, expect: Option<&str>) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let expected = expect.map(parse_fingerprint).transpose()?;

    let core = Messenger::new(config);
    let passphrase = read_passphrase("Vault passphrase")?;
    core.open_vault(&passphrase).await?;

    let events = core.events();
    println!("Dialing {addr}:{port}…");
    core.dial_peer(addr, port, expected).await?;
    chat_loop(&core, events).await
}

/// Shared interactive loop: render events, forward stdin lines.
///
/// `/file <path>` sends a file, `/verify` marks the current peer
/// verified, `/quit` hangs up.
async fn chat_loop(
    core: &Messenger,
    mut events: tokio::sync::broadcast::Receiver<Event>,
) -> Result<()> {
    use tokio::sync::broadcast::error::RecvError;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => continue,
                Ok(event) => {
                    if render_event(&event) {
                        break;
                    }
                }
            },
            line = lines.next_line() => match line? {
                None => {
                    core.disconnect().await?;
                    break;
                }
                Some(line) => handle_input(core, line.trim()).await?,
            },
        }
    }
    Ok(())
}

/// Render one event; returns `true` when the chat is over.
fn render_event(event: &Event) -> bool {
    match event {
        Event::PeerConnecting { addr } => {
            println!("* connecting to {addr}…");
            false
        }
        Event::HandshakeComplete {
            peer_fingerprint,
            first_contact,
        } => {
            println!("* secure session established with {peer_fingerprint}");
            if *first_contact {
                println!("* first contact: verify this fingerprint out-of-band, then run /verify");
            }
            false
        }
        Event::MessageReceived { kind, body, .. } => {
            match kind {
                MessageKind::Text => println!("peer> {body}"),
                MessageKind::File => println!("peer> [file received: {body}]"),
            }
            false
        }
        Event::MessageSent { kind, body, .. } => {
            if *kind == MessageKind::File {
                println!("* file sent: {body}");
            }
            false
        }
        Event::PeerDisconnected { reason } => {
            let why = match reason {
                DisconnectReason::LocalClose => "closed",
                DisconnectReason::PeerClose => "peer hung up",
                DisconnectReason::PeerUnreachable => "peer unreachable",
                DisconnectReason::AuthFail => "authentication failure",
                DisconnectReason::Protocol => "protocol error",
                DisconnectReason::Transport => "connection lost",
            };
            println!("* session ended: {why}");
            // Transport errors reconnect in the background; everything
            // else ends the chat.
            !matches!(reason, DisconnectReason::Transport)
        }
        Event::Error { kind, detail } => {
            eprintln!("! {kind}: {detail}");
            false
        }
    }
}

async fn handle_input(core: &Messenger, line: &str) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    if let Some(path) = line.strip_prefix("/file ") {
        if let Err(e) = core.send_file(std::path::Path::new(path.trim())).await {
            eprintln!("! could not send file: {e}");
        }
        return Ok(());
    }
    match line {
        "/quit" => {
            core.disconnect().await?;
        }
        "/verify" => match core.current_peer().await {
            Some(peer) => {
                core.verify_peer(&peer).await?;
                println!("* peer marked verified");
            }
            None => eprintln!("! no connected peer to verify"),
        },
        _ => {
            if let Err(e) = core.send_text(line).await {
                eprintln!("! could not send: {e}");
            }
        }
    }
    Ok(())
}

/// `history` - print stored messages for a peer.
pub async fn history(config: Config, fingerprint: &str, limit: u32, offset: u32) -> Result<()> {
    let peer = parse_fingerprint(fingerprint)?;
    let core = Messenger::new(config);
    let passphrase = read_passphrase("Vault passphrase")?;
    core.open_vault(&passphrase).await?;

    let messages = core.conversation_history(&peer, limit, offset).await?;
    if messages.is_empty() {
        println!("(no messages)");
        return Ok(());
    }
    for message in messages {
        let who = match message.direction {
            Direction::Sent => "me",
            Direction::Received => "peer",
        };
        match message.kind {
            MessageKind::Text => println!("[{}] {who}> {}", message.timestamp, message.body),
            MessageKind::File => println!(
                "[{}] {who}> [file: {} ({} bytes)]",
                message.timestamp,
                message.file_name.as_deref().unwrap_or("?"),
                message.file_size.unwrap_or(0),
            ),
        }
    }
    Ok(())
}

/// `verify` - pin-verify a peer by fingerprint.
pub async fn verify(config: Config, fingerprint: &str) -> Result<()> {
    let peer = parse_fingerprint(fingerprint)?;
    let core = Messenger::new(config);
    let passphrase = read_passphrase("Vault passphrase")?;
    core.open_vault(&passphrase).await?;

    core.verify_peer(&peer).await?;
    println!("Peer {peer} marked verified.");
    Ok(())
}

/// `rotate-passphrase` - re-seal the vault under a new passphrase.
pub async fn rotate_passphrase(config: Config) -> Result<()> {
    let core = Messenger::new(config);
    let old = read_passphrase("Current passphrase")?;
    let new = match std::env::var("P2PMSG_NEW_PASSPHRASE") {
        Ok(new) => new,
        Err(_) => prompt_line("New passphrase")?,
    };
    if new.is_empty() {
        return Err(anyhow!("empty passphrase"));
    }
    core.rotate_passphrase(&old, &new)?;
    println!("Passphrase rotated.");
    Ok(())
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

//! `watch` command: run the sync engine, print state changes and read
//! commands from stdin

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::engine::{self, Command, StoreView};
use super::snapshot::Freshness;
use crate::api::ChatClient;
use crate::auth::ConfigAuth;
use crate::channel::{ChannelState, WebSocketTransport};
use crate::models::{ContactId, ContactSummary, Message, MessageKind, Presence};
use crate::notify::StdoutNotifier;

const HELP: &str = "\
Type a line to send it to the focused conversation, or:
  /focus <contact>        open a conversation (marks it read)
  /unfocus                close the conversation
  /read [contact]         mark a conversation read
  /send <contact> <text>  send without focusing
  /typing [on|off]        tell the focused contact you are typing
  /delete <message-id>    delete one of your messages
  /add <contact>          add a contact
  /remove <contact>       remove a contact
  /refresh                fetch a fresh snapshot
  /help                   show this help
  /quit                   stop watching";

/// A line typed at the prompt.
#[derive(Debug, PartialEq)]
enum Entry {
    Command(Command),
    Help,
    Quit,
}

/// Run until Ctrl-C, `/quit`, or until the session is rejected.
pub async fn run(focus: Option<ContactId>) -> Result<()> {
    let client = ChatClient::new()?;
    let me = client.me()?.to_string();
    let settings = client.config().sync.clone();
    let transport = WebSocketTransport::new(client.config().socket_url()?);

    let handle = engine::spawn(
        transport,
        &me,
        &settings,
        Arc::new(client),
        Arc::new(ConfigAuth),
        Box::new(StdoutNotifier),
    );
    if let Some(contact) = focus {
        handle.send(Command::Focus(contact));
    }

    println!("Watching for events... (Ctrl-C to stop, /help for commands)");

    let mut view = handle.view();
    let mut screen = Screen::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                for line in screen.update(&current, &me) {
                    println!("{}", line);
                }
                if current.connection == ChannelState::Unauthenticated {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let focused = view.borrow().focused.clone();
                    match parse_line(&line, focused.as_deref()) {
                        Ok(Some(Entry::Command(cmd))) => handle.send(cmd),
                        Ok(Some(Entry::Help)) => println!("{}", HELP),
                        Ok(Some(Entry::Quit)) => break,
                        Ok(None) => {}
                        Err(e) => println!("{}", e),
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Could not read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    let store = handle.shutdown().await?;
    tracing::debug!("Engine stopped with {} contacts", store.contacts.len());
    Ok(())
}

fn parse_line(line: &str, focused: Option<&str>) -> Result<Option<Entry>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Some(command) = line.strip_prefix('/') else {
        let to = focused.ok_or("No conversation open. Use /focus <contact> first.")?;
        return Ok(Some(Entry::Command(Command::Send {
            to: to.to_string(),
            content: line.to_string(),
            kind: MessageKind::Text,
        })));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let arg = |what: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("Usage: /{} <{}>", name, what))
        } else {
            Ok(rest.to_string())
        }
    };
    let current = || -> Result<String, String> {
        focused
            .map(str::to_string)
            .ok_or_else(|| "No conversation open.".to_string())
    };

    let cmd = match name {
        "focus" => Command::Focus(arg("contact")?),
        "unfocus" => Command::Unfocus,
        "read" if rest.is_empty() => Command::MarkRead(current()?),
        "read" => Command::MarkRead(rest.to_string()),
        "send" => {
            let (to, content) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: /send <contact> <text>")?;
            Command::Send {
                to: to.to_string(),
                content: content.trim().to_string(),
                kind: MessageKind::Text,
            }
        }
        "typing" => {
            let is_typing = match rest {
                "" | "on" => true,
                "off" => false,
                _ => return Err("Usage: /typing [on|off]".to_string()),
            };
            Command::SetTyping {
                contact: current()?,
                is_typing,
            }
        }
        "delete" => Command::Delete(arg("message-id")?),
        "add" => Command::AddContact(arg("contact")?),
        "remove" => Command::RemoveContact(arg("contact")?),
        "refresh" => Command::Refresh,
        "help" => return Ok(Some(Entry::Help)),
        "quit" | "exit" => return Ok(Some(Entry::Quit)),
        other => return Err(format!("Unknown command /{} (try /help)", other)),
    };
    Ok(Some(Entry::Command(cmd)))
}

/// What has been printed so far, so only changes are printed again.
#[derive(Default)]
struct Screen {
    connection: ChannelState,
    freshness: Freshness,
    focused: Option<ContactId>,
    contacts: HashMap<ContactId, String>,
    messages: HashMap<String, String>,
}

impl Screen {
    fn update(&mut self, view: &StoreView, me: &str) -> Vec<String> {
        let mut out = Vec::new();

        if view.connection != self.connection {
            self.connection = view.connection;
            out.push(format!("[connection] {}", self.connection.label()));
        }
        if view.freshness != self.freshness {
            self.freshness = view.freshness;
            out.push(format!("[sync] {}", self.freshness.label()));
        }

        for contact in &view.contacts {
            let line = summary_line(contact);
            if self.contacts.get(&contact.id) != Some(&line) {
                out.push(line.clone());
                self.contacts.insert(contact.id.clone(), line);
            }
        }
        self.contacts
            .retain(|id, _| view.contacts.iter().any(|c| &c.id == id));

        if view.focused != self.focused {
            self.focused = view.focused.clone();
            self.messages.clear();
            match &self.focused {
                Some(id) => {
                    let name = view.contact(id).map_or(id.as_str(), |c| c.display_name.as_str());
                    out.push(format!("--- {} ---", name));
                }
                None => out.push("--- conversation closed ---".to_string()),
            }
        }

        for message in &view.conversation {
            let key = message.order_key().1.to_string();
            let line = message_line(view, message, me);
            if self.messages.get(&key) != Some(&line) {
                out.push(line.clone());
                self.messages.insert(key, line);
            }
        }

        out
    }
}

fn summary_line(c: &ContactSummary) -> String {
    let mut line = format!("{:<20} ", c.display_name);
    match (c.presence, c.last_seen_at) {
        (Presence::Online, _) => line.push_str("online"),
        (Presence::Offline, Some(seen)) => {
            line.push_str(&format!("last seen {}", seen.format("%H:%M")))
        }
        (Presence::Offline, None) => line.push_str("offline"),
    }
    if c.is_typing {
        line.push_str("  typing...");
    } else if let Some(ref preview) = c.last_message_preview {
        line.push_str(&format!("  \"{}\"", preview));
    }
    if c.unread_count > 0 {
        line.push_str(&format!("  ({})", c.unread_count));
    }
    line
}

fn message_line(view: &StoreView, m: &Message, me: &str) -> String {
    let sender = match m {
        Message::Confirmed(c) if c.sender_id != me => view
            .contact(&c.sender_id)
            .map_or(c.sender_id.as_str(), |s| s.display_name.as_str()),
        _ => "you",
    };
    let state = match m {
        Message::Pending(p) if p.failed => "failed",
        _ => m.delivery_state().as_str(),
    };
    format!(
        "  {} {}: {} [{}]",
        m.created_at().format("%H:%M"),
        sender,
        m.preview(),
        state
    )
}

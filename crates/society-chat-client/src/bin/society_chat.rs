//! Minimal terminal client.
//!
//! Usage: `society-chat <user-id> <society-id> [peer-id]`
//!
//! Lines typed are sent to the open conversation. Commands:
//! `/open <peer>`, `/history`, `/retry <client-ref>`, `/discard <client-ref>`,
//! `/delete <message-id> me|all`, `/online`, `/who`, `/quit`.

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use society_chat_client::{init_tracing, ChatSession, ClientConfig, EventKind, SendStatus};
use society_chat_shared::{ClientRef, DeleteScope, MessageId, ServerEvent, SocietyId, UserId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(me), Some(society)) = (args.next(), args.next()) else {
        bail!("usage: society-chat <user-id> <society-id> [peer-id]");
    };
    let mut peer: Option<UserId> = args.next().map(UserId::new);

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let session = ChatSession::start(&config, UserId::new(me), SocietyId::new(society))?;

    let _printer = session
        .events()
        .subscribe(EventKind::ReceiveMessage, "terminal", |event| {
            if let ServerEvent::ReceiveMessage(m) = event {
                println!(
                    "[{}] {}: {}",
                    m.created_at.format("%H:%M"),
                    m.sender,
                    m.content.text.as_deref().or(m.content.file_url.as_deref()).unwrap_or("")
                );
            }
        });
    let _presence = session
        .events()
        .subscribe(EventKind::UserStatus, "terminal", |event| {
            if let ServerEvent::UserStatus(s) = event {
                println!("* {} is {}", s.user_id, if s.is_online { "online" } else { "offline" });
            }
        });

    if !session.wait_connected().await {
        bail!("could not connect to {}", config.ws_url);
    }
    if let Some(p) = &peer {
        session.select_peer(p).await?;
        print_history(&session, p).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let result = match words.next() {
            Some("/quit") => break,
            Some("/open") => match words.next() {
                Some(p) => {
                    let p = UserId::new(p);
                    session.select_peer(&p).await?;
                    print_history(&session, &p).await;
                    peer = Some(p);
                    Ok(())
                }
                None => {
                    println!("usage: /open <peer>");
                    Ok(())
                }
            },
            Some("/history") => {
                if let Some(p) = &peer {
                    print_history(&session, p).await;
                }
                Ok(())
            }
            Some("/online") => session.request_online_status(),
            Some("/who") => session.api().presence(session.me()).await.map(|table| {
                for (user, p) in table {
                    println!("  {user}: {}", if p.is_online { "online" } else { "offline" });
                }
            }),
            Some(cmd @ ("/retry" | "/discard")) => {
                let (Some(p), Some(raw)) = (&peer, words.next()) else {
                    println!("usage: {cmd} <client-ref>");
                    continue;
                };
                let client_ref = ClientRef(raw.parse().context("invalid client ref")?);
                if cmd == "/retry" {
                    session.retry(p, client_ref).await
                } else {
                    session.discard(p, client_ref).await;
                    Ok(())
                }
            }
            Some("/delete") => {
                let (Some(p), Some(id), Some(scope)) = (&peer, words.next(), words.next()) else {
                    println!("usage: /delete <message-id> me|all");
                    continue;
                };
                let scope = match scope {
                    "me" => DeleteScope::ForMe,
                    "all" => DeleteScope::ForAll,
                    _ => {
                        println!("scope must be 'me' or 'all'");
                        continue;
                    }
                };
                session.delete_message(p, &MessageId::from(id), scope).await
            }
            _ => match &peer {
                Some(p) => session.send_text(p, line).await.map(|_| ()),
                None => {
                    println!("open a conversation first: /open <peer>");
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            println!("! {e}");
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn print_history(session: &ChatSession, peer: &UserId) {
    let Some(conversation) = session.conversation(peer).await else {
        return;
    };
    for entry in conversation.entries() {
        let marker = match &entry.status {
            SendStatus::Pending => " (sending)".to_string(),
            SendStatus::Failed(reason) => format!(
                " (failed: {reason}, ref {})",
                entry.client_ref.map(|r| r.to_string()).unwrap_or_default()
            ),
            SendStatus::Confirmed(_) if entry.sender == *session.me() && entry.seen => " ✓✓".to_string(),
            SendStatus::Confirmed(_) => String::new(),
        };
        println!(
            "[{}] {}: {}{}",
            entry.created_at.format("%H:%M"),
            entry.sender,
            entry
                .content
                .text
                .as_deref()
                .or(entry.content.file_url.as_deref())
                .unwrap_or(""),
            marker
        );
    }
}

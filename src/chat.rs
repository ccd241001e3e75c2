//! Chat presence: sit in a channel's IRC chat while mining it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MinerError, Result};

pub const IRC_ADDR: &str = "irc.chat.twitch.tv:6667";

#[async_trait]
pub trait ChatPresence: Send + Sync {
    async fn join(&self, channel: &str) -> Result<()>;
    async fn leave(&self, channel: &str) -> Result<()>;
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One IRC connection per joined channel.
pub struct IrcChat {
    addr: String,
    login: String,
    auth_token: String,
    sessions: DashMap<String, Session>,
    reconnect_delay: Duration,
}

impl IrcChat {
    pub fn new(login: &str, auth_token: &str) -> Self {
        Self {
            addr: IRC_ADDR.to_string(),
            login: login.to_lowercase(),
            auth_token: auth_token.to_string(),
            sessions: DashMap::new(),
            reconnect_delay: Duration::from_secs(60),
        }
    }

    pub fn with_addr(mut self, addr: &str) -> Self {
        self.addr = addr.to_string();
        self
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.sessions.contains_key(channel)
    }

    /// Leave every channel.
    pub async fn leave_all(&self) {
        let channels: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for channel in channels {
            if let Err(e) = self.leave(&channel).await {
                tracing::debug!(channel = %channel, error = %e, "Leave chat failed");
            }
        }
    }
}

/// Handshake lines for a session.
pub fn handshake(login: &str, auth_token: &str, channel: &str) -> Vec<String> {
    vec![
        format!("PASS oauth:{}\r\n", auth_token),
        format!("NICK {}\r\n", login),
        format!("JOIN #{}\r\n", channel),
    ]
}

/// Reply for a server line, if it needs one.
pub fn reply_to(line: &str) -> Option<String> {
    line.strip_prefix("PING")
        .map(|rest| format!("PONG{}\r\n", rest.trim_end()))
}

async fn run_session(
    addr: String,
    login: String,
    auth_token: String,
    channel: String,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    while !cancel.is_cancelled() {
        match session_once(&addr, &login, &auth_token, &channel, &cancel).await {
            Ok(()) => return,
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Chat connection lost"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

/// Returns `Ok` only when cancelled.
async fn session_once(
    addr: &str,
    login: &str,
    auth_token: &str,
    channel: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let (read, mut write) = stream.into_split();
    for line in handshake(login, auth_token, channel) {
        write.write_all(line.as_bytes()).await?;
    }
    tracing::info!(channel = %channel, "Joined chat");

    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                write.write_all(format!("PART #{}\r\n", channel).as_bytes()).await.ok();
                write.shutdown().await.ok();
                tracing::info!(channel = %channel, "Left chat");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Err(MinerError::Transport("chat closed by server".into()));
                };
                if let Some(reply) = reply_to(&line) {
                    write.write_all(reply.as_bytes()).await?;
                }
            }
        }
    }
}

#[async_trait]
impl ChatPresence for IrcChat {
    async fn join(&self, channel: &str) -> Result<()> {
        if self.sessions.contains_key(channel) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            self.addr.clone(),
            self.login.clone(),
            self.auth_token.clone(),
            channel.to_string(),
            cancel.clone(),
            self.reconnect_delay,
        ));
        self.sessions
            .insert(channel.to_string(), Session { cancel, task });
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(channel) else {
            return Ok(());
        };
        session.cancel.cancel();
        let mut task = session.task;
        if tokio::time::timeout(Duration::from_secs(5), &mut task).await.is_err() {
            task.abort();
            return Err(MinerError::Transport(format!("leaving #{} timed out", channel)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_handshake_and_ping() {
        let lines = handshake("me", "tok", "alice");
        assert_eq!(lines, vec!["PASS oauth:tok\r\n", "NICK me\r\n", "JOIN #alice\r\n"]);
        assert_eq!(reply_to("PING :tmi.twitch.tv").as_deref(), Some("PONG :tmi.twitch.tv\r\n"));
        assert_eq!(reply_to(":tmi.twitch.tv 001 me :Welcome"), None);
    }

    #[tokio::test]
    async fn test_join_and_leave_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line);
            }
            seen
        });

        let chat = IrcChat::new("Me", "tok").with_addr(&addr);
        chat.join("alice").await.unwrap();
        assert!(chat.is_joined("alice"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        chat.leave("alice").await.unwrap();
        assert!(!chat.is_joined("alice"));

        let seen = server.await.unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("PASS oauth:tok"));
        assert!(seen.contains(&"JOIN #alice".to_string()));
        assert_eq!(seen.last().map(String::as_str), Some("PART #alice"));
    }
}

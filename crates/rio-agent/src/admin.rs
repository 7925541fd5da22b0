//! Local admin endpoint: a line-based TCP shell.
//!
//! Each accepted client gets its own task, its own command history, and a
//! probe that decides whether it is interactive (a human on a terminal
//! gets a banner and prompts) or batch (a script gets JSON replies).
//! Notify-bus traffic is broadcast to every connected client.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use rio_core::message::{Message, MessageType};
use rio_core::notify::{Notification, NotifyBus};
use rio_core::value::Value;

use crate::router::Router;

/// How long a silent client is given before it counts as interactive.
const PROBE_WAIT: Duration = Duration::from_millis(250);

type Outboxes = Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>;

pub struct AdminServer {
    router: Arc<Router>,
    device_id: String,
    outboxes: Outboxes,
}

impl AdminServer {
    /// Bind the admin port and start accepting. A failure to listen is
    /// fatal for the agent and is returned to the caller.
    pub async fn start(
        port: u16,
        router: Arc<Router>,
        notify: NotifyBus,
        device_id: String,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "admin endpoint listening");
        let server = Arc::new(Self {
            router,
            device_id,
            outboxes: Arc::new(Mutex::new(Vec::new())),
        });

        // Broadcast notify traffic to every connected client.
        let broadcast = server.outboxes.clone();
        let mut rx = notify.subscribe();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if matches!(
                    notification,
                    Notification::Manager { .. }
                        | Notification::ExecutionResult { .. }
                        | Notification::Telemetry { .. }
                ) {
                    let line = notification.render();
                    broadcast.lock().retain(|tx| tx.send(line.clone()).is_ok());
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.serve_client(stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "admin accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "admin client connected");
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Writer task: serializes all output for this client.
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        self.outboxes.lock().push(outbox.clone());
        tokio::spawn(async move {
            let mut write_half: OwnedWriteHalf = write_half;
            while let Some(line) = outbox_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Interactive probe: a client that stays silent briefly is a
        // human; one that pipes input immediately is a batch script.
        let mut first_line = String::new();
        let interactive = match timeout(PROBE_WAIT, reader.read_line(&mut first_line)).await {
            Err(_) => true,
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => false,
            Ok(Err(_)) => return,
        };
        if interactive {
            let _ = outbox.send(format!(
                "RIO agent {} — admin console. 'bye' ends the session.\n",
                self.device_id
            ));
            let _ = outbox.send(format!("{}> ", self.device_id));
        }

        let mut history: Vec<String> = Vec::new();
        let mut pending = if first_line.is_empty() {
            None
        } else {
            Some(first_line)
        };

        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => line,
                    }
                }
            };
            let line = line.trim_end_matches(['\r', '\n']).trim().to_string();
            if line.is_empty() {
                if interactive {
                    let _ = outbox.send(format!("{}> ", self.device_id));
                }
                continue;
            }
            if line == "bye" || line == "\u{4}" {
                break;
            }

            match self.run_line(&line, &mut history, interactive).await {
                Some(reply) => {
                    let _ = outbox.send(reply);
                }
                None => {}
            }
            if interactive {
                let _ = outbox.send(format!("{}> ", self.device_id));
            }
        }
        debug!(%peer, "admin client closed");
    }

    /// Execute one console line: history recall, the history listing, or
    /// a routed management verb.
    async fn run_line(
        &self,
        line: &str,
        history: &mut Vec<String>,
        interactive: bool,
    ) -> Option<String> {
        let line = match recall(line, history) {
            Ok(line) => line,
            Err(err) => return Some(format!("{err}\n")),
        };
        history.push(line.clone());

        let tokens = tokenize(&line);
        let verb = tokens.first()?.to_ascii_lowercase();

        if verb == "history" {
            let filter = tokens.get(1).cloned().unwrap_or_default();
            let listing: String = history
                .iter()
                .enumerate()
                .filter(|(_, entry)| filter.is_empty() || entry.contains(&filter))
                .map(|(i, entry)| format!("{:3} {entry}\n", i + 1))
                .collect();
            return Some(listing);
        }

        let Some(message) = line_to_message(&tokens) else {
            return Some(format!("unknown command: {verb}\n"));
        };
        let response = self.router.handle(message).await?;
        Some(if interactive {
            render_block(&response)
        } else {
            format!("{}\n", response.to_json())
        })
    }
}

/// Resolve `!!`, `!N`, and `!prefix` against the client's history.
fn recall(line: &str, history: &[String]) -> Result<String, String> {
    if !line.starts_with('!') {
        return Ok(line.to_string());
    }
    let spec = &line[1..];
    if spec == "!" {
        return history
            .last()
            .cloned()
            .ok_or_else(|| "history is empty".to_string());
    }
    if let Ok(index) = spec.parse::<usize>() {
        let slot = index
            .checked_sub(1)
            .ok_or_else(|| "history index is 1-based".to_string())?;
        return history
            .get(slot)
            .cloned()
            .ok_or_else(|| format!("no history entry {index}"));
    }
    history
        .iter()
        .rev()
        .find(|entry| entry.starts_with(spec))
        .cloned()
        .ok_or_else(|| format!("no history entry starting with {spec}"))
}

/// Quote-preserving tokenizer: `"…"` groups words, `""` escapes a quote.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    let mut quoted_token = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                    quoted_token = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted_token {
                    tokens.push(std::mem::take(&mut current));
                    quoted_token = false;
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted_token {
        tokens.push(current);
    }
    tokens
}

/// Map console tokens onto a management message.
///
/// The verb is the first token. Positional tokens fill the conventional
/// slots of each verb; `key=value` tokens become parameters directly.
fn line_to_message(tokens: &[String]) -> Option<Message> {
    let verb = tokens.first()?;
    let message_type = MessageType::from_verb(verb)?;
    let mut message = Message::new(message_type, "console");

    let positional: Vec<&String> = tokens[1..]
        .iter()
        .filter(|t| !t.contains('='))
        .collect();
    let slots: &[&str] = match message_type {
        MessageType::Exec => &["target", "action"],
        MessageType::Schedule => &["command", "name", "value"],
        MessageType::List => &["what", "target"],
        MessageType::Help => &["target", "action"],
        MessageType::Name | MessageType::Test => &["name"],
        MessageType::Ruleset => &["command"],
        _ => &["target"],
    };
    for (slot, token) in slots.iter().zip(positional.iter()) {
        message
            .parameters
            .insert(slot.to_string(), Value::Str(token.to_string()));
    }
    for token in tokens[1..].iter().filter(|t| t.contains('=')) {
        let (key, value) = token.split_once('=').expect("filtered on '='");
        message
            .parameters
            .insert(key.to_string(), Value::from_text(value));
    }
    Some(message)
}

/// Terminal rendering of a response for interactive clients.
fn render_block(message: &Message) -> String {
    let mut block = format!("-- {} --\n", message.message_type.as_str());
    for (name, value) in &message.parameters {
        match value {
            Value::Map(_) | Value::Array(_) => {
                let rendered = serde_json::to_string_pretty(value).unwrap_or_default();
                block.push_str(&format!("{name}:\n{rendered}\n"));
            }
            other => block.push_str(&format!("{name}: {other}\n")),
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_preserves_quotes_and_escapes() {
        assert_eq!(
            tokenize(r#"exec sim0 set value="1.5""#),
            vec!["exec", "sim0", "set", "value=1.5"]
        );
        assert_eq!(
            tokenize(r#"name "field unit""#),
            vec!["name", "field unit"]
        );
        assert_eq!(tokenize(r#"say "a ""b"" c""#), vec!["say", r#"a "b" c"#]);
        assert_eq!(tokenize(r#"empty """#), vec!["empty", ""]);
    }

    #[test]
    fn recall_by_index_prefix_and_last() {
        let history = vec![
            "status".to_string(),
            "list tasks".to_string(),
            "enable sim0".to_string(),
        ];
        assert_eq!(recall("!!", &history).unwrap(), "enable sim0");
        assert_eq!(recall("!2", &history).unwrap(), "list tasks");
        assert_eq!(recall("!li", &history).unwrap(), "list tasks");
        assert!(recall("!9", &history).is_err());
        assert!(recall("!zz", &history).is_err());
        assert_eq!(recall("plain", &history).unwrap(), "plain");
    }

    #[test]
    fn console_lines_become_messages() {
        let message = line_to_message(&tokenize("exec sim0 set value=2")).unwrap();
        assert_eq!(message.message_type, MessageType::Exec);
        assert_eq!(
            message.parameters.get("target"),
            Some(&Value::Str("sim0".into()))
        );
        assert_eq!(
            message.parameters.get("action"),
            Some(&Value::Str("set".into()))
        );
        assert_eq!(message.parameters.get("value"), Some(&Value::Int(2)));

        let message = line_to_message(&tokenize("schedule set gps_max 99")).unwrap();
        assert_eq!(
            message.parameters.get("command"),
            Some(&Value::Str("set".into()))
        );
        assert_eq!(
            message.parameters.get("name"),
            Some(&Value::Str("gps_max".into()))
        );
        assert_eq!(
            message.parameters.get("value"),
            Some(&Value::Str("99".into()))
        );

        assert!(line_to_message(&tokenize("frobnicate x")).is_none());
    }
}

//! Command execution.

use crate::{Commands, Transport};
use colored::Colorize;
use hpkv_client::{Channel, ChannelConfig, Client, ClientError, Notification, RecordValue, RestClient, TlsClientConfig};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Record operations over the selected transport.
pub enum Records {
    Ws(Client),
    Rest(RestClient),
}

impl Records {
    pub fn transport(&self) -> Transport {
        match self {
            Records::Ws(_) => Transport::Ws,
            Records::Rest(_) => Transport::Rest,
        }
    }

    pub async fn get(&self, key: &str) -> Option<RecordValue> {
        match self {
            Records::Ws(client) => client.fetch(key).await,
            Records::Rest(rest) => rest.read(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: RecordValue) -> bool {
        match self {
            Records::Ws(client) => client.insert(key, value).await,
            Records::Rest(rest) => rest.create(key, value).await,
        }
    }

    pub async fn update(&self, key: &str, value: RecordValue, partial: bool) -> bool {
        match self {
            Records::Ws(client) => client.update(key, value, partial).await,
            Records::Rest(rest) => rest.update(key, value, partial).await,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self {
            Records::Ws(client) => client.remove(key).await,
            Records::Rest(rest) => rest.delete(key).await,
        }
    }

    /// Opens the WebSocket channel eagerly. No-op for REST.
    pub async fn connect(&self) -> Result<(), ClientError> {
        match self {
            Records::Ws(client) => client.connect().await,
            Records::Rest(_) => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Records::Ws(client) = self {
            if let Err(e) = client.close().await {
                tracing::debug!("Close failed: {}", e);
            }
        }
    }
}

/// Everything a command needs to talk to the service.
pub struct Context {
    pub base_url: String,
    pub timeout: Duration,
    pub tls: Option<TlsClientConfig>,
    pub records: Records,
    /// Always available for REST-only operations.
    pub rest: RestClient,
}

/// Executes a command and returns the formatted output.
pub async fn execute(ctx: &Context, cmd: Commands) -> CommandResult<String> {
    match cmd {
        Commands::Repl => unreachable!(),
        // Watch streams until interrupted; handled in main.rs
        Commands::Watch { .. } => unreachable!(),

        Commands::Get { key } => get(ctx, &key).await,

        Commands::Set { key, value } => {
            let value = parse_value_arg(&value)?;
            set(ctx, &key, value).await
        }

        Commands::Update {
            key,
            value,
            partial,
        } => {
            let value = parse_value_arg(&value)?;
            update(ctx, &key, value, partial).await
        }

        Commands::Delete { key } => delete(ctx, &key).await,

        Commands::Incr { key, by } => incr(ctx, &key, by).await,

        Commands::Range { start, end, limit } => range(ctx, &start, &end, limit).await,

        Commands::Token { keys } => {
            let token = ctx.rest.websocket_token(&keys).await?;
            Ok(token)
        }

        Commands::Demo => demo(ctx).await,
    }
}

pub async fn get(ctx: &Context, key: &str) -> CommandResult<String> {
    match ctx.records.get(key).await {
        Some(value) => Ok(format_value(&value)),
        None => Err(format!("record {} not found", key).into()),
    }
}

pub async fn set(ctx: &Context, key: &str, value: RecordValue) -> CommandResult<String> {
    if ctx.records.set(key, value).await {
        Ok(format!("{} {}", "Stored".green(), key.cyan()))
    } else {
        Err(format!("failed to store {}", key).into())
    }
}

pub async fn update(
    ctx: &Context,
    key: &str,
    value: RecordValue,
    partial: bool,
) -> CommandResult<String> {
    if ctx.records.update(key, value, partial).await {
        let verb = if partial { "Merged into" } else { "Replaced" };
        Ok(format!("{} {}", verb.green(), key.cyan()))
    } else {
        Err(format!("failed to update {}", key).into())
    }
}

pub async fn delete(ctx: &Context, key: &str) -> CommandResult<String> {
    if ctx.records.delete(key).await {
        Ok(format!("{} {}", "Deleted".green(), key.cyan()))
    } else {
        Err(format!("failed to delete {}", key).into())
    }
}

pub async fn incr(ctx: &Context, key: &str, by: i64) -> CommandResult<String> {
    let result = ctx.rest.atomic_increment(key, by).await?;
    match result.new_value {
        Some(value) => Ok(format!("{} = {}", key.cyan(), value.to_string().yellow())),
        None => Ok(format!("{} {}", "Incremented".green(), key.cyan())),
    }
}

pub async fn range(
    ctx: &Context,
    start: &str,
    end: &str,
    limit: Option<u32>,
) -> CommandResult<String> {
    let result = ctx.rest.range(start, end, limit).await?;
    if result.records.is_empty() {
        return Ok("No records in range".yellow().to_string());
    }

    let mut output = String::new();
    for record in &result.records {
        output.push_str(&format!(
            "  {} = {}\n",
            record.key.cyan(),
            record.decoded()
        ));
    }
    output.push_str(&format!(
        "{}: {}",
        "Count".dimmed(),
        result.count.unwrap_or(result.records.len() as u64)
    ));
    if result.truncated == Some(true) {
        output.push_str(&format!(" ({})", "truncated".yellow()));
    }
    Ok(output)
}

/// Streams notifications for `keys` until Ctrl+C or connection loss.
pub async fn watch(ctx: &Context, keys: &[String]) -> CommandResult<()> {
    let token = ctx.rest.websocket_token(keys).await?;

    let mut config =
        ChannelConfig::with_token(ctx.base_url.clone(), token).with_connect_timeout(ctx.timeout);
    if let Some(tls) = ctx.tls.clone() {
        config = config.with_tls(tls);
    }
    let channel = Channel::new(config);

    // Subscribe before opening so no notification is missed
    let mut notifications = channel.subscribe_notifications();
    channel.open().await?;

    eprintln!("{} {}", "Watching".green(), keys.join(", ").cyan());
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    let mut health = tokio::time::interval(Duration::from_secs(1));
    let result = loop {
        tokio::select! {
            event = notifications.recv() => {
                match event {
                    Ok(n) => println!("{}", format_notification(&n)),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} notifications", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => break Err(ClientError::ChannelClosed),
                }
            }
            _ = health.tick() => {
                if !channel.is_open() {
                    break Err(ClientError::ConnectionLost);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                break Ok(());
            }
        }
    };

    let _ = channel.close().await;
    Ok(result?)
}

/// Walks through the lifecycle of a sample `user:1` record.
pub async fn demo(ctx: &Context) -> CommandResult<String> {
    let key = "user:1";
    let mut output = format!(
        "{} ({:?} transport)\n",
        "HPKV CRUD walkthrough".bold(),
        ctx.records.transport()
    );

    let user = RecordValue::json(json!({
        "name": "John Doe",
        "age": 30,
        "email": "john@example.com",
    }));
    output.push_str(&format!("1. {}\n", set(ctx, key, user).await?));
    output.push_str(&format!("2. Read: {}\n", compact(get(ctx, key).await?)));

    let patch = RecordValue::json(json!({ "age": 31 }));
    output.push_str(&format!("3. {}\n", update(ctx, key, patch, true).await?));
    output.push_str(&format!("4. Read: {}\n", compact(get(ctx, key).await?)));

    output.push_str(&format!("5. {}\n", delete(ctx, key).await?));

    match ctx.records.get(key).await {
        None => output.push_str(&format!("6. {}", "Verified deletion".green())),
        Some(value) => {
            return Err(format!("{} still present after delete: {}", key, value).into());
        }
    }

    Ok(output)
}

/// Parses a value argument: JSON, plain text, or `@file`.
pub fn parse_value_arg(arg: &str) -> CommandResult<RecordValue> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(RecordValue::decode(content.trim_end()))
    } else {
        Ok(RecordValue::decode(arg))
    }
}

/// Formats a value for display.
pub fn format_value(value: &RecordValue) -> String {
    match value.as_json() {
        Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
        None => value.to_string(),
    }
}

pub fn format_notification(n: &Notification) -> String {
    let time = n
        .time()
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "[{}] {} = {}",
        time.dimmed(),
        n.key.as_deref().unwrap_or("?").cyan(),
        n.value.as_deref().unwrap_or("")
    )
}

fn compact(pretty: String) -> String {
    pretty.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpkv_client::testing::{MockRest, MockServer};

    async fn ws_context(server: &MockServer, rest: &MockRest) -> Context {
        Context {
            base_url: server.base_url(),
            timeout: Duration::from_secs(5),
            tls: None,
            records: Records::Ws(Client::new(server.channel_config())),
            rest: rest.client(),
        }
    }

    #[test]
    fn test_parse_value_arg() {
        assert_eq!(
            parse_value_arg(r#"{"a":1}"#).unwrap(),
            RecordValue::json(json!({"a": 1}))
        );
        assert_eq!(parse_value_arg("hello").unwrap(), RecordValue::text("hello"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"{\"b\":2}\n").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(
            parse_value_arg(&arg).unwrap(),
            RecordValue::json(json!({"b": 2}))
        );

        assert!(parse_value_arg("@/nonexistent/value.json").is_err());
    }

    #[test]
    fn test_format_notification() {
        colored::control::set_override(false);
        let n = Notification::new("stock:AAPL", "189.5", 1_700_000_000_000);
        assert_eq!(format_notification(&n), "[22:13:20.000] stock:AAPL = 189.5");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&RecordValue::text("plain")), "plain");
        assert_eq!(
            format_value(&RecordValue::json(json!({"a": 1}))),
            "{\n  \"a\": 1\n}"
        );
    }

    #[tokio::test]
    async fn test_demo_over_websocket() {
        colored::control::set_override(false);
        let server = MockServer::start().await;
        let rest = MockRest::start().await;
        let ctx = ws_context(&server, &rest).await;

        let output = demo(&ctx).await.unwrap();
        assert!(output.contains(r#""age": 31"#) || output.contains(r#""age":31"#));
        assert!(output.contains(r#""name": "John Doe""#));
        assert!(output.ends_with("6. Verified deletion"));
        assert_eq!(server.stored("user:1"), None);
    }

    #[tokio::test]
    async fn test_demo_over_rest() {
        colored::control::set_override(false);
        let rest = MockRest::start().await;
        let ctx = Context {
            base_url: rest.base_url(),
            timeout: Duration::from_secs(5),
            tls: None,
            records: Records::Rest(rest.client()),
            rest: rest.client(),
        };

        let output = demo(&ctx).await.unwrap();
        assert!(output.contains("Rest transport"));
        assert!(output.contains(r#""age": 31"#));
        assert_eq!(rest.stored("user:1"), None);
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let server = MockServer::start().await;
        let rest = MockRest::start().await;
        let ctx = ws_context(&server, &rest).await;

        let err = execute(&ctx, Commands::Get { key: "user:404".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_incr_and_range_use_rest() {
        colored::control::set_override(false);
        let server = MockServer::start().await;
        let rest = MockRest::start().await;
        let ctx = ws_context(&server, &rest).await;

        let output = execute(
            &ctx,
            Commands::Incr {
                key: "counter".into(),
                by: 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(output, "counter = 3");

        rest.client().create("item:1", "a").await;
        rest.client().create("item:2", "b").await;
        let output = execute(
            &ctx,
            Commands::Range {
                start: "item:1".into(),
                end: "item:9".into(),
                limit: None,
            },
        )
        .await
        .unwrap();
        assert!(output.contains("item:1 = a"));
        assert!(output.contains("item:2 = b"));
        assert!(server.requests().is_empty());
    }
}

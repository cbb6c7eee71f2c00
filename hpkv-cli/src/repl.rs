//! Interactive REPL.

use crate::commands::{self, Context};
use crate::Transport;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                            Show this help

  get <key>                       Read a record
  set <key> <value>               Create or replace a record
  update <key> <value>            Replace a record
  patch <key> <json>              Merge JSON fields into a record
  delete <key>                    Delete a record

  incr <key> [amount]             Atomically increment a counter
  range <start> <end> [limit]     List records in a key range
  token <key>...                  Issue a WebSocket token for keys

  demo                            Run the CRUD walkthrough

  quit, exit                      Exit the REPL

Values are JSON when they parse as JSON, plain text otherwise.
"#;

pub async fn run(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "HPKV CLI".bold().cyan());

    if ctx.records.transport() == Transport::Ws {
        println!("Connecting to {}...", ctx.base_url);
        ctx.records.connect().await?;
        println!("{}", "Connected!".green());
    } else {
        println!("Using REST API at {}", ctx.base_url);
    }

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".hpkv_history"))
        .unwrap_or_else(|_| ".hpkv_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "hpkv>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(ctx, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    ctx.records.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Runs one REPL line. `Ok(None)` means exit.
async fn execute_repl_command(
    ctx: &Context,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let cmd = cmd.to_lowercase();
    let args: Vec<&str> = rest.split_whitespace().collect();

    let output = match cmd.as_str() {
        "help" | "?" => HELP_TEXT.to_string(),

        "quit" | "exit" | "q" => return Ok(None),

        "get" | "g" => match args.as_slice() {
            [key] => commands::get(ctx, key).await?,
            _ => "Usage: get <key>".to_string(),
        },

        "set" | "s" | "update" | "u" | "patch" | "p" => {
            // The value is the remainder of the line so JSON may contain spaces
            let Some((key, value)) = rest.split_once(char::is_whitespace) else {
                return Ok(Some(format!("Usage: {} <key> <value>", cmd)));
            };
            let value = commands::parse_value_arg(value.trim())?;
            match cmd.as_str() {
                "set" | "s" => commands::set(ctx, key, value).await?,
                "patch" | "p" => commands::update(ctx, key, value, true).await?,
                _ => commands::update(ctx, key, value, false).await?,
            }
        }

        "delete" | "del" | "d" => match args.as_slice() {
            [key] => commands::delete(ctx, key).await?,
            _ => "Usage: delete <key>".to_string(),
        },

        "incr" | "i" => match args.as_slice() {
            [key] => commands::incr(ctx, key, 1).await?,
            [key, amount] => commands::incr(ctx, key, amount.parse()?).await?,
            _ => "Usage: incr <key> [amount]".to_string(),
        },

        "range" | "r" => match args.as_slice() {
            [start, end] => commands::range(ctx, start, end, None).await?,
            [start, end, limit] => commands::range(ctx, start, end, Some(limit.parse()?)).await?,
            _ => "Usage: range <start> <end> [limit]".to_string(),
        },

        "token" => {
            if args.is_empty() {
                "Usage: token <key>...".to_string()
            } else {
                let keys: Vec<String> = args.iter().map(|s| s.to_string()).collect();
                ctx.rest.websocket_token(&keys).await?
            }
        }

        "demo" => commands::demo(ctx).await?,

        _ => format!("Unknown command: {}. Type 'help' for help.", cmd),
    };

    Ok(Some(output))
}

//! Line-oriented command shell in front of the supervisor.

use crate::error::MirrorError;
use crate::mirror::{SourceGroup, SupervisorHandle};
use anyhow::Result;
use std::iter::Peekable;
use std::path::PathBuf;
use std::str::Chars;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const PROMPT: &str = "> ";
const DEFAULT_LOG_LINES: usize = 20;

const HELP: &str = "\
Commands:
  add <source> <target...>     start mirroring source onto each target
  end <source> <target...>     stop the given backups
  restore <source> <target>    make source match target again
  list                         show active backups by source
  log [n]                      show the last n activity entries
  help                         show this help
  exit                         stop all backups and quit";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShellError {
    #[error("Parse error: unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("Parse error: trailing backslash")]
    TrailingBackslash,

    #[error("Parse error: command substitution not allowed")]
    CommandSubstitution,

    #[error("Parse error: bad substitution")]
    BadSubstitution,

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Unknown command: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Add { source: PathBuf, targets: Vec<PathBuf> },
    End { source: PathBuf, targets: Vec<PathBuf> },
    Restore { source: PathBuf, target: PathBuf },
    List,
    Log(usize),
    Help,
    Exit,
}

/// Split a line into words the way a POSIX shell would: quotes group,
/// backslashes escape, a leading `~` becomes the home directory and
/// `$VAR` / `${VAR}` expand from the environment (unset expands to nothing).
/// Command substitution is refused. Expanded values are not split further.
pub fn split_words(line: &str) -> std::result::Result<Vec<String>, ShellError> {
    let mut words = Vec::new();
    let mut current = String::new();
    // Distinguishes `''` (an empty word) from no word at all
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '~' if !in_word && chars.peek().map_or(true, |&n| n == '/' || n.is_whitespace()) => {
                in_word = true;
                match dirs::home_dir() {
                    Some(home) => current.push_str(&home.to_string_lossy()),
                    None => current.push('~'),
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ShellError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(ShellError::UnterminatedQuote('"')),
                        },
                        Some('$') => expand_variable(&mut chars, &mut current)?,
                        Some('`') => return Err(ShellError::CommandSubstitution),
                        Some(c) => current.push(c),
                        None => return Err(ShellError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(ShellError::TrailingBackslash),
                }
            }
            '$' => {
                // An unquoted expansion to nothing does not make a word
                let before = current.len();
                expand_variable(&mut chars, &mut current)?;
                in_word |= current.len() > before;
            }
            '`' => return Err(ShellError::CommandSubstitution),
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn is_name_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

/// Expand what follows a `$` into `out`. A `$` not followed by a name is
/// kept literally.
fn expand_variable(chars: &mut Peekable<Chars<'_>>, out: &mut String) -> std::result::Result<(), ShellError> {
    let name = match chars.peek() {
        Some('(') => return Err(ShellError::CommandSubstitution),
        Some('{') => {
            chars.next();
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) if is_name_char(c) => name.push(c),
                    _ => return Err(ShellError::BadSubstitution),
                }
            }
            if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(ShellError::BadSubstitution);
            }
            name
        }
        Some(&c) if c == '_' || c.is_ascii_alphabetic() => {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if !is_name_char(c) {
                    break;
                }
                name.push(c);
                chars.next();
            }
            name
        }
        _ => {
            out.push('$');
            return Ok(());
        }
    };

    if let Some(value) = std::env::var_os(&name) {
        out.push_str(&value.to_string_lossy());
    }
    Ok(())
}

/// `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> std::result::Result<Option<ShellCommand>, ShellError> {
    let words = split_words(line)?;
    let Some((name, args)) = words.split_first() else {
        return Ok(None);
    };
    let paths = || args.iter().map(PathBuf::from);

    let command = match name.as_str() {
        "add" if args.len() >= 2 => ShellCommand::Add {
            source: PathBuf::from(&args[0]),
            targets: paths().skip(1).collect(),
        },
        "add" => return Err(ShellError::Usage("add <source> <target...>")),
        "end" if args.len() >= 2 => ShellCommand::End {
            source: PathBuf::from(&args[0]),
            targets: paths().skip(1).collect(),
        },
        "end" => return Err(ShellError::Usage("end <source> <target...>")),
        "restore" if args.len() == 2 => ShellCommand::Restore {
            source: PathBuf::from(&args[0]),
            target: PathBuf::from(&args[1]),
        },
        "restore" => return Err(ShellError::Usage("restore <source> <target>")),
        "list" => ShellCommand::List,
        "log" => match args {
            [] => ShellCommand::Log(DEFAULT_LOG_LINES),
            [n] => match n.parse() {
                Ok(n) => ShellCommand::Log(n),
                Err(_) => return Err(ShellError::Usage("log [n]")),
            },
            _ => return Err(ShellError::Usage("log [n]")),
        },
        "help" => ShellCommand::Help,
        "exit" | "quit" => ShellCommand::Exit,
        other => return Err(ShellError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Render the grouped listing, one `Source:` header per source root.
pub fn format_listing(groups: &[SourceGroup]) -> Vec<String> {
    if groups.is_empty() {
        return vec!["No active backups".to_string()];
    }

    let mut lines = Vec::new();
    for group in groups {
        lines.push(format!("Source: {}", group.source.display()));
        for pair in &group.targets {
            let uptime = humantime::format_duration(Duration::from_secs(pair.uptime_secs));
            lines.push(format!("  -> {} ({}, up {})", pair.target.display(), pair.worker, uptime));
        }
    }
    lines
}

pub struct Shell<W> {
    supervisor: SupervisorHandle,
    output: W,
    interactive: bool,
}

impl<W: AsyncWrite + Unpin> Shell<W> {
    /// `interactive` controls the banner and prompt.
    pub fn new(supervisor: SupervisorHandle, output: W, interactive: bool) -> Self {
        Self {
            supervisor,
            output,
            interactive,
        }
    }

    /// Read commands until `exit` or end of input, then shut the supervisor
    /// down.
    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<W> {
        let mut lines = input.lines();
        if self.interactive {
            self.say("Commands: add, end, restore, list, log, help, exit").await?;
        }

        loop {
            if self.interactive {
                self.output.write_all(PROMPT.as_bytes()).await?;
                self.output.flush().await?;
            }

            let Some(line) = lines.next_line().await? else {
                break;
            };

            match parse_command(&line) {
                Ok(None) => {}
                Ok(Some(ShellCommand::Exit)) => break,
                Ok(Some(command)) => self.execute(command).await?,
                Err(e) => self.say(&e.to_string()).await?,
            }
        }

        debug!("Shell finished, shutting down supervisor");
        match self.supervisor.shutdown().await {
            Ok(()) | Err(MirrorError::SupervisorGone) => {}
            Err(e) => return Err(e.into()),
        }
        self.output.flush().await?;
        Ok(self.output)
    }

    async fn execute(&mut self, command: ShellCommand) -> Result<()> {
        match command {
            ShellCommand::Add { source, targets } => {
                for target in targets {
                    match self.supervisor.add(&source, &target).await {
                        Ok(_) => self.say("Backup started").await?,
                        Err(e) => self.say(&format!("Error: {}", e)).await?,
                    }
                }
            }
            ShellCommand::End { source, targets } => {
                for target in targets {
                    match self.supervisor.remove(&source, &target).await {
                        Ok(_) => self.say("Backup ended").await?,
                        Err(MirrorError::NotFound) => self.say("Backup not found").await?,
                        Err(e) => self.say(&format!("Error: {}", e)).await?,
                    }
                }
            }
            ShellCommand::Restore { source, target } => {
                self.say("Restoring backup...").await?;
                match self.supervisor.restore(source, target).await {
                    Ok(report) => self.say(&format!("Restore complete: {}", report)).await?,
                    Err(e) => self.say(&format!("Error: {}", e)).await?,
                }
            }
            ShellCommand::List => {
                let groups = match self.supervisor.list().await {
                    Ok(groups) => groups,
                    Err(e) => return self.say(&format!("Error: {}", e)).await,
                };
                for line in format_listing(&groups) {
                    self.say(&line).await?;
                }
            }
            ShellCommand::Log(n) => {
                for entry in self.supervisor.logs().get_logs(Some(n)) {
                    let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    let line = match &entry.pair {
                        Some(pair) => format!("{} {:5} {}: {}", when, entry.level, pair, entry.message),
                        None => format!("{} {:5} {}", when, entry.level, entry.message),
                    };
                    self.say(&line).await?;
                }
            }
            ShellCommand::Help => self.say(HELP).await?,
            ShellCommand::Exit => {}
        }
        Ok(())
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.output.write_all(line.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        Ok(())
    }
}

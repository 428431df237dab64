//! Line commands and plain-text rendering of the board.

use std::fmt::Write;

use notero_core::{AggregatedNote, User};

pub const HELP: &str = "\
commands:
  note <text>   post a note
  vote <n>      toggle your vote on note #n
  board         show the board
  users         list everyone who joined
  whoami        show your identity
  quit          leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Note(String),
    Vote(usize),
    Board,
    Users,
    WhoAmI,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingArgument(&'static str),
    BadNumber(String),
    Unknown(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "type `help` for commands"),
            ParseError::MissingArgument(cmd) => write!(f, "`{cmd}` needs an argument"),
            ParseError::BadNumber(arg) => write!(f, "`{arg}` is not a note number"),
            ParseError::Unknown(cmd) => write!(f, "unknown command `{cmd}`, try `help`"),
        }
    }
}

impl std::error::Error for ParseError {}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd {
        "" => Err(ParseError::Empty),
        "note" if rest.is_empty() => Err(ParseError::MissingArgument("note")),
        "note" => Ok(Command::Note(rest.to_string())),
        "vote" if rest.is_empty() => Err(ParseError::MissingArgument("vote")),
        "vote" => match rest.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Command::Vote(n)),
            _ => Err(ParseError::BadNumber(rest.to_string())),
        },
        "board" | "ls" => Ok(Command::Board),
        "users" => Ok(Command::Users),
        "whoami" => Ok(Command::WhoAmI),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// Display order, so `vote <n>` keeps pointing at the same note.
pub fn ordered(mut board: Vec<AggregatedNote>) -> Vec<AggregatedNote> {
    board.sort_by(|a, b| {
        a.note
            .text
            .cmp(&b.note.text)
            .then_with(|| a.note.id.cmp(&b.note.id))
    });
    board
}

pub fn render_board(board: &[AggregatedNote]) -> String {
    if board.is_empty() {
        return "(the board is empty)\n".to_string();
    }
    let mut out = String::new();
    for (i, entry) in board.iter().enumerate() {
        let mark = if entry.voted_by_current_user { '*' } else { ' ' };
        let _ = writeln!(
            out,
            "{:>3}. [{:>2}{mark}] {}  ({})",
            i + 1,
            entry.vote_count,
            entry.note.text,
            entry.note.author.name
        );
    }
    out
}

pub fn render_users(users: &[User], me: &User) -> String {
    let mut names: Vec<&User> = users.iter().collect();
    names.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::new();
    for user in names {
        let you = if user.id == me.id { " (you)" } else { "" };
        let _ = writeln!(out, "  {}{you}", user.name);
    }
    out
}

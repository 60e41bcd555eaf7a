// ABOUTME: Line-oriented console commands for driving the catalog from stdin.
// ABOUTME: Parses each line into a Command and renders the current catalog as text.

use std::fmt::Write as _;

use marquee_core::{AppState, Intent, MovieId, SortOrder};
use thiserror::Error;
use ulid::Ulid;

pub const HELP: &str = "commands: add | delete <id> | fav <id> | search <text> | \
sort title|id asc|desc|off | clear | list | quit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} needs a record id")]
    MissingId(&'static str),

    #[error("not a record id: {0}")]
    BadId(String),

    #[error("usage: sort title|id asc|desc|off")]
    BadSort,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Dispatch(Intent),
    List,
    Help,
    Quit,
}

/// Parse one input line. Blank lines list the catalog.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match word {
        "" | "list" | "ls" => Command::List,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "add" => Command::Dispatch(Intent::Add),
        "delete" | "rm" => Command::Dispatch(Intent::Delete {
            id: parse_id("delete", rest)?,
        }),
        "fav" => Command::Dispatch(Intent::Favorite {
            id: parse_id("fav", rest)?,
        }),
        "search" => Command::Dispatch(Intent::SearchStringChanged {
            search: rest.to_string(),
        }),
        "clear" => Command::Dispatch(Intent::ClearAllSorting),
        "sort" => parse_sort(rest)?,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn parse_id(command: &'static str, raw: &str) -> Result<MovieId, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::MissingId(command));
    }
    Ulid::from_string(raw).map_err(|_| ParseError::BadId(raw.to_string()))
}

fn parse_sort(rest: &str) -> Result<Command, ParseError> {
    let mut parts = rest.split_whitespace();
    let (Some(field), Some(direction), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::BadSort);
    };
    let order = match direction {
        "asc" => Some(SortOrder::Forward),
        "desc" => Some(SortOrder::Reverse),
        "off" => None,
        _ => return Err(ParseError::BadSort),
    };
    let intent = match field {
        "title" => Intent::TitleSortChanged { order },
        "id" => Intent::IdSortChanged { order },
        _ => return Err(ParseError::BadSort),
    };
    Ok(Command::Dispatch(intent))
}

/// Render the catalog view: the active query followed by one line per record.
pub fn render(state: &AppState) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "search={:?} title={} id={} ({} records)",
        state.search_string,
        sort_label(state.title_sort),
        sort_label(state.id_sort),
        state.entities.len()
    );
    for movie in &state.entities {
        let star = if movie.favorite { '*' } else { ' ' };
        let _ = write!(out, "{star} {}  {}", movie.id, movie.title);
        if !movie.cast.is_empty() {
            let _ = write!(out, " ({})", movie.cast.join(", "));
        }
        out.push('\n');
    }
    out
}

fn sort_label(order: Option<SortOrder>) -> &'static str {
    match order {
        Some(SortOrder::Forward) => "asc",
        Some(SortOrder::Reverse) => "desc",
        None => "off",
    }
}

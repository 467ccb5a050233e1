//! Input line parsing.
//!
//! Lines starting with `:` are driver commands; everything else is a chat
//! message for the open table.

use tablechat_types::RowId;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Tables,
    Open { table: String, page: u32 },
    Page(u32),
    /// Run the latest attached query.
    Query,
    /// Run ad-hoc SQL against the open table.
    Sql(String),
    Select(Target),
    Selection,
    Clear,
    Usage,
    Reconnect,
    Reset,
    Help,
    Quit,
}

/// What a `:select` toggles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Row(RowId),
    Cell { row_id: RowId, column: String },
    Column(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command :{0} (try :help)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid page number: {0}")]
    Page(String),
}

pub const HELP: &str = "\
commands:
  :tables                      list tables
  :open <table> [page]         open a table page
  :page <n>                    switch page of the open table
  :query                       highlight rows from the latest attached query
  :sql <statement>             run a retrieval query and highlight matches
  :select row <id>             toggle a row
  :select cell <id> <column>   toggle a cell
  :select column <name>        toggle a column
  :selection                   show the selection of the open table
  :clear                       clear the selection of the open table
  :usage                       token usage so far
  :reconnect                   reconnect the chat stream now
  :reset                       start a new conversation thread
  :quit
anything else is sent as a question about the open table";

/// Parse one line. Returns `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<Input>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix(':') else {
        return Ok(Some(Input::Chat(line.to_string())));
    };

    let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    let mut words = args.split_whitespace();

    let input = match name {
        "tables" => Input::Tables,
        "open" => {
            let table = words.next().ok_or(ParseError::Usage(":open <table> [page]"))?;
            let page = words.next().map(page_number).transpose()?.unwrap_or(1);
            Input::Open {
                table: table.to_string(),
                page,
            }
        }
        "page" => {
            let n = words.next().ok_or(ParseError::Usage(":page <n>"))?;
            Input::Page(page_number(n)?)
        }
        "query" => Input::Query,
        "sql" => {
            if args.is_empty() {
                return Err(ParseError::Usage(":sql <statement>"));
            }
            Input::Sql(args.to_string())
        }
        "select" => Input::Select(target(&mut words)?),
        "selection" => Input::Selection,
        "clear" => Input::Clear,
        "usage" => Input::Usage,
        "reconnect" => Input::Reconnect,
        "reset" => Input::Reset,
        "help" | "h" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(input))
}

fn page_number(s: &str) -> Result<u32, ParseError> {
    match s.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ParseError::Page(s.to_string())),
    }
}

fn target<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Target, ParseError> {
    const USAGE: &str = ":select row <id> | cell <id> <column> | column <name>";
    let kind = words.next().ok_or(ParseError::Usage(USAGE))?;
    let target = match (kind, words.next(), words.next()) {
        ("row", Some(id), None) => Target::Row(RowId::new(id)),
        ("cell", Some(id), Some(column)) => Target::Cell {
            row_id: RowId::new(id),
            column: column.to_string(),
        },
        ("column", Some(name), None) => Target::Column(name.to_string()),
        _ => return Err(ParseError::Usage(USAGE)),
    };
    Ok(target)
}

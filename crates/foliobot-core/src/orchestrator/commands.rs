//! Local side-channel commands.
//!
//! These short-circuit before any backend is involved: they never
//! count as a model turn and never enter the conversation history.

/// A recognized side-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    SetColor(String),
}

pub const HELP_TEXT: &str = "\
Commands:
  \\help           Show this help text
  \\color <value>  Set the color of your messages (a name or hex value)

Anything else is sent to the assistant. Ask about Pablo's experience,
skills, and projects, or ask to book a meeting.";

/// Parse an input line as a side-channel command. Returns `None` for
/// regular chat input, including unrecognized backslash words.
pub fn parse(input: &str) -> Option<Command> {
    let rest = input.trim().strip_prefix('\\')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    match parts.next()? {
        "help" => Some(Command::Help),
        "color" => Some(Command::SetColor(
            parts.next().unwrap_or("").trim().to_string(),
        )),
        _ => None,
    }
}

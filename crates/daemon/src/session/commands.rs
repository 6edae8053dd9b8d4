//! Command interpreter for `command` envelopes.

/// Help text shown for the `help` command.
pub const HELP_TEXT: &str = "Available commands: help, clear, date, echo <text>, or any shell command";

/// What to do with an interpreted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Write this text to the shell's input.
    Shell(String),
    /// Send this text back to the client as output without touching the shell.
    Reply(String),
}

/// Maps a command string to its action.
///
/// A few reserved words are rewritten; everything else goes to the shell
/// terminated by exactly one newline.
pub fn interpret(command: &str) -> CommandAction {
    let line = command.trim_end_matches(['\r', '\n']);

    match line.trim() {
        "help" => return CommandAction::Shell(format!("echo '{HELP_TEXT}'\n")),
        "clear" => return CommandAction::Shell("clear\n".to_string()),
        "date" => return CommandAction::Shell("date\n".to_string()),
        _ => {}
    }

    if let Some(text) = line.strip_prefix("echo ") {
        return CommandAction::Reply(format!("{text}\r\n"));
    }

    CommandAction::Shell(format!("{line}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_words() {
        assert_eq!(
            interpret("help"),
            CommandAction::Shell(format!("echo '{HELP_TEXT}'\n"))
        );
        assert_eq!(interpret("clear"), CommandAction::Shell("clear\n".into()));
        assert_eq!(interpret("date\n"), CommandAction::Shell("date\n".into()));
        assert_eq!(interpret("  date  "), CommandAction::Shell("date\n".into()));
    }

    #[test]
    fn test_echo_replies_directly() {
        assert_eq!(
            interpret("echo hello world"),
            CommandAction::Reply("hello world\r\n".into())
        );
        assert_eq!(interpret("echo \n"), CommandAction::Reply("\r\n".into()));
    }

    #[test]
    fn test_echo_without_space_goes_to_shell() {
        assert_eq!(interpret("echo"), CommandAction::Shell("echo\n".into()));
        assert_eq!(interpret("echoes"), CommandAction::Shell("echoes\n".into()));
    }

    #[test]
    fn test_other_commands_get_single_newline() {
        assert_eq!(interpret("ls -la"), CommandAction::Shell("ls -la\n".into()));
        assert_eq!(interpret("ls -la\r\n"), CommandAction::Shell("ls -la\n".into()));
        assert_eq!(interpret(""), CommandAction::Shell("\n".into()));
    }
}

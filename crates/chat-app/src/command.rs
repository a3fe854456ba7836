use std::path::PathBuf;

/// One line of terminal input, after line continuation has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    /// 1-based position in the session list.
    Select(usize),
    Delete(usize),
    Rename(String),
    Attach(PathBuf),
    Detach,
    Retry,
    Regenerate,
    ToggleTheme,
    ToggleSidebar,
    Help,
    Quit,
    Invalid(String),
}

pub const HELP_TEXT: &str = "\
/new              start a new chat
/list             list chats, newest first
/select <n>       switch to chat number n
/delete <n>       delete chat number n
/rename <title>   rename the current chat
/attach <path>    attach a file to the next message
/detach           drop the pending attachment
/retry            resend the last failed message
/regen            regenerate the last reply
/theme            toggle light/dark theme
/sidebar          toggle the chat list shown before each prompt
/help             show this help
/quit             exit
End a line with \\ to continue typing on the next line.";

impl Command {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Self::Send(input.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "list" | "ls" => Self::List,
            "select" | "open" => parse_index(argument).map_or_else(
                || Self::Invalid("usage: /select <n>".to_string()),
                Self::Select,
            ),
            "delete" | "rm" => parse_index(argument).map_or_else(
                || Self::Invalid("usage: /delete <n>".to_string()),
                Self::Delete,
            ),
            "rename" if !argument.is_empty() => Self::Rename(argument.to_string()),
            "rename" => Self::Invalid("usage: /rename <title>".to_string()),
            "attach" if !argument.is_empty() => Self::Attach(PathBuf::from(argument)),
            "attach" => Self::Invalid("usage: /attach <path>".to_string()),
            "detach" => Self::Detach,
            "retry" => Self::Retry,
            "regen" | "regenerate" => Self::Regenerate,
            "theme" => Self::ToggleTheme,
            "sidebar" => Self::ToggleSidebar,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => Self::Invalid(format!("unknown command `/{other}`, try /help")),
        }
    }
}

fn parse_index(argument: &str) -> Option<usize> {
    argument.parse::<usize>().ok().filter(|index| *index > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent_verbatim() {
        assert_eq!(
            Command::parse("Muraho\namakuru?"),
            Command::Send("Muraho\namakuru?".to_string())
        );
        assert_eq!(Command::parse(""), Command::Send(String::new()));
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(Command::parse("/new"), Command::New);
        assert_eq!(Command::parse("  /select 2 "), Command::Select(2));
        assert_eq!(Command::parse("/DELETE 1"), Command::Delete(1));
        assert_eq!(
            Command::parse("/rename Ingendo   i Musanze"),
            Command::Rename("Ingendo   i Musanze".to_string())
        );
        assert_eq!(
            Command::parse("/attach ./ifoto.png"),
            Command::Attach(PathBuf::from("./ifoto.png"))
        );
        assert_eq!(Command::parse("/regen"), Command::Regenerate);
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn bad_arguments_and_unknown_commands_are_invalid() {
        assert!(matches!(Command::parse("/select"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/select 0"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/delete x"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/rename"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/frobnicate"), Command::Invalid(_)));
    }
}

use thiserror::Error;

pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub summary: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "/help",
        aliases: &[],
        usage: "/help",
        summary: "Show this help message",
    },
    CommandSpec {
        name: "/agents",
        aliases: &[],
        usage: "/agents",
        summary: "List available agents",
    },
    CommandSpec {
        name: "/agent",
        aliases: &[],
        usage: "/agent <name> <task>",
        summary: "Run a task with a specific agent",
    },
    CommandSpec {
        name: "/sync",
        aliases: &[],
        usage: "/sync",
        summary: "Upload the workspace to the cloud",
    },
    CommandSpec {
        name: "/status",
        aliases: &[],
        usage: "/status",
        summary: "Show connection and platform status",
    },
    CommandSpec {
        name: "/clear",
        aliases: &[],
        usage: "/clear",
        summary: "Clear the screen",
    },
    CommandSpec {
        name: "/exit",
        aliases: &["/quit"],
        usage: "/exit",
        summary: "Leave interactive mode",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Agents,
    Agent { name: String, task: String },
    Sync,
    Status,
    Clear,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command: {0} (try /help)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub fn is_command(line: &str) -> bool {
    line.trim_start().starts_with('/')
}

pub fn parse_command(line: &str) -> Result<SlashCommand, CommandError> {
    let trimmed = line.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (trimmed, ""),
    };
    let head = head.to_ascii_lowercase();
    let spec = COMMANDS
        .iter()
        .find(|spec| spec.name == head || spec.aliases.iter().any(|alias| *alias == head))
        .ok_or_else(|| CommandError::Unknown(head.clone()))?;
    match spec.name {
        "/help" => Ok(SlashCommand::Help),
        "/agents" => Ok(SlashCommand::Agents),
        "/agent" => {
            let (name, task) = rest
                .split_once(char::is_whitespace)
                .map(|(name, task)| (name.trim(), task.trim()))
                .ok_or(CommandError::Usage(spec.usage))?;
            if name.is_empty() || task.is_empty() {
                return Err(CommandError::Usage(spec.usage));
            }
            Ok(SlashCommand::Agent {
                name: name.to_string(),
                task: task.to_string(),
            })
        }
        "/sync" => Ok(SlashCommand::Sync),
        "/status" => Ok(SlashCommand::Status),
        "/clear" => Ok(SlashCommand::Clear),
        "/exit" => Ok(SlashCommand::Exit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

pub fn help_text() -> String {
    let width = COMMANDS
        .iter()
        .map(|spec| spec.usage.len())
        .max()
        .unwrap_or(0);
    let mut out = String::from("Available commands:\n");
    for spec in COMMANDS {
        out.push_str(&format!("  {:<width$}  {}", spec.usage, spec.summary));
        if !spec.aliases.is_empty() {
            out.push_str(&format!(" (also {})", spec.aliases.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_table_entry() {
        assert_eq!(parse_command("/help"), Ok(SlashCommand::Help));
        assert_eq!(parse_command("/agents"), Ok(SlashCommand::Agents));
        assert_eq!(parse_command(" /SYNC "), Ok(SlashCommand::Sync));
        assert_eq!(parse_command("/status"), Ok(SlashCommand::Status));
        assert_eq!(parse_command("/clear"), Ok(SlashCommand::Clear));
        assert_eq!(parse_command("/exit"), Ok(SlashCommand::Exit));
        assert_eq!(parse_command("/quit"), Ok(SlashCommand::Exit));
    }

    #[test]
    fn agent_takes_name_and_rest_of_line_as_task() {
        assert_eq!(
            parse_command("/agent debugger  fix the failing   test"),
            Ok(SlashCommand::Agent {
                name: "debugger".to_string(),
                task: "fix the failing   test".to_string(),
            })
        );
        assert_eq!(
            parse_command("/agent debugger"),
            Err(CommandError::Usage("/agent <name> <task>"))
        );
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert_eq!(
            parse_command("/deploy now"),
            Err(CommandError::Unknown("/deploy".to_string()))
        );
        assert!(is_command("  /x"));
        assert!(!is_command("hello /x"));
    }

    #[test]
    fn help_lists_every_command() {
        let help = help_text();
        for spec in COMMANDS {
            assert!(help.contains(spec.usage), "{}", spec.usage);
        }
        assert!(help.contains("/quit"));
    }
}

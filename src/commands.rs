/// Available commands, role gating and autocomplete logic
use crate::tracker::{Role, View};

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
  /// View the command belongs to; gates who may run it
  pub view: View,
}

impl Command {
  pub fn allowed_for(&self, role: Role) -> bool {
    role.can_view(self.view)
  }
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "list",
    aliases: &["ls", "issues"],
    description: "List issues, newest first",
    view: View::Issues,
  },
  Command {
    name: "show",
    aliases: &["s", "issue"],
    description: "Show an issue with comments, attachments and activity",
    view: View::Issues,
  },
  Command {
    name: "create",
    aliases: &["new", "report"],
    description: "Report a new issue",
    view: View::Issues,
  },
  Command {
    name: "update",
    aliases: &["u", "edit"],
    description: "Change status, priority or other fields of an issue",
    view: View::Issues,
  },
  Command {
    name: "delete",
    aliases: &["rm"],
    description: "Delete an issue",
    view: View::Issues,
  },
  Command {
    name: "comment",
    aliases: &["c"],
    description: "Comment on an issue",
    view: View::Issues,
  },
  Command {
    name: "attach",
    aliases: &["a", "upload"],
    description: "Attach a file to an issue",
    view: View::Issues,
  },
  Command {
    name: "analytics",
    aliases: &["stats"],
    description: "Issue counts by status, priority and department",
    view: View::Analytics,
  },
  Command {
    name: "users",
    aliases: &["admin"],
    description: "List users and their roles",
    view: View::Admin,
  },
  Command {
    name: "role",
    aliases: &["r"],
    description: "Change a user's role",
    view: View::Admin,
  },
];

/// Look up a command by name or alias.
pub fn find(name: &str) -> Option<&'static Command> {
  let name = name.to_lowercase();
  COMMANDS
    .iter()
    .find(|cmd| cmd.name == name || cmd.aliases.contains(&name.as_str()))
}

/// Commands `role` may run
pub fn available(role: Role) -> Vec<&'static Command> {
  COMMANDS.iter().filter(|cmd| cmd.allowed_for(role)).collect()
}

/// Get autocomplete suggestions for a given input, hiding commands the role
/// cannot run
pub fn get_suggestions(input: &str, role: Role) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return available(role);
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS.iter().filter(|cmd| cmd.allowed_for(role)) {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
      continue;
    }

    // Fuzzy match on alias
    if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

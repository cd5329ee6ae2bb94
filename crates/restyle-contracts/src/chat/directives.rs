/// Chat-loop input, parsed ahead of free text. Anything that is not a
/// recognized `/command` is a message for the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Room { path: String },
    Style { text: String },
    Redesign,
    Products { label: String },
    Help,
    Quit,
    Unknown { command: String },
    Say { message: String },
    Noop,
}

pub const CHAT_HELP: &[(&str, &str)] = &[
    ("/room <path>", "load a room photo (quotes allowed for spaces)"),
    ("/style <text>", "set the style to apply on the next redesign"),
    ("/redesign", "run the redesign pipeline for the active room and style"),
    ("/products <label>", "look up shoppable products for one label"),
    ("/help", "show this list"),
    ("/quit", "leave the chat"),
];

pub fn parse_directive(text: &str) -> Directive {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Directive::Noop;
    }

    let Some(slash_tail) = trimmed.strip_prefix('/') else {
        return Directive::Say {
            message: trimmed.to_string(),
        };
    };

    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return Directive::Say {
            message: trimmed.to_string(),
        };
    }

    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    match command.as_str() {
        "room" => Directive::Room {
            path: parse_path_arg(arg),
        },
        "style" => Directive::Style {
            text: arg.to_string(),
        },
        "redesign" => Directive::Redesign,
        "products" => Directive::Products {
            label: arg.to_string(),
        },
        "help" => Directive::Help,
        "quit" | "exit" => Directive::Quit,
        _ => Directive::Unknown { command },
    }
}

fn parse_path_arg(arg: &str) -> String {
    if arg.is_empty() {
        return String::new();
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<String>>(),
    };
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

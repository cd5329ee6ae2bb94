mod directives;
mod transcript;

pub use directives::{parse_directive, Directive, CHAT_HELP};
pub use transcript::{ChatTurn, Role, Transcript};

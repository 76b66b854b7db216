//! G-code command values and the line parser.
//!
//! The grammar here is the practical RepRap dialect: one command per line,
//! `;` comments, optional `N` line numbers and `*` checksums (both
//! stripped), letter-prefixed parameters. `M32` and `M117` take the rest of
//! the line as text.

pub mod source;

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Opcode, uppercased: "G1", "M105", "T0", …
    pub opcode: String,
    /// Letter parameters in line order.
    params: Vec<(char, f64)>,
    /// Trailing text argument (file path for M32, message for M117).
    pub text: Option<String>,
}

impl Command {
    pub fn opcode_is(&self, opcode: &str) -> bool {
        self.opcode == opcode
    }

    pub fn get(&self, letter: char) -> Option<f64> {
        self.params
            .iter()
            .find(|(l, _)| *l == letter)
            .map(|(_, v)| *v)
    }

    pub fn has(&self, letter: char) -> bool {
        self.get(letter).is_some()
    }

    pub fn has_any_xyze(&self) -> bool {
        self.has('X') || self.has('Y') || self.has('Z') || self.has('E')
    }
}

/// Reply sent back to the command's originating source.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    OkMsg(String),
    Error(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => write!(f, "ok"),
            Response::OkMsg(msg) => write!(f, "ok {msg}"),
            Response::Error(msg) => write!(f, "Error:{msg}"),
        }
    }
}

/// Opcodes whose argument is free text rather than letter words.
fn takes_text_argument(opcode: &str) -> bool {
    matches!(opcode, "M32" | "M117")
}

/// Parse one line. Returns `None` for blank lines and pure comments.
pub fn parse_line(line: &str) -> Option<Command> {
    let line = match line.find(';') {
        Some(at) => &line[..at],
        None => line,
    };
    let line = match line.find('*') {
        Some(at) => &line[..at],
        None => line,
    };
    let mut words = line.split_whitespace().peekable();

    // skip the N<line-number> word if present
    let first = loop {
        let word = words.next()?;
        if !word.starts_with(['N', 'n']) || word.len() < 2 {
            break word;
        }
        if word[1..].parse::<u64>().is_err() {
            break word;
        }
    };

    let opcode = first.to_ascii_uppercase();
    let mut command = Command {
        opcode,
        params: Vec::new(),
        text: None,
    };

    if takes_text_argument(&command.opcode) {
        let rest: Vec<&str> = words.collect();
        if !rest.is_empty() {
            command.text = Some(rest.join(" "));
        }
        return Some(command);
    }

    for word in words {
        let mut chars = word.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let value = chars.as_str();
        let value = if value.is_empty() {
            0.0
        } else {
            value.parse::<f64>().ok()?
        };
        command.params.push((letter, value));
    }
    Some(command)
}

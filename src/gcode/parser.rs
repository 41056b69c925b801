// src/gcode/parser.rs
use super::GCodeError;

/// A single parsed G-code line: an opcode like "G1" or "M105" plus its
/// parameter words. Parameter letters are folded to uppercase.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub opcode: String,
    pub params: Vec<Param>,
    /// Trailing free text, as used by M32 (filename) and M117 (message).
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Param {
    pub letter: char,
    pub value: f64,
}

impl Command {
    pub fn get(&self, letter: char) -> Option<f64> {
        self.params.iter().find(|p| p.letter == letter).map(|p| p.value)
    }

    pub fn has(&self, letter: char) -> bool {
        self.params.iter().any(|p| p.letter == letter)
    }

    pub fn has_any_xyze(&self) -> bool {
        self.has('X') || self.has('Y') || self.has('Z') || self.has('E')
    }
}

/// Opcodes whose argument is a raw string rather than parameter words.
fn takes_text_argument(opcode: &str) -> bool {
    matches!(opcode, "M32" | "M117")
}

/// Parse one line of G-code. Returns Ok(None) for blank/comment-only lines.
///
/// Accepts free whitespace between words, `;` comments, and case-insensitive
/// letters. Line numbers (`N..`) and checksums (`*..`) are stripped, matching
/// what hosts like OctoPrint send.
pub fn parse_line(line: &str) -> Result<Option<Command>, GCodeError> {
    let line = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    // strip "*<checksum>" if present
    let line = match line.find('*') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let mut rest = line.trim();
    if rest.is_empty() {
        return Ok(None);
    }

    // skip a leading line number word
    if rest.starts_with('N') || rest.starts_with('n') {
        let end = rest[1..]
            .find(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        rest = rest[end..].trim_start();
        if rest.is_empty() {
            return Ok(None);
        }
    }

    let (opcode, after) = take_word(rest).ok_or_else(|| GCodeError::Syntax {
        line: line.to_string(),
        reason: "expected an opcode word".to_string(),
    })?;
    let opcode = opcode.to_ascii_uppercase();
    if !opcode.starts_with(['G', 'M', 'T']) {
        return Err(GCodeError::Syntax {
            line: line.to_string(),
            reason: format!("line does not start with a G/M/T word: '{}'", opcode),
        });
    }

    if takes_text_argument(&opcode) {
        let text = after.trim();
        return Ok(Some(Command {
            opcode,
            params: Vec::new(),
            text: (!text.is_empty()).then(|| text.to_string()),
        }));
    }

    let mut params = Vec::new();
    let mut cursor = after.trim_start();
    while !cursor.is_empty() {
        let (word, after) = take_word(cursor).ok_or_else(|| GCodeError::Syntax {
            line: line.to_string(),
            reason: "malformed parameter word".to_string(),
        })?;
        let letter = word.chars().next().unwrap().to_ascii_uppercase();
        if !letter.is_ascii_alphabetic() {
            return Err(GCodeError::Syntax {
                line: line.to_string(),
                reason: format!("parameter does not start with a letter: '{}'", word),
            });
        }
        let value_str = &word[1..];
        // bare selector words like the X in "G28 X" carry an implicit 0
        let value = if value_str.is_empty() {
            0.0
        } else {
            value_str.parse::<f64>().map_err(|_| GCodeError::Syntax {
                line: line.to_string(),
                reason: format!("bad numeric value in '{}'", word),
            })?
        };
        params.push(Param { letter, value });
        cursor = after.trim_start();
    }

    Ok(Some(Command { opcode, params, text: None }))
}

/// Split off the next letter+number word. Returns (word, rest).
fn take_word(s: &str) -> Option<(&str, &str)> {
    let mut chars = s.char_indices();
    let (_, first) = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    let end = s[1..]
        .find(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

//! GDB Machine Interface (MI) Parser
//!
//! Parses GDB/MI output lines into records and value trees. The value
//! grammar is read in a single forward scan without backtracking:
//!
//! ```text
//! value  := '"' chars '"' | '{' [result (',' result)*] '}' | '[' [value (',' value)*] ']' | result
//! result := name '=' value
//! ```
//!
//! A backslash inside a quoted string is kept together with the character
//! that follows it; strings are not unescaped. Front ends built on top of
//! this format rely on seeing the raw escapes.

use crate::gdb::error::ParseError;
use crate::gdb::types::*;
use regex::Regex;

/// One classified line of GDB output
#[derive(Debug, Clone, PartialEq)]
pub enum MiOutputRecord {
    /// `^` result of the command in flight
    Result(CommandResult),
    /// `*` execution state change
    Exec(GdbEvent),
    /// `=` notification
    Notify(GdbEvent),
    /// `~` console stream
    Console(String),
    /// `&` log stream
    Log(String),
    /// `@` target program output
    Target(String),
}

/// GDB/MI Parser
pub struct MiParser {
    // `class[,results]` following the sigil of result and async records
    header_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            header_pattern: Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*)(?:,(.*))?$")
                .expect("record header pattern is valid"),
        }
    }

    /// Parse a single line of GDB/MI output.
    ///
    /// Blank lines, the `(gdb)` prompt and lines without a known sigil yield
    /// `Ok(None)`.
    pub fn parse_line(&self, line: &str) -> Result<Option<MiOutputRecord>, ParseError> {
        let line = line.trim_start().trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.trim_end() == "(gdb)" {
            return Ok(None);
        }

        let mut chars = line.chars();
        let sigil = chars.next().unwrap_or_default();
        let rest = chars.as_str();

        let record = match sigil {
            '^' => {
                let (class, payload) = self.parse_header(line, rest)?;
                let status = CommandStatus::from_keyword(class).ok_or_else(|| {
                    ParseError::new(format!("unknown result class '{}'", class), line, 1)
                })?;
                MiOutputRecord::Result(CommandResult::new(status, line, payload))
            }
            '*' => {
                let (name, payload) = self.parse_header(line, rest)?;
                MiOutputRecord::Exec(GdbEvent::new(name, payload.unwrap_or_else(MiValue::empty_tuple)))
            }
            '=' => {
                let (name, payload) = self.parse_header(line, rest)?;
                MiOutputRecord::Notify(GdbEvent::new(name, payload.unwrap_or_else(MiValue::empty_tuple)))
            }
            '~' => MiOutputRecord::Console(strip_quotes(rest).to_string()),
            '&' => MiOutputRecord::Log(strip_quotes(rest).to_string()),
            '@' => MiOutputRecord::Target(unescape_string(strip_quotes(rest))),
            _ => return Ok(None),
        };

        Ok(Some(record))
    }

    /// Split `class,results` and parse the results as tuple content
    fn parse_header<'a>(
        &self,
        line: &str,
        rest: &'a str,
    ) -> Result<(&'a str, Option<MiValue>), ParseError> {
        let caps = self
            .header_pattern
            .captures(rest)
            .ok_or_else(|| ParseError::new("malformed record header", line, 1))?;
        let class = caps.get(1).map_or("", |m| m.as_str());
        let payload = match caps.get(2) {
            Some(body) => Some(MiValue::Tuple(
                parse_results(body.as_str()).map_err(|e| e.offset_into(line, body.start() + 1))?,
            )),
            None => None,
        };
        Ok((class, payload))
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a comma separated `name=value` list, as found after a record class
pub fn parse_results(input: &str) -> Result<MiTuple, ParseError> {
    let mut cursor = Cursor::new(input);
    cursor.read_tuple(None)
}

/// Parse a single value that must span the whole input
pub fn parse_value(input: &str) -> Result<MiValue, ParseError> {
    let mut cursor = Cursor::new(input);
    let value = cursor.read_value()?;
    if cursor.peek().is_some() {
        return Err(cursor.error("unexpected trailing input"));
    }
    Ok(value)
}

impl ParseError {
    // Re-anchor an error found in a slice onto the full record line
    fn offset_into(self, line: &str, offset: usize) -> ParseError {
        ParseError::new(self.message, line, self.position + offset)
    }
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(message, self.input, self.pos)
    }

    fn expect(&mut self, c: u8) -> Result<(), ParseError> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.error(&format!("expected '{}'", c as char))),
            None => Err(self.error(&format!("expected '{}', found end of input", c as char))),
        }
    }

    fn read_value(&mut self) -> Result<MiValue, ParseError> {
        match self.peek() {
            Some(b'"') => {
                self.pos += 1;
                let s = self.read_quoted()?;
                Ok(MiValue::String(s))
            }
            Some(b'{') => {
                self.pos += 1;
                Ok(MiValue::Tuple(self.read_tuple(Some(b'}'))?))
            }
            Some(b'[') => {
                self.pos += 1;
                Ok(MiValue::List(self.read_list()?))
            }
            Some(_) => {
                // Bare `name=value` becomes a one-entry tuple
                let (name, value) = self.read_result()?;
                let mut tuple = MiTuple::new();
                tuple.insert(name, value);
                Ok(MiValue::Tuple(tuple))
            }
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn read_result(&mut self) -> Result<(String, MiValue), ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b',' | b'{' | b'}' | b'[' | b']' | b'"') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        let name = self.input[start..self.pos].to_string();
        self.expect(b'=')?;
        let value = self.read_value()?;
        Ok((name, value))
    }

    /// Body of a quoted string, opening quote already consumed
    fn read_quoted(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b'"') => {
                    let body = self.input[start..self.pos].to_string();
                    self.pos += 1;
                    return Ok(body);
                }
                Some(b'\\') => {
                    // Keep the backslash and the escaped character as they are
                    self.pos += 1;
                    match self.input[self.pos..].chars().next() {
                        Some(escaped) => self.pos += escaped.len_utf8(),
                        None => return Err(self.error("unterminated string")),
                    }
                }
                // Multi-byte characters never contain a quote or backslash byte
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    /// Tuple entries up to `closing`, or to end of input for top-level results
    fn read_tuple(&mut self, closing: Option<u8>) -> Result<MiTuple, ParseError> {
        let mut tuple = MiTuple::new();
        match (self.peek(), closing) {
            (None, None) => return Ok(tuple),
            (Some(c), Some(close)) if c == close => {
                self.pos += 1;
                return Ok(tuple);
            }
            _ => {}
        }

        loop {
            let (name, value) = self.read_result()?;
            insert_coalescing(&mut tuple, name, value);
            match (self.peek(), closing) {
                (Some(b','), _) => self.pos += 1,
                (Some(c), Some(close)) if c == close => {
                    self.pos += 1;
                    return Ok(tuple);
                }
                (None, None) => return Ok(tuple),
                (None, Some(_)) => return Err(self.error("unterminated tuple")),
                (Some(_), Some(_)) => return Err(self.error("expected ',' or '}'")),
                (Some(_), None) => return Err(self.error("expected ','")),
            }
        }
    }

    /// List items up to `]`, opening bracket already consumed
    fn read_list(&mut self) -> Result<Vec<MiValue>, ParseError> {
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            items.push(self.read_value()?);
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(_) => return Err(self.error("expected ',' or ']'")),
                None => return Err(self.error("unterminated list")),
            }
        }
    }
}

/// Drop exactly one layer of surrounding double quotes, if present
fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Unescape a GDB/MI c-string
pub fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('n') => { result.push('\n'); chars.next(); }
            Some('t') => { result.push('\t'); chars.next(); }
            Some('r') => { result.push('\r'); chars.next(); }
            Some('\\') => { result.push('\\'); chars.next(); }
            Some('"') => { result.push('"'); chars.next(); }
            Some(d) if d.is_digit(8) => {
                // Octal escape, e.g. \033
                let mut code = 0u32;
                let mut digits = 0;
                while let Some(d) = chars.peek().and_then(|d| d.to_digit(8)) {
                    if digits == 3 {
                        break;
                    }
                    code = code * 8 + d;
                    digits += 1;
                    chars.next();
                }
                result.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            _ => result.push(c),
        }
    }

    result
}

//! Source text to [`Value`].
//!
//! The reader walks the input one character at a time through a small state
//! machine ([`ParseState`]) and hands complete tokens and delimiters to a
//! nesting-aware builder. Reader macros (`'`, `` ` ``, `~`, `~@`, `@`) are only
//! recognized at a token boundary; they queue a wrapper symbol on the current
//! nesting level that is applied to the next complete form, innermost first.

use indexmap::IndexMap;
use nom::{
    IResult, Parser,
    character::complete::{char, digit1},
    combinator::{all_consuming, opt, recognize},
    sequence::pair,
};

use crate::ast::{IntType, Value};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Reader limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Maximum combined nesting of containers and pending reader macros
    pub max_depth: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            max_depth: MAX_PARSE_DEPTH,
        }
    }
}

/// Read exactly one form from `input`.
///
/// Returns `Ok(None)` if the input holds only whitespace and comments.
pub fn read_str(input: &str) -> Result<Option<Value>, Error> {
    read_str_with_config(input, &ParseConfig::default())
}

pub fn read_str_with_config(input: &str, config: &ParseConfig) -> Result<Option<Value>, Error> {
    let mut reader = Reader::new(input, *config);
    let mut chars = input.char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        let splice = ch == '~'
            && reader.state == ParseState::ExpandNormal
            && chars.next_if(|&(_, next)| next == '@').is_some();
        reader.feed(offset, ch, splice)?;
    }
    reader.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// At a token boundary: reader macro prefixes are live
    ExpandNormal,
    /// Inside a bare token
    NonExpandNormal,
    String,
    EscapedString,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Root,
    List,
    Vector,
    Hashmap,
}

impl FrameKind {
    fn closer(self) -> char {
        match self {
            FrameKind::Root => '\0',
            FrameKind::List => ')',
            FrameKind::Vector => ']',
            FrameKind::Hashmap => '}',
        }
    }
}

/// One open nesting level of the builder
struct Frame {
    kind: FrameKind,
    items: Vec<Value>,
    /// Reader macro wrappers waiting for the next complete form
    pending: Vec<&'static str>,
    /// Byte offset of the opening delimiter
    offset: usize,
}

impl Frame {
    fn new(kind: FrameKind, offset: usize) -> Self {
        Frame {
            kind,
            items: Vec::new(),
            pending: Vec::new(),
            offset,
        }
    }
}

struct Reader<'a> {
    input: &'a str,
    config: ParseConfig,
    state: ParseState,
    frames: Vec<Frame>,
    token: String,
    token_start: usize,
    string_buf: String,
    string_start: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str, config: ParseConfig) -> Self {
        Reader {
            input,
            config,
            state: ParseState::ExpandNormal,
            frames: vec![Frame::new(FrameKind::Root, 0)],
            token: String::new(),
            token_start: 0,
            string_buf: String::new(),
            string_start: 0,
        }
    }

    fn error_at(&self, kind: ParseErrorKind, message: impl Into<String>, offset: usize) -> Error {
        let char_offset = self.input[..offset].chars().count();
        Error::Parse(ParseError::with_context(
            kind,
            message,
            self.input,
            char_offset,
        ))
    }

    /// Containers plus queued reader macros currently open
    fn depth(&self) -> usize {
        self.frames.len() - 1 + self.frames.iter().map(|f| f.pending.len()).sum::<usize>()
    }

    fn check_depth(&self, offset: usize) -> Result<(), Error> {
        if self.depth() + 1 >= self.config.max_depth {
            return Err(self.error_at(
                ParseErrorKind::TooDeeplyNested,
                format!(
                    "expression too deeply nested (max depth: {})",
                    self.config.max_depth
                ),
                offset,
            ));
        }
        Ok(())
    }

    fn feed(&mut self, offset: usize, ch: char, splice: bool) -> Result<(), Error> {
        match self.state {
            ParseState::Comment => {
                if ch == '\n' {
                    self.state = ParseState::ExpandNormal;
                }
                Ok(())
            }
            ParseState::String => {
                match ch {
                    '\\' => self.state = ParseState::EscapedString,
                    '"' => {
                        self.state = ParseState::ExpandNormal;
                        let text = std::mem::take(&mut self.string_buf);
                        self.add_value(Value::String(text), offset)?;
                    }
                    c => self.string_buf.push(c),
                }
                Ok(())
            }
            ParseState::EscapedString => {
                let unescaped = match ch {
                    'n' => '\n',
                    '\\' => '\\',
                    '"' => '"',
                    other => {
                        return Err(self.error_at(
                            ParseErrorKind::InvalidSyntax,
                            format!("unknown escape sequence '\\{other}'"),
                            offset,
                        ));
                    }
                };
                self.string_buf.push(unescaped);
                self.state = ParseState::String;
                Ok(())
            }
            ParseState::ExpandNormal => {
                let wrapper = match ch {
                    '\'' => Some("quote"),
                    '`' => Some("quasiquote"),
                    '~' if splice => Some("splice-unquote"),
                    '~' => Some("unquote"),
                    '@' => Some("deref"),
                    _ => None,
                };
                match wrapper {
                    Some(symbol) => {
                        self.check_depth(offset)?;
                        if let Some(frame) = self.frames.last_mut() {
                            frame.pending.push(symbol);
                        }
                        Ok(())
                    }
                    None => self.feed_normal(offset, ch),
                }
            }
            ParseState::NonExpandNormal => self.feed_normal(offset, ch),
        }
    }

    fn feed_normal(&mut self, offset: usize, ch: char) -> Result<(), Error> {
        match ch {
            c if c.is_ascii_whitespace() || c == ',' => {
                self.flush_token()?;
                self.state = ParseState::ExpandNormal;
            }
            ';' => {
                self.flush_token()?;
                self.state = ParseState::Comment;
            }
            '"' => {
                self.flush_token()?;
                self.string_start = offset;
                self.state = ParseState::String;
            }
            '(' | '[' | '{' => {
                self.flush_token()?;
                self.check_depth(offset)?;
                let kind = match ch {
                    '(' => FrameKind::List,
                    '[' => FrameKind::Vector,
                    _ => FrameKind::Hashmap,
                };
                self.frames.push(Frame::new(kind, offset));
                self.state = ParseState::ExpandNormal;
            }
            ')' | ']' | '}' => {
                self.flush_token()?;
                self.close_container(offset, ch)?;
                self.state = ParseState::ExpandNormal;
            }
            c => {
                if self.token.is_empty() {
                    self.token_start = offset;
                }
                self.token.push(c);
                self.state = ParseState::NonExpandNormal;
            }
        }
        Ok(())
    }

    fn flush_token(&mut self) -> Result<(), Error> {
        if self.token.is_empty() {
            return Ok(());
        }
        let token = std::mem::take(&mut self.token);
        self.add_value(classify_token(&token), self.token_start)
    }

    fn close_container(&mut self, offset: usize, closer: char) -> Result<(), Error> {
        let top_kind = self.frames.last().map_or(FrameKind::Root, |f| f.kind);
        if top_kind == FrameKind::Root {
            return Err(self.error_at(
                ParseErrorKind::Unbalanced,
                format!("unexpected '{closer}'"),
                offset,
            ));
        }
        if top_kind.closer() != closer {
            return Err(self.error_at(
                ParseErrorKind::Unbalanced,
                format!("expected '{}', got '{closer}'", top_kind.closer()),
                offset,
            ));
        }
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        if !frame.pending.is_empty() {
            return Err(self.error_at(
                ParseErrorKind::InvalidSyntax,
                "reader macro not followed by a form",
                offset,
            ));
        }

        let value = match frame.kind {
            FrameKind::List | FrameKind::Root => Value::list(frame.items),
            FrameKind::Vector => Value::vector(frame.items),
            FrameKind::Hashmap => {
                if frame.items.len() % 2 != 0 {
                    return Err(self.error_at(
                        ParseErrorKind::OddMapEntries,
                        format!(
                            "odd number of entries for hashmap: {}",
                            Value::list(frame.items)
                        ),
                        frame.offset,
                    ));
                }
                let mut map = IndexMap::with_capacity(frame.items.len() / 2);
                let mut items = frame.items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    map.insert(key, value);
                }
                Value::hashmap(map)
            }
        };
        self.add_value(value, frame.offset)
    }

    /// Attach a complete form to the innermost frame, applying queued
    /// reader macros in LIFO order.
    fn add_value(&mut self, mut value: Value, offset: usize) -> Result<(), Error> {
        let Some(frame) = self.frames.last_mut() else {
            return Err(self.error_at(ParseErrorKind::Unbalanced, "no open form", offset));
        };
        while let Some(symbol) = frame.pending.pop() {
            value = Value::list(vec![Value::Symbol(symbol.to_owned()), value]);
        }
        frame.items.push(value);
        Ok(())
    }

    fn finish(mut self) -> Result<Option<Value>, Error> {
        let end = self.input.len();
        match self.state {
            ParseState::String | ParseState::EscapedString => {
                return Err(self.error_at(
                    ParseErrorKind::Incomplete,
                    "unterminated string",
                    self.string_start,
                ));
            }
            _ => self.flush_token()?,
        }

        if let Some(open) = self.frames.last()
            && open.kind != FrameKind::Root
        {
            return Err(self.error_at(
                ParseErrorKind::Incomplete,
                format!("expected '{}', got EOF", open.kind.closer()),
                open.offset,
            ));
        }

        let Some(mut root) = self.frames.pop() else {
            return Ok(None);
        };
        if !root.pending.is_empty() {
            return Err(self.error_at(
                ParseErrorKind::Incomplete,
                "reader macro not followed by a form",
                end,
            ));
        }
        match root.items.len() {
            0 => Ok(None),
            1 => Ok(root.items.pop()),
            n => Err(self.error_at(
                ParseErrorKind::TrailingContent,
                format!("expected one form, found {n}"),
                end,
            )),
        }
    }
}

/// Signed decimal integer literal
fn integer_literal(input: &str) -> IResult<&str, &str> {
    recognize(pair(opt(char('-')), digit1)).parse(input)
}

/// Classify a bare token: integer, `nil`/`true`/`false`, keyword or symbol.
/// Digits that do not fit an integer read as a symbol.
fn classify_token(token: &str) -> Value {
    if let Ok((_, digits)) = all_consuming(integer_literal).parse(token)
        && let Ok(n) = digits.parse::<IntType>()
    {
        return Value::Int(n);
    }
    match token {
        "nil" => Value::Nil,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match token.strip_prefix(':') {
            Some(name) => Value::Keyword(name.to_owned()),
            None => Value::Symbol(token.to_owned()),
        },
    }
}

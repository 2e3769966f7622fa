//! Pipeline configuration language
//!
//! ```text
//! # comments run to the end of the line
//! input  { generator { count => 3 message => "hello" } }
//! filter { mutate { add_field => { "env" => "prod" } } }
//! output { stdout { codec => "json" } }
//! ```
//!
//! A configuration is a sequence of `input`, `filter` and `output` sections,
//! each optional and repeatable. Sections hold plugin blocks whose settings are
//! `key => value` pairs. Values are quoted strings, numbers, booleans,
//! barewords, arrays and hashes; they are kept as JSON values so plugins can
//! deserialize them with serde.

use crate::error::ParseError;
use crate::plugins::{PluginArgs, PluginKind};
use serde::Serialize;
use serde_json::{Map, Number, Value};

/// One plugin block of a configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDecl {
    pub kind: PluginKind,
    pub name: String,
    pub args: PluginArgs,
}

/// Parsed pipeline configuration, plugins kept in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineDefinition {
    pub inputs: Vec<PluginDecl>,
    pub filters: Vec<PluginDecl>,
    pub outputs: Vec<PluginDecl>,
}

impl PipelineDefinition {
    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Parser::new(text).parse()
    }

    /// Every plugin block, inputs first, then filters, then outputs
    pub fn plugins(&self) -> impl Iterator<Item = &PluginDecl> {
        self.inputs
            .iter()
            .chain(self.filters.iter())
            .chain(self.outputs.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.filters.is_empty() && self.outputs.is_empty()
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn parse(mut self) -> Result<PipelineDefinition, ParseError> {
        let mut definition = PipelineDefinition::default();

        loop {
            self.skip_trivia();
            if self.peek().is_none() {
                return Ok(definition);
            }

            let (line, column) = (self.line, self.column);
            let section = self.bareword()?;
            let (kind, target) = match section.as_str() {
                "input" => (PluginKind::Input, &mut definition.inputs),
                "filter" => (PluginKind::Filter, &mut definition.filters),
                "output" => (PluginKind::Output, &mut definition.outputs),
                other => {
                    return Err(ParseError {
                        line,
                        column,
                        message: format!(
                            "expected 'input', 'filter' or 'output', found '{}'",
                            other
                        ),
                    })
                }
            };

            self.expect('{')?;
            loop {
                self.skip_trivia();
                if self.eat('}') {
                    break;
                }
                target.push(self.plugin(kind)?);
            }
        }
    }

    fn plugin(&mut self, kind: PluginKind) -> Result<PluginDecl, ParseError> {
        let name = self.bareword()?;
        self.expect('{')?;
        let args = self.entries('}')?;
        Ok(PluginDecl { kind, name, args })
    }

    // `key => value` pairs up to `close`, commas optional
    fn entries(&mut self, close: char) -> Result<Map<String, Value>, ParseError> {
        let mut entries = Map::new();

        loop {
            self.skip_trivia();
            if self.eat(close) {
                return Ok(entries);
            }

            let (line, column) = (self.line, self.column);
            let key = match self.peek() {
                Some('"') | Some('\'') => self.quoted()?,
                _ => self.bareword()?,
            };
            self.skip_trivia();
            self.expect_arrow()?;
            let value = self.value()?;

            if entries.insert(key.clone(), value).is_some() {
                return Err(ParseError {
                    line,
                    column,
                    message: format!("duplicate setting '{}'", key),
                });
            }

            self.skip_trivia();
            self.eat(',');
        }
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        self.skip_trivia();
        match self.peek() {
            Some('"') | Some('\'') => Ok(Value::String(self.quoted()?)),
            Some('[') => {
                self.advance();
                self.array()
            }
            Some('{') => {
                self.advance();
                Ok(Value::Object(self.entries('}')?))
            }
            Some(_) => {
                let word = self.bareword()?;
                Ok(scalar(word))
            }
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn array(&mut self) -> Result<Value, ParseError> {
        let mut items = Vec::new();

        loop {
            self.skip_trivia();
            if self.eat(']') {
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_trivia();
            if !self.eat(',') && self.peek() != Some(']') {
                return Err(self.error("expected ',' or ']' in array"));
            }
        }
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        let (line, column) = (self.line, self.column);
        let quote = match self.advance() {
            Some(c) => c,
            None => return Err(self.error("expected a string")),
        };
        let mut out = String::new();

        loop {
            match self.advance() {
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c) if c == quote || c == '\\' => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => break,
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => break,
            }
        }

        Err(ParseError {
            line,
            column,
            message: "unterminated string".to_string(),
        })
    }

    fn bareword(&mut self) -> Result<String, ParseError> {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if is_word_char(c) {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if word.is_empty() {
            return Err(match self.peek() {
                Some(c) => self.error(format!("unexpected character '{}'", c)),
                None => self.error("unexpected end of input"),
            });
        }
        Ok(word)
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_trivia();
        if self.eat(expected) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(c) => self.error(format!("expected '{}', found '{}'", expected, c)),
            None => self.error(format!("expected '{}', found end of input", expected)),
        })
    }

    fn expect_arrow(&mut self) -> Result<(), ParseError> {
        if self.peek() == Some('=') && self.chars.get(self.pos + 1) == Some(&'>') {
            self.advance();
            self.advance();
            return Ok(());
        }
        Err(self.error("expected '=>'"))
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '@' | '/' | ':')
}

fn scalar(word: String) -> Value {
    match word.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = word.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(n) = word.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(word)
}

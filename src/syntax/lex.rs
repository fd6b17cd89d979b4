use crate::syntax::token::{Token, TokenKind};
use crate::utils::Span;
use std::iter::Peekable;
use std::str::Chars;

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    byte_pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            byte_pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut lookahead = self.chars.clone();
        lookahead.next();
        lookahead.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.byte_pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '#' {
                // Line comment
                while let Some(nc) = self.peek() {
                    if nc == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_while<F>(&mut self, pred: F) -> String
    where
        F: Fn(char) -> bool,
    {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            s.push(c);
            self.advance();
        }
        s
    }

    fn read_number(&mut self) -> TokenKind {
        let mut text = String::new();
        if self.peek() == Some('-') {
            self.advance();
            text.push('-');
        }
        if self.peek() == Some('0') && matches!(self.peek_second(), Some('x' | 'X')) {
            self.advance();
            self.advance();
            let digits = self.read_while(|c| c.is_ascii_hexdigit());
            let negative = text.starts_with('-');
            return match i64::from_str_radix(&digits, 16) {
                Ok(v) if negative => TokenKind::Int(-v),
                Ok(v) => TokenKind::Int(v),
                Err(_) => TokenKind::Invalid(format!("bad hex literal '0x{}'", digits)),
            };
        }
        text.push_str(&self.read_while(|c| c.is_ascii_digit()));

        // Float: '.' followed by a digit, and/or an exponent
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            text.push('.');
            text.push_str(&self.read_while(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek(), Some('e' | 'E'))
            && self
                .peek_second()
                .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+')
        {
            is_float = true;
            self.advance();
            text.push('e');
            if let Some(sign @ ('-' | '+')) = self.peek() {
                self.advance();
                text.push(sign);
            }
            text.push_str(&self.read_while(|c| c.is_ascii_digit()));
        }

        if is_float {
            match text.parse() {
                Ok(v) => TokenKind::Float(v),
                Err(_) => TokenKind::Invalid(format!("bad float literal '{}'", text)),
            }
        } else {
            match text.parse() {
                Ok(v) => TokenKind::Int(v),
                Err(_) => TokenKind::Invalid(format!("integer literal '{}' out of range", text)),
            }
        }
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        let start_byte = self.byte_pos;
        let start_line = self.line;
        let start_col = self.col;

        let kind = match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {
                let ident = self.read_while(|c| c.is_alphanumeric() || c == '_');
                match ident.as_str() {
                    "loop" => TokenKind::Loop,
                    _ => TokenKind::Ident(ident),
                }
            }
            Some(c) if c.is_ascii_digit() => self.read_number(),
            Some('-') if self.peek_second().is_some_and(|c| c.is_ascii_digit()) => {
                self.read_number()
            }
            Some('=') => {
                self.advance();
                TokenKind::Assign
            }
            Some('@') => {
                self.advance();
                TokenKind::At
            }
            Some('<') => {
                self.advance();
                TokenKind::Lt
            }
            Some('>') => {
                self.advance();
                TokenKind::Gt
            }
            Some('(') => {
                self.advance();
                TokenKind::LParen
            }
            Some(')') => {
                self.advance();
                TokenKind::RParen
            }
            Some('[') => {
                self.advance();
                TokenKind::LBracket
            }
            Some(']') => {
                self.advance();
                TokenKind::RBracket
            }
            Some(',') => {
                self.advance();
                TokenKind::Comma
            }
            None => TokenKind::EOF,
            Some(c) => {
                self.advance();
                TokenKind::Invalid(format!("unexpected character '{}'", c))
            }
        };

        Token {
            kind,
            span: Span {
                start_byte,
                end_byte: self.byte_pos,
                start_line,
                start_col,
                end_line: self.line,
                end_col: self.col,
            },
        }
    }
}

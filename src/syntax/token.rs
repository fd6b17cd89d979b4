use crate::utils::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Loop,

    // Identifiers & Literals
    Ident(String),
    Int(i64),
    Float(f64),

    // Punctuation
    Assign, // =
    At,     // @
    Lt,
    Gt, // < >

    // Delimiters
    LParen,
    RParen, // ( )
    LBracket,
    RBracket, // [ ]
    Comma,

    Invalid(String),
    EOF,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

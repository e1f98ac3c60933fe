use std::str::Chars;

use itertools::{self, MultiPeek};

use crate::{
    token::{self, Token},
    Position,
};

/// Scanner reads characters from the source code and groups them in to a
/// sequence of tokens. Newlines are significant (statements are
/// newline-delimited) so they are emitted as tokens instead of skipped.
#[derive(Debug)]
pub struct Scanner<'a> {
    src: MultiPeek<Chars<'a>>,
    lexeme: String,
    pos: Position,
}

/// Scan the whole source and return its tokens, terminated by `Eof`.
/// Unknown characters are kept as [`token::Type::Unknown`] tokens for the
/// parser to report.
pub fn tokenize(src: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(src);
    let mut tokens = Vec::with_capacity(128);
    while let Some(token) = scanner.scan() {
        tokens.push(token);
    }
    let pos = scanner.pos;
    tokens.push(Token {
        typ: token::Type::Eof,
        lexeme: String::new(),
        pos,
    });
    tokens
}

impl<'a> Scanner<'a> {
    /// Create a new scanner.
    pub fn new(src: &'a str) -> Self {
        let src = itertools::multipeek(src.chars());
        Self {
            src,
            lexeme: String::new(),
            pos: Position::default(),
        }
    }

    /// Consume and return the next token from source, `None` at end of input.
    pub fn scan(&mut self) -> Option<Token> {
        self.skip_blanks();
        self.lexeme.clear();
        let start = self.pos;
        let c = self.advance()?;

        Some(match c {
            '\n' => self.make_token_at(token::Type::Newline, start),
            '(' => self.make_token_at(token::Type::LParen, start),
            ')' => self.make_token_at(token::Type::RParen, start),
            '[' => self.make_token_at(token::Type::LBracket, start),
            ']' => self.make_token_at(token::Type::RBracket, start),
            '{' => self.make_token_at(token::Type::LBrace, start),
            '}' => self.make_token_at(token::Type::RBrace, start),
            ',' => self.make_token_at(token::Type::Comma, start),
            '.' => self.make_token_at(token::Type::Dot, start),
            ':' => self.make_token_at(token::Type::Colon, start),
            '+' => self.make_token_at(token::Type::Plus, start),
            '*' => self.make_token_at(token::Type::Star, start),
            '/' => self.make_token_at(token::Type::Slash, start),
            '%' => self.make_token_at(token::Type::Percent, start),
            '-' => {
                if self.consume('>') {
                    self.make_token_at(token::Type::Arrow, start)
                } else {
                    self.make_token_at(token::Type::Minus, start)
                }
            }
            '=' => {
                if self.consume('=') {
                    self.make_token_at(token::Type::EqualEqual, start)
                } else {
                    self.make_token_at(token::Type::Assign, start)
                }
            }
            '!' => {
                if self.consume('=') {
                    self.make_token_at(token::Type::BangEqual, start)
                } else {
                    self.make_token_at(token::Type::Unknown, start)
                }
            }
            '<' => {
                if self.consume('=') {
                    self.make_token_at(token::Type::LessEqual, start)
                } else {
                    self.make_token_at(token::Type::Less, start)
                }
            }
            '>' => {
                if self.consume('=') {
                    self.make_token_at(token::Type::GreaterEqual, start)
                } else {
                    self.make_token_at(token::Type::Greater, start)
                }
            }
            '"' | '\'' => self.string(c, start),
            n if is_digit(n) => self.number(start),
            c if is_alpha(c) => self.identity(start),
            _ => self.make_token_at(token::Type::Unknown, start),
        })
    }

    fn identity(&mut self, start: Position) -> Token {
        while self.peek_check(|c| is_alpha(c) || is_digit(c)) {
            self.advance();
        }
        let typ = match self.lexeme.as_ref() {
            "if" => token::Type::If,
            "then" => token::Type::Then,
            "elseif" => token::Type::Elseif,
            "else" => token::Type::Else,
            "end" => token::Type::End,
            "while" => token::Type::While,
            "do" => token::Type::Do,
            "for" => token::Type::For,
            "function" => token::Type::Function,
            "return" => token::Type::Return,
            "local" => token::Type::Local,
            "and" => token::Type::And,
            "or" => token::Type::Or,
            "not" => token::Type::Not,
            "table" => token::Type::Table,
            "true" => token::Type::True,
            "false" => token::Type::False,
            "nil" => token::Type::Nil,
            // 'is' reads better than '==' in prose-style scripts
            "is" => token::Type::EqualEqual,
            _ => token::Type::Ident,
        };
        self.make_token_at(typ, start)
    }

    fn number(&mut self, start: Position) -> Token {
        while self.peek_check(is_digit) {
            self.advance();
        }
        if self.peek_check(|c| c == '.') && self.peek_next_check(is_digit) {
            self.advance();
            while self.peek_check(is_digit) {
                self.advance();
            }
        }
        self.make_token_at(token::Type::Number, start)
    }

    /// Scan a string literal delimited by `quote`, cooking escape sequences
    /// as it goes. An unterminated string is tolerated: the token simply
    /// spans to the end of input.
    fn string(&mut self, quote: char, start: Position) -> Token {
        let mut value = String::new();
        loop {
            match self.peek() {
                None => break,
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('\'') => value.push('\''),
                        // any other escape is preserved literally
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => break,
                    }
                }
                Some(_) => {
                    let c = self.advance().expect("We have peeked.");
                    value.push(c);
                }
            }
        }
        self.lexeme.clear();
        Token {
            typ: token::Type::Str,
            lexeme: value,
            pos: start,
        }
    }

    /// Skip spaces, tabs, carriage returns and `#` line comments. Newlines
    /// stay in the stream.
    fn skip_blanks(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '#' => {
                    while self.peek_check(|c| c != '\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn peek_check<F: Fn(char) -> bool>(&mut self, check: F) -> bool {
        self.peek().map(check).unwrap_or(false)
    }

    fn peek_next_check<F: Fn(char) -> bool>(&mut self, check: F) -> bool {
        self.peek_next().map(check).unwrap_or(false)
    }

    fn peek(&mut self) -> Option<char> {
        self.src.reset_peek();
        self.src.peek().copied()
    }

    fn peek_next(&mut self) -> Option<char> {
        self.src.reset_peek();
        match self.src.peek() {
            None => None,
            Some(_) => self.src.peek().copied(),
        }
    }

    fn advance(&mut self) -> Option<char> {
        self.src.next().map(|c| {
            self.lexeme.push(c);
            if c == '\n' {
                self.pos.next_line();
            } else {
                self.pos.next_column();
            }
            c
        })
    }

    fn consume(&mut self, expected: char) -> bool {
        match self.peek() {
            None => false,
            Some(c) if c != expected => false,
            _ => {
                self.advance();
                true
            }
        }
    }

    fn make_token_at(&mut self, typ: token::Type, pos: Position) -> Token {
        Token {
            typ,
            lexeme: self.lexeme.drain(..).collect(),
            pos,
        }
    }
}

fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

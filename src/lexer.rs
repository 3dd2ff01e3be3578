// (C) 2020 Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Hand-written lexer. The parser consumes tokens one at a time and emits
// bytecode directly as it goes (there is no separate AST), so the lexer
// only needs to support one token of lookahead plus the "current line
// slice" needed for error messages.
//
// Escape sequences inside string literals are NOT processed here - the
// token payload is the raw inner slice, and translation happens in
// `object::unescape` only once the literal is actually turned into a
// string object, so a token that's discarded during error recovery never
// pays for it.

use std::collections::HashMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // literals / names
    Identifier,
    Number,
    StringLit,
    // keywords (looked up from the caller-provided table)
    Keyword(Keyword),
    // punctuation / operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Plus,
    PlusEq,
    Minus,
    MinusEq,
    Star,
    Slash,
    Bang,
    BangEq,
    Eq,
    EqEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AmpAmp,
    PipePipe,
    Eof,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Keyword {
    Var,
    Static,
    Func,
    Class,
    Import,
    For,
    As,
    If,
    Else,
    While,
    Break,
    Return,
    New,
    True,
    False,
    Null,
    Super,
}

impl Keyword {
    pub fn table() -> HashMap<&'static str, Keyword> {
        use Keyword::*;
        let mut m = HashMap::new();
        m.insert("var", Var);
        m.insert("static", Static);
        m.insert("func", Func);
        m.insert("class", Class);
        m.insert("import", Import);
        m.insert("for", For);
        m.insert("as", As);
        m.insert("if", If);
        m.insert("else", Else);
        m.insert("while", While);
        m.insert("break", Break);
        m.insert("return", Return);
        m.insert("new", New);
        m.insert("true", True);
        m.insert("false", False);
        m.insert("nil", Null);
        m.insert("super", Super);
        m
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: i32,
    pub number: f64,
}

pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    pos: usize,
    line: i32,
    line_start: usize,
    keywords: HashMap<&'static str, Keyword>,
    pub error: Option<(i32, String)>,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str, keywords: HashMap<&'static str, Keyword>) -> Self {
        Lexer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            keywords,
            error: None,
        }
    }

    pub fn current_line_slice(&self) -> &'src str {
        let end = self.bytes[self.line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|n| self.line_start + n)
            .unwrap_or(self.src.len());
        &self.src[self.line_start..end]
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while self.peek().is_some() && self.peek() != Some(b'\n') {
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start_line = self.line;
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            None => {
                                self.error = Some((start_line, "unterminated block comment".into()));
                                return;
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            _ => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn make(&self, kind: TokenKind, start: usize, line: i32) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.src[start..self.pos],
            line,
            number: 0.0,
        }
    }

    fn two_char(&mut self, second: u8, with: TokenKind, without: TokenKind) -> TokenKind {
        if self.peek() == Some(second) {
            self.advance();
            with
        } else {
            without
        }
    }

    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_trivia();
        let start = self.pos;
        let line = self.line;
        let c = match self.advance() {
            None => return self.make(TokenKind::Eof, start, line),
            Some(c) => c,
        };

        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            b':' => TokenKind::Colon,
            b';' => TokenKind::Semicolon,
            b'+' => self.two_char(b'=', TokenKind::PlusEq, TokenKind::Plus),
            b'-' => self.two_char(b'=', TokenKind::MinusEq, TokenKind::Minus),
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'!' => self.two_char(b'=', TokenKind::BangEq, TokenKind::Bang),
            b'=' => self.two_char(b'=', TokenKind::EqEq, TokenKind::Eq),
            b'<' => self.two_char(b'=', TokenKind::LtEq, TokenKind::Lt),
            b'>' => self.two_char(b'=', TokenKind::GtEq, TokenKind::Gt),
            b'&' if self.peek() == Some(b'&') => {
                self.advance();
                TokenKind::AmpAmp
            }
            b'|' if self.peek() == Some(b'|') => {
                self.advance();
                TokenKind::PipePipe
            }
            b'"' => return self.string_literal(start, line),
            b'0'..=b'9' => return self.number_literal(start, line),
            c if c == b'_' || c.is_ascii_alphabetic() => return self.identifier(start, line),
            _ => {
                self.error = Some((line, format!("unexpected character '{}'", c as char)));
                TokenKind::Error
            }
        };
        self.make(kind, start, line)
    }

    fn string_literal(&mut self, start: usize, line: i32) -> Token<'src> {
        let inner_start = self.pos;
        loop {
            match self.peek() {
                None => {
                    self.error = Some((line, "unterminated string literal".into()));
                    return Token {
                        kind: TokenKind::Error,
                        lexeme: &self.src[start..self.pos],
                        line,
                        number: 0.0,
                    };
                }
                Some(b'"') => break,
                Some(b'\\') => {
                    self.advance();
                    self.advance();
                }
                _ => {
                    self.advance();
                }
            }
        }
        let inner_end = self.pos;
        self.advance(); // closing quote
        Token {
            kind: TokenKind::StringLit,
            lexeme: &self.src[inner_start..inner_end],
            line,
            number: 0.0,
        }
    }

    fn number_literal(&mut self, start: usize, line: i32) -> Token<'src> {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            self.advance();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let save = self.pos;
            self.advance();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            if matches!(self.peek(), Some(b'0'..=b'9')) {
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.advance();
                }
            } else {
                self.pos = save;
            }
        }
        let lexeme = &self.src[start..self.pos];
        let number: f64 = lexeme.parse().unwrap_or(0.0);
        Token {
            kind: TokenKind::Number,
            lexeme,
            line,
            number,
        }
    }

    fn identifier(&mut self, start: usize, line: i32) -> Token<'src> {
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.advance();
        }
        let lexeme = &self.src[start..self.pos];
        let kind = match self.keywords.get(lexeme) {
            Some(&kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier,
        };
        Token {
            kind,
            lexeme,
            line,
            number: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src, Keyword::table());
        let mut kinds = Vec::new();
        loop {
            let t = lexer.next_token();
            if t.kind == TokenKind::Eof {
                break;
            }
            kinds.push(t.kind);
        }
        kinds
    }

    #[test]
    fn skips_whitespace_and_comments() {
        let kinds = lex_all("  // hi\n  1 /* block\ncomment */ + 2");
        assert_eq!(
            kinds,
            vec![TokenKind::Number, TokenKind::Plus, TokenKind::Number]
        );
    }

    #[test]
    fn disambiguates_two_char_operators_greedily() {
        let kinds = lex_all("a += b == c != d && e || f");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEq,
                TokenKind::Identifier,
                TokenKind::EqEq,
                TokenKind::Identifier,
                TokenKind::BangEq,
                TokenKind::Identifier,
                TokenKind::AmpAmp,
                TokenKind::Identifier,
                TokenKind::PipePipe,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn keyword_table_overrides_identifier() {
        let kinds = lex_all("var x func");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Var),
                TokenKind::Identifier,
                TokenKind::Keyword(Keyword::Func),
            ]
        );
    }

    #[test]
    fn string_literal_keeps_escapes_raw() {
        let mut lexer = Lexer::new("\"a\\nb\"", Keyword::table());
        let t = lexer.next_token();
        assert_eq!(t.kind, TokenKind::StringLit);
        assert_eq!(t.lexeme, "a\\nb");
    }

    #[test]
    fn number_literal_parses_exponent() {
        let mut lexer = Lexer::new("1.5e2", Keyword::table());
        let t = lexer.next_token();
        assert_eq!(t.kind, TokenKind::Number);
        assert_eq!(t.number, 150.0);
    }

    #[test]
    fn unterminated_string_reports_error() {
        let mut lexer = Lexer::new("\"abc", Keyword::table());
        lexer.next_token();
        assert!(lexer.error.is_some());
    }

    #[test]
    fn tracks_line_numbers_across_newlines() {
        let mut lexer = Lexer::new("a\nb\nc", Keyword::table());
        let a = lexer.next_token();
        let b = lexer.next_token();
        let c = lexer.next_token();
        assert_eq!((a.line, b.line, c.line), (1, 2, 3));
    }
}

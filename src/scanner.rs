use super::token::{Token, TokenType};

/// Hand-rolled cursor over the source bytes. Lox source is ASCII at the
/// lexical level; string literals may still carry arbitrary UTF-8, which
/// passes through untouched.
pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return self.make_token(TokenType::Eof),
        };

        match c {
            b'(' => self.make_token(TokenType::LeftParen),
            b')' => self.make_token(TokenType::RightParen),
            b'{' => self.make_token(TokenType::LeftBrace),
            b'}' => self.make_token(TokenType::RightBrace),
            b';' => self.make_token(TokenType::Semicolon),
            b',' => self.make_token(TokenType::Comma),
            b'.' => self.make_token(TokenType::Dot),
            b'-' => self.make_token(TokenType::Minus),
            b'+' => self.make_token(TokenType::Plus),
            b'/' => self.make_token(TokenType::Slash),
            b'*' => self.make_token(TokenType::Star),
            b'!' => {
                if self.matches(b'=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            b'"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.current += 1;
        Some(c)
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\r') | Some(b'\t') => {
                    self.current += 1;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.current += 1;
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.current += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn make_token(&self, typ: TokenType) -> Token<'src> {
        Token::new(typ, &self.source[self.start..self.current], self.line)
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token::new(TokenType::Error, message, self.line)
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == b'"' {
                self.current += 1;
                return self.make_token(TokenType::String);
            }
            if c == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        self.error_token("Unterminated string.")
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.current += 1;
        }

        // A trailing '.' is a method call, not part of the number.
        if self.peek() == Some(b'.') && self.peek_next().map_or(false, |c| c.is_ascii_digit()) {
            self.current += 1;
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.current += 1;
            }
        }

        self.make_token(TokenType::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while self
            .peek()
            .map_or(false, |c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.current += 1;
        }
        self.make_token(self.identifier_type())
    }

    fn identifier_type(&self) -> TokenType {
        match &self.source[self.start..self.current] {
            "and" => TokenType::And,
            "class" => TokenType::Class,
            "else" => TokenType::Else,
            "false" => TokenType::False,
            "for" => TokenType::For,
            "fun" => TokenType::Fun,
            "if" => TokenType::If,
            "nil" => TokenType::Nil,
            "or" => TokenType::Or,
            "print" => TokenType::Print,
            "return" => TokenType::Return,
            "super" => TokenType::Super,
            "this" => TokenType::This,
            "true" => TokenType::True,
            "var" => TokenType::Var,
            "while" => TokenType::While,
            _ => TokenType::Identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<(TokenType, &str)> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.typ == TokenType::Eof;
            tokens.push((token.typ, token.lexeme));
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn scans_punctuation_and_operators() {
        let tokens = scan_all("(){};,.-+/* ! != = == < <= > >=");
        let types: Vec<TokenType> = tokens.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            vec![
                TokenType::LeftParen,
                TokenType::RightParen,
                TokenType::LeftBrace,
                TokenType::RightBrace,
                TokenType::Semicolon,
                TokenType::Comma,
                TokenType::Dot,
                TokenType::Minus,
                TokenType::Plus,
                TokenType::Slash,
                TokenType::Star,
                TokenType::Bang,
                TokenType::BangEqual,
                TokenType::Equal,
                TokenType::EqualEqual,
                TokenType::Less,
                TokenType::LessEqual,
                TokenType::Greater,
                TokenType::GreaterEqual,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        let tokens = scan_all("var x = fun_1; classy class");
        assert_eq!(tokens[0], (TokenType::Var, "var"));
        assert_eq!(tokens[1], (TokenType::Identifier, "x"));
        assert_eq!(tokens[3], (TokenType::Identifier, "fun_1"));
        assert_eq!(tokens[5], (TokenType::Identifier, "classy"));
        assert_eq!(tokens[6], (TokenType::Class, "class"));
    }

    #[test]
    fn scans_numbers() {
        let tokens = scan_all("12 3.5 7.");
        assert_eq!(tokens[0], (TokenType::Number, "12"));
        assert_eq!(tokens[1], (TokenType::Number, "3.5"));
        // '7.' is a number followed by a dot.
        assert_eq!(tokens[2], (TokenType::Number, "7"));
        assert_eq!(tokens[3], (TokenType::Dot, "."));
    }

    #[test]
    fn tracks_lines_through_comments_and_strings() {
        let mut scanner = Scanner::new("// comment\n\"a\nb\" x");
        let string = scanner.scan_token();
        assert_eq!(string.typ, TokenType::String);
        let ident = scanner.scan_token();
        assert_eq!(ident.line, 3);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"abc");
        let token = scanner.scan_token();
        assert_eq!(token.typ, TokenType::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }
}

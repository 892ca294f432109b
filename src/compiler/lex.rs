use crate::compiler::token::{Token, TokenKind};

/// The scanner walks a source string and produces tokens one at a
/// time, on demand. It never allocates: every token borrows its
/// lexeme straight from the source. Errors come back inline as
/// [`TokenKind::Error`] tokens so the compiler can report them
/// with everything else.
#[derive(Debug)]
pub struct Scanner<'src> {
    source: &'src str,
    /// Byte offset where the current token started.
    start: usize,
    /// Byte offset of the next unread character.
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scans the next token. Past the end of input this keeps
    /// returning `Eof` tokens forever.
    pub fn next_token(&mut self) -> Token<'src> {
        self.strip();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return self.make(TokenKind::Eof),
        };

        match c {
            '(' => self.make(TokenKind::LeftParen),
            ')' => self.make(TokenKind::RightParen),
            '{' => self.make(TokenKind::LeftBrace),
            '}' => self.make(TokenKind::RightBrace),
            ',' => self.make(TokenKind::Comma),
            '.' => self.make(TokenKind::Dot),
            '-' => self.make(TokenKind::Minus),
            '+' => self.make(TokenKind::Plus),
            ';' => self.make(TokenKind::Semicolon),
            '/' => self.make(TokenKind::Slash),
            '*' => self.make(TokenKind::Star),
            '?' => self.make(TokenKind::Question),
            ':' => self.make(TokenKind::Colon),
            '!' => self.two(TokenKind::Bang, TokenKind::BangEqual),
            '=' => self.two(TokenKind::Equal, TokenKind::EqualEqual),
            '>' => self.two(TokenKind::Greater, TokenKind::GreaterEqual),
            '<' => self.two(TokenKind::Less, TokenKind::LessEqual),
            '"' => self.string(),
            '0'..='9' => self.number(),
            c if c.is_ascii_alphabetic() || c == '_' => self.identifier(),
            _ => self.error("Unexpected character."),
        }
    }

    /// Eats whitespace and `//` comments, counting newlines.
    fn strip(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\r' | '\t') => {
                    self.advance();
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while !matches!(self.peek(), Some('\n') | None) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.current += c.len_utf8();
        Some(c)
    }

    /// Consumes `expected` if it is next.
    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            return true;
        }
        false
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    /// Picks between a one- and two-character token depending on
    /// whether `=` follows.
    fn two(&mut self, short: TokenKind, long: TokenKind) -> Token<'src> {
        let kind = if self.eat('=') { long } else { short };
        self.make(kind)
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    /// Strings run to the closing quote with no escape sequences;
    /// the token's lexeme keeps both quotes. Newlines are allowed
    /// inside and still count toward the line number.
    fn string(&mut self) -> Token<'src> {
        loop {
            match self.advance() {
                Some('"') => return self.make(TokenKind::String),
                Some('\n') => self.line += 1,
                Some(_) => {}
                None => return self.error("Unterminated string."),
            }
        }
    }

    /// `[0-9]+(.[0-9]+)?` — the dot is only part of the number
    /// when digits follow it.
    fn number(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some('0'..='9')) {
            self.advance();
        }
        if self.peek() == Some('.') && matches!(self.peek_next(), Some('0'..='9')) {
            self.advance();
            while matches!(self.peek(), Some('0'..='9')) {
                self.advance();
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.advance();
        }
        self.make(Scanner::keyword(&self.source[self.start..self.current]))
    }

    /// Tells keywords apart from plain identifiers once the whole
    /// word has been consumed.
    fn keyword(lexeme: &str) -> TokenKind {
        match lexeme {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "case" => TokenKind::Case,
            "class" => TokenKind::Class,
            "const" => TokenKind::Const,
            "continue" => TokenKind::Continue,
            "default" => TokenKind::Default,
            "else" => TokenKind::Else,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "fun" => TokenKind::Fun,
            "if" => TokenKind::If,
            "nil" => TokenKind::Nil,
            "or" => TokenKind::Or,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            "super" => TokenKind::Super,
            "switch" => TokenKind::Switch,
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            _ => TokenKind::Identifier,
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn scan(source: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(source);
        let mut tokens = vec![];
        loop {
            let token = scanner.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn empty_source() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn statement() {
        assert_eq!(
            kinds("var answer = 42;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn two_character_operators() {
        assert_eq!(
            kinds("! != = == > >= < <="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_versus_identifiers() {
        assert_eq!(
            kinds("break breaker switcheroo switch"),
            vec![
                TokenKind::Break,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Switch,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers() {
        let tokens = scan("1 12.5 7.");
        assert_eq!(tokens[0].lexeme, "1");
        assert_eq!(tokens[1].lexeme, "12.5");
        // the trailing dot is its own token, not part of the number
        assert_eq!(tokens[2].lexeme, "7");
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn string_spans_include_quotes() {
        let tokens = scan("\"hello\"");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, "\"hello\"");
    }

    #[test]
    fn lines_count_through_comments_and_strings() {
        let tokens = scan("one // two\nthree \"a\nb\" four");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2); // three
        assert_eq!(tokens[2].line, 3); // the string closes on line 3
        assert_eq!(tokens[3].line, 3); // four
    }

    #[test]
    fn unterminated_string() {
        let tokens = scan("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unterminated string.");
    }

    #[test]
    fn stray_character() {
        let tokens = scan("@");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unexpected character.");
    }

    proptest! {
        #[test]
        fn doesnt_crash(s in "\\PC*") {
            scan(&s);
        }

        #[test]
        fn numbers_scan_as_one_token(s in "[0-9]{1,12}(\\.[0-9]{1,12})?") {
            let tokens = scan(&s);
            prop_assert_eq!(tokens.len(), 2);
            prop_assert_eq!(tokens[0].kind, TokenKind::Number);
            prop_assert_eq!(tokens[0].lexeme, s.as_str());
        }

        #[test]
        fn identifiers_scan_whole(s in "[a-zA-Z_][a-zA-Z0-9_]{0,20}") {
            let tokens = scan(&s);
            prop_assert_eq!(tokens.len(), 2);
            prop_assert_eq!(tokens[0].lexeme, s.as_str());
        }
    }
}

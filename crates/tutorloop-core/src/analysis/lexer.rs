//! Lexical analyzer for Python submissions.
//!
//! Turns source text into a token stream with explicit `Newline`, `Indent`
//! and `Dedent` markers, following the layout rules of the reference
//! tokenizer: newlines inside brackets and after a backslash are joined,
//! blank and comment-only lines are ignored, and tabs advance to the next
//! multiple of eight.

use thiserror::Error;

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    /// Plain, raw or bytes string literal.
    Str,
    /// Formatted string literal (`f"..."`).
    FStr,
    Op,
    /// End of a logical line.
    Newline,
    Indent,
    Dedent,
}

/// Token with kind and source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.lexeme == op
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.lexeme == name
    }

    /// Integer literal (`42`, `1_000`, `0x1F`), excluding floats and complex.
    pub fn is_int_literal(&self) -> bool {
        if self.kind != TokenKind::Number {
            return false;
        }
        let digits = self.lexeme.replace('_', "").to_ascii_lowercase();
        if ["0x", "0o", "0b"].iter().any(|p| digits.starts_with(p)) {
            return true;
        }
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

/// Python's reserved words.
pub const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

// Longest first, so a greedy scan picks `**=` over `**` over `*`.
const OPERATORS: [&str; 47] = [
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "==", "!=", "<=", ">=", "**", "//", "<<",
    ">>", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ";", ".", "=",
];

const STRING_PREFIXES: [&str; 8] = ["r", "u", "b", "f", "br", "rb", "fr", "rf"];

/// Tokenize a Python module.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    indents: Vec<usize>,
    brackets: Vec<(char, usize)>,
    tokens: Vec<Token>,
    at_line_start: bool,
    line_has_tokens: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            indents: vec![0],
            brackets: Vec::new(),
            tokens: Vec::new(),
            at_line_start: true,
            line_has_tokens: false,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.brackets.is_empty() {
                if self.indentation()? {
                    continue;
                }
                if self.pos >= self.chars.len() {
                    break;
                }
            }

            let c = self.chars[self.pos];
            match c {
                '\n' => self.newline(),
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' => self.continuation()?,
                '"' | '\'' => self.string(self.pos, false)?,
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.number(),
                c if c.is_ascii_digit() => self.number(),
                c if is_ident_start(c) => self.name_or_string()?,
                _ => self.operator()?,
            }
        }

        if let Some(&(open, line)) = self.brackets.last() {
            return Err(LexError {
                line,
                message: format!("'{open}' was never closed"),
            });
        }
        if self.line_has_tokens {
            self.push(TokenKind::Newline, String::new());
        }
        for _ in 1..self.indents.len() {
            self.push(TokenKind::Dedent, String::new());
        }
        Ok(self.tokens)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            line: self.line,
            message: message.into(),
        }
    }

    fn push(&mut self, kind: TokenKind, lexeme: String) {
        if !matches!(kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent) {
            self.line_has_tokens = true;
        }
        self.tokens.push(Token {
            kind,
            lexeme,
            line: self.line,
        });
    }

    /// Measure the indentation of a fresh physical line. Returns true when
    /// the line was blank or comment-only and has been consumed.
    fn indentation(&mut self) -> Result<bool, LexError> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                self.consume_line_end();
                return Ok(true);
            }
            Some('\n') | Some('\r') => {
                self.consume_line_end();
                return Ok(true);
            }
            Some('\\') => {
                // A continuation on an otherwise empty line joins the next one.
                self.continuation()?;
                return Ok(true);
            }
            Some(_) => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, String::new());
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(TokenKind::Dedent, String::new());
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        self.at_line_start = false;
        Ok(false)
    }

    fn consume_line_end(&mut self) {
        if self.peek(0) == Some('\r') {
            self.pos += 1;
        }
        if self.peek(0) == Some('\n') {
            self.pos += 1;
            self.line += 1;
        }
    }

    fn newline(&mut self) {
        self.pos += 1;
        if self.brackets.is_empty() {
            if self.line_has_tokens {
                self.push(TokenKind::Newline, String::new());
                self.line_has_tokens = false;
            }
            self.at_line_start = true;
        }
        self.line += 1;
    }

    fn skip_comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn continuation(&mut self) -> Result<(), LexError> {
        match (self.peek(1), self.peek(2)) {
            (Some('\n'), _) => self.pos += 2,
            (Some('\r'), Some('\n')) => self.pos += 3,
            _ => return Err(self.error("unexpected character after line continuation character")),
        }
        self.line += 1;
        Ok(())
    }

    fn name_or_string(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        let quoted = matches!(self.peek(0), Some('"') | Some('\''));
        if quoted && STRING_PREFIXES.contains(&word.to_ascii_lowercase().as_str()) {
            let formatted = word.to_ascii_lowercase().contains('f');
            return self.string(start, formatted);
        }
        self.push(TokenKind::Name, word);
        Ok(())
    }

    fn string(&mut self, start: usize, formatted: bool) -> Result<(), LexError> {
        let quote = self.chars[self.pos];
        let opening_line = self.line;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        loop {
            let Some(c) = self.peek(0) else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(LexError {
                    line: opening_line,
                    message: message.to_string(),
                });
            };
            match c {
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                '\n' if !triple => {
                    return Err(LexError {
                        line: opening_line,
                        message: "unterminated string literal".to_string(),
                    });
                }
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }

        let end = self.pos.min(self.chars.len());
        let lexeme: String = self.chars[start..end].iter().collect();
        let kind = if formatted {
            TokenKind::FStr
        } else {
            TokenKind::Str
        };
        self.push(kind, lexeme);
        Ok(())
    }

    fn number(&mut self) {
        let start = self.pos;
        let prefixed = self.peek(0) == Some('0')
            && matches!(self.peek(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        while let Some(c) = self.peek(0) {
            let exponent_sign = matches!(c, '+' | '-')
                && !prefixed
                && self.pos > start
                && matches!(self.chars[self.pos - 1], 'e' | 'E');
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let lexeme = self.chars[start..self.pos].iter().collect();
        self.push(TokenKind::Number, lexeme);
    }

    fn operator(&mut self) -> Result<(), LexError> {
        let op = OPERATORS.iter().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, expected)| self.peek(i) == Some(expected))
        });
        let Some(op) = op else {
            let c = self.chars[self.pos];
            return Err(self.error(format!("invalid character '{c}'")));
        };

        match *op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, self.line));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                let expected = match close {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, _)) => {
                        return Err(self.error(format!(
                            "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                        )));
                    }
                    None => return Err(self.error(format!("unmatched '{close}'"))),
                }
            }
            _ => {}
        }

        self.pos += op.chars().count();
        self.push(TokenKind::Op, op.to_string());
        Ok(())
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenize_block_structure() {
        use TokenKind::*;
        let source = "def f(x):\n    return x\n\nprint(f(1))\n";
        assert_eq!(
            kinds(source),
            vec![
                Name, Name, Op, Name, Op, Op, Newline, Indent, Name, Name, Newline, Dedent, Name,
                Op, Name, Op, Number, Op, Op, Newline,
            ]
        );
    }

    #[test]
    fn brackets_join_lines() {
        let tokens = tokenize("x = [\n  1,\n  2,\n]\n").unwrap();
        let newlines = tokens.iter().filter(|t| t.kind == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(tokens.iter().all(|t| t.kind != TokenKind::Indent));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let source = "x = 1\n\n    # indented comment\ny = 2  # trailing\n";
        let tokens = tokenize(source).unwrap();
        assert!(tokens.iter().all(|t| t.kind != TokenKind::Indent));
        assert_eq!(tokens.last().unwrap().line, 4);
    }

    #[test]
    fn string_forms() {
        let tokens = tokenize("a = '''multi\nline''' + rb'x' + f\"{y}\"\n").unwrap();
        let strings: Vec<_> = tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Str | TokenKind::FStr))
            .map(|t| t.kind)
            .collect();
        assert_eq!(strings, vec![TokenKind::Str, TokenKind::Str, TokenKind::FStr]);
    }

    #[test]
    fn numbers_and_literals() {
        let tokens = tokenize("x = 1_000 + 0x1F + 2.5 + 1e-3 + 3j\n").unwrap();
        let ints: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Number)
            .map(|t| (t.lexeme.as_str(), t.is_int_literal()))
            .collect();
        assert_eq!(
            ints,
            vec![
                ("1_000", true),
                ("0x1F", true),
                ("2.5", false),
                ("1e-3", false),
                ("3j", false)
            ]
        );
    }

    #[test]
    fn lexical_errors() {
        assert!(tokenize("x = 'open\n").is_err());
        assert!(tokenize("x = \"\"\"never closed\n").is_err());
        assert!(tokenize("print((1)\n").is_err());
        assert!(tokenize("print(1))\n").is_err());
        assert!(tokenize("x = [1, 2)\n").is_err());
        assert!(tokenize("if x:\n        a = 1\n    b = 2\n").is_err());
        assert!(tokenize("x = $y\n").is_err());
    }

    #[test]
    fn dedents_closed_at_eof() {
        let tokens = tokenize("for i in x:\n    for j in y:\n        pass").unwrap();
        let dedents = tokens.iter().filter(|t| t.kind == TokenKind::Dedent).count();
        assert_eq!(dedents, 2);
        assert_eq!(tokens[tokens.len() - 3].kind, TokenKind::Newline);
    }
}

//! Token scanner for C#-family mod scripts.
//!
//! Comments are dropped and string/char literals collapse into single
//! `Literal` tokens, so banned identifiers inside strings or comments never
//! trigger the validator. Interpolation holes (`$"{...}"`) are scanned as
//! code: they can call APIs like any other expression.
//!
//! Verbatim identifiers (`@System`) are reported without their `@`, so they
//! compare equal to the plain name; `verbatim` records that the word cannot
//! be a keyword.

/// Kind of a scanned token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident,
    Number,
    Punct,
    Literal,
    /// A whole preprocessor line such as `#pragma warning disable`.
    Directive,
}

/// One token with its 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub line: u32,
    pub col: u32,
    /// Written with a leading `@`.
    pub verbatim: bool,
}

/// Multi-character punctuators, longest first.
const MULTI_PUNCT: &[&str] = &[
    "??=", "<<=", ">>=", "::", "->", "=>", "??", "?.", "&&", "||", "==", "!=", "<=", ">=", "++",
    "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "<<",
];

/// Scan `src` into tokens.
pub(crate) fn tokenize(src: &str) -> Vec<Token<'_>> {
    let mut lexer = Lexer {
        src,
        pos: 0,
        line: 1,
        col: 1,
        tokens: Vec::new(),
    };
    lexer.lex_code(false);
    lexer.tokens
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    tokens: Vec<Token<'a>>,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: u32, col: u32) {
        self.tokens.push(Token {
            kind,
            text: &self.src[start..self.pos],
            line,
            col,
            verbatim: false,
        });
    }

    /// Scan code. With `in_hole`, stop after the `}` closing an interpolation hole.
    fn lex_code(&mut self, in_hole: bool) {
        let mut depth = 0usize;
        let mut at_line_start = true;

        while let Some(c) = self.peek() {
            if c == '\n' {
                self.bump();
                at_line_start = true;
                continue;
            }
            if c.is_whitespace() {
                self.bump();
                continue;
            }

            let (start, line, col) = (self.pos, self.line, self.col);

            if c == '#' && at_line_start && !in_hole {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
                self.tokens.push(Token {
                    kind: TokenKind::Directive,
                    text: self.src[start..self.pos].trim_end(),
                    line,
                    col,
                    verbatim: false,
                });
                continue;
            }
            at_line_start = false;

            let rest = self.rest();
            if rest.starts_with("//") {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
                continue;
            }
            if rest.starts_with("/*") {
                self.bump_n(2);
                while !self.rest().is_empty() && !self.rest().starts_with("*/") {
                    self.bump();
                }
                self.bump_n(2);
                continue;
            }

            if self.lex_string() {
                self.push(TokenKind::Literal, start, line, col);
                continue;
            }

            if c == '\'' {
                self.bump();
                while let Some(c) = self.bump() {
                    match c {
                        '\\' => {
                            self.bump();
                        }
                        '\'' | '\n' => break,
                        _ => {}
                    }
                }
                self.push(TokenKind::Literal, start, line, col);
                continue;
            }

            let verbatim_ident =
                c == '@' && self.peek_nth(1).is_some_and(|n| n.is_alphabetic() || n == '_');
            if c.is_alphabetic() || c == '_' || verbatim_ident {
                self.bump();
                while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    self.bump();
                }
                self.tokens.push(Token {
                    kind: TokenKind::Ident,
                    text: &self.src[start + usize::from(verbatim_ident)..self.pos],
                    line,
                    col,
                    verbatim: verbatim_ident,
                });
                continue;
            }

            if c.is_ascii_digit() {
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                {
                    // `1..5` is a range, not a float.
                    if self.peek() == Some('.') && self.peek_nth(1) == Some('.') {
                        break;
                    }
                    self.bump();
                }
                self.push(TokenKind::Number, start, line, col);
                continue;
            }

            if let Some(op) = MULTI_PUNCT.iter().find(|op| rest.starts_with(**op)) {
                self.bump_n(op.len());
                self.push(TokenKind::Punct, start, line, col);
                continue;
            }

            if in_hole {
                if c == '{' {
                    depth += 1;
                } else if c == '}' {
                    if depth == 0 {
                        self.bump();
                        return;
                    }
                    depth -= 1;
                }
            }
            self.bump();
            self.push(TokenKind::Punct, start, line, col);
        }
    }

    /// Consume a string literal starting at the cursor, if there is one.
    fn lex_string(&mut self) -> bool {
        let rest = self.rest();
        if rest.starts_with("$\"\"\"") || rest.starts_with("\"\"\"") {
            let open = if rest.starts_with('$') { 4 } else { 3 };
            self.bump_n(open);
            while !self.rest().is_empty() && !self.rest().starts_with("\"\"\"") {
                self.bump();
            }
            self.bump_n(3);
            true
        } else if rest.starts_with("$@\"") || rest.starts_with("@$\"") {
            self.bump_n(3);
            self.lex_string_body(true, true);
            true
        } else if rest.starts_with("$\"") {
            self.bump_n(2);
            self.lex_string_body(false, true);
            true
        } else if rest.starts_with("@\"") {
            self.bump_n(2);
            self.lex_string_body(true, false);
            true
        } else if rest.starts_with('"') {
            self.bump();
            self.lex_string_body(false, false);
            true
        } else {
            false
        }
    }

    fn lex_string_body(&mut self, verbatim: bool, interpolated: bool) {
        while let Some(c) = self.peek() {
            match c {
                '"' if verbatim && self.peek_nth(1) == Some('"') => self.bump_n(2),
                '"' => {
                    self.bump();
                    return;
                }
                '\\' if !verbatim => self.bump_n(2),
                '\n' if !verbatim => return,
                '{' if interpolated && self.peek_nth(1) == Some('{') => self.bump_n(2),
                '{' if interpolated => {
                    self.bump();
                    // Hole tokens are pushed while the enclosing literal is still open;
                    // they land before it in the token stream.
                    self.lex_code(true);
                }
                _ => {
                    self.bump();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(src: &str) -> Vec<&str> {
        tokenize(src).into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn identifiers_and_punctuation() {
        assert_eq!(
            texts("System.IO.File.ReadAllText(path);"),
            vec!["System", ".", "IO", ".", "File", ".", "ReadAllText", "(", "path", ")", ";"]
        );
    }

    #[test]
    fn comments_are_dropped() {
        let src = "// unsafe\nint x = 1; /* DllImport */ return x;";
        let toks = texts(src);
        assert!(!toks.contains(&"unsafe"));
        assert!(!toks.contains(&"DllImport"));
        assert!(toks.contains(&"return"));
    }

    #[test]
    fn strings_collapse_to_literals() {
        let toks = tokenize(r#"Log("System.IO is fine here"); var s = @"C:\unsafe""x";"#);
        assert!(toks.iter().all(|t| t.text != "unsafe" && t.text != "IO"));
        assert_eq!(
            toks.iter().filter(|t| t.kind == TokenKind::Literal).count(),
            2
        );
    }

    #[test]
    fn interpolation_holes_are_code() {
        let toks = texts(r#"var s = $"value: {System.IO.File.ReadAllText("x")} {{literal}}";"#);
        assert!(toks.contains(&"System"));
        assert!(toks.contains(&"ReadAllText"));
        assert!(!toks.contains(&"literal"));
    }

    #[test]
    fn raw_strings_are_opaque() {
        let toks = texts("var s = \"\"\"\n unsafe \"quoted\" \n\"\"\"; ok();");
        assert!(!toks.contains(&"unsafe"));
        assert!(toks.contains(&"ok"));
    }

    #[test]
    fn directives_span_the_line() {
        let toks = tokenize("#pragma warning disable CS0162\nint x;");
        assert_eq!(toks[0].kind, TokenKind::Directive);
        assert_eq!(toks[0].text, "#pragma warning disable CS0162");
        assert_eq!(toks[1].text, "int");
    }

    #[test]
    fn positions_are_one_based() {
        let toks = tokenize("a\n  unsafe");
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
    }

    #[test]
    fn verbatim_identifiers_drop_prefix() {
        let toks = tokenize("@unsafe = @System.@IO");
        assert_eq!(toks[0].text, "unsafe");
        assert!(toks[0].verbatim);
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        let names: Vec<_> = toks.iter().map(|t| (t.text, t.verbatim)).collect();
        assert_eq!(
            names[2..],
            [("System", true), (".", false), ("IO", true)]
        );
    }

    #[test]
    fn multi_char_operators() {
        assert_eq!(texts("p->x ?? y?.z"), vec!["p", "->", "x", "??", "y", "?.", "z"]);
    }

    #[test]
    fn char_literals() {
        assert_eq!(texts(r"var c = '\''; f();"), vec!["var", "c", "=", r"'\''", ";", "f", "(", ")", ";"]);
    }

    #[test]
    fn unterminated_input_does_not_hang() {
        let _ = tokenize("var s = \"never closed");
        let _ = tokenize("/* never closed");
        let _ = tokenize("$\"{ open hole");
    }
}

//! Lexical analysis for the restricted language.
//!
//! Two passes:
//! - logos tokenizes the source, producing raw `Newline(indent)` tokens;
//! - [`tokenize`] runs the layout pass, turning raw newlines into logical
//!   `Newline` / `Indent` / `Dedent` tokens and dropping newlines inside
//!   brackets.

use logos::{Lexer, Logos};

use super::error::Fault;

/// A string literal. For f-strings `value` is the unprocessed body; escapes
/// are resolved per literal segment by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct StrLit {
    pub value: String,
    pub raw: bool,
    pub fstring: bool,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\f\r]+")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"\\\r?\n")]
pub enum Token {
    /// Raw line break followed by the next line's indentation width.
    #[regex(r"\n[ \t]*", indent_width)]
    Newline(usize),

    // Produced only by the layout pass.
    Indent,
    Dedent,
    Eof,

    // --- Literals ---
    #[regex(r"[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<i64>().ok())]
    #[regex(r"0[xX][0-9a-fA-F_]+", |lex| i64::from_str_radix(&lex.slice()[2..].replace('_', ""), 16).ok())]
    Int(i64),

    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9]+", parse_float)]
    Float(f64),

    #[regex(r#"[rRfF]?[rRfF]?["']"#, lex_string)]
    Str(StrLit),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // --- Keywords ---
    #[token("None")]
    None,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("in")]
    In,
    #[token("is")]
    Is,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("pass")]
    Pass,
    #[token("def")]
    Def,
    #[token("return")]
    Return,
    #[token("lambda")]
    Lambda,
    #[token("del")]
    Del,
    #[token("assert")]
    Assert,

    // Reserved: recognised so the parser can reject them by name.
    #[token("import")]
    Import,
    #[token("from")]
    From,
    #[token("as")]
    As,
    #[token("class")]
    Class,
    #[token("try")]
    Try,
    #[token("except")]
    Except,
    #[token("finally")]
    Finally,
    #[token("raise")]
    Raise,
    #[token("with")]
    With,
    #[token("yield")]
    Yield,
    #[token("async")]
    Async,
    #[token("await")]
    Await,
    #[token("global")]
    Global,
    #[token("nonlocal")]
    Nonlocal,

    // --- Operators ---
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("//=")]
    DoubleSlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("**=")]
    DoubleStarAssign,
    #[token("->")]
    Arrow,

    // --- Delimiters ---
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token(";")]
    Semicolon,
}

impl Token {
    /// Source spelling of keyword tokens, used in diagnostics.
    pub fn keyword(&self) -> Option<&'static str> {
        Some(match self {
            Token::Import => "import",
            Token::From => "from",
            Token::As => "as",
            Token::Class => "class",
            Token::Try => "try",
            Token::Except => "except",
            Token::Finally => "finally",
            Token::Raise => "raise",
            Token::With => "with",
            Token::Yield => "yield",
            Token::Async => "async",
            Token::Await => "await",
            Token::Global => "global",
            Token::Nonlocal => "nonlocal",
            _ => return None,
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Token::Newline(_) => "end of line".into(),
            Token::Indent => "indent".into(),
            Token::Dedent => "dedent".into(),
            Token::Eof => "end of input".into(),
            Token::Int(i) => i.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(_) => "string".into(),
            Token::Ident(name) => format!("'{name}'"),
            other => match other.keyword() {
                Some(k) => format!("'{k}'"),
                None => format!("{other:?}"),
            },
        }
    }
}

fn indent_width(lex: &mut Lexer<Token>) -> usize {
    lex.slice()[1..].chars().fold(0, |width, c| match c {
        '\t' => (width / 8 + 1) * 8,
        _ => width + 1,
    })
}

fn parse_float(lex: &mut Lexer<Token>) -> Option<f64> {
    lex.slice().replace('_', "").parse::<f64>().ok()
}

/// Scan a string body after its opening quote. Handles single, triple, raw
/// and f-string forms; returns `None` on an unterminated literal.
fn lex_string(lex: &mut Lexer<Token>) -> Option<StrLit> {
    let opening = lex.slice();
    let quote = opening.chars().last()?;
    let prefix = opening[..opening.len() - 1].to_ascii_lowercase();
    let raw = prefix.contains('r');
    let fstring = prefix.contains('f');
    if prefix.len() == 2 && !(raw && fstring) {
        return None;
    }

    let rest = lex.remainder();
    let triple = rest.starts_with(&format!("{quote}{quote}"));
    let (body_start, terminator) = if triple {
        (2, format!("{quote}{quote}{quote}"))
    } else {
        (0, quote.to_string())
    };

    let body = &rest[body_start..];
    let mut chars = body.char_indices();
    let end = loop {
        let (i, c) = chars.next()?;
        match c {
            '\\' => {
                chars.next();
            }
            '\n' if !triple => return None,
            _ if body[i..].starts_with(&terminator) => break i,
            _ => {}
        }
    };

    let raw_body = &body[..end];
    lex.bump(body_start + end + terminator.len());

    let value = if raw || fstring {
        raw_body.to_string()
    } else {
        unescape(raw_body)
    };
    Some(StrLit {
        value,
        raw,
        fstring,
    })
}

/// Resolve backslash escapes. Unknown escapes keep their backslash.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => {
                        out.push_str("\\x");
                        out.push_str(&hex);
                    }
                }
            }
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// A token with the 1-based source line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

fn line_starts(source: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

fn line_of(starts: &[usize], offset: usize) -> u32 {
    match starts.binary_search(&offset) {
        Ok(i) => i as u32 + 1,
        Err(i) => i as u32,
    }
}

/// Remove indentation common to every non-blank line.
fn dedent(source: &str) -> String {
    let common = source
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    if common == 0 {
        return source.to_string();
    }
    source
        .lines()
        .map(|l| l.get(common..).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tokenize and apply the layout pass.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, Fault> {
    let source = dedent(source);
    let starts = line_starts(&source);

    let mut raw = Vec::new();
    let mut lexer = Token::lexer(&source);
    while let Some(result) = lexer.next() {
        let line = line_of(&starts, lexer.span().start);
        match result {
            Ok(token) => raw.push(Spanned { token, line }),
            Err(()) => {
                let slice = lexer.slice();
                let message = if slice.starts_with(['"', '\'']) || slice.ends_with(['"', '\'']) {
                    "unterminated string literal".to_string()
                } else {
                    format!("invalid syntax near {slice:?}")
                };
                return Err(Fault::compile(message, line));
            }
        }
    }

    layout(raw, starts.len() as u32)
}

fn layout(raw: Vec<Spanned>, last_line: u32) -> Result<Vec<Spanned>, Fault> {
    let mut out: Vec<Spanned> = Vec::with_capacity(raw.len() + 8);
    let mut indents: Vec<usize> = vec![0];
    let mut depth: usize = 0;
    let mut iter = raw.into_iter().peekable();

    while let Some(spanned) = iter.next() {
        match spanned.token {
            Token::Newline(mut width) => {
                if depth > 0 {
                    continue;
                }
                // Blank and comment-only lines: only the last newline counts.
                while let Some(Spanned {
                    token: Token::Newline(next),
                    ..
                }) = iter.peek()
                {
                    width = *next;
                    iter.next();
                }
                let Some(next) = iter.peek() else { break };
                let line = next.line;

                if !out.is_empty() && !matches!(out.last(), Some(s) if s.token == Token::Newline(0))
                {
                    out.push(Spanned {
                        token: Token::Newline(0),
                        line: spanned.line,
                    });
                }
                if out.is_empty() {
                    // Leading blank lines.
                    if width != 0 {
                        return Err(Fault::compile("unexpected indent", line));
                    }
                    continue;
                }

                let current = *indents.last().unwrap_or(&0);
                if width > current {
                    indents.push(width);
                    out.push(Spanned {
                        token: Token::Indent,
                        line,
                    });
                } else {
                    while width < *indents.last().unwrap_or(&0) {
                        indents.pop();
                        out.push(Spanned {
                            token: Token::Dedent,
                            line,
                        });
                    }
                    if width != *indents.last().unwrap_or(&0) {
                        return Err(Fault::compile(
                            "unindent does not match any outer indentation level",
                            line,
                        ));
                    }
                }
            }
            token => {
                match token {
                    Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
                    Token::RParen | Token::RBracket | Token::RBrace => {
                        depth = depth.saturating_sub(1)
                    }
                    _ => {}
                }
                out.push(Spanned {
                    token,
                    line: spanned.line,
                });
            }
        }
    }

    if !out.is_empty() && !matches!(out.last(), Some(s) if s.token == Token::Newline(0)) {
        out.push(Spanned {
            token: Token::Newline(0),
            line: last_line,
        });
    }
    for _ in 1..indents.len() {
        out.push(Spanned {
            token: Token::Dedent,
            line: last_line,
        });
    }
    out.push(Spanned {
        token: Token::Eof,
        line: last_line,
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("x = 1"),
            vec![
                Token::Ident("x".into()),
                Token::Assign,
                Token::Int(1),
                Token::Newline(0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let tokens = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&Token::Indent));
        assert!(tokens.contains(&Token::Dedent));
        let indent = tokens.iter().position(|t| *t == Token::Indent).unwrap();
        assert_eq!(tokens[indent - 1], Token::Newline(0));
    }

    #[test]
    fn test_newlines_inside_brackets_are_dropped() {
        let tokens = kinds("xs = [\n  1,\n  2,\n]\n");
        let newlines = tokens
            .iter()
            .filter(|t| matches!(t, Token::Newline(_)))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let tokens = kinds("a = 1\n\n   # note\n\nb = 2");
        assert!(!tokens.contains(&Token::Indent));
    }

    #[test]
    fn test_string_forms() {
        let tokens = kinds(r#"a = 'it\'s' + "x\ny" + r"\d" + f"{v:.2f}" + """multi
line""""#);
        let strs: Vec<_> = tokens
            .into_iter()
            .filter_map(|t| match t {
                Token::Str(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(strs[0].value, "it's");
        assert_eq!(strs[1].value, "x\ny");
        assert_eq!(strs[2].value, "\\d");
        assert!(strs[3].fstring);
        assert_eq!(strs[3].value, "{v:.2f}");
        assert_eq!(strs[4].value, "multi\nline");
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1_000")[0], Token::Int(1000));
        assert_eq!(kinds("0xff")[0], Token::Int(255));
        assert_eq!(kinds("2.5")[0], Token::Float(2.5));
        assert_eq!(kinds(".5")[0], Token::Float(0.5));
        assert_eq!(kinds("1e3")[0], Token::Float(1000.0));
    }

    #[test]
    fn test_common_indentation_is_removed() {
        let tokens = kinds("    x = 1\n    y = 2\n");
        assert!(!tokens.contains(&Token::Indent));
    }

    #[test]
    fn test_unterminated_string_is_a_compile_fault() {
        let err = tokenize("x = 'abc").unwrap_err();
        assert!(matches!(err, Fault::Compile { .. }));
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if a:\n    b = 1\n  c = 2\n").unwrap_err();
        assert!(err.to_string().contains("unindent"));
    }
}

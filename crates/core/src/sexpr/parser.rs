use crate::sexpr::SExpr;
use compact_str::CompactString;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// A syntax error with the 1-based line and column it was found at.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{line}:{column}: {kind}")]
pub struct SExprError {
    pub kind: SExprErrorKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SExprErrorKind {
    Empty,
    UnterminatedList,
    UnterminatedString,
    UnexpectedClose,
    TrailingInput,
}

impl Display for SExprErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SExprErrorKind::Empty => "expected an expression",
            SExprErrorKind::UnterminatedList => "unterminated list",
            SExprErrorKind::UnterminatedString => "unterminated string",
            SExprErrorKind::UnexpectedClose => "unexpected ')'",
            SExprErrorKind::TrailingInput => "unexpected input after the expression",
        })
    }
}

/// Parses exactly one expression. Whitespace and `//` line comments may
/// surround it.
pub fn parse_sexpr(input: &str) -> Result<SExpr, SExprError> {
    let mut parser = Parser { src: input, pos: 0 };
    parser.skip_trivia();
    if parser.is_at_end() {
        return Err(parser.error(SExprErrorKind::Empty));
    }
    let expr = parser.parse_expr()?;
    parser.skip_trivia();
    if !parser.is_at_end() {
        return Err(parser.error(SExprErrorKind::TrailingInput));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn is_at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn next(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn error_at(&self, pos: usize, kind: SExprErrorKind) -> SExprError {
        let before = &self.src[..pos];
        let line = before.matches('\n').count() as u32 + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let column = before[line_start..].chars().count() as u32 + 1;
        SExprError { kind, line, column }
    }

    fn error(&self, kind: SExprErrorKind) -> SExprError {
        self.error_at(self.pos, kind)
    }

    fn skip_trivia(&mut self) {
        loop {
            let trimmed = self.rest().trim_start();
            self.pos = self.src.len() - trimmed.len();
            if !trimmed.starts_with("//") {
                break;
            }
            self.pos += trimmed.find('\n').unwrap_or(trimmed.len());
        }
    }

    fn parse_expr(&mut self) -> Result<SExpr, SExprError> {
        let start = self.pos;
        match self.peek() {
            None => Err(self.error(SExprErrorKind::Empty)),
            Some('(') => {
                self.next();
                let mut elems = Vec::new();
                loop {
                    self.skip_trivia();
                    match self.peek() {
                        None => return Err(self.error_at(start, SExprErrorKind::UnterminatedList)),
                        Some(')') => {
                            self.next();
                            break;
                        }
                        Some(_) => elems.push(self.parse_expr()?),
                    }
                }
                Ok(SExpr::List(elems.into_boxed_slice()))
            }
            Some(')') => Err(self.error(SExprErrorKind::UnexpectedClose)),
            Some('"') => self.parse_string(),
            Some(_) => Ok(self.parse_atom()),
        }
    }

    fn parse_string(&mut self) -> Result<SExpr, SExprError> {
        let start = self.pos;
        self.next();
        let mut s = CompactString::default();
        while let Some(c) = self.next() {
            match c {
                '"' => return Ok(SExpr::String(s)),
                '\\' => {
                    let Some(esc) = self.next() else { break };
                    s.push(match esc {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                _ => s.push(c),
            }
        }
        Err(self.error_at(start, SExprErrorKind::UnterminatedString))
    }

    fn parse_atom(&mut self) -> SExpr {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == '(' || c == ')' {
                break;
            }
            self.next();
        }
        let atom = &self.src[start..self.pos];
        if let Ok(i) = atom.parse::<i64>() {
            return SExpr::Int(i);
        }
        // Only numeric-looking atoms are floats, so symbols such as `inf`
        // or `NaN` stay symbols.
        let numeric = atom
            .trim_start_matches(['-', '+'])
            .starts_with(|c: char| c.is_ascii_digit());
        match atom.parse::<f64>() {
            Ok(f) if numeric => SExpr::Float(f),
            _ => SExpr::Symbol(atom.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr::{float, int, list, string, symbol};
    use indoc::indoc;

    #[test]
    fn test_basic() {
        let input = r#"(a 123 1.23 "str" (nested (1 2)))"#;
        let parsed = parse_sexpr(input).unwrap();
        assert_eq!(
            parsed,
            list([
                symbol("a"),
                int(123),
                float(1.23),
                string("str"),
                list([symbol("nested"), list([int(1), int(2)])])
            ])
        );
    }

    #[test]
    fn trailing_whitespace_and_comments_are_skipped() {
        let input = indoc! {"
            // leading comment
            (goto B2) // trailing comment
            (not part of it)
        "};
        let err = parse_sexpr(input).unwrap_err();
        assert_eq!(err.kind, SExprErrorKind::TrailingInput);
        assert_eq!((err.line, err.column), (3, 1));

        let input = "(block B1\n    // body\n    (return v0))\n\n";
        assert_eq!(
            parse_sexpr(input).unwrap(),
            list([
                symbol("block"),
                symbol("B1"),
                list([symbol("return"), symbol("v0")])
            ])
        );
    }

    #[test]
    fn operator_and_special_float_names_are_symbols() {
        let parsed = parse_sexpr("(- + inf NaN -1 +2.5 -0.5)").unwrap();
        assert_eq!(
            parsed,
            list([
                symbol("-"),
                symbol("+"),
                symbol("inf"),
                symbol("NaN"),
                int(-1),
                float(2.5),
                float(-0.5)
            ])
        );
    }

    #[test]
    fn errors_point_at_the_offending_position() {
        let err = parse_sexpr("(a\n  (b c)").unwrap_err();
        assert_eq!(err.kind, SExprErrorKind::UnterminatedList);
        assert_eq!((err.line, err.column), (1, 1));

        let err = parse_sexpr("(a \"open").unwrap_err();
        assert_eq!(err.kind, SExprErrorKind::UnterminatedString);
        assert_eq!((err.line, err.column), (1, 4));

        let err = parse_sexpr("  )").unwrap_err();
        assert_eq!(err.kind, SExprErrorKind::UnexpectedClose);
        assert_eq!(err.to_string(), "1:3: unexpected ')'");

        assert_eq!(parse_sexpr(" // nothing\n").unwrap_err().kind, SExprErrorKind::Empty);
    }
}

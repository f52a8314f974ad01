//! S-expression parsing and formatting: the textual form of flow graphs
//! in filetests, printer output and the IL parser's input.

use compact_str::CompactString;
use std::fmt::{self, Display, Formatter, Write as _};

mod parser;

pub use parser::{SExprError, SExprErrorKind, parse_sexpr};

#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Int(i64),
    Float(f64),
    Symbol(CompactString),
    String(CompactString),
    List(Box<[SExpr]>),
}

impl SExpr {
    pub fn parse(src: &str) -> Result<Self, SExprError> {
        parse_sexpr(src)
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SExpr::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SExpr]> {
        match self {
            SExpr::List(l) => Some(l),
            _ => None,
        }
    }

    /// If this is a list whose first element is the symbol `head`,
    /// returns the remaining elements.
    pub fn tagged(&self, head: &str) -> Option<&[SExpr]> {
        match self.as_list()? {
            [SExpr::Symbol(s), rest @ ..] if s == head => Some(rest),
            _ => None,
        }
    }

    fn format(&self, dst: &mut String, indent_level: usize) -> fmt::Result {
        match self {
            SExpr::Int(x) => write!(dst, "{x}"),
            SExpr::Float(x) => write!(dst, "{x:?}"),
            SExpr::Symbol(x) => dst.write_str(x),
            SExpr::String(s) => write!(dst, "\"{}\"", s.escape_default()),
            SExpr::List(l) => {
                if !dst.ends_with('\n') && !dst.is_empty() {
                    dst.push('\n');
                    dst.push_str(&"    ".repeat(indent_level));
                }
                dst.push('(');
                for (i, e) in l.iter().enumerate() {
                    if i != 0 {
                        dst.push(' ');
                    }
                    e.format(dst, indent_level + 1)?;
                }
                dst.push(')');
                Ok(())
            }
        }
    }
}

impl Display for SExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.format(&mut s, 0)?;
        for line in s.lines() {
            writeln!(f, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

pub fn int(x: i64) -> SExpr {
    SExpr::Int(x)
}

pub fn float(x: f64) -> SExpr {
    SExpr::Float(x)
}

pub fn symbol(x: impl Into<CompactString>) -> SExpr {
    SExpr::Symbol(x.into())
}

pub fn string(x: impl Into<CompactString>) -> SExpr {
    SExpr::String(x.into())
}

pub fn list(es: impl IntoIterator<Item = SExpr>) -> SExpr {
    SExpr::List(es.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn formatting() {
        let expr = list([
            string("Hi there\n"),
            int(3),
            list([
                float(10.1),
                symbol("Ozymandias"),
                list([symbol("item"), int(10)]),
            ]),
            int(5),
        ]);
        assert_eq!(
            expr.to_string(),
            indoc! {r#"
        ("Hi there\n" 3
            (10.1 Ozymandias
                (item 10)) 5)
        "#}
        )
    }
}

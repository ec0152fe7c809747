//! Template parsing: source text to segment tree.
//!
//! A template is literal text interleaved with `{{ ... }}` tags. A tag holds
//! either an expression to interpolate or one of the block keywords `if`,
//! `else`, `end`. Expressions support literals, access paths, parenthesized
//! function calls, unary `!` and the conventional infix comparison/logical
//! operators.

use serde_json::Value;

use crate::error::{Error, Result};

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied through verbatim.
    Text(String),
    /// `{{ expr }}` interpolation.
    Expr(Expr),
    /// `{{ if expr }} ... {{ else }} ... {{ end }}` block.
    If {
        /// The branch condition.
        cond: Expr,
        /// Segments rendered when the condition is truthy.
        then_branch: Vec<Segment>,
        /// Segments rendered otherwise.
        else_branch: Vec<Segment>,
    },
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal JSON value (string, number, bool, null).
    Literal(Value),
    /// An access path rooted at the context: `.Inputs.x`, `.Steps.id.Status`.
    Path(Vec<String>),
    /// A function call: `default("GET", .Inputs.method)`.
    Call {
        /// Function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// Unary negation: `!expr`.
    Not(Box<Expr>),
    /// Binary operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

/// Infix operators, in the conventional precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// Parses a template into its segment tree.
///
/// # Errors
///
/// Returns [`Error::TemplateParse`] on malformed tags, unbalanced blocks or
/// invalid expressions.
pub fn parse_template(input: &str) -> Result<Vec<Segment>> {
    let tokens = tokenize_tags(input)?;
    let mut pos = 0;
    let segments = parse_segments(&tokens, &mut pos, false)?;
    if pos != tokens.len() {
        return Err(parse_err("unexpected {{ end }} without matching {{ if }}"));
    }
    Ok(segments)
}

fn parse_err(message: impl Into<String>) -> Error {
    Error::TemplateParse {
        message: message.into(),
    }
}

/// Raw tag-level token.
#[derive(Debug)]
enum TagToken {
    Text(String),
    If(String),
    Else,
    End,
    Expr(String),
}

fn tokenize_tags(input: &str) -> Result<Vec<TagToken>> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(TagToken::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| parse_err("unterminated {{ tag"))?;
        let tag = after[..end].trim();

        if tag == "end" {
            tokens.push(TagToken::End);
        } else if tag == "else" {
            tokens.push(TagToken::Else);
        } else if let Some(cond) = tag.strip_prefix("if ") {
            tokens.push(TagToken::If(cond.trim().to_string()));
        } else if tag.is_empty() {
            return Err(parse_err("empty {{ }} tag"));
        } else {
            tokens.push(TagToken::Expr(tag.to_string()));
        }

        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        tokens.push(TagToken::Text(rest.to_string()));
    }

    Ok(tokens)
}

fn parse_segments(tokens: &[TagToken], pos: &mut usize, in_block: bool) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();

    while *pos < tokens.len() {
        match &tokens[*pos] {
            TagToken::Text(text) => {
                segments.push(Segment::Text(text.clone()));
                *pos += 1;
            }
            TagToken::Expr(src) => {
                segments.push(Segment::Expr(parse_expression(src)?));
                *pos += 1;
            }
            TagToken::If(cond_src) => {
                let cond = parse_expression(cond_src)?;
                *pos += 1;
                let then_branch = parse_segments(tokens, pos, true)?;

                let mut else_branch = Vec::new();
                match tokens.get(*pos) {
                    Some(TagToken::Else) => {
                        *pos += 1;
                        else_branch = parse_segments(tokens, pos, true)?;
                        match tokens.get(*pos) {
                            Some(TagToken::End) => *pos += 1,
                            _ => return Err(parse_err("{{ else }} without closing {{ end }}")),
                        }
                    }
                    Some(TagToken::End) => *pos += 1,
                    _ => return Err(parse_err("{{ if }} without closing {{ end }}")),
                }

                segments.push(Segment::If {
                    cond,
                    then_branch,
                    else_branch,
                });
            }
            TagToken::Else | TagToken::End => {
                if in_block {
                    return Ok(segments);
                }
                return Err(parse_err("unexpected block tag outside {{ if }}"));
            }
        }
    }

    if in_block {
        return Err(parse_err("{{ if }} without closing {{ end }}"));
    }
    Ok(segments)
}

/// Parses a standalone expression (used for conditions as well as tags).
///
/// # Errors
///
/// Returns [`Error::TemplateParse`] on invalid syntax.
pub fn parse_expression(src: &str) -> Result<Expr> {
    let tokens = Lexer::new(src).run()?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_err(format!(
            "unexpected trailing input in expression: {src}"
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Ident(String),
    String(String),
    Number(f64),
    True,
    False,
    Null,
    LParen,
    RParen,
    Comma,
    Bang,
    Op(BinaryOp),
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\n' | '\r' => {
                    self.chars.next();
                }
                '.' => {
                    self.chars.next();
                    tokens.push(Token::Dot);
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '"' => tokens.push(self.lex_string()?),
                '0'..='9' => tokens.push(self.lex_number()?),
                '-' => tokens.push(self.lex_number()?),
                '=' => {
                    self.chars.next();
                    self.expect('=', "expected == operator")?;
                    tokens.push(Token::Op(BinaryOp::Eq));
                }
                '!' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Op(BinaryOp::Ne));
                    } else {
                        tokens.push(Token::Bang);
                    }
                }
                '<' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Op(BinaryOp::Le));
                    } else {
                        tokens.push(Token::Op(BinaryOp::Lt));
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.chars.peek() == Some(&'=') {
                        self.chars.next();
                        tokens.push(Token::Op(BinaryOp::Ge));
                    } else {
                        tokens.push(Token::Op(BinaryOp::Gt));
                    }
                }
                '&' => {
                    self.chars.next();
                    self.expect('&', "expected && operator")?;
                    tokens.push(Token::Op(BinaryOp::And));
                }
                '|' => {
                    self.chars.next();
                    self.expect('|', "expected || operator")?;
                    tokens.push(Token::Op(BinaryOp::Or));
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let ident = self.lex_ident();
                    tokens.push(match ident.as_str() {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        _ => Token::Ident(ident),
                    });
                }
                other => {
                    return Err(parse_err(format!(
                        "unexpected character {other:?} in expression"
                    )))
                }
            }
        }

        Ok(tokens)
    }

    fn expect(&mut self, expected: char, message: &str) -> Result<()> {
        if self.chars.next() == Some(expected) {
            Ok(())
        } else {
            Err(parse_err(message))
        }
    }

    fn lex_string(&mut self) -> Result<Token> {
        self.chars.next(); // opening quote
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(Token::String(value)),
                Some('\\') => match self.chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => return Err(parse_err("unterminated string literal")),
                },
                Some(c) => value.push(c),
                None => return Err(parse_err("unterminated string literal")),
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token> {
        let mut raw = String::new();
        if self.chars.peek() == Some(&'-') {
            raw.push('-');
            self.chars.next();
        }
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                raw.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        raw.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| parse_err(format!("invalid number literal: {raw}")))
    }

    fn lex_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        ident
    }
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[BinaryOp]) -> Option<BinaryOp> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_op(&[BinaryOp::Or]).is_some() {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.eat_op(&[BinaryOp::And]).is_some() {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while let Some(op) = self.eat_op(&[BinaryOp::Eq, BinaryOp::Ne]) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) =
            self.eat_op(&[BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge])
        {
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::String(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Dot) => self.parse_path(),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(parse_err("expected closing parenthesis")),
                }
            }
            Some(Token::Ident(name)) => {
                match self.next() {
                    Some(Token::LParen) => {}
                    _ => return Err(parse_err(format!("expected ( after function {name}"))),
                }
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                } else {
                    loop {
                        args.push(self.parse_or()?);
                        match self.next() {
                            Some(Token::Comma) => {}
                            Some(Token::RParen) => break,
                            _ => return Err(parse_err("expected , or ) in argument list")),
                        }
                    }
                }
                Ok(Expr::Call { name, args })
            }
            other => Err(parse_err(format!("unexpected token in expression: {other:?}"))),
        }
    }

    fn parse_path(&mut self) -> Result<Expr> {
        let mut segments = Vec::new();
        loop {
            match self.next() {
                Some(Token::Ident(seg)) => segments.push(seg),
                _ => return Err(parse_err("expected identifier in access path")),
            }
            if self.peek() == Some(&Token::Dot) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(Expr::Path(segments))
    }
}

/// Converts an f64 literal into the narrowest JSON number.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        #[allow(clippy::cast_possible_truncation)]
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_one_segment() {
        let segments = parse_template("hello world").unwrap();
        assert_eq!(segments, vec![Segment::Text("hello world".into())]);
    }

    #[test]
    fn interpolation_parses_path() {
        let segments = parse_template("x={{ .Inputs.count }}").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(
            segments[1],
            Segment::Expr(Expr::Path(vec!["Inputs".into(), "count".into()]))
        );
    }

    #[test]
    fn if_else_end_blocks_nest() {
        let segments =
            parse_template("{{ if .Inputs.a }}A{{ if .Inputs.b }}B{{ end }}{{ else }}C{{ end }}")
                .unwrap();
        assert_eq!(segments.len(), 1);
        let Segment::If {
            then_branch,
            else_branch,
            ..
        } = &segments[0]
        else {
            panic!("expected if segment");
        };
        assert_eq!(then_branch.len(), 2);
        assert_eq!(else_branch, &vec![Segment::Text("C".into())]);
    }

    #[test]
    fn unbalanced_if_is_rejected() {
        assert!(parse_template("{{ if .Inputs.a }}A").is_err());
        assert!(parse_template("A{{ end }}").is_err());
        assert!(parse_template("{{ else }}").is_err());
    }

    #[test]
    fn unterminated_tag_is_rejected() {
        assert!(parse_template("{{ .Inputs.a").is_err());
    }

    #[test]
    fn call_with_arguments() {
        let expr = parse_expression(r#"default("GET", .Inputs.method)"#).unwrap();
        let Expr::Call { name, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "default");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], Expr::Literal(Value::String("GET".into())));
    }

    #[test]
    fn operator_precedence_and_over_or() {
        let expr = parse_expression(".Inputs.a || .Inputs.b && .Inputs.c").unwrap();
        let Expr::Binary { op, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
    }

    #[test]
    fn comparison_binds_tighter_than_equality() {
        let expr = parse_expression(".Inputs.a == .Inputs.b < 3").unwrap();
        let Expr::Binary { op, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Eq);
        assert!(matches!(
            *rhs,
            Expr::Binary {
                op: BinaryOp::Lt,
                ..
            }
        ));
    }

    #[test]
    fn negation_parses() {
        let expr = parse_expression("!.Inputs.flag").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn number_literals_narrow_to_integers() {
        assert_eq!(parse_expression("42").unwrap(), Expr::Literal(Value::from(42)));
        assert_eq!(
            parse_expression("2.5").unwrap(),
            Expr::Literal(serde_json::json!(2.5))
        );
        assert_eq!(parse_expression("-3").unwrap(), Expr::Literal(Value::from(-3)));
    }

    #[test]
    fn string_escapes() {
        let expr = parse_expression(r#""a\"b\n""#).unwrap();
        assert_eq!(expr, Expr::Literal(Value::String("a\"b\n".into())));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse_expression(".Inputs.a .Inputs.b").is_err());
    }
}

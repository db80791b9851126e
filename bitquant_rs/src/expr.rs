//! Factor expression grammar.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | IDENT | IDENT '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Identifiers resolve against [`PANEL_FIELDS`] and the function registry at
//! parse time, so a parsed [`Expr`] is always evaluable.

use std::fmt;

use crate::error::{QuantError, Result};
use crate::functions::{Function, find_function};
use crate::panel::PANEL_FIELDS;

const MAX_DEPTH: usize = 64;
const MAX_OPERATORS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Field(&'static str),
    Call {
        function: Function,
        args: Vec<Expr>,
        window: Option<usize>,
    },
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Parser {
            input,
            tokens,
            cursor: 0,
            depth: 0,
            operators: 0,
        };
        if parser.peek().kind == TokenKind::Eof {
            return Err(QuantError::expression(input, 0, "empty expression"));
        }
        let expr = parser.expression()?;
        let trailing = parser.peek();
        if trailing.kind != TokenKind::Eof {
            return Err(QuantError::expression(
                input,
                trailing.position,
                format!("unexpected {}", trailing.kind),
            ));
        }
        Ok(expr)
    }

    /// Panel fields referenced anywhere in the expression.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields(&self, out: &mut Vec<&'static str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(name) => out.push(*name),
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_fields(out)),
            Expr::Neg(inner) => inner.collect_fields(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Field(name) => write!(f, "{name}"),
            Expr::Call {
                function,
                args,
                window,
            } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                if let Some(window) = window {
                    write!(f, ",{window}")?;
                }
                write!(f, ")")
            }
            Expr::Neg(inner) => write!(f, "-({inner})"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs}{}{rhs})", op.symbol()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Number(f64),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Number(v) => write!(f, "number {v}"),
            TokenKind::LParen => write!(f, "`(`"),
            TokenKind::RParen => write!(f, "`)`"),
            TokenKind::Comma => write!(f, "`,`"),
            TokenKind::Plus => write!(f, "`+`"),
            TokenKind::Minus => write!(f, "`-`"),
            TokenKind::Star => write!(f, "`*`"),
            TokenKind::Slash => write!(f, "`/`"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
    /// Raw source text, used to tell integer literals from decimals.
    text: String,
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position: self.input.len(),
                text: String::new(),
            });
        };
        let single = |kind| Token {
            kind,
            position: pos,
            text: ch.to_string(),
        };
        let token = match ch {
            '(' => single(TokenKind::LParen),
            ')' => single(TokenKind::RParen),
            ',' => single(TokenKind::Comma),
            '+' => single(TokenKind::Plus),
            '-' => single(TokenKind::Minus),
            '*' => single(TokenKind::Star),
            '/' => single(TokenKind::Slash),
            '0'..='9' | '.' => return self.number(pos),
            c if c.is_ascii_alphabetic() || c == '_' => return Ok(self.identifier(pos)),
            other => {
                return Err(QuantError::expression(
                    self.input,
                    pos,
                    format!("unexpected character `{other}`"),
                ));
            }
        };
        self.chars.next();
        Ok(token)
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        let mut text = String::new();
        let mut seen_exponent = false;
        while let Some(&(_, ch)) = self.chars.peek() {
            match ch {
                '0'..='9' | '.' => text.push(ch),
                'e' | 'E' if !seen_exponent => {
                    seen_exponent = true;
                    text.push(ch);
                    self.chars.next();
                    if let Some((_, sign)) = self.chars.next_if(|(_, c)| *c == '+' || *c == '-') {
                        text.push(sign);
                    }
                    continue;
                }
                _ => break,
            }
            self.chars.next();
        }
        let value = text.parse::<f64>().map_err(|_| {
            QuantError::expression(self.input, start, format!("invalid number `{text}`"))
        })?;
        Ok(Token {
            kind: TokenKind::Number(value),
            position: start,
            text,
        })
    }

    fn identifier(&mut self, start: usize) -> Token {
        let mut text = String::new();
        while let Some((_, ch)) = self
            .chars
            .next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        {
            text.push(ch);
        }
        Token {
            kind: TokenKind::Ident(text.clone()),
            position: start,
            text,
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    cursor: usize,
    depth: usize,
    operators: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        // the lexer always terminates the stream with Eof
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn error(&self, position: usize, message: impl Into<String>) -> QuantError {
        QuantError::expression(self.input, position, message)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        let token = self.advance();
        if token.kind == kind {
            Ok(token)
        } else {
            Err(self.error(
                token.position,
                format!("expected {what}, found {}", token.kind),
            ))
        }
    }

    fn binary_operator(&mut self) -> Result<()> {
        let token = self.advance();
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(self.error(token.position, "expression has too many operators"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(self.peek().position, "expression nested too deeply"));
        }
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.binary_operator()?;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => break,
            };
            self.binary_operator()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let mut negations = 0usize;
        while self.peek().kind == TokenKind::Minus {
            self.advance();
            negations += 1;
        }
        let operand = self.primary()?;
        // a run of signs collapses to its parity
        if negations % 2 == 0 {
            return Ok(operand);
        }
        Ok(match operand {
            Expr::Literal(v) => Expr::Literal(-v),
            inner => Expr::Neg(Box::new(inner)),
        })
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(v) => Ok(Expr::Literal(v)),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "`)`")
                    .map_err(|_| self.error(token.position, "unclosed parenthesis"))?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.call(&name, token.position)
                } else {
                    self.field(&name, token.position)
                }
            }
            other => Err(self.error(token.position, format!("unexpected {other}"))),
        }
    }

    fn field(&self, name: &str, position: usize) -> Result<Expr> {
        PANEL_FIELDS
            .iter()
            .copied()
            .find(|f| *f == name)
            .map(Expr::Field)
            .ok_or_else(|| self.error(position, format!("unknown field `{name}`")))
    }

    fn call(&mut self, name: &str, position: usize) -> Result<Expr> {
        let function = find_function(name)
            .ok_or_else(|| self.error(position, format!("unknown function `{name}`")))?;
        let open = self.expect(TokenKind::LParen, "`(`")?;

        let mut raw_args: Vec<(Expr, Token)> = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                let first = self.peek().clone();
                let arg = self.expression()?;
                raw_args.push((arg, first));
                match self.peek().kind {
                    TokenKind::Comma => {
                        self.advance();
                    }
                    TokenKind::RParen => break,
                    TokenKind::Eof => {
                        return Err(self.error(open.position, "unclosed parenthesis"));
                    }
                    _ => {
                        let found = self.peek().clone();
                        return Err(self.error(
                            found.position,
                            format!("expected `,` or `)`, found {}", found.kind),
                        ));
                    }
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let signature = function.signature();
        if raw_args.len() != signature.arity() {
            return Err(self.error(
                position,
                format!(
                    "{} takes {} arguments, got {}",
                    function.name(),
                    signature.arity(),
                    raw_args.len()
                ),
            ));
        }

        let mut window = None;
        if signature.window {
            let Some((arg, first)) = raw_args.pop() else {
                return Err(self.error(position, "missing window argument"));
            };
            window = Some(self.window_literal(function, &arg, &first)?);
        }
        Ok(Expr::Call {
            function,
            args: raw_args.into_iter().map(|(arg, _)| arg).collect(),
            window,
        })
    }

    fn window_literal(&self, function: Function, arg: &Expr, first: &Token) -> Result<usize> {
        let is_integer_text = first.text.chars().all(|c| c.is_ascii_digit());
        match arg {
            Expr::Literal(v) if is_integer_text && *v >= 1.0 && *v <= u32::MAX as f64 => {
                Ok(*v as usize)
            }
            _ => Err(self.error(
                first.position,
                format!(
                    "window of {} must be a positive integer literal",
                    function.name()
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_factors() {
        for source in [
            "ts_midpoint(ts_natr(high,low,close,7),14)",
            "ts_delta(dynamic_ts_max(ts_bbands(close,20),28),7)",
            "ts_midpoint(ts_ht_trendmode(close),21)",
        ] {
            let expr = Expr::parse(source).expect(source);
            assert_eq!(expr.to_string(), source);
        }
    }

    #[test]
    fn infix_respects_precedence() {
        let expr = Expr::parse("close - open * 2").expect("parse");
        assert_eq!(expr.to_string(), "(close-(open*2))");
        let expr = Expr::parse("-(close + 1) / 2").expect("parse");
        assert_eq!(expr.to_string(), "(-((close+1))/2)");
        assert_eq!(expr.fields(), vec!["close"]);
    }

    #[test]
    fn unknown_function_reports_position() {
        let err = Expr::parse("foo_bar(close,5)").expect_err("unknown");
        match err {
            QuantError::FactorExpression {
                position, message, ..
            } => {
                assert_eq!(position, 0);
                assert!(message.contains("foo_bar"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for source in [
            "",
            "ts_delta(close,5",
            "ts_delta(close)",
            "ts_delta(close,2.5)",
            "ts_delta(close,open)",
            "close +",
            "close)",
            "return_1",
            "__import__('os')",
            "close; open",
        ] {
            assert!(
                matches!(
                    Expr::parse(source),
                    Err(QuantError::FactorExpression { .. })
                ),
                "{source} should fail"
            );
        }
    }

    #[test]
    fn long_inputs_parse_or_fail_cleanly() {
        let even = format!("{}close", "-".repeat(200_000));
        assert_eq!(Expr::parse(&even).expect("even run"), Expr::Field("close"));
        let odd = format!("{}close", "-".repeat(200_001));
        assert_eq!(
            Expr::parse(&odd).expect("odd run"),
            Expr::Neg(Box::new(Expr::Field("close")))
        );
        assert_eq!(Expr::parse("---2").expect("literal"), Expr::Literal(-2.0));

        let chain = vec!["close"; 5_000].join("+");
        assert!(matches!(
            Expr::parse(&chain),
            Err(QuantError::FactorExpression { .. })
        ));

        let nested = format!("{}close{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(
            Expr::parse(&nested),
            Err(QuantError::FactorExpression { .. })
        ));
    }
}

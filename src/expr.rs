//! A small expression grammar for computed pipeline values.
//!
//! Configured operations are evaluated over two namespaces: `v` (the node's
//! input fields) and `c` (constants supplied at runtime), e.g.
//! `(v.inner > c.min_inner) && (v.outer < c.max_outer)` or
//! `math.exp(v.level + c.offset)`. The grammar covers arithmetic,
//! comparisons, boolean logic and a fixed set of `math.*` functions.
//! Expressions come from the experiment configuration, which is trusted
//! input; the grammar bounds what a bad entry can do, it is not a sandbox.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    BadChar(char, usize),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unknown function 'math.{0}'")]
    UnknownFunction(String),

    #[error("wrong number of arguments for 'math.{0}'")]
    BadArity(String),

    #[error("unknown namespace '{0}', expected 'v', 'c' or 'math'")]
    UnknownNamespace(String),

    #[error("no input field named '{0}'")]
    MissingInput(String),

    #[error("no constant named '{0}'")]
    MissingConstant(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Not,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two = chars.get(i + 1) == Some(&'=');
                tokens.push(match (c, two) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('=', true) => Token::Eq,
                    ('!', true) => Token::Ne,
                    ('!', false) => Token::Not,
                    ('=', false) => return Err(ExprError::BadChar('=', i)),
                    _ => unreachable!(),
                });
                i += if two { 2 } else { 1 };
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(ExprError::UnexpectedEnd);
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            _ if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && i > start
                            && matches!(chars.get(i - 1), Some('e') | Some('E'))))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(ExprError::BadChar(c, i)),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Num(f64),
    Input(String),
    Constant(String),
    Unary(UnOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

/// A parsed, reusable expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    ast: Ast,
    source: String,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, tok: &Token) -> Result<(), ExprError> {
        let got = self.next()?;
        if &got == tok {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(format!("{:?}", got)))
        }
    }

    fn binding_power(tok: &Token) -> Option<(BinOp, u8, u8)> {
        // (op, left bp, right bp); right > left makes the operator
        // left-associative, the reverse makes it right-associative
        Some(match tok {
            Token::Or => (BinOp::Or, 1, 2),
            Token::And => (BinOp::And, 3, 4),
            Token::Lt => (BinOp::Lt, 5, 6),
            Token::Le => (BinOp::Le, 5, 6),
            Token::Gt => (BinOp::Gt, 5, 6),
            Token::Ge => (BinOp::Ge, 5, 6),
            Token::Eq => (BinOp::Eq, 5, 6),
            Token::Ne => (BinOp::Ne, 5, 6),
            Token::Plus => (BinOp::Add, 7, 8),
            Token::Minus => (BinOp::Sub, 7, 8),
            Token::Star => (BinOp::Mul, 9, 10),
            Token::Slash => (BinOp::Div, 9, 10),
            Token::Percent => (BinOp::Rem, 9, 10),
            Token::Caret => (BinOp::Pow, 14, 13),
            _ => return None,
        })
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Ast, ExprError> {
        let mut lhs = match self.next()? {
            Token::Num(n) => Ast::Num(n),
            Token::Minus => Ast::Unary(UnOp::Neg, Box::new(self.parse_expr(11)?)),
            Token::Not => Ast::Unary(UnOp::Not, Box::new(self.parse_expr(11)?)),
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                self.expect(&Token::RParen)?;
                inner
            }
            Token::Ident(ns) => self.parse_namespaced(ns)?,
            other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
        };

        while let Some(tok) = self.peek() {
            let Some((op, left_bp, right_bp)) = Self::binding_power(tok) else {
                break;
            };
            if left_bp < min_bp {
                break;
            }
            self.next()?;
            let rhs = self.parse_expr(right_bp)?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// `v.name`, `v['name']`, `c.name`, `c['name']` or `math.fn(args)`.
    fn parse_namespaced(&mut self, ns: String) -> Result<Ast, ExprError> {
        let key = match self.next()? {
            Token::Dot => match self.next()? {
                Token::Ident(name) => name,
                other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
            },
            Token::LBracket => {
                let name = match self.next()? {
                    Token::Str(s) => s,
                    other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                };
                self.expect(&Token::RBracket)?;
                name
            }
            other => return Err(ExprError::UnexpectedToken(format!("{:?}", other))),
        };
        match ns.as_str() {
            "v" => Ok(Ast::Input(key)),
            "c" => Ok(Ast::Constant(key)),
            "math" => {
                self.expect(&Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.next()?;
                } else {
                    loop {
                        args.push(self.parse_expr(0)?);
                        match self.next()? {
                            Token::Comma => continue,
                            Token::RParen => break,
                            other => {
                                return Err(ExprError::UnexpectedToken(format!("{:?}", other)))
                            }
                        }
                    }
                }
                check_math_fn(&key, args.len())?;
                Ok(Ast::Call(key, args))
            }
            _ => Err(ExprError::UnknownNamespace(ns)),
        }
    }
}

fn check_math_fn(name: &str, arity: usize) -> Result<(), ExprError> {
    let expected = match name {
        "abs" | "sqrt" | "exp" | "ln" | "log10" | "floor" | "ceil" => 1,
        "min" | "max" | "pow" => 2,
        _ => return Err(ExprError::UnknownFunction(name.to_string())),
    };
    if arity != expected {
        return Err(ExprError::BadArity(name.to_string()));
    }
    Ok(())
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_expr(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            ast,
            source: source.to_string(),
        })
    }

    /// Evaluate over the input fields `v` and constants `c`. Booleans are
    /// represented as 1.0 / 0.0.
    pub fn eval(
        &self,
        inputs: &BTreeMap<String, f64>,
        constants: &BTreeMap<String, f64>,
    ) -> Result<f64, ExprError> {
        eval_ast(&self.ast, inputs, constants)
    }
}

fn eval_ast(
    ast: &Ast,
    inputs: &BTreeMap<String, f64>,
    constants: &BTreeMap<String, f64>,
) -> Result<f64, ExprError> {
    Ok(match ast {
        Ast::Num(n) => *n,
        Ast::Input(name) => *inputs
            .get(name)
            .ok_or_else(|| ExprError::MissingInput(name.clone()))?,
        Ast::Constant(name) => *constants
            .get(name)
            .ok_or_else(|| ExprError::MissingConstant(name.clone()))?,
        Ast::Unary(op, inner) => {
            let x = eval_ast(inner, inputs, constants)?;
            match op {
                UnOp::Neg => -x,
                UnOp::Not => bool_to_f64(x == 0.0),
            }
        }
        Ast::Binary(op, lhs, rhs) => {
            let a = eval_ast(lhs, inputs, constants)?;
            // short-circuit the boolean operators
            match op {
                BinOp::And if a == 0.0 => return Ok(0.0),
                BinOp::Or if a != 0.0 => return Ok(1.0),
                _ => {}
            }
            let b = eval_ast(rhs, inputs, constants)?;
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::Pow => a.powf(b),
                BinOp::Lt => bool_to_f64(a < b),
                BinOp::Le => bool_to_f64(a <= b),
                BinOp::Gt => bool_to_f64(a > b),
                BinOp::Ge => bool_to_f64(a >= b),
                BinOp::Eq => bool_to_f64(a == b),
                BinOp::Ne => bool_to_f64(a != b),
                BinOp::And | BinOp::Or => bool_to_f64(b != 0.0),
            }
        }
        Ast::Call(name, args) => {
            let x = eval_ast(&args[0], inputs, constants)?;
            match name.as_str() {
                "abs" => x.abs(),
                "sqrt" => x.sqrt(),
                "exp" => x.exp(),
                "ln" => x.ln(),
                "log10" => x.log10(),
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => {
                    let y = eval_ast(&args[1], inputs, constants)?;
                    match name.as_str() {
                        "min" => x.min(y),
                        "max" => x.max(y),
                        "pow" => x.powf(y),
                        _ => return Err(ExprError::UnknownFunction(name.clone())),
                    }
                }
            }
        }
    })
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, v: &[(&str, f64)], c: &[(&str, f64)]) -> f64 {
        let v: BTreeMap<String, f64> = v.iter().map(|(k, x)| (k.to_string(), *x)).collect();
        let c: BTreeMap<String, f64> = c.iter().map(|(k, x)| (k.to_string(), *x)).collect();
        Expression::parse(src).unwrap().eval(&v, &c).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[], &[]), 9.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &[], &[]), 512.0); // right-associative
        assert_eq!(eval("7 % 4", &[], &[]), 3.0);
    }

    #[test]
    fn test_namespaces() {
        assert_eq!(eval("v.a + c.b", &[("a", 2.0)], &[("b", 3.0)]), 5.0);
        assert_eq!(eval("v['a'] * 2", &[("a", 2.5)], &[]), 5.0);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let v = [("inner", 5.0), ("outer", 1.0)];
        let c = [("min_inner", 3.0), ("max_outer", 2.0)];
        assert_eq!(
            eval("(v.inner > c.min_inner) && (v.outer < c.max_outer)", &v, &c),
            1.0
        );
        assert_eq!(eval("v.inner <= 4 or v.outer == 1", &v, &c), 1.0);
        assert_eq!(eval("not (v.outer != 1)", &v, &c), 1.0);
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(eval("math.sqrt(v.x)", &[("x", 9.0)], &[]), 3.0);
        assert!((eval("math.exp(1) - 2.718281828", &[], &[])).abs() < 1e-6);
        assert_eq!(eval("math.max(2, 3)", &[], &[]), 3.0);
        assert_eq!(eval("math.pow(2, 10)", &[], &[]), 1024.0);
    }

    #[test]
    fn test_short_circuit() {
        // the divide-by-zero side is never evaluated
        assert_eq!(eval("0 && (1 / 0)", &[], &[]), 0.0);
        assert_eq!(eval("1 || (1 / 0)", &[], &[]), 1.0);
    }

    #[test]
    fn test_missing_names() {
        let expr = Expression::parse("v.nope").unwrap();
        assert_eq!(
            expr.eval(&BTreeMap::new(), &BTreeMap::new()),
            Err(ExprError::MissingInput("nope".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("v.a +").is_err());
        assert!(Expression::parse("math.nope(1)").is_err());
        assert!(Expression::parse("math.sqrt(1, 2)").is_err());
        assert!(Expression::parse("w.a").is_err());
        assert!(Expression::parse("1 $ 2").is_err());
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(eval("1.5e3 + 0.5", &[], &[]), 1500.5);
    }
}

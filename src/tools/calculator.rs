//! Scientific calculator over a closed grammar.
//!
//! ```text
//! expression := term (('+' | '-') term)*
//! term       := factor (('*' | '/' | '%') factor)*
//! factor     := ('+' | '-') factor | power
//! power      := primary ('**' factor)?
//! primary    := number | '(' expression ')' | name | name '(' arguments ')'
//! ```
//!
//! Only the names in [`ALLOWED_NAMES`] are accepted. Anything else is rejected while
//! tokenizing, so no input ever reaches an evaluator it was not written for.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ToolResult;

pub const ALLOWED_NAMES: &[&str] = &[
    "abs",
    "pow",
    "sin",
    "cos",
    "tan",
    "asin",
    "acos",
    "atan",
    "sqrt",
    "log",
    "log10",
    "exp",
    "factorial",
    "pi",
    "e",
];

/// Largest n whose factorial fits in an f64.
const MAX_FACTORIAL: f64 = 170.0;
/// Bounds parser recursion (parentheses, unary signs, exponents, call arguments).
pub const MAX_NESTING_DEPTH: usize = 128;
/// Bounds the size of the expression tree that evaluation walks.
pub const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculatorRequest {
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("name '{0}' is not allowed")]
    UnknownName(String),
    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("{name}() takes {expected} argument(s) but {found} were given")]
    Arity {
        name: &'static str,
        expected: &'static str,
        found: usize,
    },
    #[error("'{0}' is a constant and cannot be called")]
    NotCallable(&'static str),
    #[error("'{0}' is a function and must be called with arguments")]
    MissingCall(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("math domain error: {0}")]
    Domain(&'static str),
    #[error("numerical result out of range")]
    Overflow,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("expression has more than {0} tokens")]
    TooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Abs,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Log,
    Log10,
    Exp,
    Factorial,
    Pi,
    E,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "abs" => Builtin::Abs,
            "pow" => Builtin::Pow,
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "tan" => Builtin::Tan,
            "asin" => Builtin::Asin,
            "acos" => Builtin::Acos,
            "atan" => Builtin::Atan,
            "sqrt" => Builtin::Sqrt,
            "log" => Builtin::Log,
            "log10" => Builtin::Log10,
            "exp" => Builtin::Exp,
            "factorial" => Builtin::Factorial,
            "pi" => Builtin::Pi,
            "e" => Builtin::E,
            _ => return None,
        };
        Some(builtin)
    }

    fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Pow => "pow",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Asin => "asin",
            Builtin::Acos => "acos",
            Builtin::Atan => "atan",
            Builtin::Sqrt => "sqrt",
            Builtin::Log => "log",
            Builtin::Log10 => "log10",
            Builtin::Exp => "exp",
            Builtin::Factorial => "factorial",
            Builtin::Pi => "pi",
            Builtin::E => "e",
        }
    }

    fn constant_value(self) -> Option<f64> {
        match self {
            Builtin::Pi => Some(std::f64::consts::PI),
            Builtin::E => Some(std::f64::consts::E),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Name(Builtin),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(value) => write!(f, "number {value}"),
            Token::Name(builtin) => write!(f, "name '{}'", builtin.name()),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Percent => f.write_str("'%'"),
            Token::Power => f.write_str("'**'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Spanned {
    token: Token,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, CalcError> {
    let chars = input.char_indices().collect::<Vec<(usize, char)>>();
    let mut tokens = Vec::new();
    let mut index = 0usize;

    while index < chars.len() {
        let (pos, ch) = chars[index];

        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        if ch.is_ascii_digit() || ch == '.' {
            let start = index;
            while index < chars.len() && (chars[index].1.is_ascii_digit() || chars[index].1 == '.')
            {
                index += 1;
            }
            let literal = chars[start..index]
                .iter()
                .map(|(_, c)| *c)
                .collect::<String>();
            let value = literal
                .parse::<f64>()
                .map_err(|_| CalcError::InvalidNumber(literal.clone()))?;
            tokens.push(Spanned {
                token: Token::Number(value),
                pos,
            });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = index;
            while index < chars.len()
                && (chars[index].1.is_ascii_alphanumeric() || chars[index].1 == '_')
            {
                index += 1;
            }
            let name = chars[start..index]
                .iter()
                .map(|(_, c)| *c)
                .collect::<String>();
            let builtin = Builtin::from_name(&name).ok_or(CalcError::UnknownName(name))?;
            tokens.push(Spanned {
                token: Token::Name(builtin),
                pos,
            });
            continue;
        }

        let token = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if chars.get(index + 1).map(|(_, c)| *c) == Some('*') => {
                index += 1;
                Token::Power
            }
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            other => return Err(CalcError::UnexpectedChar { ch: other, pos }),
        };
        tokens.push(Spanned { token, pos });
        index += 1;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Builtin,
        args: Vec<Expr>,
    },
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    cursor: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Self {
            tokens,
            cursor: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, CalcError> {
        let expr = self.expression()?;
        match self.tokens.get(self.cursor) {
            None => Ok(expr),
            Some(spanned) => Err(unexpected(spanned)),
        }
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).map(|spanned| spanned.token)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.cursor).copied();
        if spanned.is_some() {
            self.cursor += 1;
        }
        spanned
    }

    fn expect(&mut self, expected: Token) -> Result<(), CalcError> {
        match self.advance() {
            Some(spanned) if spanned.token == expected => Ok(()),
            Some(spanned) => Err(unexpected(&spanned)),
            None => Err(CalcError::UnexpectedEnd),
        }
    }

    fn expression(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.cursor += 1;
            let rhs = self.term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.cursor += 1;
            let rhs = self.factor()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    /// Every recursive path re-enters through here, so this is where depth is counted.
    fn factor(&mut self) -> Result<Expr, CalcError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(CalcError::TooDeep(MAX_NESTING_DEPTH));
        }
        let expr = self.unary();
        self.depth -= 1;
        expr
    }

    fn unary(&mut self) -> Result<Expr, CalcError> {
        match self.peek() {
            Some(Token::Plus) => {
                self.cursor += 1;
                self.factor()
            }
            Some(Token::Minus) => {
                self.cursor += 1;
                Ok(Expr::Negate(Box::new(self.factor()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, CalcError> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Power) {
            self.cursor += 1;
            // Right-associative, and the exponent may carry its own sign.
            let exponent = self.factor()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, CalcError> {
        let spanned = self.advance().ok_or(CalcError::UnexpectedEnd)?;
        match spanned.token {
            Token::Number(value) => Ok(Expr::Number(value)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Name(builtin) => {
                let called = self.peek() == Some(Token::LParen);
                match (builtin.constant_value(), called) {
                    (Some(_), true) => Err(CalcError::NotCallable(builtin.name())),
                    (Some(value), false) => Ok(Expr::Number(value)),
                    (None, false) => Err(CalcError::MissingCall(builtin.name())),
                    (None, true) => {
                        self.cursor += 1;
                        let args = self.arguments()?;
                        Ok(Expr::Call {
                            func: builtin,
                            args,
                        })
                    }
                }
            }
            _ => Err(unexpected(&spanned)),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, CalcError> {
        let mut args = Vec::new();
        if self.peek() == Some(Token::RParen) {
            self.cursor += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.advance() {
                Some(Spanned {
                    token: Token::Comma,
                    ..
                }) => continue,
                Some(Spanned {
                    token: Token::RParen,
                    ..
                }) => return Ok(args),
                Some(spanned) => return Err(unexpected(&spanned)),
                None => return Err(CalcError::UnexpectedEnd),
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn unexpected(spanned: &Spanned) -> CalcError {
    CalcError::UnexpectedToken {
        found: spanned.token.to_string(),
        pos: spanned.pos,
    }
}

fn eval(expr: &Expr) -> Result<f64, CalcError> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Negate(operand) => Ok(-eval(operand)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs)?;
            let rhs = eval(rhs)?;
            apply_binary(*op, lhs, rhs)
        }
        Expr::Call { func, args } => {
            let values = args.iter().map(eval).collect::<Result<Vec<f64>, CalcError>>()?;
            apply_function(*func, &values)
        }
    }
}

fn checked(value: f64) -> Result<f64, CalcError> {
    if value.is_nan() {
        return Err(CalcError::Domain("result is undefined"));
    }
    if value.is_infinite() {
        return Err(CalcError::Overflow);
    }
    Ok(value)
}

fn power(base: f64, exponent: f64) -> Result<f64, CalcError> {
    if base == 0.0 && exponent < 0.0 {
        return Err(CalcError::DivisionByZero);
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(CalcError::Domain(
            "negative number cannot be raised to a fractional power",
        ));
    }
    checked(base.powf(exponent))
}

fn apply_binary(op: BinaryOp, lhs: f64, rhs: f64) -> Result<f64, CalcError> {
    match op {
        BinaryOp::Add => checked(lhs + rhs),
        BinaryOp::Sub => checked(lhs - rhs),
        BinaryOp::Mul => checked(lhs * rhs),
        BinaryOp::Div => {
            if rhs == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            checked(lhs / rhs)
        }
        BinaryOp::Mod => {
            if rhs == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            // Remainder takes the sign of the divisor.
            let remainder = lhs % rhs;
            if remainder != 0.0 && (remainder < 0.0) != (rhs < 0.0) {
                checked(remainder + rhs)
            } else {
                checked(remainder)
            }
        }
        BinaryOp::Pow => power(lhs, rhs),
    }
}

fn expect_args(
    func: Builtin,
    args: &[f64],
    expected: usize,
    label: &'static str,
) -> Result<(), CalcError> {
    if args.len() != expected {
        return Err(CalcError::Arity {
            name: func.name(),
            expected: label,
            found: args.len(),
        });
    }
    Ok(())
}

fn factorial(n: f64) -> Result<f64, CalcError> {
    if n < 0.0 {
        return Err(CalcError::Domain("factorial() not defined for negative values"));
    }
    if n.fract() != 0.0 {
        return Err(CalcError::Domain("factorial() only accepts integral values"));
    }
    if n > MAX_FACTORIAL {
        return Err(CalcError::Overflow);
    }
    let mut product = 1.0f64;
    let mut k = 2.0f64;
    while k <= n {
        product *= k;
        k += 1.0;
    }
    Ok(product)
}

fn apply_function(func: Builtin, args: &[f64]) -> Result<f64, CalcError> {
    if func == Builtin::Pow {
        expect_args(func, args, 2, "2")?;
        return power(args[0], args[1]);
    }

    if func == Builtin::Log {
        if args.is_empty() || args.len() > 2 {
            return Err(CalcError::Arity {
                name: func.name(),
                expected: "1 or 2",
                found: args.len(),
            });
        }
        let x = args[0];
        if x <= 0.0 {
            return Err(CalcError::Domain("log() requires a positive argument"));
        }
        return match args.get(1).copied() {
            None => checked(x.ln()),
            Some(base) if base <= 0.0 => {
                Err(CalcError::Domain("log() requires a positive base"))
            }
            Some(base) if base == 1.0 => Err(CalcError::DivisionByZero),
            Some(base) => checked(x.ln() / base.ln()),
        };
    }

    expect_args(func, args, 1, "1")?;
    let x = args[0];
    match func {
        Builtin::Abs => Ok(x.abs()),
        Builtin::Sin => checked(x.sin()),
        Builtin::Cos => checked(x.cos()),
        Builtin::Tan => checked(x.tan()),
        Builtin::Asin | Builtin::Acos if !(-1.0..=1.0).contains(&x) => Err(CalcError::Domain(
            "asin()/acos() require an argument between -1 and 1",
        )),
        Builtin::Asin => Ok(x.asin()),
        Builtin::Acos => Ok(x.acos()),
        Builtin::Atan => Ok(x.atan()),
        Builtin::Sqrt if x < 0.0 => Err(CalcError::Domain("sqrt() of a negative number")),
        Builtin::Sqrt => Ok(x.sqrt()),
        Builtin::Log10 if x <= 0.0 => {
            Err(CalcError::Domain("log10() requires a positive argument"))
        }
        Builtin::Log10 => checked(x.log10()),
        Builtin::Exp => checked(x.exp()),
        Builtin::Factorial => factorial(x),
        Builtin::Pow | Builtin::Log | Builtin::Pi | Builtin::E => {
            Err(CalcError::NotCallable(func.name()))
        }
    }
}

/// Parses and evaluates `expression` without executing anything outside the grammar.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(CalcError::UnexpectedEnd);
    }
    if tokens.len() > MAX_TOKENS {
        return Err(CalcError::TooLong(MAX_TOKENS));
    }
    let expr = Parser::new(&tokens).parse()?;
    eval(&expr)
}

pub fn run_calculator(request: &CalculatorRequest) -> ToolResult {
    let expression = request.expression.trim();
    if expression.is_empty() {
        return ToolResult::CalculatorError {
            message: "Expression cannot be empty.".to_string(),
        };
    }

    match evaluate(expression) {
        Ok(value) => {
            tracing::debug!(expression, value, "calculator evaluated expression");
            ToolResult::CalculatorResult { value }
        }
        Err(err) => {
            tracing::debug!(expression, error = %err, "calculator rejected expression");
            ToolResult::CalculatorError {
                message: format!("Calculation failed: {err}"),
            }
        }
    }
}

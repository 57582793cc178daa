//! Arithmetic expression evaluation for the `math_eval` tool
//!
//! Expressions are gated by a character class and then parsed by a small
//! recursive-descent parser. Only the operators and the fixed function and
//! constant set below are reachable; nothing is handed to an interpreter.

use std::sync::LazyLock;

use regex::Regex;

use crate::sandbox::MAX_CODE_LENGTH;
use crate::types::ToolError;

static ALLOWED_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9+\-*/%^().\s,a-z_]+$").expect("allowed-character pattern is valid")
});

/// Largest n whose factorial is finite in an f64
const MAX_FINITE_FACTORIAL: f64 = 170.0;

/// Deepest nesting of parentheses, calls and unary signs
pub const MAX_NESTING_DEPTH: usize = 64;

/// Evaluate a single arithmetic expression
///
/// Supports `+ - * / % ^` (`^` is exponentiation), parentheses, the constants
/// `pi` and `e`, and the functions `log`, `factorial`, `avg`, `abs`, `round`,
/// `ceil`, `floor`, `lcm`, `hcf`, `sin`, `cos`, `tan`, `asin`, `acos`, `atan`.
///
/// Non-finite results (`1/0`) are returned as values, not errors.
pub fn evaluate(expression: &str) -> Result<f64, ToolError> {
    let normalized = expression.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ToolError::Validation("Expression is empty".into()));
    }
    if normalized.chars().count() > MAX_CODE_LENGTH {
        return Err(ToolError::Validation("Expression is too long".into()));
    }
    if !ALLOWED_CHARS.is_match(&normalized) {
        return Err(ToolError::Validation(
            "Expression contains unsupported characters".into(),
        ));
    }

    let tokens = tokenize(&normalized)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some(token) => Err(ToolError::Execution(format!(
            "Unexpected token after expression: {token}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::Op(op) => write!(f, "{op}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ToolError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ToolError::Execution(format!("Invalid number: {literal}")))?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_lowercase() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => {
                return Err(ToolError::Validation(format!(
                    "Unsupported character: {other}"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ToolError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ToolError::Execution(format!(
                "Expected '{expected}' but found '{token}'"
            ))),
            None => Err(ToolError::Execution(format!(
                "Expected '{expected}' but the expression ended"
            ))),
        }
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // Every recursive production passes through here
    fn unary(&mut self) -> Result<f64, ToolError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ToolError::Validation(
                "Expression is nested too deeply".into(),
            ));
        }
        let value = self.signed();
        self.depth -= 1;
        value
    }

    // unary := ('+' | '-') unary | power
    fn signed(&mut self) -> Result<f64, ToolError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?   (right-associative)
    fn power(&mut self) -> Result<f64, ToolError> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ToolError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let args = self.arguments()?;
                    call_function(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(token) => Err(ToolError::Execution(format!("Unexpected token: {token}"))),
            None => Err(ToolError::Execution("Unexpected end of expression".into())),
        }
    }

    // Called after '('; consumes through the matching ')'
    fn arguments(&mut self) -> Result<Vec<f64>, ToolError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(token) => {
                    return Err(ToolError::Execution(format!(
                        "Expected ',' or ')' but found '{token}'"
                    )));
                }
                None => return Err(ToolError::Execution("Unclosed function call".into())),
            }
        }
    }
}

fn constant(name: &str) -> Result<f64, ToolError> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        _ => Err(ToolError::Execution(format!("Unknown identifier: {name}"))),
    }
}

fn arity(name: &str, args: &[f64], expected: usize) -> Result<(), ToolError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ToolError::Execution(format!(
            "{name}() expects {expected} argument(s), got {}",
            args.len()
        )))
    }
}

fn call_function(name: &str, args: &[f64]) -> Result<f64, ToolError> {
    let unary = |f: fn(f64) -> f64| -> Result<f64, ToolError> {
        arity(name, args, 1)?;
        Ok(f(args[0]))
    };

    match name {
        "log" => match args {
            [n] => Ok(n.ln()),
            [base, n] => Ok(n.ln() / base.ln()),
            _ => Err(ToolError::Execution(format!(
                "log() expects 1 or 2 arguments, got {}",
                args.len()
            ))),
        },
        "factorial" => unary(factorial),
        "avg" => {
            if args.is_empty() {
                return Err(ToolError::Execution(
                    "avg() expects at least 1 argument".into(),
                ));
            }
            Ok(args.iter().sum::<f64>() / args.len() as f64)
        }
        "abs" => unary(f64::abs),
        "round" => unary(|x| (x + 0.5).floor()),
        "ceil" => unary(f64::ceil),
        "floor" => unary(f64::floor),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "asin" => unary(f64::asin),
        "acos" => unary(f64::acos),
        "atan" => unary(f64::atan),
        "hcf" => {
            arity(name, args, 2)?;
            Ok(hcf(args[0], args[1]))
        }
        "lcm" => {
            arity(name, args, 2)?;
            Ok(lcm(args[0], args[1]))
        }
        _ => Err(ToolError::Execution(format!("Unknown function: {name}"))),
    }
}

fn factorial(n: f64) -> f64 {
    if n.is_nan() || n < 0.0 {
        return f64::NAN;
    }
    if n > MAX_FINITE_FACTORIAL {
        return f64::INFINITY;
    }
    let mut result = 1.0;
    let mut i = 2.0;
    while i <= n {
        result *= i;
        i += 1.0;
    }
    result
}

fn hcf(a: f64, b: f64) -> f64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    if !a.is_finite() || !b.is_finite() {
        return f64::NAN;
    }
    while b != 0.0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a
}

fn lcm(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        return 0.0;
    }
    (a * b).abs() / hcf(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> f64 {
        evaluate(expr).unwrap()
    }

    #[test]
    fn test_documented_examples() {
        assert!((eval("log(2,8)") - 3.0).abs() < 1e-12);
        assert_eq!(eval("factorial(5)"), 120.0);
        assert_eq!(eval("avg(1,2,3)"), 2.0);
        assert_eq!(eval("2^10"), 1024.0);
    }

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3"), 7.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("2^3^2"), 512.0);
        assert_eq!(eval("-2^2"), -4.0);
        assert_eq!(eval("10 % 4"), 2.0);
        assert_eq!(eval("7 - 2 - 1"), 4.0);
        assert_eq!(eval("2 * -3"), -6.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(eval("factorial(0)"), 1.0);
        assert!(eval("factorial(-1)").is_nan());
        assert_eq!(eval("factorial(171)"), f64::INFINITY);
        assert_eq!(eval("hcf(12, 18)"), 6.0);
        assert_eq!(eval("lcm(4, 6)"), 12.0);
        assert_eq!(eval("lcm(0, 6)"), 0.0);
        assert_eq!(eval("round(2.5)"), 3.0);
        assert_eq!(eval("round(-2.5)"), -2.0);
        assert_eq!(eval("abs(-4) + ceil(1.2) + floor(1.8)"), 7.0);
        assert!((eval("sin(pi/2)") - 1.0).abs() < 1e-12);
        assert!((eval("log(e)") - 1.0).abs() < 1e-12);
        assert!((eval("atan(1) * 4") - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_case_and_whitespace_normalization() {
        assert_eq!(eval("  ABS(-3)  "), 3.0);
        assert_eq!(eval("PI - pi"), 0.0);
    }

    #[test]
    fn test_non_finite_is_not_an_error() {
        assert_eq!(eval("1/0"), f64::INFINITY);
        assert!(eval("0/0").is_nan());
    }

    #[test]
    fn test_character_gate() {
        for expr in ["1; 2", "[1]", "`1`", "1 == 1", "\"a\"", "x = 1", ""] {
            assert!(
                matches!(evaluate(expr), Err(ToolError::Validation(_))),
                "expected rejection for {expr:?}"
            );
        }
    }

    #[test]
    fn test_closed_scope() {
        assert!(evaluate("process").is_err());
        assert!(evaluate("require(1)").is_err());
        assert!(evaluate("constructor").is_err());
        assert!(evaluate("sqrt(4)").is_err());
    }

    #[test]
    fn test_malformed_expressions_are_errors() {
        for expr in ["(1 + 2", "1 +", "avg()", "log(1,2,3)", "hcf(1)", "1 2", "1..2", ")"] {
            assert!(evaluate(expr).is_err(), "expected error for {expr:?}");
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(1_000), ")".repeat(1_000));
        let unclosed = "(".repeat(10_000);
        let signs = format!("{}1", "-".repeat(1_000));
        let powers = format!("2{}", "^-2".repeat(1_000));
        for expr in [&parens, &unclosed, &signs, &powers] {
            assert!(
                matches!(evaluate(expr), Err(ToolError::Validation(_))),
                "expected rejection for {} chars",
                expr.len()
            );
        }
        assert_eq!(
            evaluate(&"-".repeat(100_000)),
            Err(ToolError::Validation("Expression is too long".into()))
        );
    }

    #[test]
    fn test_moderate_nesting_still_evaluates() {
        let depth = 20;
        let nested = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(eval(&nested), 1.0);
        assert_eq!(eval("abs(-(-(-(2))))"), 2.0);
        assert_eq!(eval("--3"), 3.0);
    }
}

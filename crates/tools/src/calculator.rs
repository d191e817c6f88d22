//! Calculator tool: evaluates arithmetic expressions for the model.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    = term (('+' | '-') term)*
//! term    = unary (('*' | '/' | '%') unary)*
//! unary   = '-' unary | power
//! power   = atom (('^' | '**') unary)?
//! atom    = NUMBER | NAME | NAME '(' expr ')' | '(' expr ')'
//! ```
//!
//! `^` is right-associative, so `2 ^ 3 ^ 2` is `2 ^ 9`.

use async_trait::async_trait;
use murmur_core::error::ToolError;
use murmur_core::tool::{Tool, ToolContext, ToolResult};
use serde_json::{Value, json};
use tracing::debug;

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression. Supports + - * / % ^, parentheses, \
         the constants pi and e, and sqrt, abs, sin, cos, tan, ln, log, exp, round, floor, ceil."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. '3.14 * 10 ^ 2' or 'sqrt(16)'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let expression = arguments["expression"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'expression' argument".into()))?;

        match evaluate(expression) {
            Ok(value) => {
                debug!(expression, value, "Expression evaluated");
                Ok(ToolResult::ok(json!({
                    "expression": expression,
                    "result": number(value),
                })))
            }
            Err(e) => Ok(ToolResult::error(format!("cannot evaluate '{expression}': {e}"))),
        }
    }
}

/// Integral results are reported without a fractional part.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Evaluate an expression to a finite number.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let tokens = lex(expr)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let value = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(format!("unexpected {tok:?} after end of expression"));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Name(String),
    Op(char),
    Open,
    Close,
}

fn lex(input: &str) -> Result<Vec<Tok>, String> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut end = start;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &input[start..end];
            let n = text.parse().map_err(|_| format!("invalid number '{text}'"))?;
            out.push(Tok::Num(n));
        } else if c.is_ascii_alphabetic() {
            let mut end = start;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Tok::Name(input[start..end].to_ascii_lowercase()));
        } else {
            chars.next();
            let tok = match c {
                '(' => Tok::Open,
                ')' => Tok::Close,
                '*' if matches!(chars.peek(), Some((_, '*'))) => {
                    chars.next();
                    Tok::Op('^')
                }
                '+' | '-' | '*' | '/' | '%' | '^' => Tok::Op(c),
                other => return Err(format!("unexpected character '{other}'")),
            };
            out.push(tok);
        }
    }

    Ok(out)
}

struct Parser<'a> {
    tokens: &'a [Tok],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += usize::from(tok.is_some());
        tok
    }

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some(Tok::Op(c)) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut acc = self.term()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let rhs = self.term()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.unary()?;
        while let Some(op) = self.eat_op(&['*', '/', '%']) {
            let rhs = self.unary()?;
            acc = match op {
                '*' => acc * rhs,
                _ if rhs == 0.0 => return Err("division by zero".into()),
                '/' => acc / rhs,
                _ => acc % rhs,
            };
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<f64, String> {
        if self.eat_op(&['-']).is_some() {
            return Ok(-self.unary()?);
        }
        if self.eat_op(&['+']).is_some() {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.atom()?;
        if self.eat_op(&['^']).is_some() {
            // exponent binds through unary minus: 2 ^ -1
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(n),
            Some(Tok::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Tok::Close) => Ok(inner),
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            Some(Tok::Name(name)) if self.peek() == Some(&Tok::Open) => {
                let arg = self.atom()?;
                apply(&name, arg)
            }
            Some(Tok::Name(name)) => match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                _ => Err(format!("unknown constant '{name}'")),
            },
            Some(tok) => Err(format!("unexpected {tok:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

fn apply(function: &str, x: f64) -> Result<f64, String> {
    let value = match function {
        "sqrt" if x < 0.0 => return Err("square root of a negative number".into()),
        "sqrt" => x.sqrt(),
        "abs" => x.abs(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "ln" | "log" if x <= 0.0 => return Err("logarithm of a non-positive number".into()),
        "ln" => x.ln(),
        "log" => x.log10(),
        "exp" => x.exp(),
        "round" => x.round(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        other => return Err(format!("unknown function '{other}'")),
    };
    Ok(value)
}

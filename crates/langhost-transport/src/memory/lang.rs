//! Tiny expression language evaluated by the in-memory host.
//!
//! Supports numeric literals with `+`/`-`, quoted strings, `NULL`,
//! `TRUE`/`FALSE`, variables assigned with `<-`, statements separated by
//! newlines or `;`, and a handful of builtins (`c`, `data.frame`, `stop`,
//! `cat`, `message`, `print`, `paste`, `sum`, `length`, `identity`,
//! `Sys.sleep`).

use std::collections::HashMap;
use std::time::Duration;

use langhost_core::OutputKind;
use serde_json::{Number, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LangError {
    Parse(String),
    Runtime(String),
}

/// Everything one run produced.
#[derive(Debug)]
pub struct Run {
    pub output: Vec<(OutputKind, String)>,
    pub delay: Duration,
    pub result: Result<Value, LangError>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Value),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Assign,
    Eq,
    Sep,
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Var(String),
    Call(String, Vec<Arg>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
struct Arg {
    name: Option<String>,
    value: Expr,
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

/// Interpreter state; variables persist across runs on one connection.
#[derive(Debug, Default)]
pub struct Interpreter {
    env: HashMap<String, Value>,
}

#[derive(Default)]
struct Effects {
    output: Vec<(OutputKind, String)>,
    delay: Duration,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and evaluate a program.
    pub fn run(&mut self, code: &str) -> Run {
        let mut effects = Effects::default();
        let result = parse_program(code).and_then(|program| {
            let mut last = Value::Null;
            for stmt in program {
                last = match stmt {
                    Stmt::Assign(name, expr) => {
                        let value = self.eval(&expr, &mut effects)?;
                        self.env.insert(name, value.clone());
                        value
                    }
                    Stmt::Expr(expr) => self.eval(&expr, &mut effects)?,
                };
            }
            Ok(last)
        });
        Run {
            output: effects.output,
            delay: effects.delay,
            result,
        }
    }

    /// Call a builtin with already evaluated positional arguments.
    pub fn invoke(&mut self, function: &str, args: Vec<Value>) -> Run {
        let mut effects = Effects::default();
        let args = args.into_iter().map(|v| (None, v)).collect();
        let result = call_builtin(function, args, &mut effects);
        Run {
            output: effects.output,
            delay: effects.delay,
            result,
        }
    }

    fn eval(&self, expr: &Expr, effects: &mut Effects) -> Result<Value, LangError> {
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Var(name) => match name.as_str() {
                "NULL" => Ok(Value::Null),
                "TRUE" => Ok(Value::Bool(true)),
                "FALSE" => Ok(Value::Bool(false)),
                _ => self
                    .env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LangError::Runtime(format!("object '{name}' not found"))),
            },
            Expr::Add(lhs, rhs) => {
                let (a, b) = (self.eval(lhs, effects)?, self.eval(rhs, effects)?);
                arithmetic(&a, &b, i64::checked_add, |x, y| x + y)
            }
            Expr::Sub(lhs, rhs) => {
                let (a, b) = (self.eval(lhs, effects)?, self.eval(rhs, effects)?);
                arithmetic(&a, &b, i64::checked_sub, |x, y| x - y)
            }
            Expr::Call(name, args) => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push((arg.name.clone(), self.eval(&arg.value, effects)?));
                }
                call_builtin(name, evaluated, effects)
            }
        }
    }
}

fn arithmetic(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, LangError> {
    let non_numeric = || LangError::Runtime("non-numeric argument to binary operator".to_string());
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                if let Some(sum) = int_op(x, y) {
                    return Ok(json!(sum));
                }
            }
            let (x, y) = (
                x.as_f64().ok_or_else(non_numeric)?,
                y.as_f64().ok_or_else(non_numeric)?,
            );
            Number::from_f64(float_op(x, y))
                .map(Value::Number)
                .ok_or_else(non_numeric)
        }
        _ => Err(non_numeric()),
    }
}

fn call_builtin(
    name: &str,
    args: Vec<(Option<String>, Value)>,
    effects: &mut Effects,
) -> Result<Value, LangError> {
    match name {
        "c" => {
            let mut items = Vec::new();
            for (_, value) in args {
                match value {
                    Value::Array(inner) => items.extend(inner),
                    Value::Null => {}
                    other => items.push(other),
                }
            }
            Ok(if items.is_empty() {
                Value::Null
            } else {
                Value::Array(items)
            })
        }
        "data.frame" => data_frame(args),
        "stop" => Err(LangError::Runtime(join_display(&args, ""))),
        "cat" => {
            effects
                .output
                .push((OutputKind::Normal, join_display(&args, " ")));
            Ok(Value::Null)
        }
        "message" => {
            let text = format!("{}\n", join_display(&args, ""));
            effects.output.push((OutputKind::Error, text));
            Ok(Value::Null)
        }
        "print" => {
            effects
                .output
                .push((OutputKind::Normal, format!("{}\n", join_display(&args, " "))));
            Ok(args.into_iter().next().map_or(Value::Null, |(_, v)| v))
        }
        "paste" => Ok(Value::String(join_display(&args, " "))),
        "identity" => Ok(args.into_iter().next().map_or(Value::Null, |(_, v)| v)),
        "length" => {
            let len = match args.first().map(|(_, v)| v) {
                None | Some(Value::Null) => 0,
                Some(Value::Array(items)) => items.len(),
                Some(_) => 1,
            };
            Ok(json!(len))
        }
        "sum" => {
            let mut total = json!(0);
            for (_, value) in args {
                let items = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                for item in items {
                    total = arithmetic(&total, &item, i64::checked_add, |x, y| x + y)?;
                }
            }
            Ok(total)
        }
        "Sys.sleep" => {
            let secs = args
                .first()
                .and_then(|(_, v)| v.as_f64())
                .filter(|s| *s >= 0.0)
                .ok_or_else(|| LangError::Runtime("invalid 'time' value".to_string()))?;
            let too_long = || LangError::Runtime("'time' value too large".to_string());
            let pause = Duration::try_from_secs_f64(secs).map_err(|_| too_long())?;
            effects.delay = effects.delay.checked_add(pause).ok_or_else(too_long)?;
            Ok(Value::Null)
        }
        _ => Err(LangError::Runtime(format!(
            "could not find function \"{name}\""
        ))),
    }
}

fn data_frame(args: Vec<(Option<String>, Value)>) -> Result<Value, LangError> {
    let mut columns = Vec::with_capacity(args.len());
    let mut values = Vec::with_capacity(args.len());
    for (index, (name, value)) in args.into_iter().enumerate() {
        columns.push(name.unwrap_or_else(|| format!("V{}", index + 1)));
        values.push(match value {
            Value::Array(items) => items,
            other => vec![other],
        });
    }
    let rows = values.first().map_or(0, Vec::len);
    if values.iter().any(|column| column.len() != rows) {
        return Err(LangError::Runtime(
            "arguments imply differing number of rows".to_string(),
        ));
    }
    let rows: Vec<Value> = (0..rows)
        .map(|r| Value::Array(values.iter().map(|column| column[r].clone()).collect()))
        .collect();
    Ok(json!({ "columns": columns, "rows": rows }))
}

fn join_display(args: &[(Option<String>, Value)], separator: &str) -> String {
    args.iter()
        .map(|(_, v)| display(v))
        .collect::<Vec<_>>()
        .join(separator)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(" "),
        other => other.to_string(),
    }
}

fn tokenize(code: &str) -> Result<Vec<Token>, LangError> {
    let mut tokens = Vec::new();
    let mut chars = code.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            '\n' | ';' => {
                chars.next();
                tokens.push(Token::Sep);
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '+' | '=' => {
                chars.next();
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '+' => Token::Plus,
                    _ => Token::Eq,
                });
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '<' => {
                chars.next();
                if chars.next() != Some('-') {
                    return Err(LangError::Parse("unexpected '<'".to_string()));
                }
                tokens.push(Token::Assign);
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => return Err(LangError::Parse("unterminated string".to_string())),
                        Some(c) if c == ch => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => {
                                return Err(LangError::Parse("unterminated string".to_string()));
                            }
                        },
                        Some(c) => text.push(c),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = if literal.contains('.') {
                    literal
                        .parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                } else {
                    literal.parse::<i64>().ok().map(|n| json!(n))
                };
                tokens.push(Token::Num(value.ok_or_else(|| {
                    LangError::Parse(format!("malformed number '{literal}'"))
                })?));
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(LangError::Parse(format!("unexpected '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse_program(code: &str) -> Result<Vec<Stmt>, LangError> {
    let mut parser = Parser {
        tokens: tokenize(code)?,
        pos: 0,
    };
    let mut program = Vec::new();
    loop {
        while parser.peek() == Some(&Token::Sep) {
            parser.pos += 1;
        }
        if parser.peek().is_none() {
            break;
        }
        program.push(parser.statement()?);
        match parser.peek() {
            None | Some(Token::Sep) => {}
            Some(other) => return Err(LangError::Parse(format!("unexpected {other:?}"))),
        }
    }
    Ok(program)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), LangError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(other) => Err(LangError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
            None => Err(LangError::Parse("unexpected end of input".to_string())),
        }
    }

    fn statement(&mut self) -> Result<Stmt, LangError> {
        if let (Some(Token::Ident(name)), Some(Token::Assign)) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Stmt::Assign(name, self.expression()?));
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Expr, LangError> {
        match self.next() {
            Some(Token::Num(value)) => Ok(Expr::Lit(value)),
            Some(Token::Str(text)) => Ok(Expr::Lit(Value::String(text))),
            Some(Token::Minus) => {
                let operand = self.term()?;
                Ok(Expr::Sub(Box::new(Expr::Lit(json!(0))), Box::new(operand)))
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Var(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Expr::Call(name, args));
                }
                loop {
                    args.push(self.argument()?);
                    match self.next() {
                        Some(Token::Comma) => {}
                        Some(Token::RParen) => return Ok(Expr::Call(name, args)),
                        Some(other) => {
                            return Err(LangError::Parse(format!("unexpected {other:?}")));
                        }
                        None => return Err(LangError::Parse("unexpected end of input".to_string())),
                    }
                }
            }
            Some(other) => Err(LangError::Parse(format!("unexpected {other:?}"))),
            None => Err(LangError::Parse("unexpected end of input".to_string())),
        }
    }

    fn argument(&mut self) -> Result<Arg, LangError> {
        if let (Some(Token::Ident(name)), Some(Token::Eq)) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Arg {
                name: Some(name),
                value: self.expression()?,
            });
        }
        Ok(Arg {
            name: None,
            value: self.expression()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(code: &str) -> Result<Value, LangError> {
        Interpreter::new().run(code).result
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1+1"), Ok(json!(2)));
        assert_eq!(eval("10 - 4 + 0.5"), Ok(json!(6.5)));
        assert_eq!(eval("-3 + 1"), Ok(json!(-2)));
        assert!(matches!(eval("1 + 'a'"), Err(LangError::Runtime(_))));
    }

    #[test]
    fn test_stop_and_parse_errors() {
        assert_eq!(eval("stop('x')"), Err(LangError::Runtime("x".to_string())));
        assert!(matches!(eval("1 +"), Err(LangError::Parse(_))));
        assert!(matches!(eval("'open"), Err(LangError::Parse(_))));
        assert!(matches!(eval("undefined_thing"), Err(LangError::Runtime(_))));
    }

    #[test]
    fn test_variables_persist() {
        let mut interpreter = Interpreter::new();
        assert!(interpreter.run("x <- 40; y <- 2").result.is_ok());
        assert_eq!(interpreter.run("x + y").result, Ok(json!(42)));
    }

    #[test]
    fn test_output_and_delay() {
        let run =
            Interpreter::new().run("cat('hello', 'world')\nmessage('careful')\nSys.sleep(1.5)");
        assert_eq!(
            run.output,
            vec![
                (OutputKind::Normal, "hello world".to_string()),
                (OutputKind::Error, "careful\n".to_string()),
            ]
        );
        assert_eq!(run.delay, Duration::from_millis(1500));
        assert_eq!(run.result, Ok(Value::Null));
    }

    #[test]
    fn test_unrepresentable_sleep_is_an_error() {
        let huge = "Sys.sleep(100000000000000000000000000000.0)";
        assert!(matches!(eval(huge), Err(LangError::Runtime(_))));

        let code = "Sys.sleep(9000000000000000000)\n".repeat(3);
        let run = Interpreter::new().run(&code);
        assert!(matches!(run.result, Err(LangError::Runtime(_))));
    }

    #[test]
    fn test_data_frame() {
        let value = eval("data.frame(a = c(1, 2), b = c('x', 'y'))").unwrap();
        assert_eq!(
            value,
            json!({ "columns": ["a", "b"], "rows": [[1, "x"], [2, "y"]] })
        );
        assert!(eval("data.frame(a = c(1, 2), b = 'x')").is_err());
    }

    #[test]
    fn test_invoke() {
        let run = Interpreter::new().invoke("sum", vec![json!([1, 2]), json!(3)]);
        assert_eq!(run.result, Ok(json!(6)));
        let run = Interpreter::new().invoke("nope", vec![]);
        assert!(matches!(run.result, Err(LangError::Runtime(_))));
    }
}

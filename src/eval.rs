//! The macro expression language.
//!
//! Deliberately tiny: identifier lookup against the scope, member access
//! into nested configs, builtin calls, literals, lists, arithmetic,
//! concatenation and equality. Anything fancier belongs in the description
//! file, not in a template.

use std::rc::Rc;

use camino::Utf8Path;

use crate::app::App;
use crate::config::Config;
use crate::error::BuildError;
use crate::expand::expand;
use crate::paths;
use crate::value::{Builtin, Value, flatten};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    BangEq,
}

fn macro_err(message: impl Into<String>) -> BuildError {
    BuildError::Macro(message.into())
}

fn lex(src: &str) -> Result<Vec<Token>, BuildError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(macro_err("expected '==' in expression"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::BangEq);
                    i += 2;
                } else {
                    return Err(macro_err("expected '!=' in expression"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(macro_err("unterminated string literal")),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            let escaped = *chars
                                .get(i + 1)
                                .ok_or_else(|| macro_err("unterminated escape"))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let start = i;
                while matches!(chars.get(i), Some(ch) if ch.is_ascii_digit()) {
                    i += 1;
                }
                let mut is_float = false;
                if chars.get(i) == Some(&'.')
                    && matches!(chars.get(i + 1), Some(ch) if ch.is_ascii_digit())
                {
                    is_float = true;
                    i += 1;
                    while matches!(chars.get(i), Some(ch) if ch.is_ascii_digit()) {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let x: f64 = text
                        .parse()
                        .map_err(|_| macro_err(format!("bad float literal '{text}'")))?;
                    tokens.push(Token::Float(x));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| macro_err(format!("bad int literal '{text}'")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while matches!(chars.get(i), Some(ch) if ch.is_ascii_alphanumeric() || *ch == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(macro_err(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

/// Evaluates one macro expression against `scope`.
pub(crate) fn eval_expression(
    app: &Rc<App>,
    scope: &Config,
    src: &str,
) -> Result<Value, BuildError> {
    let tokens = lex(src)?;
    let mut parser = Evaluator {
        app,
        scope,
        tokens,
        pos: 0,
    };
    let value = parser.equality()?;
    if parser.pos != parser.tokens.len() {
        return Err(macro_err(format!("trailing input in expression '{src}'")));
    }
    Ok(value)
}

/// Looks up `name` in the scope, falling back to the app's global config,
/// and expands the raw field value at read time.
pub(crate) fn lookup(app: &Rc<App>, scope: &Config, name: &str) -> Result<Value, BuildError> {
    let raw = scope
        .get(name)
        .or_else(|| app.globals().get(name))
        .ok_or_else(|| BuildError::UnknownField(name.to_string()))?;
    expand(app, scope, &raw)
}

struct Evaluator<'a> {
    app: &'a Rc<App>,
    scope: &'a Config,
    tokens: Vec<Token>,
    pos: usize,
}

impl Evaluator<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), BuildError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(macro_err(format!("expected {token:?}")))
        }
    }

    fn equality(&mut self) -> Result<Value, BuildError> {
        let mut lhs = self.additive()?;
        loop {
            match self.peek() {
                Some(Token::EqEq) => {
                    self.pos += 1;
                    let rhs = self.additive()?;
                    lhs = Value::Bool(lhs == rhs);
                }
                Some(Token::BangEq) => {
                    self.pos += 1;
                    let rhs = self.additive()?;
                    lhs = Value::Bool(lhs != rhs);
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn additive(&mut self) -> Result<Value, BuildError> {
        let mut lhs = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = add(lhs, rhs)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    lhs = arith(lhs, rhs, "-")?;
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn term(&mut self) -> Result<Value, BuildError> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    lhs = arith(lhs, rhs, "*")?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    lhs = arith(lhs, rhs, "/")?;
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> Result<Value, BuildError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            let value = self.unary()?;
            return match value {
                Value::Int(n) => Ok(Value::Int(-n)),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(macro_err(format!("cannot negate a {}", other.kind_name()))),
            };
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Value, BuildError> {
        let mut value = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        _ => return Err(macro_err("expected field name after '.'")),
                    };
                    value = self.member(value, &name)?;
                }
                Some(Token::LParen) => {
                    self.pos += 1;
                    let args = self.arguments()?;
                    value = self.call(value, args)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Value>, BuildError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.equality()?);
            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(args),
                _ => return Err(macro_err("expected ',' or ')' in argument list")),
            }
        }
    }

    fn primary(&mut self) -> Result<Value, BuildError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Value::Int(n)),
            Some(Token::Float(x)) => Ok(Value::Float(x)),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => lookup(self.app, self.scope, &name),
            },
            Some(Token::LParen) => {
                let value = self.equality()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                loop {
                    items.push(self.equality()?);
                    match self.advance() {
                        Some(Token::Comma) => {}
                        Some(Token::RBracket) => return Ok(Value::List(items)),
                        _ => return Err(macro_err("expected ',' or ']' in list literal")),
                    }
                }
            }
            other => Err(macro_err(format!("unexpected token {other:?}"))),
        }
    }

    /// Member access reads a field out of a nested config, expanding it
    /// against that config as the scope.
    fn member(&mut self, value: Value, name: &str) -> Result<Value, BuildError> {
        match value {
            Value::Config(config) => lookup(self.app, &config, name),
            other => Err(macro_err(format!(
                "cannot read field '{name}' of a {}",
                other.kind_name()
            ))),
        }
    }

    fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, BuildError> {
        match callee {
            Value::Builtin(builtin) => call_builtin(self.app, builtin, &args),
            other => Err(macro_err(format!(
                "a {} value is not callable",
                other.kind_name()
            ))),
        }
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, BuildError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + b as f64)),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (a, b) => Err(macro_err(format!(
            "cannot add a {} and a {}",
            a.kind_name(),
            b.kind_name()
        ))),
    }
}

fn arith(lhs: Value, rhs: Value, op: &str) -> Result<Value, BuildError> {
    let err = |a: &Value, b: &Value| {
        macro_err(format!(
            "cannot apply '{op}' to a {} and a {}",
            a.kind_name(),
            b.kind_name()
        ))
    };
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => match op {
            "-" => Ok(Value::Int(a - b)),
            "*" => Ok(Value::Int(a * b)),
            "/" if *b == 0 => Err(macro_err("division by zero")),
            "/" => Ok(Value::Int(a / b)),
            _ => Err(err(&lhs, &rhs)),
        },
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = match lhs {
                Value::Int(n) => n as f64,
                Value::Float(x) => x,
                _ => unreachable!(),
            };
            let b = match rhs {
                Value::Int(n) => n as f64,
                Value::Float(x) => x,
                _ => unreachable!(),
            };
            match op {
                "-" => Ok(Value::Float(a - b)),
                "*" => Ok(Value::Float(a * b)),
                "/" => Ok(Value::Float(a / b)),
                _ => Err(macro_err(format!("unknown operator '{op}'"))),
            }
        }
        _ => Err(err(&lhs, &rhs)),
    }
}

fn arity(args: &[Value], expected: std::ops::RangeInclusive<usize>, name: &str) -> Result<(), BuildError> {
    if expected.contains(&args.len()) {
        Ok(())
    } else {
        Err(macro_err(format!(
            "{name}() takes {} to {} arguments, got {}",
            expected.start(),
            expected.end(),
            args.len()
        )))
    }
}

/// Dispatch table for the builtin helpers reachable from macros.
fn call_builtin(app: &Rc<App>, builtin: Builtin, args: &[Value]) -> Result<Value, BuildError> {
    match builtin {
        Builtin::AbsPath => {
            arity(args, 1..=2, "abs_path")?;
            let strict = args.get(1).map(Value::is_truthy).unwrap_or(false);
            paths::abs_path(&app.topdir(), &args[0], strict)
        }
        Builtin::RelPath => {
            arity(args, 2..=2, "rel_path")?;
            paths::rel_path(&args[0], &args[1])
        }
        Builtin::JoinPath => paths::join_path(args),
        Builtin::SwapExt => {
            arity(args, 2..=2, "swap_ext")?;
            let ext = args[1]
                .as_str()
                .ok_or_else(|| macro_err("swap_ext() extension must be a string"))?;
            paths::swap_ext(&args[0], ext)
        }
        Builtin::Flatten => {
            arity(args, 1..=1, "flatten")?;
            Ok(Value::List(flatten(args[0].clone())))
        }
        Builtin::Glob => {
            arity(args, 1..=1, "glob")?;
            let pattern = args[0]
                .as_str()
                .ok_or_else(|| macro_err("glob() pattern must be a string"))?;
            glob_files(app, pattern)
        }
        Builtin::Len => {
            arity(args, 1..=1, "len")?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Config(config) => Ok(Value::Int(config.len() as i64)),
                other => Err(macro_err(format!("len() of a {}", other.kind_name()))),
            }
        }
        Builtin::Color => {
            arity(args, 0..=3, "color")?;
            Ok(Value::Str(color_escape(app, args)?))
        }
        Builtin::Basename => {
            arity(args, 1..=1, "basename")?;
            let path = args[0]
                .as_str()
                .ok_or_else(|| macro_err("basename() argument must be a string"))?;
            let base = path.rsplit('/').next().unwrap_or(path);
            Ok(Value::Str(base.to_string()))
        }
        Builtin::Print => {
            let line: Vec<String> = args.iter().map(Value::stringify).collect();
            app.reporter().line(&line.join(" "));
            Ok(Value::Null)
        }
        Builtin::RunCmd => {
            arity(args, 1..=1, "run_cmd")?;
            let command = args[0]
                .as_str()
                .ok_or_else(|| macro_err("run_cmd() command must be a string"))?;
            run_cmd(app, command)
        }
    }
}

/// Glob relative to the top of the directory stack; results come back
/// relative to it as well.
pub(crate) fn glob_files(app: &Rc<App>, pattern: &str) -> Result<Value, BuildError> {
    let base = app.topdir();
    let full = paths::absolutize(&base, pattern);
    let mut matches = Vec::new();
    for entry in glob::glob(full.as_str())? {
        let path = entry.map_err(|err| BuildError::Io(err.into_error()))?;
        let path = camino::Utf8PathBuf::from_path_buf(path)
            .map_err(|p| BuildError::NonUtf8Path(p.display().to_string()))?;
        let relative = path
            .strip_prefix(&base)
            .map(Utf8Path::to_path_buf)
            .unwrap_or(path);
        matches.push(Value::Str(relative.into_string()));
    }
    Ok(Value::List(matches))
}

/// Converts an RGB color to an ANSI escape; no arguments resets. Emits
/// nothing at all when color output is disabled.
fn color_escape(app: &Rc<App>, args: &[Value]) -> Result<String, BuildError> {
    if !app.use_color() {
        return Ok(String::new());
    }
    if args.is_empty() {
        return Ok("\x1B[0m".to_string());
    }
    let channel = |v: &Value| {
        v.as_int()
            .filter(|n| (0..=255).contains(n))
            .ok_or_else(|| macro_err("color() channels must be integers in 0..=255"))
    };
    if args.len() != 3 {
        return Err(macro_err("color() takes zero or three arguments"));
    }
    let (r, g, b) = (channel(&args[0])?, channel(&args[1])?, channel(&args[2])?);
    Ok(format!("\x1B[38;2;{r};{g};{b}m"))
}

/// Runs a console command synchronously and returns its stdout with
/// whitespace stripped.
fn run_cmd(app: &Rc<App>, command: &str) -> Result<Value, BuildError> {
    let output = shell_command(command)
        .current_dir(app.topdir())
        .output()?;
    if !output.status.success() {
        return Err(BuildError::CommandFailed {
            command: command.to_string(),
            code: output.status.code().unwrap_or(-1),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Value::Str(stdout.trim().to_string()))
}

#[cfg(unix)]
fn shell_command(command: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
